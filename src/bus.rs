//! Multi-channel carrier-sense transport over replicated cells.
//!
//! The bus owns a fixed pool of [`Channel`]s and arbitrates access to them
//! the way radio does: probe for an idle channel starting at a random
//! offset, take the lease, wait for the lease to settle, publish, then back
//! off. There is no real acknowledgment on the medium; a transmission is
//! presumed delivered when the local participant still holds an untouched
//! channel after `ack_wait` elapses, which in practice correlates with
//! nobody having contended for it.

use log::{debug, info, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::cell::ReplicatedCell;
use crate::channel::Channel;
use crate::framer::{self, Frame, Reassembler};
use crate::wrapping_number::{sequence_advance, SEQUENCE_MODULUS};

/// Transport tunables. The defaults are the empirically derived values for
/// a medium with ~200 ms replication delay; correctness of the collision
/// avoidance depends on the contention and cooldown bounds staying larger
/// than the actual replication delay of the deployment.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Capacity of a single replicated cell, characters.
    pub cell_capacity: usize,
    /// How long to wait after requesting a channel lease before trusting a
    /// write not to race the ownership change.
    pub settle_wait: f64,
    /// How long a published value must sit uncontested before the release
    /// sweep treats the transmission as delivered.
    pub ack_wait: f64,
    /// Randomized wait bounds after failing to find or keep a channel.
    pub min_contention_wait: f64,
    pub max_contention_wait: f64,
    /// Randomized wait bounds between successive sends, bounding how
    /// aggressively one participant monopolizes the pool.
    pub min_cooldown_wait: f64,
    pub max_cooldown_wait: f64,
    /// Capacity of the receive and ack rings; consumers must drain both
    /// every tick or lose the oldest entries.
    pub ring_capacity: usize,
    /// Seed for probe offsets, backoff jitter and the initial sequence
    /// number. `None` seeds from entropy.
    pub rng_seed: Option<u64>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            cell_capacity: 105,
            settle_wait: 0.2,
            ack_wait: 2.0,
            min_contention_wait: 0.3,
            max_contention_wait: 0.5,
            min_cooldown_wait: 1.0,
            max_cooldown_wait: 1.5,
            ring_capacity: 16,
            rng_seed: None,
        }
    }
}

/// Suspension points of the send path. The bus never blocks; each state
/// either resolves within the current tick or parks behind a countdown
/// checked again on the next [`Bus::advance`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SendState {
    Idle,
    Probing,
    AwaitingOwnership { channel: usize, remaining: f64 },
    Sending { channel: usize },
    Cooldown { remaining: f64 },
}

struct PendingSend<A> {
    frames: Vec<Frame>,
    next: usize,
    ack: Option<A>,
}

struct RingBuffer<T> {
    entries: Vec<Option<T>>,
    head: usize,
    tail: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: (0..capacity).map(|_| None).collect(),
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    /// Appends an entry, returning the evicted oldest entry when the
    /// consumer has fallen a full lap behind.
    fn push(&mut self, value: T) -> Option<T> {
        let evicted = if self.len == self.entries.len() {
            let old = self.entries[self.tail].take();
            self.tail = (self.tail + 1) % self.entries.len();
            self.len -= 1;
            old
        } else {
            None
        };
        self.entries[self.head] = Some(value);
        self.head = (self.head + 1) % self.entries.len();
        self.len += 1;
        evicted
    }

    fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.entries[self.tail].take();
        self.tail = (self.tail + 1) % self.entries.len();
        self.len -= 1;
        value
    }
}

pub struct Bus<C: ReplicatedCell, A> {
    config: BusConfig,
    channels: Vec<Channel<C, A>>,
    state: SendState,
    // countdown gating re-entry into the send path: contention backoff
    // while idle, and any residual wait carried out of other states
    send_wait: f64,
    pending: Option<PendingSend<A>>,
    now: f64,
    seq: u16,
    max_fragment_payload: usize,
    rng: SmallRng,
    reassembler: Reassembler,
    recv_ring: RingBuffer<Vec<u8>>,
    ack_ring: RingBuffer<A>,
}

impl<C: ReplicatedCell, A> Bus<C, A> {
    /// Builds a bus over the given replicated cell pairs. Channel indices
    /// are assigned in order at startup and never reused.
    pub fn new(cell_pairs: Vec<(C, C)>, config: BusConfig) -> Self {
        let mut rng = match config.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        let channels: Vec<Channel<C, A>> = cell_pairs
            .into_iter()
            .enumerate()
            .map(|(i, (cell0, cell1))| Channel::new(i, cell0, cell1))
            .collect();
        let max_fragment_payload = framer::max_fragment_payload(config.cell_capacity);
        // spread initial sequence numbers so two participants fragmenting
        // at the same time rarely collide on one
        let seq = rng.gen_range(0..SEQUENCE_MODULUS);
        let slot_count = channels.len();
        Self {
            reassembler: Reassembler::new(slot_count),
            recv_ring: RingBuffer::new(config.ring_capacity),
            ack_ring: RingBuffer::new(config.ring_capacity),
            channels,
            state: SendState::Idle,
            send_wait: 0.0,
            pending: None,
            now: 0.0,
            seq,
            max_fragment_payload,
            rng,
            config,
        }
    }

    /// Whether a `try_send` call would currently be accepted.
    pub fn send_ready(&self) -> bool {
        matches!(self.state, SendState::Idle) && self.send_wait <= 0.0 && self.pending.is_none()
    }

    pub fn state(&self) -> SendState {
        self.state
    }

    /// Largest payload a single send may carry: one fragment per channel.
    pub fn max_payload(&self) -> usize {
        self.channels.len() * self.max_fragment_payload
    }

    /// Queues a payload for transmission. Returns false when a send is
    /// already in flight, the bus is backing off, or the payload cannot be
    /// framed; an oversized payload must not be retried as-is.
    pub fn try_send(&mut self, data: &[u8], ack: A) -> bool {
        if !self.send_ready() {
            return false;
        }
        if data.len() > self.max_payload() {
            warn!(
                "rejecting payload of {} bytes, max is {}",
                data.len(),
                self.max_payload()
            );
            return false;
        }
        let frames = match framer::fragment(self.seq, data, self.max_fragment_payload) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("rejecting payload: {e}");
                return false;
            }
        };
        self.seq = sequence_advance(self.seq);
        debug!(
            "queued send of {} bytes as {} frame(s)",
            data.len(),
            frames.len()
        );
        self.pending = Some(PendingSend {
            frames,
            next: 0,
            ack: Some(ack),
        });
        true
    }

    /// Drains one decoded payload from the receive ring, oldest first.
    pub fn poll_received(&mut self) -> Option<Vec<u8>> {
        self.recv_ring.pop()
    }

    /// Drains one heuristically acknowledged token, oldest first.
    pub fn poll_acked(&mut self) -> Option<A> {
        self.ack_ring.pop()
    }

    /// Raises or lowers the delivery heuristic's wait, never below the
    /// lease settle interval.
    pub fn set_ack_wait(&mut self, secs: f64) {
        self.config.ack_wait = secs.max(self.config.settle_wait);
    }

    /// Adjusts the inter-send cooldown bounds at runtime.
    pub fn set_cooldown_bounds(&mut self, min: f64, max: f64) {
        let min = min.max(0.0);
        self.config.min_cooldown_wait = min;
        self.config.max_cooldown_wait = max.max(min);
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Drives one cooperative tick: the send state machine, the release
    /// sweep, and the receive sweep. `dt` is elapsed time in seconds.
    pub fn advance(&mut self, dt: f64) {
        self.now += dt;
        self.advance_send(dt);
        self.release_channels();
        self.recv_frames();
    }

    fn advance_send(&mut self, dt: f64) {
        if self.send_wait > 0.0 {
            self.send_wait -= dt;
        }
        match &mut self.state {
            SendState::AwaitingOwnership { remaining, .. } => *remaining -= dt,
            SendState::Cooldown { remaining } => *remaining -= dt,
            _ => {}
        }

        loop {
            match self.state {
                SendState::Idle => {
                    if self.send_wait > 0.0 || self.pending.is_none() {
                        break;
                    }
                    self.state = SendState::Probing;
                }
                SendState::Probing => {
                    let Some(index) = self.probe_idle_channel() else {
                        // every channel busy: randomized contention backoff
                        self.send_wait = self
                            .rng
                            .gen_range(self.config.min_contention_wait..=self.config.max_contention_wait);
                        self.state = SendState::Idle;
                        break;
                    };
                    debug!("probing selected channel {index}");
                    self.channels[index].request_lease();
                    self.state = SendState::AwaitingOwnership {
                        channel: index,
                        remaining: self.config.settle_wait,
                    };
                    break;
                }
                SendState::AwaitingOwnership { channel, remaining } => {
                    if remaining > 0.0 {
                        break;
                    }
                    if self.channels[channel].holds_lease() {
                        self.state = SendState::Sending { channel };
                    } else {
                        debug!("lost channel {channel} to contention, backing off");
                        self.send_wait = self
                            .rng
                            .gen_range(self.config.min_contention_wait..=self.config.max_contention_wait);
                        self.state = SendState::Idle;
                        break;
                    }
                }
                SendState::Sending { channel } => {
                    let Some(pending) = self.pending.as_mut() else {
                        self.state = SendState::Idle;
                        break;
                    };
                    let frame = &pending.frames[pending.next];
                    let last = pending.next + 1 == pending.frames.len();
                    let ack = if last { pending.ack.take() } else { None };
                    let chars = frame.to_chars();
                    match self.channels[channel].publish(
                        &chars,
                        self.config.cell_capacity,
                        self.now,
                        ack,
                    ) {
                        Ok(()) => {
                            debug!(
                                "published frame {}/{} on channel {channel}",
                                frame.index + 1,
                                frame.count
                            );
                            pending.next += 1;
                            if last {
                                self.pending = None;
                                self.state = SendState::Cooldown {
                                    remaining: self.rng.gen_range(
                                        self.config.min_cooldown_wait
                                            ..=self.config.max_cooldown_wait,
                                    ),
                                };
                            } else {
                                // remaining fragments each get their own
                                // probe and settle on the next ticks
                                self.state = SendState::Probing;
                            }
                            break;
                        }
                        Err(e) => {
                            warn!("publish on channel {channel} failed: {e}");
                            self.send_wait = self.rng.gen_range(
                                self.config.min_contention_wait..=self.config.max_contention_wait,
                            );
                            self.state = SendState::Idle;
                            break;
                        }
                    }
                }
                SendState::Cooldown { remaining } => {
                    if remaining > 0.0 {
                        break;
                    }
                    self.state = SendState::Idle;
                }
            }
        }
    }

    /// Scans for an idle channel starting at a random offset. An idle
    /// channel whose lease we already hold is preferred: a freshly
    /// contested lease is far less reliably writable than a retained one.
    fn probe_idle_channel(&mut self) -> Option<usize> {
        let n = self.channels.len();
        if n == 0 {
            return None;
        }
        let start = self.rng.gen_range(0..n);
        let mut fallback = None;
        for offset in 0..n {
            let index = (start + offset) % n;
            let channel = &self.channels[index];
            if !channel.is_idle() {
                continue;
            }
            if channel.holds_lease() {
                return Some(index);
            }
            if fallback.is_none() {
                fallback = Some(index);
            }
        }
        fallback
    }

    /// The delivery heuristic: any channel we still hold, with our value
    /// still sitting on it after `ack_wait`, is assumed to have been seen by
    /// every peer (nobody contended), released back to idle, and its ack
    /// token surfaced to the consumer.
    fn release_channels(&mut self) {
        let active = match self.state {
            SendState::AwaitingOwnership { channel, .. } | SendState::Sending { channel } => {
                Some(channel)
            }
            _ => None,
        };
        for index in 0..self.channels.len() {
            if Some(index) == active {
                continue;
            }
            let channel = &mut self.channels[index];
            if channel.is_idle() || !channel.holds_lease() {
                continue;
            }
            if self.now - channel.last_send_time() <= self.config.ack_wait {
                continue;
            }
            match channel.release() {
                Ok(Some(ack)) => {
                    info!("channel {index} released, transmission presumed delivered");
                    if self.ack_ring.push(ack).is_some() {
                        warn!("ack ring overflow, dropped oldest token");
                    }
                }
                Ok(None) => {
                    info!("channel {index} released");
                }
                Err(e) => {
                    warn!("release of channel {index} failed: {e}");
                }
            }
        }
    }

    /// Polls every channel for replicated changes and runs decoded frames
    /// through reassembly. Whole payloads land on the receive ring.
    fn recv_frames(&mut self) {
        for index in 0..self.channels.len() {
            let Some(chars) = self.channels[index].observe() else {
                continue;
            };
            match Frame::from_chars(&chars) {
                Ok(frame) => {
                    debug!(
                        "received frame seq {} ({}/{}) on channel {index}",
                        frame.seq,
                        frame.index + 1,
                        frame.count
                    );
                    if let Some(payload) = self.reassembler.feed(frame) {
                        if self.recv_ring.push(payload).is_some() {
                            warn!("receive ring overflow, dropped oldest payload");
                        }
                    }
                }
                Err(e) => {
                    warn!("undecodable transmission on channel {index}: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Bus, BusConfig, RingBuffer, SendState};
    use crate::cell::{CellFabric, CellView, FabricConfig};

    fn test_bus(fabric: &CellFabric, channels: usize, seed: u64) -> Bus<CellView, &'static str> {
        let p = fabric.join();
        let pairs = (0..channels)
            .map(|i| (fabric.view(p, i * 2), fabric.view(p, i * 2 + 1)))
            .collect();
        Bus::new(
            pairs,
            BusConfig {
                rng_seed: Some(seed),
                ..BusConfig::default()
            },
        )
    }

    #[test]
    fn ring_buffer_fifo_and_eviction() {
        let mut ring: RingBuffer<u32> = RingBuffer::new(2);
        assert!(ring.push(1).is_none());
        assert!(ring.push(2).is_none());
        assert_eq!(ring.push(3), Some(1));
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn second_send_rejected_while_in_flight() {
        let fabric = CellFabric::new(16, FabricConfig::default());
        let mut bus = test_bus(&fabric, 8, 1);
        assert!(bus.send_ready());
        assert!(bus.try_send(b"one", "a"));
        assert!(!bus.send_ready());
        assert!(!bus.try_send(b"two", "b"));
    }

    #[test]
    fn oversized_payload_rejected_up_front() {
        let fabric = CellFabric::new(2, FabricConfig::default());
        let mut bus = test_bus(&fabric, 1, 2);
        let data = vec![0u8; bus.max_payload() + 1];
        assert!(!bus.try_send(&data, "big"));
        assert!(bus.send_ready());
    }

    #[test]
    fn send_walks_the_state_machine() {
        let fabric = CellFabric::new(16, FabricConfig::default());
        let mut bus = test_bus(&fabric, 8, 3);
        assert!(bus.try_send(b"payload", "tok"));

        // first tick probes and requests the lease
        fabric.advance(0.05);
        bus.advance(0.05);
        assert!(matches!(
            bus.state(),
            SendState::AwaitingOwnership { .. }
        ));

        // settle interval passes, the frame goes out, cooldown begins
        for _ in 0..6 {
            fabric.advance(0.05);
            bus.advance(0.05);
        }
        assert!(matches!(bus.state(), SendState::Cooldown { .. }));
        assert!(!bus.send_ready());
    }

    #[test]
    fn ack_wait_never_drops_below_settle() {
        let fabric = CellFabric::new(2, FabricConfig::default());
        let mut bus = test_bus(&fabric, 1, 4);
        bus.set_ack_wait(0.01);
        assert!(bus.config().ack_wait >= bus.config().settle_wait);
    }
}
