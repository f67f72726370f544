//! Hashed timing wheel for cheap coarse timers.
//!
//! Scheduling is O(1): a timer lands in the slot its deadline hashes to,
//! carrying the number of full wheel revolutions still ahead of it. Each
//! [`advance`](TimerWheel::advance) step walks the cursor one slot and fires
//! the entries whose revolution count has reached zero. The wheel returns
//! fired keys to the caller instead of invoking callbacks; the host owns
//! dispatch.

use log::trace;

const DEFAULT_SLOT_COUNT: usize = 256;
const DEFAULT_RESOLUTION: f64 = 0.01;

/// Identifies one scheduled timer for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u64);

struct Entry<K> {
    handle: u64,
    key: K,
    revolutions: u32,
    repeat_slots: Option<usize>,
}

pub struct TimerWheel<K> {
    slots: Vec<Vec<Entry<K>>>,
    resolution: f64,
    cursor: usize,
    // time carried between advance calls that has not yet made a full slot
    accumulated: f64,
    next_handle: u64,
}

impl<K> Default for TimerWheel<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> TimerWheel<K> {
    /// 256 slots at 10 ms resolution, enough for timers up to ~2.5 s per
    /// revolution with no revolution counting.
    pub fn new() -> Self {
        Self::with_geometry(DEFAULT_SLOT_COUNT, DEFAULT_RESOLUTION)
    }

    pub fn with_geometry(slot_count: usize, resolution: f64) -> Self {
        Self {
            slots: (0..slot_count.max(1)).map(|_| Vec::new()).collect(),
            resolution: resolution.max(f64::EPSILON),
            cursor: 0,
            accumulated: 0.0,
            next_handle: 0,
        }
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    pub fn len(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Vec::is_empty)
    }

    /// Schedules `key` to fire once after `seconds`.
    pub fn delay(&mut self, seconds: f64, key: K) -> TimerHandle {
        self.schedule(seconds, key, None)
    }

    /// Schedules `key` to fire every `seconds` until cancelled.
    pub fn repeat(&mut self, seconds: f64, key: K) -> TimerHandle {
        let steps = self.steps_for(seconds);
        self.schedule(seconds, key, Some(steps))
    }

    /// Removes a scheduled timer. Returns false when the handle already
    /// fired (one-shot) or was cancelled before.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        for slot in &mut self.slots {
            if let Some(pos) = slot.iter().position(|e| e.handle == handle.0) {
                slot.swap_remove(pos);
                return true;
            }
        }
        false
    }

    /// Advances the wheel by `dt` seconds and returns the keys of every
    /// timer that came due, in firing order.
    pub fn advance(&mut self, dt: f64) -> Vec<K>
    where
        K: Clone,
    {
        self.accumulated += dt;
        let mut fired = Vec::new();
        while self.accumulated >= self.resolution {
            self.accumulated -= self.resolution;
            self.cursor = (self.cursor + 1) % self.slots.len();
            self.step(&mut fired);
        }
        fired
    }

    fn step(&mut self, fired: &mut Vec<K>)
    where
        K: Clone,
    {
        let mut due = Vec::new();
        let slot = &mut self.slots[self.cursor];
        let mut i = 0;
        while i < slot.len() {
            if slot[i].revolutions == 0 {
                due.push(slot.swap_remove(i));
            } else {
                slot[i].revolutions -= 1;
                i += 1;
            }
        }
        for entry in due {
            fired.push(entry.key.clone());
            if let Some(interval) = entry.repeat_slots {
                self.insert(interval, entry.handle, entry.key, Some(interval));
            }
        }
    }

    fn schedule(&mut self, seconds: f64, key: K, repeat_slots: Option<usize>) -> TimerHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        let steps = self.steps_for(seconds);
        trace!("scheduled timer {handle} for {steps} slot(s) ahead");
        self.insert(steps, handle, key, repeat_slots);
        TimerHandle(handle)
    }

    fn steps_for(&self, seconds: f64) -> usize {
        ((seconds / self.resolution).round() as usize).max(1)
    }

    fn insert(&mut self, steps: usize, handle: u64, key: K, repeat_slots: Option<usize>) {
        let slot = (self.cursor + steps) % self.slots.len();
        let revolutions = ((steps - 1) / self.slots.len()) as u32;
        self.slots[slot].push(Entry {
            handle,
            key,
            revolutions,
            repeat_slots,
        });
    }
}
