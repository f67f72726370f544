//! The replicated-cell contract the transport is built on, plus an
//! in-process fabric that simulates it for tests and local demos.
//!
//! A replicated cell is a named slot holding a short string. Only the
//! current lease holder may write it. Value and lease changes propagate to
//! every other participant after an uncontrolled delay with no completion
//! signal, and a write issued before a lease request has settled is silently
//! dropped. That hazard is the reason the bus waits a fixed settle interval
//! between acquiring a channel and publishing on it.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, trace};
use thiserror::Error;

/// Identity of one participant on the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticipantId(pub u32);

/// Errors surfaced by cell operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CellError {
    /// Caller's local replica does not show it holding the lease
    #[error("participant {participant:?} does not hold the lease on this cell")]
    NotLeaseHolder { participant: ParticipantId },
    /// Value exceeds the cell's replicable capacity
    #[error("value of {len} chars exceeds cell capacity of {capacity}")]
    Oversize { len: usize, capacity: usize },
}

/// Explicit form of the medium's ambient "current writer" state: who holds
/// the cell and when their hold became locally visible.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lease {
    pub holder: ParticipantId,
    pub acquired_at: f64,
}

/// One participant's view of one replicated cell.
///
/// `read` returns the last locally replicated value, which lags the true
/// global state. `request_lease` completes asynchronously with no signal;
/// callers infer completion by waiting a settle interval and re-checking
/// [`holds_lease`](ReplicatedCell::holds_lease).
pub trait ReplicatedCell {
    fn read(&self) -> String;
    fn write(&mut self, value: &str) -> Result<(), CellError>;
    fn request_lease(&mut self);
    fn holds_lease(&self) -> bool;
    fn lease(&self) -> Option<Lease>;
}

/// Tunables for the simulated fabric.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// One-way propagation delay for value and lease changes, seconds.
    pub replication_delay: f64,
    /// Capacity of each cell in characters.
    pub cell_capacity: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            replication_delay: 0.2,
            cell_capacity: 105,
        }
    }
}

#[derive(Clone)]
struct Replica {
    value: String,
    owner: Option<ParticipantId>,
    owner_since: f64,
}

impl Replica {
    fn new() -> Self {
        Self {
            value: String::new(),
            owner: None,
            owner_since: 0.0,
        }
    }
}

enum PendingEvent {
    LeaseSettled {
        cell: usize,
        participant: ParticipantId,
    },
    ValueReplicated {
        cell: usize,
        writer: ParticipantId,
        value: String,
    },
}

struct FabricState {
    config: FabricConfig,
    now: f64,
    authoritative: Vec<Replica>,
    // replicas[participant][cell]
    replicas: Vec<Vec<Replica>>,
    pending: Vec<(f64, PendingEvent)>,
}

impl FabricState {
    fn apply(&mut self, event: PendingEvent) {
        match event {
            PendingEvent::LeaseSettled { cell, participant } => {
                trace!("lease on cell {cell} settled for {participant:?}");
                self.authoritative[cell].owner = Some(participant);
                self.authoritative[cell].owner_since = self.now;
                for views in &mut self.replicas {
                    views[cell].owner = Some(participant);
                    views[cell].owner_since = self.now;
                }
            }
            PendingEvent::ValueReplicated {
                cell,
                writer,
                value,
            } => {
                for (p, views) in self.replicas.iter_mut().enumerate() {
                    if ParticipantId(p as u32) != writer {
                        views[cell].value = value.clone();
                    }
                }
            }
        }
    }
}

/// In-process simulation of a pool of replicated cells shared by several
/// participants. Drives replication by explicit [`advance`](CellFabric::advance)
/// calls with simulated time, so tests are deterministic.
#[derive(Clone)]
pub struct CellFabric {
    state: Rc<RefCell<FabricState>>,
}

impl CellFabric {
    pub fn new(cell_count: usize, config: FabricConfig) -> Self {
        let state = FabricState {
            config,
            now: 0.0,
            authoritative: (0..cell_count).map(|_| Replica::new()).collect(),
            replicas: Vec::new(),
            pending: Vec::new(),
        };
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    /// Registers a new participant with its own replica of every cell.
    pub fn join(&self) -> ParticipantId {
        let mut state = self.state.borrow_mut();
        let id = ParticipantId(state.replicas.len() as u32);
        let cells = state.authoritative.len();
        state.replicas.push((0..cells).map(|_| Replica::new()).collect());
        id
    }

    /// One participant's handle onto one cell.
    pub fn view(&self, participant: ParticipantId, cell: usize) -> CellView {
        CellView {
            state: Rc::clone(&self.state),
            participant,
            cell,
        }
    }

    pub fn cell_count(&self) -> usize {
        self.state.borrow().authoritative.len()
    }

    /// Advances simulated time and applies every replication event that has
    /// come due, in the order the events were issued.
    pub fn advance(&self, dt: f64) {
        let mut state = self.state.borrow_mut();
        state.now += dt;
        let now = state.now;
        loop {
            let Some(idx) = state.pending.iter().position(|(at, _)| *at <= now) else {
                break;
            };
            let (_, event) = state.pending.remove(idx);
            state.apply(event);
        }
    }
}

/// Implements [`ReplicatedCell`] against the simulated fabric, reproducing
/// the medium's hazards: optimistic local lease flips, delayed arbitration,
/// and silent loss of writes issued before the lease settles.
pub struct CellView {
    state: Rc<RefCell<FabricState>>,
    participant: ParticipantId,
    cell: usize,
}

impl ReplicatedCell for CellView {
    fn read(&self) -> String {
        let state = self.state.borrow();
        state.replicas[self.participant.0 as usize][self.cell]
            .value
            .clone()
    }

    fn write(&mut self, value: &str) -> Result<(), CellError> {
        let mut state = self.state.borrow_mut();
        let capacity = state.config.cell_capacity;
        if value.len() > capacity {
            return Err(CellError::Oversize {
                len: value.len(),
                capacity,
            });
        }
        let local_owner = state.replicas[self.participant.0 as usize][self.cell].owner;
        if local_owner != Some(self.participant) {
            return Err(CellError::NotLeaseHolder {
                participant: self.participant,
            });
        }
        if state.authoritative[self.cell].owner != Some(self.participant) {
            // the caller believes it owns the cell but arbitration has not
            // settled; the medium drops this write without any signal
            debug!(
                "write to cell {} by {:?} lost to unsettled lease",
                self.cell, self.participant
            );
            return Ok(());
        }
        state.authoritative[self.cell].value = value.to_string();
        state.replicas[self.participant.0 as usize][self.cell].value = value.to_string();
        let at = state.now + state.config.replication_delay;
        state.pending.push((
            at,
            PendingEvent::ValueReplicated {
                cell: self.cell,
                writer: self.participant,
                value: value.to_string(),
            },
        ));
        Ok(())
    }

    fn request_lease(&mut self) {
        let mut state = self.state.borrow_mut();
        let now = state.now;
        // locally the lease appears held right away; arbitration settles
        // (and possibly revokes it) only after the replication delay
        let view = &mut state.replicas[self.participant.0 as usize][self.cell];
        view.owner = Some(self.participant);
        view.owner_since = now;
        let at = now + state.config.replication_delay;
        state.pending.push((
            at,
            PendingEvent::LeaseSettled {
                cell: self.cell,
                participant: self.participant,
            },
        ));
    }

    fn holds_lease(&self) -> bool {
        let state = self.state.borrow();
        state.replicas[self.participant.0 as usize][self.cell].owner == Some(self.participant)
    }

    fn lease(&self) -> Option<Lease> {
        let state = self.state.borrow();
        let view = &state.replicas[self.participant.0 as usize][self.cell];
        view.owner.map(|holder| Lease {
            holder,
            acquired_at: view.owner_since,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{CellFabric, FabricConfig, ParticipantId, ReplicatedCell};

    fn fabric() -> CellFabric {
        CellFabric::new(1, FabricConfig::default())
    }

    #[test]
    fn write_requires_lease() {
        let fabric = fabric();
        let a = fabric.join();
        let mut view = fabric.view(a, 0);
        assert!(view.write("hello").is_err());
    }

    #[test]
    fn settled_write_replicates_after_delay() {
        let fabric = fabric();
        let a = fabric.join();
        let b = fabric.join();
        let mut view_a = fabric.view(a, 0);
        let view_b = fabric.view(b, 0);

        view_a.request_lease();
        fabric.advance(0.25);
        assert!(view_a.write("hello").is_ok());
        assert_eq!(view_a.read(), "hello");
        assert_eq!(view_b.read(), "");
        fabric.advance(0.25);
        assert_eq!(view_b.read(), "hello");
    }

    #[test]
    fn write_before_settle_is_silently_lost() {
        let fabric = fabric();
        let a = fabric.join();
        let b = fabric.join();
        let mut view_a = fabric.view(a, 0);
        let view_b = fabric.view(b, 0);

        view_a.request_lease();
        // locally the lease looks held, but arbitration has not run
        assert!(view_a.holds_lease());
        assert!(view_a.write("doomed").is_ok());
        fabric.advance(1.0);
        assert_eq!(view_a.read(), "");
        assert_eq!(view_b.read(), "");
    }

    #[test]
    fn later_lease_request_wins_contention() {
        let fabric = fabric();
        let a = fabric.join();
        let b = fabric.join();
        let mut view_a = fabric.view(a, 0);
        let mut view_b = fabric.view(b, 0);

        view_a.request_lease();
        fabric.advance(0.01);
        view_b.request_lease();
        // both optimistically believe they own the cell
        assert!(view_a.holds_lease());
        assert!(view_b.holds_lease());

        fabric.advance(1.0);
        assert!(!view_a.holds_lease());
        assert!(view_b.holds_lease());
        assert_eq!(view_b.lease().unwrap().holder, ParticipantId(1));
    }

    #[test]
    fn oversize_write_rejected() {
        let fabric = fabric();
        let a = fabric.join();
        let mut view = fabric.view(a, 0);
        view.request_lease();
        fabric.advance(0.25);
        let big = "x".repeat(500);
        assert!(view.write(&big).is_err());
    }
}
