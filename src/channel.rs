//! One addressable unit of the shared broadcast medium.
//!
//! A channel wraps a pair of replicated cells so a single transmission can
//! carry twice a cell's capacity: the first cell holds the frame header and
//! the leading data characters, the second the remainder. The empty string
//! is the idle sentinel observed by every participant.

use log::trace;

use crate::cell::{CellError, Lease, ReplicatedCell};

pub struct Channel<C: ReplicatedCell, A> {
    index: usize,
    cell0: C,
    cell1: C,
    // the last value this participant wrote or observed on cell0, so each
    // replicated change is consumed exactly once and our own transmissions
    // are never re-ingested as receives
    last_local0: String,
    last_send_time: f64,
    pending_ack: Option<A>,
}

impl<C: ReplicatedCell, A> Channel<C, A> {
    pub fn new(index: usize, cell0: C, cell1: C) -> Self {
        Self {
            index,
            cell0,
            cell1,
            last_local0: String::new(),
            last_send_time: f64::NEG_INFINITY,
            pending_ack: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// A channel is idle iff both wrapped cells hold the empty sentinel.
    pub fn is_idle(&self) -> bool {
        self.cell0.read().is_empty() && self.cell1.read().is_empty()
    }

    pub fn holds_lease(&self) -> bool {
        self.cell0.holds_lease() && self.cell1.holds_lease()
    }

    pub fn lease(&self) -> Option<Lease> {
        self.cell0.lease()
    }

    pub fn request_lease(&mut self) {
        self.cell0.request_lease();
        self.cell1.request_lease();
    }

    pub fn last_send_time(&self) -> f64 {
        self.last_send_time
    }

    /// Writes a rendered frame across the cell pair. The caller must hold
    /// the lease on both cells; `ack` is handed back by the release sweep
    /// once the transmission is heuristically considered delivered.
    pub fn publish(
        &mut self,
        chars: &str,
        cell_capacity: usize,
        now: f64,
        ack: Option<A>,
    ) -> Result<(), CellError> {
        let split = chars.len().min(cell_capacity);
        // frame characters are all 7-bit, so byte indexing is char indexing
        let (head, tail) = chars.split_at(split);
        self.cell0.write(head)?;
        self.cell1.write(tail)?;
        self.last_local0 = head.to_string();
        self.last_send_time = now;
        self.pending_ack = ack;
        trace!("channel {} published {} chars", self.index, chars.len());
        Ok(())
    }

    /// Resets both cells to the idle sentinel and hands back any pending
    /// ack token. Only valid for the current lease holder.
    pub fn release(&mut self) -> Result<Option<A>, CellError> {
        self.cell0.write("")?;
        self.cell1.write("")?;
        self.last_local0.clear();
        Ok(self.pending_ack.take())
    }

    /// Polls the replicated value for a change. Returns the full raw
    /// transmission (header + data) once per observed change, skipping the
    /// idle sentinel and this participant's own last transmission.
    pub fn observe(&mut self) -> Option<String> {
        let value0 = self.cell0.read();
        if value0.is_empty() || value0 == self.last_local0 {
            return None;
        }
        self.last_local0 = value0.clone();
        let value1 = self.cell1.read();
        trace!("channel {} observed {} chars", self.index, value0.len() + value1.len());
        Some(value0 + &value1)
    }
}
