//! # cellbus
//! Best-effort broadcast transport over single-writer replicated string
//! cells, for environments whose only shared state primitive is a handful
//! of short, slowly replicating, racily owned string slots.
//!
//! The stack, bottom up: a [`ReplicatedCell`] contract (with [`CellFabric`]
//! as an in-process simulation of the medium), [`Channel`]s pairing two
//! cells into one addressable transmission unit, a [`Framer`](framer) that
//! packs arbitrary bytes into 7-bit-safe characters and fragments across
//! channels, and the [`Bus`] send state machine doing carrier-sense
//! multiple access with randomized backoff and a heuristic delivery
//! acknowledgment. [`PoseCodec`] and [`TimerWheel`] are the companion
//! pieces hosts typically drive the bus with: dense variant-tagged pose
//! packing and cheap coarse timers.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod bus;
mod cell;
mod channel;
pub mod framer;
pub mod pose;
mod serde;
mod timer_wheel;
mod wrapping_number;

pub use bus::{Bus, BusConfig, SendState};
pub use cell::{CellError, CellFabric, CellView, FabricConfig, Lease, ParticipantId, ReplicatedCell};
pub use channel::Channel;
pub use framer::{Frame, FramerError, Reassembler};
pub use pose::{
    math::{Quat, Vec3},
    Discriminant, PoseCodec, PoseError, PoseSpace, SlotAnchor,
};
pub use serde::{dequantize, quantize, BitReader, BitWriter, SerdeErr};
pub use timer_wheel::{TimerHandle, TimerWheel};
pub use wrapping_number::{
    sequence_advance, sequence_greater_than, sequence_less_than, SEQUENCE_MODULUS,
};
