//! Bit-level serialization primitives shared by the framer and pose codec.

mod bit_reader;
mod bit_writer;
mod error;

pub use bit_reader::BitReader;
pub use bit_writer::{dequantize, quantize, BitWriter};
pub use error::SerdeErr;
