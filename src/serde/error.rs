use thiserror::Error;

/// Errors that can occur while reading from a bit stream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerdeErr {
    /// Attempted to read past the end of the buffer
    #[error("bit stream exhausted: needed {needed} more bit(s)")]
    Exhausted { needed: u32 },
}
