//! Wire layer: bit-level framing (escaping, CRC, terminator discipline) and
//! the header-driven mapping between frames and typed protocol messages.

pub mod codec;
pub mod framing;
pub mod message;
