//! # Wire Protocol
//!
//! What crosses the transport boundary between two devices.
//!
//! ```text
//! message.rs - PAYMENT / CONFIRMATION / HELLO JSON messages
//! codec.rs   - u32 length-prefixed framing for stream transports
//! ```

pub mod codec;
pub mod message;

pub use codec::{encode_frame, CodecError, FrameDecoder};
pub use message::{Confirmation, ConfirmationStatus, Payment, WireMessage};
