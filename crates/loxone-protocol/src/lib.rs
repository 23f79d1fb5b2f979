//! Loxone Miniserver binary WebSocket protocol.
//!
//! Two independent concerns live here: [`frame`] decodes the framed
//! binary wire format into value/text updates, and [`handshake`]
//! implements the cryptographic authentication exchange performed once
//! per connection before any frames are meaningful.

pub mod frame;
pub mod handshake;

pub use frame::{decode_header, parse_text_states, parse_value_states, MessageHeader, MessageType};
pub use handshake::{authenticate, authenticate_legacy, authenticate_token, CommandChannel};
