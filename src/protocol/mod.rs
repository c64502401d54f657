//! Protocol module - Defines the wire protocol for knowledge dissemination
//!
//! Every datagram is one message:
//! - 8 byte identifier (selects the full or reduced header shape)
//! - 8 byte total size (big-endian), header included
//! - remaining header fields
//! - `update count` key/value records
//!
//! All multi-byte integers are big-endian.

mod codec;
mod header;
mod value;

pub use codec::*;
pub use header::*;
pub use value::*;

/// Protocol version. Its digit is part of both header identifiers, so
/// messages from another version fail the identifier check on decode.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default multicast group shared by agents and ground controllers
pub const DEFAULT_GROUP: &str = "239.255.0.1:4150";

/// Identifier leading every full-header message
pub const FULL_IDENTIFIER: [u8; 8] = *b"SWCAST1F";

/// Identifier leading every reduced-header message
pub const REDUCED_IDENTIFIER: [u8; 8] = *b"SWCAST1R";

/// Width of the NUL-padded domain field
pub const DOMAIN_FIELD_LEN: usize = 32;

/// Width of the NUL-padded originator field
pub const ORIGINATOR_FIELD_LEN: usize = 64;

/// Largest payload a single UDP datagram can carry over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;
