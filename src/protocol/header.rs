//! Message header definitions
//!
//! Two header shapes share the wire: the full header, which names the
//! sender and its domain, and the reduced header for small packets.

use std::time::{SystemTime, UNIX_EPOCH};

use super::{DOMAIN_FIELD_LEN, ORIGINATOR_FIELD_LEN};

/// Message kinds carried in the full header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    /// Single key assignment
    Assign = 1,
    /// Several key assignments in one datagram
    MultiAssign = 2,
}

impl MessageType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(MessageType::Assign),
            2 => Some(MessageType::MultiAssign),
            _ => None,
        }
    }

    /// Pick the message type for a batch of `count` updates
    pub fn for_count(count: usize) -> Self {
        if count == 1 {
            MessageType::Assign
        } else {
            MessageType::MultiAssign
        }
    }
}

/// Full message header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullHeader {
    /// Logical partition of the network
    pub domain: String,
    /// host:port identity of the sender
    pub originator: String,
    pub message_type: MessageType,
    /// Number of update records following the header
    pub updates: u32,
    /// Precedence used when clocks tie
    pub quality: u32,
    /// Sender's logical clock
    pub clock: u64,
    /// Sender wall clock, seconds since the Unix epoch
    pub timestamp: u64,
    /// Remaining rebroadcast hops
    pub ttl: u8,
}

impl FullHeader {
    /// identifier(8) + size(8) + domain + originator + type(4) + updates(4)
    /// + quality(4) + clock(8) + timestamp(8) + ttl(1)
    pub const ENCODED_LEN: usize =
        8 + 8 + DOMAIN_FIELD_LEN + ORIGINATOR_FIELD_LEN + 4 + 4 + 4 + 8 + 8 + 1;
}

/// Reduced message header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReducedHeader {
    pub updates: u32,
    pub clock: u64,
    pub ttl: u8,
}

impl ReducedHeader {
    /// identifier(8) + size(8) + updates(4) + clock(8) + ttl(1)
    pub const ENCODED_LEN: usize = 8 + 8 + 4 + 8 + 1;

    /// TTL stamped on every reduced message
    pub const FIXED_TTL: u8 = 0;
}

/// A decoded message header of either shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageHeader {
    Full(FullHeader),
    Reduced(ReducedHeader),
}

impl MessageHeader {
    /// Create a full header stamped with the current wall clock
    pub fn full(
        domain: impl Into<String>,
        originator: impl Into<String>,
        quality: u32,
        clock: u64,
        ttl: u8,
    ) -> Self {
        MessageHeader::Full(FullHeader {
            domain: domain.into(),
            originator: originator.into(),
            message_type: MessageType::MultiAssign,
            updates: 0,
            quality,
            clock,
            timestamp: unix_now(),
            ttl,
        })
    }

    pub fn reduced(clock: u64) -> Self {
        MessageHeader::Reduced(ReducedHeader {
            updates: 0,
            clock,
            ttl: ReducedHeader::FIXED_TTL,
        })
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            MessageHeader::Full(_) => FullHeader::ENCODED_LEN,
            MessageHeader::Reduced(_) => ReducedHeader::ENCODED_LEN,
        }
    }

    pub fn updates(&self) -> u32 {
        match self {
            MessageHeader::Full(h) => h.updates,
            MessageHeader::Reduced(h) => h.updates,
        }
    }

    pub fn set_updates(&mut self, count: u32) {
        match self {
            MessageHeader::Full(h) => {
                h.updates = count;
                h.message_type = MessageType::for_count(count as usize);
            }
            MessageHeader::Reduced(h) => h.updates = count,
        }
    }

    pub fn clock(&self) -> u64 {
        match self {
            MessageHeader::Full(h) => h.clock,
            MessageHeader::Reduced(h) => h.clock,
        }
    }

    /// Reduced headers carry no quality; it is treated as zero
    pub fn quality(&self) -> u32 {
        match self {
            MessageHeader::Full(h) => h.quality,
            MessageHeader::Reduced(_) => 0,
        }
    }

    pub fn ttl(&self) -> u8 {
        match self {
            MessageHeader::Full(h) => h.ttl,
            MessageHeader::Reduced(h) => h.ttl,
        }
    }

    pub fn originator(&self) -> Option<&str> {
        match self {
            MessageHeader::Full(h) => Some(&h.originator),
            MessageHeader::Reduced(_) => None,
        }
    }

    pub fn is_reduced(&self) -> bool {
        matches!(self, MessageHeader::Reduced(_))
    }
}

/// Seconds since the Unix epoch (0 if the system clock is before it)
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
