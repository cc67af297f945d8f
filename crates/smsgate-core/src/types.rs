//! Decoded message model
//!
//! Types shared between the PDU parser and the multipart collector. A
//! [`PduMessage`] is one decoded SMS-DELIVER frame; an [`AssembledSms`] is what
//! the delivery pipeline forwards, carrying the storage indices that may be
//! deleted once delivery is confirmed.

use chrono::{DateTime, FixedOffset};

/// Slot number of a message in the modem's storage, as reported by `AT+CMGL`.
///
/// One PDU is read per index, and an index is the unit of deletion
/// (`AT+CMGD=<index>`). Indices are assigned by the modem and never reused by
/// this crate.
pub type StoredIndex = u32;

// ----------------------------------------------------------------------------
// Concatenation Info
// ----------------------------------------------------------------------------

/// Concatenation info from a user-data-header information element.
///
/// Present only when the frame carried an 8-bit (IEI `0x00`) or 16-bit
/// (IEI `0x08`) concatenation element. `part_number` is 1-based and always
/// within `1..=total_parts`; the parser drops malformed elements rather than
/// produce values outside that range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Concatenation {
    /// Reference number shared by all parts of one long message.
    pub reference: u16,
    /// 1-based position of this part.
    pub part_number: u8,
    /// Number of parts the sender split the message into.
    pub total_parts: u8,
}

// ----------------------------------------------------------------------------
// Decoded Frame
// ----------------------------------------------------------------------------

/// One decoded SMS-DELIVER frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduMessage {
    /// Service-centre number, with a leading `+` when flagged international.
    /// `None` when the frame carried no SMSC field.
    pub smsc: Option<String>,
    /// Originating address, normalized the same way.
    pub sender: String,
    /// Service-centre timestamp, including the signed quarter-hour zone.
    pub timestamp: DateTime<FixedOffset>,
    /// Message body, decoded per the frame's data coding scheme.
    pub text: String,
    /// Concatenation info when this frame is one part of a longer message.
    pub concatenation: Option<Concatenation>,
}

impl PduMessage {
    /// Whether this frame is one part of a concatenated message.
    pub fn is_multipart(&self) -> bool {
        self.concatenation.is_some()
    }
}

// ----------------------------------------------------------------------------
// Assembled Message
// ----------------------------------------------------------------------------

/// A complete message ready for forwarding.
///
/// Either a single-part message or the reassembly of a full concatenation
/// group. `indices` lists every storage slot consumed by the message; the
/// pipeline deletes them only after all destinations confirmed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledSms {
    pub sender: String,
    pub smsc: Option<String>,
    pub timestamp: DateTime<FixedOffset>,
    pub text: String,
    /// Part count of the original message; 1 for non-concatenated messages.
    pub total_parts: u8,
    /// Storage indices of every part, in ascending part order.
    pub indices: Vec<StoredIndex>,
}

impl AssembledSms {
    /// Whether this message was reassembled from multiple parts.
    pub fn is_multipart(&self) -> bool {
        self.total_parts > 1
    }
}
