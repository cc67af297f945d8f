//! SMS-DELIVER PDU codec and multipart reassembly
//!
//! This crate contains the pure, I/O-free half of the smsgate gateway: decoding
//! the hex-encoded PDU frames a modem returns from `AT+CMGL`, and reassembling
//! concatenated messages from their parts. Everything here operates on byte
//! slices and owned values so it can be tested against literal fixtures.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod gsm7;
pub mod multipart;
pub mod pdu;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use multipart::MultipartCollector;
pub use pdu::{parse_pdu, PduError, PduField};
pub use types::{AssembledSms, Concatenation, PduMessage, StoredIndex};
