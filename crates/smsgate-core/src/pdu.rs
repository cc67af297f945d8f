//! SMS-DELIVER frame parser
//!
//! Decodes one hex-encoded PDU, as returned by `AT+CMGL` in PDU mode, into a
//! [`PduMessage`]. Parsing is strict about structure (a field running past the
//! end of the buffer is a hard error naming the field) but lenient about
//! content: a bad BCD nibble degrades to zero, a filler nibble in an address
//! is dropped, and an unknown data coding scheme produces a placeholder body
//! instead of failing the frame.

use chrono::{DateTime, FixedOffset, Offset, TimeZone, Utc};

use crate::gsm7;
use crate::types::{Concatenation, PduMessage};

/// Minimum viable frame: anything shorter cannot hold the fixed fields.
const MIN_PDU_BYTES: usize = 10;

/// Concatenated-SMS information element with an 8-bit reference.
const IEI_CONCAT_8BIT: u8 = 0x00;
/// Concatenated-SMS information element with a 16-bit reference.
const IEI_CONCAT_16BIT: u8 = 0x08;

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

/// Field whose declared length ran past the end of the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduField {
    Smsc,
    FrameType,
    SenderLength,
    SenderType,
    SenderAddress,
    ProtocolId,
    CodingScheme,
    Timestamp,
    UserDataLength,
    UserDataHeader,
}

impl std::fmt::Display for PduField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PduField::Smsc => "SMSC address",
            PduField::FrameType => "frame type octet",
            PduField::SenderLength => "sender address length",
            PduField::SenderType => "sender address type",
            PduField::SenderAddress => "sender address",
            PduField::ProtocolId => "protocol identifier",
            PduField::CodingScheme => "data coding scheme",
            PduField::Timestamp => "service-centre timestamp",
            PduField::UserDataLength => "user data length",
            PduField::UserDataHeader => "user data header",
        };
        f.write_str(name)
    }
}

/// Why a PDU could not be decoded.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PduError {
    #[error("PDU is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("PDU too short: {len} bytes")]
    Truncated { len: usize },

    #[error("PDU truncated in {0}")]
    FieldOverrun(PduField),

    #[error("unsupported frame type (MTI {mti}, expected SMS-DELIVER)")]
    UnsupportedFrameType { mti: u8 },
}

// ----------------------------------------------------------------------------
// Frame Parsing
// ----------------------------------------------------------------------------

/// Alphabet selected by bits 2-3 of the data coding scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Alphabet {
    Gsm7,
    Data8Bit,
    Ucs2,
    Reserved,
}

impl Alphabet {
    fn from_dcs(dcs: u8) -> Self {
        match (dcs >> 2) & 0x03 {
            0 => Alphabet::Gsm7,
            1 => Alphabet::Data8Bit,
            2 => Alphabet::Ucs2,
            _ => Alphabet::Reserved,
        }
    }
}

/// Decode one hex-encoded SMS-DELIVER PDU.
pub fn parse_pdu(pdu_hex: &str) -> Result<PduMessage, PduError> {
    let data = hex::decode(pdu_hex.trim())?;
    if data.len() < MIN_PDU_BYTES {
        return Err(PduError::Truncated { len: data.len() });
    }

    let mut pos = 0usize;

    // SMSC field: length prefix covers the type octet plus the digits.
    // Zero length means no SMSC is present.
    let smsc_len = usize::from(data[pos]);
    pos += 1;
    let mut smsc = None;
    if smsc_len > 0 {
        if pos + smsc_len > data.len() {
            return Err(PduError::FieldOverrun(PduField::Smsc));
        }
        if smsc_len > 1 {
            let type_octet = data[pos];
            let digits = &data[pos + 1..pos + smsc_len];
            smsc = Some(decode_semi_octets(digits, is_international(type_octet)));
        }
        pos += smsc_len;
    }

    // First octet of the TPDU: low two bits are the message type indicator,
    // bit 6 flags a user-data header.
    let first_octet = *data.get(pos).ok_or(PduError::FieldOverrun(PduField::FrameType))?;
    pos += 1;
    let mti = first_octet & 0x03;
    if mti != 0x00 {
        return Err(PduError::UnsupportedFrameType { mti });
    }
    let has_udh = first_octet & 0x40 != 0;

    // Originating address: digit count, type octet, packed semi-octets.
    let digit_count =
        usize::from(*data.get(pos).ok_or(PduError::FieldOverrun(PduField::SenderLength))?);
    pos += 1;
    let sender_type = *data.get(pos).ok_or(PduError::FieldOverrun(PduField::SenderType))?;
    pos += 1;
    let sender_bytes = digit_count.div_ceil(2);
    if pos + sender_bytes > data.len() {
        return Err(PduError::FieldOverrun(PduField::SenderAddress));
    }
    let sender =
        decode_semi_octets(&data[pos..pos + sender_bytes], is_international(sender_type));
    pos += sender_bytes;

    // Protocol identifier, skipped.
    if pos >= data.len() {
        return Err(PduError::FieldOverrun(PduField::ProtocolId));
    }
    pos += 1;

    let dcs = *data.get(pos).ok_or(PduError::FieldOverrun(PduField::CodingScheme))?;
    pos += 1;
    let alphabet = Alphabet::from_dcs(dcs);

    if pos + 7 > data.len() {
        return Err(PduError::FieldOverrun(PduField::Timestamp));
    }
    let timestamp = decode_scts(&data[pos..pos + 7]);
    pos += 7;

    // User data length: septets for the 7-bit alphabet, octets otherwise.
    let udl = usize::from(*data.get(pos).ok_or(PduError::FieldOverrun(PduField::UserDataLength))?);
    pos += 1;

    let mut user_data = &data[pos..];
    let mut concatenation = None;
    let mut septet_count = udl;
    let mut fill_bits = 0usize;

    if has_udh && !user_data.is_empty() {
        let udh_len = usize::from(user_data[0]) + 1;
        if udh_len > user_data.len() {
            return Err(PduError::FieldOverrun(PduField::UserDataHeader));
        }
        concatenation = parse_concatenation(&user_data[1..udh_len]);
        user_data = &user_data[udh_len..];

        if alphabet == Alphabet::Gsm7 {
            // The declared length counts the header; drop its septet
            // equivalent and realign on the next septet boundary.
            let header_bits = udh_len * 8;
            septet_count = septet_count.saturating_sub(header_bits.div_ceil(7));
            fill_bits = (7 - header_bits % 7) % 7;
        }
    }

    let text = match alphabet {
        Alphabet::Gsm7 => gsm7::unpack(user_data, septet_count, fill_bits),
        Alphabet::Data8Bit => String::from_utf8_lossy(user_data).into_owned(),
        Alphabet::Ucs2 => decode_ucs2(user_data),
        Alphabet::Reserved => format!("[unsupported data coding scheme 0x{dcs:02X}]"),
    };

    Ok(PduMessage {
        smsc,
        sender,
        timestamp,
        text,
        concatenation,
    })
}

// ----------------------------------------------------------------------------
// Field Decoders
// ----------------------------------------------------------------------------

/// Bits 4-6 of an address type octet: `0x10` marks an international number.
fn is_international(type_octet: u8) -> bool {
    type_octet & 0x70 == 0x10
}

/// Decode a nibble-swapped semi-octet address.
///
/// Each byte holds two digits, low nibble first. Non-decimal nibbles (the
/// `0xF` filler that pads an odd digit count, or corrupt values) are dropped.
fn decode_semi_octets(data: &[u8], international: bool) -> String {
    let mut number = String::with_capacity(data.len() * 2 + 1);
    if international {
        number.push('+');
    }
    for &byte in data {
        let lo = byte & 0x0F;
        let hi = byte >> 4;
        if lo <= 9 {
            number.push(char::from(b'0' + lo));
        }
        if hi <= 9 {
            number.push(char::from(b'0' + hi));
        }
    }
    number
}

/// Decode the 7-byte service-centre timestamp.
///
/// Every byte is a nibble-swapped BCD pair; the year is two-digit, 2000-based.
/// The zone byte counts signed quarter hours, the sign living in bit 3 of the
/// tens nibble. Corrupt nibbles decode as zero, and an undecodable date falls
/// back to the epoch rather than failing the frame.
fn decode_scts(data: &[u8]) -> DateTime<FixedOffset> {
    let bcd = |byte: u8| -> u32 {
        let lo = u32::from(byte & 0x0F);
        let hi = u32::from(byte >> 4);
        if lo > 9 || hi > 9 {
            0
        } else {
            lo * 10 + hi
        }
    };

    let year = 2000 + bcd(data[0]) as i32;
    let month = bcd(data[1]);
    let day = bcd(data[2]);
    let hour = bcd(data[3]);
    let minute = bcd(data[4]);
    let second = bcd(data[5]);

    let zone = data[6];
    let negative = zone & 0x08 != 0;
    let quarter_hours = bcd(zone & 0xF7) as i32;
    let mut offset_secs = quarter_hours * 15 * 60;
    if negative {
        offset_secs = -offset_secs;
    }
    let offset = FixedOffset::east_opt(offset_secs).unwrap_or_else(|| Utc.fix());

    offset
        .with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()
        .unwrap_or_else(|| DateTime::UNIX_EPOCH.with_timezone(&offset))
}

/// Decode UCS2 (UTF-16BE) user data, surrogate pairs included.
fn decode_ucs2(data: &[u8]) -> String {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Scan user-data-header information elements for concatenation info.
///
/// Unrecognized elements are skipped by their declared length. A malformed
/// concatenation element (zero total, zero part, or a part past the total) is
/// ignored so the frame degrades to a single-part message.
fn parse_concatenation(udh: &[u8]) -> Option<Concatenation> {
    let mut pos = 0usize;
    let mut found = None;
    while pos + 2 <= udh.len() {
        let iei = udh[pos];
        let ie_len = usize::from(udh[pos + 1]);
        pos += 2;
        if pos + ie_len > udh.len() {
            break;
        }
        let ie = &udh[pos..pos + ie_len];
        pos += ie_len;

        let candidate = match iei {
            IEI_CONCAT_8BIT if ie.len() >= 3 => concat_info(u16::from(ie[0]), ie[1], ie[2]),
            IEI_CONCAT_16BIT if ie.len() >= 4 => {
                concat_info(u16::from_be_bytes([ie[0], ie[1]]), ie[2], ie[3])
            }
            _ => None,
        };
        if candidate.is_some() {
            found = candidate;
        }
    }
    found
}

fn concat_info(reference: u16, total_parts: u8, part_number: u8) -> Option<Concatenation> {
    if total_parts == 0 || part_number == 0 || part_number > total_parts {
        return None;
    }
    Some(Concatenation {
        reference,
        part_number,
        total_parts,
    })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
