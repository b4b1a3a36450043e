//! Intel HEX record decoding.
//!
//! Every record is a single line of ASCII hex digits introduced by a start
//! code:
//!
//! ```text
//! +---+-------+---------+------+---------------+----------+
//! | : | COUNT | ADDRESS | TYPE |     DATA      | CHECKSUM |
//! +---+-------+---------+------+---------------+----------+
//! | 1 |   2   |    4    |  2   |   COUNT * 2   |    2     |
//! +---+-------+---------+------+---------------+----------+
//! ```
//!
//! The checksum is the two's complement of the low byte of
//! `COUNT + ADDRESS_HI + ADDRESS_LO + TYPE + sum(DATA)`. Decoding reads the
//! declared checksum but does not validate it; that is the assembler's job.

use std::fmt;
use thiserror::Error;

/// Record start code.
pub const START_CODE: u8 = b':';

/// Record type byte of a data record.
pub const DATA_RECORD: u8 = 0x00;

/// Number of text characters in the fixed part of a record after the start
/// code: count(2) + address(4) + type(2) + checksum(2).
const FIXED_DIGITS: usize = 10;

/// Record field names, used to locate decode failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// Byte count (2 digits).
    ByteCount,
    /// Load address (4 digits).
    Address,
    /// Record type (2 digits).
    RecordType,
    /// Data bytes (2 digits each).
    Data,
    /// Declared checksum (2 digits).
    Checksum,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ByteCount => "byte count",
            Self::Address => "address",
            Self::RecordType => "record type",
            Self::Data => "data",
            Self::Checksum => "checksum",
        };
        f.write_str(name)
    }
}

/// Structural decode failure.
///
/// `offset` is always the byte offset of the record's start code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The given offset does not hold a start code.
    #[error("no record start code at offset {offset}")]
    MissingStartCode {
        /// Offset that was expected to hold `:`.
        offset: usize,
    },

    /// The record ended before the named field was complete.
    #[error("record at offset {offset} is truncated in the {field} field")]
    Truncated {
        /// Offset of the record start code.
        offset: usize,
        /// Field that was cut short.
        field: Field,
    },

    /// A character in the named field is not a hex digit.
    #[error("invalid hex digit in the {field} field of the record at offset {offset}")]
    InvalidHex {
        /// Offset of the record start code.
        offset: usize,
        /// Field containing the bad character.
        field: Field,
    },

    /// The assembled payload does not fit a 16-bit image.
    #[error("payload exceeds the {max}-byte limit of a 16-bit image")]
    ImageTooLarge {
        /// Largest supported payload size.
        max: usize,
    },
}

/// Intel HEX record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Data record (0x00).
    Data,
    /// End of file (0x01).
    EndOfFile,
    /// Extended segment address (0x02).
    ExtendedSegmentAddress,
    /// Start segment address (0x03).
    StartSegmentAddress,
    /// Extended linear address (0x04).
    ExtendedLinearAddress,
    /// Start linear address (0x05).
    StartLinearAddress,
    /// Anything else.
    Unknown(u8),
}

impl From<u8> for RecordType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Data,
            0x01 => Self::EndOfFile,
            0x02 => Self::ExtendedSegmentAddress,
            0x03 => Self::StartSegmentAddress,
            0x04 => Self::ExtendedLinearAddress,
            0x05 => Self::StartLinearAddress,
            v => Self::Unknown(v),
        }
    }
}

impl RecordType {
    /// Returns the numeric value of this record type.
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Data => 0x00,
            Self::EndOfFile => 0x01,
            Self::ExtendedSegmentAddress => 0x02,
            Self::StartSegmentAddress => 0x03,
            Self::ExtendedLinearAddress => 0x04,
            Self::StartLinearAddress => 0x05,
            Self::Unknown(v) => *v,
        }
    }
}

/// The fixed leading fields of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Number of data bytes.
    pub byte_count: u8,
    /// 16-bit load address.
    pub address: u16,
    /// Record type byte.
    pub record_type: u8,
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    /// Number of data bytes (always `data.len()`).
    pub byte_count: u8,
    /// 16-bit load address.
    pub address: u16,
    /// Record type byte.
    pub record_type: u8,
    /// Data bytes.
    pub data: Vec<u8>,
    /// Checksum as declared in the text.
    pub checksum: u8,
}

impl HexRecord {
    /// Build a data record with a correct checksum.
    ///
    /// Returns `None` if `data` holds more than 255 bytes.
    pub fn data_record(address: u16, data: &[u8]) -> Option<Self> {
        let byte_count = u8::try_from(data.len()).ok()?;
        Some(Self {
            byte_count,
            address,
            record_type: DATA_RECORD,
            data: data.to_vec(),
            checksum: record_checksum(byte_count, address, DATA_RECORD, data),
        })
    }

    /// Whether this is a data (type 0) record.
    pub fn is_data(&self) -> bool {
        self.record_type == DATA_RECORD
    }

    /// Classified record type.
    pub fn kind(&self) -> RecordType {
        RecordType::from(self.record_type)
    }

    /// Checksum recomputed from the record contents.
    pub fn computed_checksum(&self) -> u8 {
        record_checksum(self.byte_count, self.address, self.record_type, &self.data)
    }

    /// Whether the declared checksum matches the recomputed one.
    pub fn checksum_matches(&self) -> bool {
        self.computed_checksum() == self.checksum
    }
}

impl fmt::Display for HexRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            ":{:02X}{:04X}{:02X}",
            self.byte_count, self.address, self.record_type
        )?;
        for byte in &self.data {
            write!(f, "{byte:02X}")?;
        }
        write!(f, "{:02X}", self.checksum)
    }
}

/// Compute the checksum of a record.
pub fn record_checksum(byte_count: u8, address: u16, record_type: u8, data: &[u8]) -> u8 {
    let [addr_hi, addr_lo] = address.to_be_bytes();
    let sum = data.iter().fold(
        byte_count
            .wrapping_add(addr_hi)
            .wrapping_add(addr_lo)
            .wrapping_add(record_type),
        |acc, &b| acc.wrapping_add(b),
    );
    sum.wrapping_neg()
}

/// Sequential reader over the hex digit fields of one record.
struct FieldReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    record: usize,
}

impl<'a> FieldReader<'a> {
    fn new(text: &'a str, offset: usize) -> Result<Self, DecodeError> {
        let bytes = text.as_bytes();
        if bytes.get(offset) != Some(&START_CODE) {
            return Err(DecodeError::MissingStartCode { offset });
        }
        Ok(Self {
            bytes,
            pos: offset + 1,
            record: offset,
        })
    }

    fn read_u8(&mut self, field: Field) -> Result<u8, DecodeError> {
        let mut value = 0u8;
        for _ in 0..2 {
            let Some(&c) = self.bytes.get(self.pos) else {
                return Err(DecodeError::Truncated {
                    offset: self.record,
                    field,
                });
            };
            let digit = match hex_digit(c) {
                Some(d) => d,
                // A line break or the next start code means the record ended early
                None if matches!(c, b'\r' | b'\n' | START_CODE) => {
                    return Err(DecodeError::Truncated {
                        offset: self.record,
                        field,
                    });
                },
                None => {
                    return Err(DecodeError::InvalidHex {
                        offset: self.record,
                        field,
                    });
                },
            };
            value = (value << 4) | digit;
            self.pos += 1;
        }
        Ok(value)
    }

    fn read_u16(&mut self, field: Field) -> Result<u16, DecodeError> {
        let hi = self.read_u8(field)?;
        let lo = self.read_u8(field)?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn read_header(&mut self) -> Result<RecordHeader, DecodeError> {
        let byte_count = self.read_u8(Field::ByteCount)?;
        let address = self.read_u16(Field::Address)?;
        let record_type = self.read_u8(Field::RecordType)?;
        Ok(RecordHeader {
            byte_count,
            address,
            record_type,
        })
    }
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Decode only the byte count, address and type of the record at `offset`.
pub fn decode_header(text: &str, offset: usize) -> Result<RecordHeader, DecodeError> {
    FieldReader::new(text, offset)?.read_header()
}

/// Decode the full record whose start code sits at `offset` in `text`.
pub fn decode_record(text: &str, offset: usize) -> Result<HexRecord, DecodeError> {
    let mut reader = FieldReader::new(text, offset)?;
    let header = reader.read_header()?;

    let mut data = Vec::with_capacity(usize::from(header.byte_count));
    for _ in 0..header.byte_count {
        data.push(reader.read_u8(Field::Data)?);
    }
    let checksum = reader.read_u8(Field::Checksum)?;

    Ok(HexRecord {
        byte_count: header.byte_count,
        address: header.address,
        record_type: header.record_type,
        data,
        checksum,
    })
}

/// Text length of a record with `byte_count` data bytes, start code included.
pub fn record_len(byte_count: u8) -> usize {
    1 + FIXED_DIGITS + 2 * usize::from(byte_count)
}
