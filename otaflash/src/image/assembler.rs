//! Firmware image assembly from Intel HEX text.
//!
//! The assembler walks a whole HEX document, decodes every record and
//! concatenates the data records into one flat payload. Bytes are placed in
//! the order the records appear, not at their load address, so images are
//! expected to be record-order contiguous.
//!
//! Checksum failures are collected rather than treated as fatal: every record
//! is still decoded and appended, and the caller decides what a mismatch
//! means. Only a structural [`DecodeError`] aborts assembly.

use crate::image::ihex::{DATA_RECORD, DecodeError, START_CODE, decode_header, decode_record};
use log::{debug, trace};
use std::fmt::Write as _;

/// Largest payload a flat 16-bit image can hold.
pub const MAX_IMAGE_SIZE: usize = u16::MAX as usize;

/// Number of payload bytes per line in [`FirmwareImage::hex_dump`].
const DUMP_WIDTH: usize = 16;

/// Flat binary payload assembled from the data records of a HEX document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FirmwareImage {
    payload: Vec<u8>,
    size: u16,
}

impl FirmwareImage {
    /// Wrap an already flat payload.
    pub fn from_payload(payload: Vec<u8>) -> Result<Self, DecodeError> {
        let size = u16::try_from(payload.len()).map_err(|_| DecodeError::ImageTooLarge {
            max: MAX_IMAGE_SIZE,
        })?;
        Ok(Self { payload, size })
    }

    /// Payload bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    /// Payload size in bytes.
    pub fn size(&self) -> u16 {
        self.size
    }

    /// Payload size as `usize`.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Consume the image and return the payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Render the payload as numbered lines of 16 hex bytes.
    pub fn hex_dump(&self) -> String {
        let mut out = String::new();
        for (line, chunk) in self.payload.chunks(DUMP_WIDTH).enumerate() {
            let _ = write!(out, "{:04X}:", line * DUMP_WIDTH);
            for byte in chunk {
                let _ = write!(out, " {byte:02X}");
            }
            out.push('\n');
        }
        out
    }
}

/// A data record whose declared checksum did not match its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ChecksumMismatch {
    /// Ordinal of the record within the document (all record types counted).
    pub index: usize,
    /// Byte offset of the record start code.
    pub offset: usize,
    /// Load address of the record.
    pub address: u16,
    /// Checksum declared in the text.
    pub declared: u8,
    /// Checksum computed from the record contents.
    pub computed: u8,
}

/// Result of assembling one HEX document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Assembly {
    /// The assembled image.
    pub image: FirmwareImage,
    /// Number of records decoded, of any type.
    pub records: usize,
    /// Number of data records appended to the payload.
    pub data_records: usize,
    /// Data records that failed checksum validation, in document order.
    pub mismatches: Vec<ChecksumMismatch>,
}

impl Assembly {
    /// Whether any data record failed checksum validation.
    pub fn has_checksum_error(&self) -> bool {
        !self.mismatches.is_empty()
    }

    /// Consume the assembly and return the image.
    pub fn into_image(self) -> FirmwareImage {
        self.image
    }
}

/// Offsets of every record start code in `text`.
fn record_offsets(text: &str) -> impl Iterator<Item = usize> + '_ {
    text.bytes()
        .enumerate()
        .filter(|&(_, b)| b == START_CODE)
        .map(|(offset, _)| offset)
}

fn add_size(total: u16, byte_count: u8) -> Result<u16, DecodeError> {
    total
        .checked_add(u16::from(byte_count))
        .ok_or(DecodeError::ImageTooLarge {
            max: MAX_IMAGE_SIZE,
        })
}

/// Compute the payload size of a HEX document without assembling it.
///
/// Only the header of each record is decoded. For every document that
/// [`assemble`] accepts the result equals the assembled image size.
pub fn payload_size(hex_text: &str) -> Result<u16, DecodeError> {
    let size = record_offsets(hex_text).try_fold(0u16, |total, offset| {
        let header = decode_header(hex_text, offset)?;
        if header.record_type == DATA_RECORD {
            add_size(total, header.byte_count)
        } else {
            Ok(total)
        }
    })?;
    debug!("HEX document: {} chars, payload size {size}", hex_text.len());
    Ok(size)
}

/// Decode a whole HEX document into a flat image.
pub fn assemble(hex_text: &str) -> Result<Assembly, DecodeError> {
    let mut payload = Vec::new();
    let mut size = 0u16;
    let mut records = 0usize;
    let mut data_records = 0usize;
    let mut mismatches = Vec::new();

    for (index, offset) in record_offsets(hex_text).enumerate() {
        let record = decode_record(hex_text, offset)?;
        records += 1;

        if !record.is_data() {
            trace!(
                "Skipping {:?} record at offset {offset}",
                record.kind()
            );
            continue;
        }

        size = add_size(size, record.byte_count)?;
        data_records += 1;

        let computed = record.computed_checksum();
        if computed != record.checksum {
            debug!(
                "Checksum mismatch in record {index} @ 0x{:04X}: declared {:02X}, computed {computed:02X}",
                record.address, record.checksum
            );
            mismatches.push(ChecksumMismatch {
                index,
                offset,
                address: record.address,
                declared: record.checksum,
                computed,
            });
        }

        payload.extend_from_slice(&record.data);
    }

    debug!(
        "Assembled {size} bytes from {data_records}/{records} records ({} checksum errors)",
        mismatches.len()
    );

    Ok(Assembly {
        image: FirmwareImage { payload, size },
        records,
        data_records,
        mismatches,
    })
}
