//! Firmware image handling.
//!
//! - [`ihex`]: single Intel HEX record decoding
//! - [`assembler`]: whole-document assembly into a flat payload

pub mod assembler;
pub mod ihex;

pub use assembler::{Assembly, ChecksumMismatch, FirmwareImage, MAX_IMAGE_SIZE, assemble, payload_size};
pub use ihex::{DecodeError, Field, HexRecord, RecordHeader, RecordType, decode_header, decode_record};
