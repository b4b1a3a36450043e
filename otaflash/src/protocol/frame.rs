//! Bridge command frames.
//!
//! The bridge adapter forwards each command onto the target's two-wire bus
//! and answers with an ACK frame. Commands and replies share one layout:
//!
//! ```text
//! +------------+--------+------+-------+---------------+--------+
//! |   Magic    | Length | Cmd  | ~Cmd  |    Payload    | CRC16  |
//! +------------+--------+------+-------+---------------+--------+
//! |   4 bytes  | 2 bytes| 1    | 1     |   variable    | 2 bytes|
//! +------------+--------+------+-------+---------------+--------+
//! | 0x4F544146 |  total | cmd  | ~cmd  |   payload     | XMODEM |
//! +------------+--------+------+-------+---------------+--------+
//! ```
//!
//! All integers are little-endian. Length covers the whole frame and the CRC
//! covers everything before it. Every command except [`Command::Scan`]
//! carries the target bus address as its first payload byte. An ACK payload
//! is `[result, data...]` with result [`ACK_SUCCESS`] on success.

use {
    crate::{
        error::{Error, Result},
        protocol::crc::crc16_xmodem,
    },
    byteorder::{ByteOrder, LittleEndian, WriteBytesExt},
    std::io::{ErrorKind, Read},
};

/// Frame magic ("FATO" little-endian).
pub const FRAME_MAGIC: u32 = 0x4F54_4146;

/// ACK result code for success.
pub const ACK_SUCCESS: u8 = 0x5A;

/// Largest data block of one [`Command::WritePage`].
pub const MAX_PAGE_SIZE: usize = 64;

/// Magic + length + cmd + ~cmd.
const HEADER_LEN: usize = 8;

/// Header + CRC.
const OVERHEAD: usize = HEADER_LEN + 2;

/// Bytes discarded while hunting for a magic before giving up.
const MAX_RESYNC: usize = 256;

/// Bridge command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Probe the bus for a target (0x10).
    Scan = 0x10,
    /// Query bootloader status (0x20).
    Status = 0x20,
    /// Erase the application region (0x30).
    Erase = 0x30,
    /// Write one page of payload (0x40).
    WritePage = 0x40,
    /// Leave the bootloader and run the application (0x50).
    Run = 0x50,
    /// Ask a running application to reset into the bootloader (0x60).
    Reset = 0x60,
    /// Reply from the bridge (0xE1).
    Ack = 0xE1,
}

impl Command {
    /// Get the complement byte (~cmd).
    pub fn reversed(self) -> u8 {
        !(self as u8)
    }
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x10 => Ok(Self::Scan),
            0x20 => Ok(Self::Status),
            0x30 => Ok(Self::Erase),
            0x40 => Ok(Self::WritePage),
            0x50 => Ok(Self::Run),
            0x60 => Ok(Self::Reset),
            0xE1 => Ok(Self::Ack),
            v => Err(Error::Protocol(format!("unknown command 0x{v:02X}"))),
        }
    }
}

/// Command frame builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeFrame {
    command: Command,
    data: Vec<u8>,
}

impl BridgeFrame {
    /// Create a frame with an empty payload.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            data: Vec::new(),
        }
    }

    fn addressed(command: Command, bus_addr: u8) -> Self {
        Self {
            command,
            data: vec![bus_addr],
        }
    }

    /// Build a bus scan frame.
    pub fn scan() -> Self {
        Self::new(Command::Scan)
    }

    /// Build a status query frame.
    pub fn status(bus_addr: u8) -> Self {
        Self::addressed(Command::Status, bus_addr)
    }

    /// Build an application erase frame.
    pub fn erase(bus_addr: u8) -> Self {
        Self::addressed(Command::Erase, bus_addr)
    }

    /// Build a page write frame.
    ///
    /// Payload: bus address, page address (u16), up to [`MAX_PAGE_SIZE`]
    /// data bytes.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn write_page(bus_addr: u8, page_addr: u16, data: &[u8]) -> Result<Self> {
        if data.len() > MAX_PAGE_SIZE {
            return Err(Error::Protocol(format!(
                "page of {} bytes exceeds the {MAX_PAGE_SIZE}-byte limit",
                data.len()
            )));
        }
        let mut frame = Self::addressed(Command::WritePage, bus_addr);
        frame.data.write_u16::<LittleEndian>(page_addr).unwrap();
        frame.data.extend_from_slice(data);
        Ok(frame)
    }

    /// Build a run-application frame.
    pub fn run(bus_addr: u8) -> Self {
        Self::addressed(Command::Run, bus_addr)
    }

    /// Build a reset-to-bootloader frame.
    pub fn reset(bus_addr: u8) -> Self {
        Self::addressed(Command::Reset, bus_addr)
    }

    /// Serialize the frame.
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn build(&self) -> Vec<u8> {
        let total_len = OVERHEAD + self.data.len();
        let mut buf = Vec::with_capacity(total_len);

        buf.write_u32::<LittleEndian>(FRAME_MAGIC).unwrap();
        // Payload is bounded by MAX_PAGE_SIZE + 3
        buf.write_u16::<LittleEndian>(total_len as u16).unwrap();
        buf.push(self.command as u8);
        buf.push(self.command.reversed());
        buf.extend_from_slice(&self.data);

        let crc = crc16_xmodem(&buf);
        buf.write_u16::<LittleEndian>(crc).unwrap();

        buf
    }

    /// Get the command.
    pub fn command(&self) -> Command {
        self.command
    }

    /// Get the payload.
    pub fn payload(&self) -> &[u8] {
        &self.data
    }
}

/// Parsed ACK frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeReply {
    /// Result code.
    pub result: u8,
    /// Data following the result code.
    pub payload: Vec<u8>,
}

impl BridgeReply {
    /// Minimum ACK frame length (overhead plus the result byte).
    pub const MIN_LEN: usize = OVERHEAD + 1;

    /// Parse one complete ACK frame.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() < Self::MIN_LEN {
            return Err(Error::Protocol(format!(
                "reply of {} bytes is shorter than {}",
                frame.len(),
                Self::MIN_LEN
            )));
        }

        let magic = LittleEndian::read_u32(&frame[0..4]);
        if magic != FRAME_MAGIC {
            return Err(Error::Protocol(format!("bad frame magic 0x{magic:08X}")));
        }

        let declared = usize::from(LittleEndian::read_u16(&frame[4..6]));
        if declared != frame.len() {
            return Err(Error::Protocol(format!(
                "length field {declared} does not match frame size {}",
                frame.len()
            )));
        }

        let (cmd, not_cmd) = (frame[6], frame[7]);
        if cmd != !not_cmd {
            return Err(Error::Protocol(format!(
                "command byte 0x{cmd:02X} does not match its complement 0x{not_cmd:02X}"
            )));
        }
        if Command::try_from(cmd)? != Command::Ack {
            return Err(Error::Protocol(format!("expected ACK, got 0x{cmd:02X}")));
        }

        let body_end = frame.len() - 2;
        let crc = LittleEndian::read_u16(&frame[body_end..]);
        let computed = crc16_xmodem(&frame[..body_end]);
        if crc != computed {
            return Err(Error::Protocol(format!(
                "CRC mismatch: frame 0x{crc:04X}, computed 0x{computed:04X}"
            )));
        }

        Ok(Self {
            result: frame[HEADER_LEN],
            payload: frame[HEADER_LEN + 1..body_end].to_vec(),
        })
    }

    /// Check if this is a successful response.
    pub fn is_success(&self) -> bool {
        self.result == ACK_SUCCESS
    }

    /// Encode an ACK frame (used by bridge simulators in tests).
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(result: u8, payload: &[u8]) -> Vec<u8> {
        let total_len = Self::MIN_LEN + payload.len();
        let mut buf = Vec::with_capacity(total_len);
        buf.write_u32::<LittleEndian>(FRAME_MAGIC).unwrap();
        buf.write_u16::<LittleEndian>(total_len as u16).unwrap();
        buf.push(Command::Ack as u8);
        buf.push(Command::Ack.reversed());
        buf.push(result);
        buf.extend_from_slice(payload);
        let crc = crc16_xmodem(&buf);
        buf.write_u16::<LittleEndian>(crc).unwrap();
        buf
    }
}

fn map_read_error(err: std::io::Error) -> Error {
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            Error::Timeout("no reply from bridge".to_string())
        },
        ErrorKind::UnexpectedEof => Error::Protocol("bridge closed the stream".to_string()),
        _ => Error::Io(err),
    }
}

/// Read one frame from `reader`, skipping noise before the magic.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>> {
    let magic = FRAME_MAGIC.to_le_bytes();
    let mut window = [0u8; 4];
    reader.read_exact(&mut window).map_err(map_read_error)?;

    let mut skipped = 0;
    while window != magic {
        if skipped >= MAX_RESYNC {
            return Err(Error::Protocol(format!(
                "no frame magic within {MAX_RESYNC} bytes"
            )));
        }
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).map_err(map_read_error)?;
        window.rotate_left(1);
        window[3] = byte[0];
        skipped += 1;
    }
    if skipped > 0 {
        log::trace!("Skipped {skipped} bytes before frame magic");
    }

    let mut len = [0u8; 2];
    reader.read_exact(&mut len).map_err(map_read_error)?;
    let total = usize::from(LittleEndian::read_u16(&len));
    if total < OVERHEAD {
        return Err(Error::Protocol(format!("frame length {total} too short")));
    }

    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&magic);
    frame.extend_from_slice(&len);
    frame.resize(total, 0);
    reader
        .read_exact(&mut frame[6..])
        .map_err(map_read_error)?;
    Ok(frame)
}
