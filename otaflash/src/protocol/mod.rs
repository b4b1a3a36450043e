//! Host-to-bridge protocol.

pub mod crc;
pub mod frame;

pub use frame::{ACK_SUCCESS, BridgeFrame, BridgeReply, Command, FRAME_MAGIC, MAX_PAGE_SIZE};
