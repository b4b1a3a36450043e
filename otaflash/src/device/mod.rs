//! Target device programming.
//!
//! A [`DeviceProgrammer`] talks to the bootloader of the target
//! microcontroller. The update orchestrator only sees this trait;
//! [`bridge::BridgeProgrammer`] is the implementation that reaches the
//! target through a serial-attached bus bridge.
//!
//! ## Wait contracts
//!
//! The bootloader needs settle time after some commands. Implementations
//! observe the delays in [`timing`] themselves so that callers can issue
//! commands back to back.

pub mod bridge;

use crate::error::{Error, Result};
use std::fmt;

pub use bridge::BridgeProgrammer;

/// Settle delays required by the target bootloader.
pub mod timing {
    use std::time::Duration;

    /// After a status query.
    pub const STATUS_SETTLE: Duration = Duration::from_millis(125);

    /// After erasing the application region.
    pub const ERASE_SETTLE: Duration = Duration::from_millis(750);

    /// After asking a running application to reset.
    pub const RESET_SETTLE: Duration = Duration::from_millis(250);

    /// Before leaving the bootloader to run the application.
    pub const RUN_SETTLE: Duration = Duration::from_millis(500);
}

/// Lowest bus address a bootloader answers on.
pub const MIN_BOOTLOADER_ADDR: u8 = 8;

/// Highest bus address a bootloader answers on.
pub const MAX_BOOTLOADER_ADDR: u8 = 35;

/// Outcome of probing the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ScanResult {
    /// Nothing answered.
    NoDevice,
    /// The target is in its bootloader at this address.
    Bootloader(u8),
    /// The target is running its application at this address.
    Application(u8),
}

impl ScanResult {
    /// Classify a raw bus address reported by a scan.
    ///
    /// `0` and the reserved range below [`MIN_BOOTLOADER_ADDR`] mean no usable
    /// device.
    pub fn from_address(addr: u8) -> Self {
        match addr {
            MIN_BOOTLOADER_ADDR..=MAX_BOOTLOADER_ADDR => Self::Bootloader(addr),
            a if a > MAX_BOOTLOADER_ADDR => Self::Application(addr),
            _ => Self::NoDevice,
        }
    }

    /// Bus address, if a device answered.
    pub fn address(&self) -> Option<u8> {
        match self {
            Self::NoDevice => None,
            Self::Bootloader(a) | Self::Application(a) => Some(*a),
        }
    }
}

impl fmt::Display for ScanResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDevice => write!(f, "no device"),
            Self::Bootloader(a) => write!(f, "bootloader at 0x{a:02X}"),
            Self::Application(a) => write!(f, "application at 0x{a:02X}"),
        }
    }
}

/// Status block reported by the bootloader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BootloaderStatus {
    /// Bootloader signature byte.
    pub signature: u8,
    /// Major version.
    pub version_major: u8,
    /// Minor version.
    pub version_minor: u8,
    /// Feature flags.
    pub features: u8,
    /// Start address of the bootloader in target flash.
    pub bootloader_start: u16,
}

impl BootloaderStatus {
    /// Wire size of a status block.
    pub const LEN: usize = 6;

    /// Parse a status block.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LEN {
            return Err(Error::Protocol(format!(
                "status block of {} bytes, expected {}",
                data.len(),
                Self::LEN
            )));
        }
        Ok(Self {
            signature: data[0],
            version_major: data[1],
            version_minor: data[2],
            features: data[3],
            bootloader_start: u16::from_le_bytes([data[4], data[5]]),
        })
    }

    /// Encode the status block.
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let [lo, hi] = self.bootloader_start.to_le_bytes();
        [
            self.signature,
            self.version_major,
            self.version_minor,
            self.features,
            lo,
            hi,
        ]
    }
}

impl fmt::Display for BootloaderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "signature 0x{:02X}, v{}.{}, features 0x{:02X}, start 0x{:04X}",
            self.signature,
            self.version_major,
            self.version_minor,
            self.features,
            self.bootloader_start
        )
    }
}

/// Operations of the target bootloader.
pub trait DeviceProgrammer {
    /// Probe the bus for the target.
    fn scan(&mut self) -> Result<ScanResult>;

    /// Query bootloader status.
    fn get_status(&mut self, addr: u8) -> Result<BootloaderStatus>;

    /// Erase the application region.
    fn erase_application(&mut self, addr: u8) -> Result<()>;

    /// Write `payload` to the application region.
    ///
    /// Returns the number of write errors; zero means the upload succeeded.
    /// `progress` receives `(bytes_done, bytes_total)`.
    fn upload(
        &mut self,
        addr: u8,
        payload: &[u8],
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<usize>;

    /// Leave the bootloader and run the application.
    fn run_application(&mut self, addr: u8) -> Result<()>;

    /// Ask a running application to reset into its bootloader.
    fn request_reset(&mut self, addr: u8) -> Result<()>;
}

impl<T: DeviceProgrammer + ?Sized> DeviceProgrammer for &mut T {
    fn scan(&mut self) -> Result<ScanResult> {
        (**self).scan()
    }

    fn get_status(&mut self, addr: u8) -> Result<BootloaderStatus> {
        (**self).get_status(addr)
    }

    fn erase_application(&mut self, addr: u8) -> Result<()> {
        (**self).erase_application(addr)
    }

    fn upload(
        &mut self,
        addr: u8,
        payload: &[u8],
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<usize> {
        (**self).upload(addr, payload, progress)
    }

    fn run_application(&mut self, addr: u8) -> Result<()> {
        (**self).run_application(addr)
    }

    fn request_reset(&mut self, addr: u8) -> Result<()> {
        (**self).request_reset(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_classification() {
        assert_eq!(ScanResult::from_address(0), ScanResult::NoDevice);
        assert_eq!(ScanResult::from_address(7), ScanResult::NoDevice);
        assert_eq!(ScanResult::from_address(8), ScanResult::Bootloader(8));
        assert_eq!(ScanResult::from_address(35), ScanResult::Bootloader(35));
        assert_eq!(ScanResult::from_address(36), ScanResult::Application(36));
        assert_eq!(ScanResult::from_address(0x7F), ScanResult::Application(0x7F));
    }

    #[test]
    fn test_scan_address() {
        assert_eq!(ScanResult::NoDevice.address(), None);
        assert_eq!(ScanResult::Bootloader(10).address(), Some(10));
        assert_eq!(ScanResult::Application(40).address(), Some(40));
    }

    #[test]
    fn test_status_bytes() {
        let status = BootloaderStatus {
            signature: 0x54,
            version_major: 1,
            version_minor: 6,
            features: 0x8B,
            bootloader_start: 0x1A40,
        };
        assert_eq!(status.to_bytes(), [0x54, 1, 6, 0x8B, 0x40, 0x1A]);
        assert_eq!(BootloaderStatus::from_bytes(&status.to_bytes()).unwrap(), status);
        assert!(BootloaderStatus::from_bytes(&[0x54, 1]).is_err());
    }

    #[test]
    fn test_wait_contracts() {
        assert_eq!(timing::STATUS_SETTLE.as_millis(), 125);
        assert_eq!(timing::ERASE_SETTLE.as_millis(), 750);
        assert_eq!(timing::RESET_SETTLE.as_millis(), 250);
        assert_eq!(timing::RUN_SETTLE.as_millis(), 500);
    }
}
