//! # otaflash
//!
//! A library for over-the-air firmware updates of microcontrollers that
//! run a two-wire bus bootloader.
//!
//! A network-capable host fetches a firmware image in Intel HEX format,
//! decodes it into a flat payload and drives a bounded-retry update of the
//! target through a device programmer:
//!
//! - Intel HEX record decoding and image assembly ([`image`])
//! - Update cycle state machine with a persisted retry counter ([`update`])
//! - Firmware source over HTTPS with certificate pinning ([`net`])
//! - Directory-backed file store for staged artifacts ([`store`])
//! - Bus bridge programmer over a serial port ([`device`], [`protocol`])
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `http` (default): HTTPS firmware source
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! # #[cfg(all(feature = "native", feature = "http"))]
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     use otaflash::{BridgeProgrammer, DirStore, Endpoint, HttpFetcher, Orchestrator, UpdateConfig};
//!     use std::time::Duration;
//!
//!     let config = UpdateConfig::new(Endpoint::new("fw.example.com", 443))
//!         .with_base_path("/releases/attiny85");
//!     let fetcher = HttpFetcher::new(Duration::from_secs(30))?;
//!     let store = DirStore::open("/var/lib/otaflash")?;
//!     let device = BridgeProgrammer::open("/dev/ttyUSB0", 115_200)?;
//!
//!     let mut orchestrator = Orchestrator::new(config, fetcher, store, device);
//!     let report = orchestrator.run_cycle()?;
//!     println!("{}", report.outcome);
//!     Ok(())
//! }
//! # #[cfg(not(all(feature = "native", feature = "http")))]
//! # fn main() {}
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod device;
pub mod error;
pub mod image;
pub mod net;
pub mod port;
pub mod protocol;
pub mod store;
pub mod update;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

// Re-exports for convenience
#[cfg(feature = "http")]
pub use net::HttpFetcher;
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    device::{BootloaderStatus, BridgeProgrammer, DeviceProgrammer, ScanResult},
    error::{Error, Result},
    image::{
        Assembly, ChecksumMismatch, DecodeError, FirmwareImage, HexRecord, RecordType, assemble,
        decode_record, payload_size,
    },
    net::{Endpoint, FetchRequest, Fetcher, Terminator},
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    store::{ArtifactNames, DirStore, FileStore, MemoryStore, StoredFile},
    update::{
        CycleOutcome, CycleReport, FailureReason, Orchestrator, UpdateConfig, UpdateSession,
        UpdateState, VersionCheck,
    },
};
