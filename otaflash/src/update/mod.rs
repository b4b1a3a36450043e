//! Update cycle state machine.
//!
//! One [`Orchestrator::run_cycle`] call performs a full update attempt:
//!
//! ```text
//! Idle -> CheckVersion -> UpToDate
//!                      -> NeedsUpdate -> Staging -> Decoding -> DecodeFailed
//!                                                            -> Flashing -> FlashFailed
//!                                                                        -> Committed
//! Idle -> RetryExceeded
//! ```
//!
//! The only state that survives between cycles is held in the file store:
//! the retry counter, the staged firmware and the version strings. A failed
//! cycle bumps the counter and asks the caller to restart; once the counter
//! reaches [`UpdateConfig::max_retries`] the next cycle gives up, clears the
//! staged artifacts and runs whatever application the target already has.

mod orchestrator;

pub use orchestrator::Orchestrator;

use crate::image::FirmwareImage;
use crate::net::{Endpoint, FetchRequest, Terminator};
use crate::store::ArtifactNames;
use log::debug;
use std::fmt;

/// Default number of failed attempts before giving up.
pub const DEFAULT_MAX_RETRIES: u8 = 3;

/// Update source and policy.
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    /// Server hosting the releases.
    pub endpoint: Endpoint,
    /// Directory on the server holding the version file and firmware bodies.
    pub base_path: String,
    /// Name of the one-line latest-version file under `base_path`.
    pub version_file: String,
    /// Failed attempts allowed before giving up.
    pub max_retries: u8,
    /// File store document names.
    pub artifacts: ArtifactNames,
}

impl UpdateConfig {
    /// Default version file name.
    pub const DEFAULT_VERSION_FILE: &'static str = "fw-latest.md";

    /// Configuration for an endpoint with default paths and policy.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            base_path: "/".to_string(),
            version_file: Self::DEFAULT_VERSION_FILE.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            artifacts: ArtifactNames::default(),
        }
    }

    /// Set the release directory.
    #[must_use]
    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    /// Set the version file name.
    #[must_use]
    pub fn with_version_file(mut self, version_file: impl Into<String>) -> Self {
        self.version_file = version_file.into();
        self
    }

    /// Set the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u8) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn join(&self, file: &str) -> String {
        let base = self.base_path.trim_end_matches('/');
        let base = if base.starts_with('/') || base.is_empty() {
            base.to_string()
        } else {
            format!("/{base}")
        };
        format!("{base}/{file}")
    }

    /// Request for the latest version string.
    pub fn version_request(&self) -> FetchRequest {
        FetchRequest::new(
            self.endpoint.clone(),
            self.join(&self.version_file),
            Terminator::LINE,
        )
    }

    /// Request for the HEX body of `version`.
    pub fn firmware_request(&self, version: &str) -> FetchRequest {
        FetchRequest::new(
            self.endpoint.clone(),
            self.join(&format!("firmware-{version}.hex")),
            Terminator::Eof,
        )
    }
}

/// States of one update cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum UpdateState {
    /// Cycle created, retry counter not yet examined.
    Idle,
    /// Comparing onboard and published versions.
    CheckVersion,
    /// The target already runs the published version.
    UpToDate,
    /// A different version is published or staged.
    NeedsUpdate,
    /// Obtaining the firmware body.
    Staging,
    /// Assembling the staged body.
    Decoding,
    /// The staged body is malformed or failed checksum validation.
    DecodeFailed,
    /// Programming the target.
    Flashing,
    /// The target could not be programmed.
    FlashFailed,
    /// The new firmware is on the target and recorded as onboard.
    Committed,
    /// The retry budget is exhausted.
    RetryExceeded,
}

impl UpdateState {
    /// Whether no further transition follows this state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::UpToDate
                | Self::DecodeFailed
                | Self::FlashFailed
                | Self::Committed
                | Self::RetryExceeded
        )
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a cycle failed.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum FailureReason {
    /// The staged body is not valid Intel HEX.
    Decode(String),
    /// Data records failed checksum validation.
    ChecksumMismatch(usize),
    /// The staged body holds no data records.
    EmptyImage,
    /// Nothing answered the bus scan.
    DeviceNotFound,
    /// The upload finished with write errors.
    UploadErrors(usize),
    /// A programmer command failed.
    Device(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(msg) => write!(f, "firmware decode failed: {msg}"),
            Self::ChecksumMismatch(n) => write!(f, "{n} records failed checksum validation"),
            Self::EmptyImage => write!(f, "firmware contains no data"),
            Self::DeviceNotFound => write!(f, "target device not found"),
            Self::UploadErrors(n) => write!(f, "upload finished with {n} errors"),
            Self::Device(msg) => write!(f, "device error: {msg}"),
        }
    }
}

/// What the caller must do after a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum CycleOutcome {
    /// The target runs the published version.
    UpToDate,
    /// No version could be obtained; the resident application was started.
    NoUpdateAvailable,
    /// New firmware committed and started.
    Updated {
        /// Version now onboard.
        version: String,
    },
    /// The failure was recorded; restart to try again.
    RestartRequired {
        /// What went wrong.
        reason: FailureReason,
    },
    /// The running application was asked to reset into its bootloader;
    /// restart to begin a fresh cycle.
    ResetToBootloader,
    /// Retry budget exhausted; staged artifacts cleared.
    RetryExceeded,
}

impl CycleOutcome {
    /// Whether the caller should restart and run another cycle.
    pub fn requires_restart(&self) -> bool {
        matches!(self, Self::RestartRequired { .. } | Self::ResetToBootloader)
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpToDate => write!(f, "firmware is up to date"),
            Self::NoUpdateAvailable => write!(f, "no update available"),
            Self::Updated { version } => write!(f, "updated to {version}"),
            Self::RestartRequired { reason } => write!(f, "restart required: {reason}"),
            Self::ResetToBootloader => write!(f, "target reset into bootloader, restart required"),
            Self::RetryExceeded => write!(f, "retry limit exceeded, update abandoned"),
        }
    }
}

/// Transient state of one cycle.
#[derive(Debug, Clone)]
pub struct UpdateSession {
    /// Current state.
    pub state: UpdateState,
    /// Retry counter as persisted.
    pub retry_count: u8,
    /// Image assembled from the staged body.
    pub staged_image: Option<FirmwareImage>,
    /// Version of the staged body.
    pub staged_version: Option<String>,
    /// Every state entered, in order.
    pub history: Vec<UpdateState>,
}

impl UpdateSession {
    /// Start a session with the persisted retry counter.
    pub fn new(retry_count: u8) -> Self {
        Self {
            state: UpdateState::Idle,
            retry_count,
            staged_image: None,
            staged_version: None,
            history: vec![UpdateState::Idle],
        }
    }

    /// Move to `state`.
    pub fn enter(&mut self, state: UpdateState) {
        debug!("{} -> {state}", self.state);
        self.state = state;
        self.history.push(state);
    }

    /// Close the session into a report.
    pub fn finish(self, outcome: CycleOutcome, version: Option<String>) -> CycleReport {
        CycleReport {
            state: self.state,
            outcome,
            retry_count: self.retry_count,
            history: self.history,
            version: version.or(self.staged_version),
        }
    }
}

/// Result of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CycleReport {
    /// Last state entered.
    ///
    /// Not terminal when the cycle stopped early: `NoUpdateAvailable` ends in
    /// `CheckVersion` or `Staging`, `ResetToBootloader` in `Flashing`.
    pub state: UpdateState,
    /// What the caller must do next.
    pub outcome: CycleOutcome,
    /// Retry counter as persisted at the end of the cycle.
    pub retry_count: u8,
    /// Every state entered, in order.
    pub history: Vec<UpdateState>,
    /// Version considered by the cycle, if any.
    pub version: Option<String>,
}

/// Result of a read-only version check.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct VersionCheck {
    /// Version recorded as onboard (empty if unknown).
    pub onboard: String,
    /// Published version, if the server answered.
    pub latest: Option<String>,
    /// Version of the staged firmware, if any is staged.
    pub staged: Option<String>,
    /// Persisted retry counter.
    pub retry_count: u8,
}

impl VersionCheck {
    /// Whether the next cycle would attempt an update.
    pub fn update_available(&self) -> bool {
        match &self.latest {
            Some(latest) => *latest != self.onboard,
            None => self.staged.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> UpdateConfig {
        UpdateConfig::new(Endpoint::new("fw.example.com", 443))
    }

    #[test]
    fn test_default_policy() {
        let config = config();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.artifacts, ArtifactNames::default());
    }

    #[test]
    fn test_request_paths() {
        let config = config().with_base_path("/acme/fw-attiny85/");
        assert_eq!(
            config.version_request().url(),
            "https://fw.example.com:443/acme/fw-attiny85/fw-latest.md"
        );
        let body = config.firmware_request("1.3");
        assert_eq!(body.path, "/acme/fw-attiny85/firmware-1.3.hex");
        assert_eq!(body.terminator, Terminator::Eof);
        assert_eq!(config.version_request().terminator, Terminator::LINE);
    }

    #[test]
    fn test_request_paths_root_and_relative() {
        assert_eq!(config().version_request().path, "/fw-latest.md");
        assert_eq!(
            config().with_base_path("releases").firmware_request("2").path,
            "/releases/firmware-2.hex"
        );
    }

    #[test]
    fn test_session_history() {
        let mut session = UpdateSession::new(1);
        session.enter(UpdateState::CheckVersion);
        session.enter(UpdateState::UpToDate);
        let report = session.finish(CycleOutcome::UpToDate, Some("1.0".to_string()));
        assert_eq!(
            report.history,
            vec![
                UpdateState::Idle,
                UpdateState::CheckVersion,
                UpdateState::UpToDate
            ]
        );
        assert_eq!(report.state, UpdateState::UpToDate);
        assert_eq!(report.retry_count, 1);
        assert!(report.state.is_terminal());
    }

    #[test]
    fn test_outcome_restart_classes() {
        assert!(CycleOutcome::ResetToBootloader.requires_restart());
        assert!(
            CycleOutcome::RestartRequired {
                reason: FailureReason::DeviceNotFound
            }
            .requires_restart()
        );
        assert!(!CycleOutcome::RetryExceeded.requires_restart());
        assert!(!CycleOutcome::UpToDate.requires_restart());
    }

    #[test]
    fn test_version_check_availability() {
        let mut check = VersionCheck {
            onboard: "1.0".to_string(),
            latest: Some("1.0".to_string()),
            staged: None,
            retry_count: 0,
        };
        assert!(!check.update_available());
        check.latest = Some("1.1".to_string());
        assert!(check.update_available());
        check.latest = None;
        assert!(!check.update_available());
        check.staged = Some("1.1".to_string());
        assert!(check.update_available());
    }
}
