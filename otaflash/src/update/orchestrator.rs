use crate::device::{DeviceProgrammer, ScanResult};
use crate::error::Result;
use crate::image::{FirmwareImage, assemble, payload_size};
use crate::net::Fetcher;
use crate::store::FileStore;
use crate::update::{
    CycleOutcome, CycleReport, FailureReason, UpdateConfig, UpdateSession, UpdateState,
    VersionCheck,
};
use log::{debug, info, warn};

/// Drives update cycles against a firmware source, a file store and a
/// target device.
///
/// Collaborators are taken by value; pass `&mut` references to keep access
/// to them after the orchestrator is dropped.
pub struct Orchestrator<'a, F, S, D> {
    config: UpdateConfig,
    fetcher: F,
    store: S,
    device: D,
    progress: Option<Box<dyn FnMut(usize, usize) + 'a>>,
}

impl<'a, F: Fetcher, S: FileStore, D> Orchestrator<'a, F, S, D> {
    /// Create an orchestrator.
    pub fn new(config: UpdateConfig, fetcher: F, store: S, device: D) -> Self {
        Self {
            config,
            fetcher,
            store,
            device,
            progress: None,
        }
    }

    /// Observe upload progress as `(bytes_done, bytes_total)`.
    #[must_use]
    pub fn with_progress(mut self, progress: impl FnMut(usize, usize) + 'a) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Update configuration.
    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    /// File store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Device programmer.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Read the persisted retry counter. Missing or unreadable means 0.
    pub fn read_retry_count(&self) -> u8 {
        let name = &self.config.artifacts.retry_count;
        if !self.store.exists(name) {
            return 0;
        }
        let text = self.read_text(name);
        match text.parse::<u8>() {
            Ok(count) => count,
            Err(_) if text.is_empty() => 0,
            Err(e) => {
                warn!("Ignoring retry counter {text:?}: {e}");
                0
            },
        }
    }

    fn persist_retry_count(&mut self, count: u8) -> Result<()> {
        debug!("Saving retry counter {count}");
        self.store
            .write(&self.config.artifacts.retry_count, &count.to_string())
    }

    /// Read a document trimmed, or an empty string if it cannot be read.
    fn read_text(&self, name: &str) -> String {
        if !self.store.exists(name) {
            return String::new();
        }
        match self.store.read(name) {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                warn!("Cannot read {name}: {e}");
                String::new()
            },
        }
    }

    fn write_best_effort(&mut self, name: &str, text: &str) {
        if let Err(e) = self.store.write(name, text) {
            warn!("Cannot write {name}: {e}");
        }
    }

    fn delete_best_effort(&mut self, name: &str) {
        if let Err(e) = self.store.delete(name) {
            warn!("Cannot delete {name}: {e}");
        }
    }

    fn fetch_latest_version(&mut self) -> Option<String> {
        let request = self.config.version_request();
        match self.fetcher.fetch(&request) {
            Ok(text) => {
                let version = text.trim().to_string();
                if version.is_empty() {
                    warn!("{request} returned an empty version");
                    None
                } else {
                    Some(version)
                }
            },
            Err(e) => {
                warn!("Version check failed: {e}");
                None
            },
        }
    }

    /// Compare onboard and published versions without changing anything.
    pub fn check_version(&mut self) -> VersionCheck {
        let names = self.config.artifacts.clone();
        let staged = self
            .store
            .exists(&names.latest_firmware)
            .then(|| self.read_text(&names.latest_version));
        VersionCheck {
            onboard: self.read_text(&names.onboard_version),
            latest: self.fetch_latest_version(),
            staged,
            retry_count: self.read_retry_count(),
        }
    }
}

impl<F: Fetcher, S: FileStore, D: DeviceProgrammer> Orchestrator<'_, F, S, D> {
    /// Run one update cycle.
    ///
    /// Returns an error only when the retry counter cannot be persisted;
    /// every other failure is recorded in the report.
    pub fn run_cycle(&mut self) -> Result<CycleReport> {
        let names = self.config.artifacts.clone();
        let max = self.config.max_retries;
        let mut session = UpdateSession::new(self.read_retry_count());

        if session.retry_count >= max {
            return self.give_up(session);
        }
        info!(
            "Update attempt {} of {max}",
            u16::from(session.retry_count) + 1
        );

        session.enter(UpdateState::CheckVersion);
        let onboard = self.read_text(&names.onboard_version);
        let latest = self.fetch_latest_version();

        if let Some(latest) = latest.as_deref() {
            if latest == onboard {
                session.enter(UpdateState::UpToDate);
                info!("Onboard firmware {onboard} is up to date");
                if self.store.exists(&names.latest_firmware) {
                    debug!("Leaving staged firmware in place");
                }
                self.start_application();
                return Ok(session.finish(CycleOutcome::UpToDate, Some(onboard)));
            }
        }

        let staged = self.store.exists(&names.latest_firmware);
        if latest.is_none() && !staged {
            info!("No update available");
            self.start_application();
            return Ok(session.finish(CycleOutcome::NoUpdateAvailable, None));
        }

        session.enter(UpdateState::NeedsUpdate);
        match latest.as_deref() {
            Some(latest) => info!("Onboard firmware [{onboard}], update available [{latest}]"),
            None => info!("Onboard firmware [{onboard}], resuming staged update"),
        }

        session.enter(UpdateState::Staging);
        let latest = latest.unwrap_or_default();
        let Some((text, version)) = self.stage(&latest, staged) else {
            self.start_application();
            return Ok(session.finish(CycleOutcome::NoUpdateAvailable, Some(latest)));
        };
        session.staged_version = Some(version);

        session.enter(UpdateState::Decoding);
        match decode(&text) {
            Ok(image) => session.staged_image = Some(image),
            Err(reason) => {
                session.enter(UpdateState::DecodeFailed);
                return self.fail(session, reason);
            },
        }

        session.enter(UpdateState::Flashing);
        self.flash(session)
    }

    /// Obtain the staged body and its version.
    ///
    /// Returns `None` when there is nothing staged and the download failed.
    fn stage(&mut self, latest: &str, staged: bool) -> Option<(String, String)> {
        let names = self.config.artifacts.clone();

        if staged {
            info!("Staged firmware found, download not necessary");
            let text = match self.store.read(&names.latest_firmware) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Cannot read staged firmware: {e}");
                    String::new()
                },
            };
            let mut version = self.read_text(&names.latest_version);
            if version.is_empty() && !latest.is_empty() {
                version = latest.to_string();
                self.write_best_effort(&names.latest_version, &version);
            }
            return Some((text, version));
        }

        let request = self.config.firmware_request(latest);
        info!("Downloading firmware {latest} from {request}");
        let body = match self.fetcher.fetch(&request) {
            Ok(body) => body,
            Err(e) => {
                warn!("Firmware download failed: {e}");
                return None;
            },
        };
        self.write_best_effort(&names.latest_firmware, &body);
        self.write_best_effort(&names.latest_version, latest);
        Some((body, latest.to_string()))
    }

    fn flash(&mut self, mut session: UpdateSession) -> Result<CycleReport> {
        let scan = self.device.scan().unwrap_or_else(|e| {
            warn!("Bus scan failed: {e}");
            ScanResult::NoDevice
        });

        let addr = match scan {
            ScanResult::NoDevice => {
                session.enter(UpdateState::FlashFailed);
                return self.fail(session, FailureReason::DeviceNotFound);
            },
            ScanResult::Application(addr) => {
                info!("Target is running its application at 0x{addr:02X}, requesting reset");
                if let Err(e) = self.device.request_reset(addr) {
                    warn!("Reset request failed: {e}");
                }
                return Ok(session.finish(CycleOutcome::ResetToBootloader, None));
            },
            ScanResult::Bootloader(addr) => addr,
        };

        let payload = session
            .staged_image
            .as_ref()
            .map(FirmwareImage::as_bytes)
            .unwrap_or_default();

        match self.program(addr, payload) {
            Ok(0) => self.commit(session, addr),
            Ok(errors) => {
                session.enter(UpdateState::FlashFailed);
                self.fail(session, FailureReason::UploadErrors(errors))
            },
            Err(e) => {
                session.enter(UpdateState::FlashFailed);
                self.fail(session, FailureReason::Device(e.to_string()))
            },
        }
    }

    fn program(&mut self, addr: u8, payload: &[u8]) -> Result<usize> {
        self.device.get_status(addr)?;
        self.device.erase_application(addr)?;
        self.device.get_status(addr)?;

        let mut silent = |_: usize, _: usize| {};
        let progress: &mut dyn FnMut(usize, usize) = match self.progress.as_mut() {
            Some(progress) => progress.as_mut(),
            None => &mut silent,
        };
        self.device.upload(addr, payload, progress)
    }

    fn commit(&mut self, mut session: UpdateSession, addr: u8) -> Result<CycleReport> {
        let names = self.config.artifacts.clone();
        session.enter(UpdateState::Committed);
        let version = session.staged_version.clone().unwrap_or_default();

        if self.store.exists(&names.latest_version) {
            if let Err(e) = self.store.rename(&names.latest_version, &names.onboard_version) {
                warn!("Cannot record onboard version: {e}");
            }
        } else {
            self.write_best_effort(&names.onboard_version, &version);
        }
        if let Err(e) = self
            .store
            .rename(&names.latest_firmware, &names.onboard_firmware)
        {
            warn!("Cannot move staged firmware: {e}");
        }

        self.persist_retry_count(0)?;
        session.retry_count = 0;

        if let Err(e) = self.device.run_application(addr) {
            warn!("Cannot start the new application: {e}");
        }
        info!("Firmware {version} committed");
        Ok(session.finish(CycleOutcome::Updated { version }, None))
    }

    fn fail(&mut self, mut session: UpdateSession, reason: FailureReason) -> Result<CycleReport> {
        let count = session.retry_count.saturating_add(1);
        warn!("{reason}; saving retry counter {count}");
        self.persist_retry_count(count)?;
        session.retry_count = count;
        Ok(session.finish(CycleOutcome::RestartRequired { reason }, None))
    }

    fn give_up(&mut self, mut session: UpdateSession) -> Result<CycleReport> {
        let names = self.config.artifacts.clone();
        session.enter(UpdateState::RetryExceeded);
        warn!(
            "Update failed {} times, abandoning it",
            session.retry_count
        );
        self.delete_best_effort(&names.latest_firmware);
        self.delete_best_effort(&names.latest_version);
        self.persist_retry_count(0)?;
        session.retry_count = 0;
        self.start_application();
        Ok(session.finish(CycleOutcome::RetryExceeded, None))
    }

    /// Make sure the target runs whatever application it holds.
    ///
    /// A bootloader is queried twice and told to run the application; a
    /// running application is left alone. Failures are logged.
    pub fn start_application(&mut self) {
        match self.device.scan() {
            Ok(ScanResult::Bootloader(addr)) => {
                info!("Bootloader at 0x{addr:02X}, starting the application");
                let started = self
                    .device
                    .get_status(addr)
                    .and_then(|_| self.device.get_status(addr))
                    .and_then(|_| self.device.run_application(addr));
                if let Err(e) = started {
                    warn!("Cannot start the application: {e}");
                }
            },
            Ok(ScanResult::Application(addr)) => {
                info!("Application running at 0x{addr:02X}, letting it run");
            },
            Ok(ScanResult::NoDevice) => {
                warn!("No valid device address found, a power cycle may help");
            },
            Err(e) => warn!("Bus scan failed: {e}"),
        }
    }
}

/// Assemble a staged body, rejecting anything that must not be flashed.
fn decode(text: &str) -> std::result::Result<FirmwareImage, FailureReason> {
    let expected = payload_size(text).map_err(|e| FailureReason::Decode(e.to_string()))?;
    let assembly = assemble(text).map_err(|e| FailureReason::Decode(e.to_string()))?;

    if assembly.image.size() != expected {
        return Err(FailureReason::Decode(format!(
            "pre-sized {expected} bytes but assembled {}",
            assembly.image.size()
        )));
    }
    if assembly.has_checksum_error() {
        return Err(FailureReason::ChecksumMismatch(assembly.mismatches.len()));
    }
    if assembly.image.is_empty() {
        return Err(FailureReason::EmptyImage);
    }
    debug!(
        "Decoded {} bytes from {} records",
        assembly.image.size(),
        assembly.records
    );
    Ok(assembly.into_image())
}
