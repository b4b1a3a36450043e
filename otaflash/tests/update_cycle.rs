//! Update cycle scenarios against in-memory collaborators.

use std::collections::HashMap;

use otaflash::device::BootloaderStatus;
use otaflash::{
    ArtifactNames, CycleOutcome, CycleReport, DeviceProgrammer, DirStore, Endpoint, Error,
    FailureReason, FetchRequest, Fetcher, FileStore, MemoryStore, Orchestrator, Result,
    ScanResult, Terminator, UpdateConfig, UpdateState,
};

const BODY: &str = ":10010000214601360121470136007EFE09D2190140\n:00000001FF\n";
const BAD_BODY: &str = ":10010000214601360121470136007EFE09D2190141\n:00000001FF\n";

#[derive(Default)]
struct FakeFetcher {
    version: Option<String>,
    bodies: HashMap<String, String>,
    requests: Vec<String>,
}

impl FakeFetcher {
    fn publishing(version: &str, body: &str) -> Self {
        let mut bodies = HashMap::new();
        bodies.insert(format!("/firmware-{version}.hex"), body.to_string());
        Self {
            version: Some(version.to_string()),
            bodies,
            requests: Vec::new(),
        }
    }

    fn offline() -> Self {
        Self::default()
    }

    fn body_requests(&self) -> usize {
        self.requests
            .iter()
            .filter(|p| p.starts_with("/firmware-"))
            .count()
    }
}

impl Fetcher for FakeFetcher {
    fn fetch(&mut self, request: &FetchRequest) -> Result<String> {
        self.requests.push(request.path.clone());
        let found = match request.terminator {
            Terminator::Byte(_) => self.version.clone(),
            Terminator::Eof => self.bodies.get(&request.path).cloned(),
        };
        found.ok_or_else(|| Error::Transport(format!("{}: 404", request.path)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Scan,
    Status(u8),
    Erase(u8),
    Upload(u8, usize),
    Run(u8),
    Reset(u8),
}

struct FakeDevice {
    scan: ScanResult,
    upload_errors: usize,
    erase_fails: bool,
    upload_interrupted: bool,
    calls: Vec<Call>,
}

impl FakeDevice {
    fn bootloader() -> Self {
        Self::at(ScanResult::Bootloader(0x0A))
    }

    fn at(scan: ScanResult) -> Self {
        Self {
            scan,
            upload_errors: 0,
            erase_fails: false,
            upload_interrupted: false,
            calls: Vec::new(),
        }
    }

    fn failing_uploads(errors: usize) -> Self {
        Self {
            upload_errors: errors,
            ..Self::bootloader()
        }
    }

    fn failing_erase() -> Self {
        Self {
            erase_fails: true,
            ..Self::bootloader()
        }
    }

    fn interrupted_upload() -> Self {
        Self {
            upload_interrupted: true,
            ..Self::bootloader()
        }
    }

    fn uploaded(&self) -> bool {
        self.calls.iter().any(|c| matches!(c, Call::Upload(..)))
    }

    fn erased(&self) -> bool {
        self.calls.iter().any(|c| matches!(c, Call::Erase(_)))
    }
}

impl DeviceProgrammer for FakeDevice {
    fn scan(&mut self) -> Result<ScanResult> {
        self.calls.push(Call::Scan);
        Ok(self.scan)
    }

    fn get_status(&mut self, addr: u8) -> Result<BootloaderStatus> {
        self.calls.push(Call::Status(addr));
        Ok(BootloaderStatus::default())
    }

    fn erase_application(&mut self, addr: u8) -> Result<()> {
        self.calls.push(Call::Erase(addr));
        if self.erase_fails {
            return Err(Error::Device("erase rejected".to_string()));
        }
        Ok(())
    }

    fn upload(
        &mut self,
        addr: u8,
        payload: &[u8],
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<usize> {
        self.calls.push(Call::Upload(addr, payload.len()));
        if self.upload_interrupted {
            return Err(Error::Interrupted);
        }
        progress(payload.len(), payload.len());
        Ok(self.upload_errors)
    }

    fn run_application(&mut self, addr: u8) -> Result<()> {
        self.calls.push(Call::Run(addr));
        Ok(())
    }

    fn request_reset(&mut self, addr: u8) -> Result<()> {
        self.calls.push(Call::Reset(addr));
        Ok(())
    }
}

/// Memory store that refuses writes and renames onto chosen names.
struct FailingStore {
    inner: MemoryStore,
    read_only: Vec<String>,
}

impl FailingStore {
    fn new(inner: MemoryStore, read_only: &[&str]) -> Self {
        Self {
            inner,
            read_only: read_only.iter().map(ToString::to_string).collect(),
        }
    }

    fn check(&self, name: &str) -> Result<()> {
        if self.read_only.iter().any(|n| n == name) {
            return Err(Error::Storage(format!("{name}: read-only")));
        }
        Ok(())
    }
}

impl FileStore for FailingStore {
    fn read(&self, name: &str) -> Result<String> {
        self.inner.read(name)
    }

    fn write(&mut self, name: &str, text: &str) -> Result<()> {
        self.check(name)?;
        self.inner.write(name, text)
    }

    fn rename(&mut self, src: &str, dst: &str) -> Result<()> {
        self.check(dst)?;
        self.inner.rename(src, dst)
    }

    fn delete(&mut self, name: &str) -> Result<()> {
        self.inner.delete(name)
    }

    fn exists(&self, name: &str) -> bool {
        self.inner.exists(name)
    }

    fn list(&self) -> Result<Vec<otaflash::StoredFile>> {
        self.inner.list()
    }

    fn format(&mut self) -> Result<()> {
        self.inner.format()
    }
}

fn config() -> UpdateConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    UpdateConfig::new(Endpoint::new("fw.example.com", 443))
}

fn names() -> ArtifactNames {
    ArtifactNames::default()
}

fn run<S: FileStore>(
    fetcher: &mut FakeFetcher,
    store: &mut S,
    device: &mut FakeDevice,
) -> CycleReport {
    Orchestrator::new(config(), fetcher, store, device)
        .run_cycle()
        .unwrap()
}

#[test]
fn test_successful_update_commits() {
    let names = names();
    let mut fetcher = FakeFetcher::publishing("1.1", BODY);
    let mut store = MemoryStore::new().with_file(&names.onboard_version, "1.0\n");
    let mut device = FakeDevice::bootloader();
    let mut seen = Vec::new();

    let report = Orchestrator::new(config(), &mut fetcher, &mut store, &mut device)
        .with_progress(|done, total| seen.push((done, total)))
        .run_cycle()
        .unwrap();

    assert_eq!(
        report.outcome,
        CycleOutcome::Updated {
            version: "1.1".to_string()
        }
    );
    assert_eq!(
        report.history,
        vec![
            UpdateState::Idle,
            UpdateState::CheckVersion,
            UpdateState::NeedsUpdate,
            UpdateState::Staging,
            UpdateState::Decoding,
            UpdateState::Flashing,
            UpdateState::Committed,
        ]
    );
    assert_eq!(report.retry_count, 0);
    assert_eq!(seen, vec![(16, 16)]);

    assert_eq!(store.get(&names.onboard_version), Some("1.1"));
    assert_eq!(store.get(&names.onboard_firmware), Some(BODY));
    assert!(!store.exists(&names.latest_firmware));
    assert!(!store.exists(&names.latest_version));
    assert_eq!(store.get(&names.retry_count), Some("0"));

    assert_eq!(
        device.calls,
        vec![
            Call::Scan,
            Call::Status(0x0A),
            Call::Erase(0x0A),
            Call::Status(0x0A),
            Call::Upload(0x0A, 16),
            Call::Run(0x0A),
        ]
    );
}

#[test]
fn test_equal_versions_are_up_to_date_without_staging() {
    let names = names();
    let mut fetcher = FakeFetcher::publishing("1.0", BODY);
    fetcher.version = Some(" 1.0 \r".to_string());
    let mut store = MemoryStore::new().with_file(&names.onboard_version, "1.0");
    let mut device = FakeDevice::at(ScanResult::Application(0x24));

    let report = run(&mut fetcher, &mut store, &mut device);

    assert_eq!(report.outcome, CycleOutcome::UpToDate);
    assert_eq!(report.state, UpdateState::UpToDate);
    assert_eq!(
        report.history,
        vec![
            UpdateState::Idle,
            UpdateState::CheckVersion,
            UpdateState::UpToDate
        ]
    );
    assert!(!store.exists(&names.latest_firmware));
    assert!(!store.exists(&names.latest_version));
    assert!(!store.exists(&names.retry_count));
    assert_eq!(fetcher.body_requests(), 0);
    // Running application is left alone
    assert_eq!(device.calls, vec![Call::Scan]);
}

#[test]
fn test_up_to_date_starts_application_from_bootloader() {
    let names = names();
    let mut fetcher = FakeFetcher::publishing("1.0", BODY);
    let mut store = MemoryStore::new().with_file(&names.onboard_version, "1.0");
    let mut device = FakeDevice::bootloader();

    let report = run(&mut fetcher, &mut store, &mut device);

    assert_eq!(report.outcome, CycleOutcome::UpToDate);
    assert_eq!(
        device.calls,
        vec![
            Call::Scan,
            Call::Status(0x0A),
            Call::Status(0x0A),
            Call::Run(0x0A)
        ]
    );
}

#[test]
fn test_upload_failures_exhaust_retries() {
    let names = names();
    let mut fetcher = FakeFetcher::publishing("1.1", BODY);
    let mut store = MemoryStore::new().with_file(&names.onboard_version, "1.0");
    let mut device = FakeDevice::failing_uploads(2);

    for expected in 1..=3u8 {
        let report = run(&mut fetcher, &mut store, &mut device);
        assert_eq!(
            report.outcome,
            CycleOutcome::RestartRequired {
                reason: FailureReason::UploadErrors(2)
            }
        );
        assert_eq!(report.state, UpdateState::FlashFailed);
        assert_eq!(report.retry_count, expected);
        assert_eq!(store.get(&names.retry_count), Some(expected.to_string().as_str()));
        assert_eq!(store.get(&names.onboard_version), Some("1.0"));
    }
    // Staged body downloaded once and reused afterwards
    assert_eq!(fetcher.body_requests(), 1);

    device.calls.clear();
    let report = run(&mut fetcher, &mut store, &mut device);

    assert_eq!(report.outcome, CycleOutcome::RetryExceeded);
    assert_eq!(
        report.history,
        vec![UpdateState::Idle, UpdateState::RetryExceeded]
    );
    assert_eq!(report.retry_count, 0);
    assert_eq!(store.get(&names.retry_count), Some("0"));
    assert!(!store.exists(&names.latest_firmware));
    assert!(!store.exists(&names.latest_version));
    assert_eq!(store.get(&names.onboard_version), Some("1.0"));
    assert!(!device.erased());
    assert_eq!(device.calls.last(), Some(&Call::Run(0x0A)));
}

#[test]
fn test_retry_exceeded_then_fresh_attempt() {
    let names = names();
    let mut fetcher = FakeFetcher::publishing("1.1", BODY);
    let mut store = MemoryStore::new()
        .with_file(&names.onboard_version, "1.0")
        .with_file(&names.retry_count, "3");
    let mut device = FakeDevice::bootloader();

    let first = run(&mut fetcher, &mut store, &mut device);
    assert_eq!(first.outcome, CycleOutcome::RetryExceeded);
    assert_eq!(fetcher.requests.len(), 0);

    let second = run(&mut fetcher, &mut store, &mut device);
    assert_eq!(
        second.outcome,
        CycleOutcome::Updated {
            version: "1.1".to_string()
        }
    );
}

#[test]
fn test_checksum_error_is_decode_failure() {
    let names = names();
    let mut fetcher = FakeFetcher::publishing("1.1", BAD_BODY);
    let mut store = MemoryStore::new().with_file(&names.onboard_version, "1.0");
    let mut device = FakeDevice::bootloader();

    let report = run(&mut fetcher, &mut store, &mut device);

    assert_eq!(report.state, UpdateState::DecodeFailed);
    assert_eq!(
        report.outcome,
        CycleOutcome::RestartRequired {
            reason: FailureReason::ChecksumMismatch(1)
        }
    );
    assert_eq!(report.retry_count, 1);
    assert_eq!(store.get(&names.retry_count), Some("1"));
    // Staged before decoding
    assert_eq!(store.get(&names.latest_firmware), Some(BAD_BODY));
    assert_eq!(store.get(&names.latest_version), Some("1.1"));
    assert!(device.calls.is_empty());
}

#[test]
fn test_truncated_body_is_decode_failure() {
    let mut fetcher = FakeFetcher::publishing("1.1", ":1001000021460136\n");
    let mut store = MemoryStore::new();
    let mut device = FakeDevice::bootloader();

    let report = run(&mut fetcher, &mut store, &mut device);

    assert_eq!(report.state, UpdateState::DecodeFailed);
    assert!(matches!(
        report.outcome,
        CycleOutcome::RestartRequired {
            reason: FailureReason::Decode(_)
        }
    ));
    assert_eq!(report.retry_count, 1);
}

#[test]
fn test_missing_device_counts_as_failure() {
    let names = names();
    let mut fetcher = FakeFetcher::publishing("1.1", BODY);
    let mut store = MemoryStore::new();
    let mut device = FakeDevice::at(ScanResult::NoDevice);

    let report = run(&mut fetcher, &mut store, &mut device);

    assert_eq!(
        report.outcome,
        CycleOutcome::RestartRequired {
            reason: FailureReason::DeviceNotFound
        }
    );
    assert_eq!(report.state, UpdateState::FlashFailed);
    assert_eq!(store.get(&names.retry_count), Some("1"));
}

#[test]
fn test_running_application_is_reset_without_counting() {
    let names = names();
    let mut fetcher = FakeFetcher::publishing("1.1", BODY);
    let mut store = MemoryStore::new()
        .with_file(&names.onboard_version, "1.0")
        .with_file(&names.retry_count, "1");
    let mut device = FakeDevice::at(ScanResult::Application(0x24));

    let report = run(&mut fetcher, &mut store, &mut device);

    assert_eq!(report.outcome, CycleOutcome::ResetToBootloader);
    assert!(report.outcome.requires_restart());
    // The cycle stops mid-way; the target restarts into its bootloader
    assert_eq!(report.state, UpdateState::Flashing);
    assert!(!report.state.is_terminal());
    assert_eq!(report.retry_count, 1);
    assert_eq!(store.get(&names.retry_count), Some("1"));
    assert_eq!(device.calls, vec![Call::Scan, Call::Reset(0x24)]);
    // Staged body is kept for the next cycle
    assert_eq!(store.get(&names.latest_firmware), Some(BODY));
}

#[test]
fn test_offline_without_staged_firmware() {
    let names = names();
    let mut fetcher = FakeFetcher::offline();
    let mut store = MemoryStore::new().with_file(&names.onboard_version, "1.0");
    let mut device = FakeDevice::bootloader();

    let report = run(&mut fetcher, &mut store, &mut device);

    assert_eq!(report.outcome, CycleOutcome::NoUpdateAvailable);
    assert_eq!(report.state, UpdateState::CheckVersion);
    assert_eq!(store.len(), 1);
    assert!(!device.erased());
}

#[test]
fn test_offline_resumes_staged_firmware() {
    let names = names();
    let mut fetcher = FakeFetcher::offline();
    let mut store = MemoryStore::new()
        .with_file(&names.onboard_version, "1.0")
        .with_file(&names.latest_firmware, BODY)
        .with_file(&names.latest_version, "1.1");
    let mut device = FakeDevice::bootloader();

    let report = run(&mut fetcher, &mut store, &mut device);

    assert_eq!(
        report.outcome,
        CycleOutcome::Updated {
            version: "1.1".to_string()
        }
    );
    assert_eq!(fetcher.body_requests(), 0);
    assert_eq!(store.get(&names.onboard_version), Some("1.1"));
}

#[test]
fn test_staged_firmware_without_version_takes_published_one() {
    let names = names();
    let mut fetcher = FakeFetcher::publishing("1.2", BODY);
    let mut store = MemoryStore::new().with_file(&names.latest_firmware, BODY);
    let mut device = FakeDevice::bootloader();

    let report = run(&mut fetcher, &mut store, &mut device);

    assert_eq!(
        report.outcome,
        CycleOutcome::Updated {
            version: "1.2".to_string()
        }
    );
    assert_eq!(store.get(&names.onboard_version), Some("1.2"));
}

#[test]
fn test_body_download_failure_stages_nothing() {
    let names = names();
    let mut fetcher = FakeFetcher::publishing("1.1", BODY);
    fetcher.bodies.clear();
    let mut store = MemoryStore::new().with_file(&names.onboard_version, "1.0");
    let mut device = FakeDevice::bootloader();

    let report = run(&mut fetcher, &mut store, &mut device);

    assert_eq!(report.outcome, CycleOutcome::NoUpdateAvailable);
    assert_eq!(report.state, UpdateState::Staging);
    assert!(!store.exists(&names.latest_firmware));
    assert!(!store.exists(&names.retry_count));
}

#[test]
fn test_garbage_retry_counter_reads_as_zero() {
    let names = names();
    let mut fetcher = FakeFetcher::publishing("1.1", BODY);
    let mut store = MemoryStore::new().with_file(&names.retry_count, "many");
    let mut device = FakeDevice::at(ScanResult::NoDevice);

    let report = run(&mut fetcher, &mut store, &mut device);

    assert_eq!(report.retry_count, 1);
}

#[test]
fn test_check_version_is_read_only() {
    let names = names();
    let mut fetcher = FakeFetcher::publishing("1.1", BODY);
    let mut store = MemoryStore::new()
        .with_file(&names.onboard_version, "1.0")
        .with_file(&names.retry_count, "2");
    let mut device = FakeDevice::bootloader();

    let check = Orchestrator::new(config(), &mut fetcher, &mut store, &mut device).check_version();

    assert_eq!(check.onboard, "1.0");
    assert_eq!(check.latest.as_deref(), Some("1.1"));
    assert_eq!(check.staged, None);
    assert_eq!(check.retry_count, 2);
    assert!(check.update_available());
    assert_eq!(store.len(), 2);
    assert!(device.calls.is_empty());
}

#[test]
fn test_cycle_over_directory_store() {
    let dir = tempfile::tempdir().unwrap();
    let names = names();
    let mut store = DirStore::open(dir.path()).unwrap();
    store.write(&names.onboard_version, "1.0").unwrap();
    let mut fetcher = FakeFetcher::publishing("1.1", BODY);
    let mut device = FakeDevice::bootloader();

    let report = run(&mut fetcher, &mut store, &mut device);

    assert!(matches!(report.outcome, CycleOutcome::Updated { .. }));
    let listed: Vec<String> = store.list().unwrap().into_iter().map(|f| f.name).collect();
    assert_eq!(
        listed,
        vec![
            names.onboard_firmware.clone(),
            names.onboard_version.clone(),
            names.retry_count.clone()
        ]
    );
    assert_eq!(
        std::fs::read_to_string(dir.path().join(&names.onboard_firmware)).unwrap(),
        BODY
    );
}

#[test]
fn test_erase_error_fails_flash_and_counts_attempt() {
    let names = names();
    let mut fetcher = FakeFetcher::publishing("1.1", BODY);
    let mut store = MemoryStore::new().with_file(&names.onboard_version, "1.0");
    let mut device = FakeDevice::failing_erase();

    let report = run(&mut fetcher, &mut store, &mut device);

    assert_eq!(report.state, UpdateState::FlashFailed);
    assert!(matches!(
        report.outcome,
        CycleOutcome::RestartRequired {
            reason: FailureReason::Device(_)
        }
    ));
    assert_eq!(report.retry_count, 1);
    assert_eq!(store.get(&names.retry_count), Some("1"));
    assert!(!device.uploaded());
    assert_eq!(store.get(&names.onboard_version), Some("1.0"));
    assert_eq!(store.get(&names.latest_firmware), Some(BODY));
}

#[test]
fn test_interrupted_upload_fails_flash() {
    let names = names();
    let mut fetcher = FakeFetcher::publishing("1.1", BODY);
    let mut store = MemoryStore::new()
        .with_file(&names.onboard_version, "1.0")
        .with_file(&names.retry_count, "1");
    let mut device = FakeDevice::interrupted_upload();

    let report = run(&mut fetcher, &mut store, &mut device);

    assert_eq!(report.state, UpdateState::FlashFailed);
    match report.outcome {
        CycleOutcome::RestartRequired {
            reason: FailureReason::Device(message),
        } => assert!(message.contains("interrupted")),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(store.get(&names.retry_count), Some("2"));
    assert!(!device.calls.contains(&Call::Run(0x0A)));
}

#[test]
fn test_unwritable_retry_counter_is_an_error() {
    let names = names();
    let mut fetcher = FakeFetcher::publishing("1.1", BAD_BODY);
    let mut store = FailingStore::new(
        MemoryStore::new().with_file(&names.onboard_version, "1.0"),
        &[&names.retry_count],
    );
    let mut device = FakeDevice::bootloader();

    let err = Orchestrator::new(config(), &mut fetcher, &mut store, &mut device)
        .run_cycle()
        .unwrap_err();

    assert!(err.is_storage());
    assert!(!store.exists(&names.retry_count));
    // Staging happened before the failure was recorded
    assert_eq!(store.inner.get(&names.latest_firmware), Some(BAD_BODY));
    assert!(device.calls.is_empty());
}

#[test]
fn test_unwritable_counter_after_commit_is_an_error() {
    let names = names();
    let mut fetcher = FakeFetcher::publishing("1.1", BODY);
    let mut store = FailingStore::new(
        MemoryStore::new().with_file(&names.onboard_version, "1.0"),
        &[&names.retry_count],
    );
    let mut device = FakeDevice::bootloader();

    let result = Orchestrator::new(config(), &mut fetcher, &mut store, &mut device).run_cycle();

    assert!(result.unwrap_err().is_storage());
    // Artifacts were already moved; the application is not started
    assert_eq!(store.inner.get(&names.onboard_version), Some("1.1"));
    assert!(!device.calls.contains(&Call::Run(0x0A)));
}

#[test]
fn test_staging_write_failures_are_skipped() {
    let names = names();
    let mut fetcher = FakeFetcher::publishing("1.1", BODY);
    let mut store = FailingStore::new(
        MemoryStore::new().with_file(&names.onboard_version, "1.0"),
        &[&names.latest_firmware, &names.onboard_firmware],
    );
    let mut device = FakeDevice::bootloader();

    let report = run(&mut fetcher, &mut store, &mut device);

    // The downloaded body is flashed from memory
    assert_eq!(
        report.outcome,
        CycleOutcome::Updated {
            version: "1.1".to_string()
        }
    );
    assert!(device.calls.contains(&Call::Upload(0x0A, 16)));
    assert_eq!(store.inner.get(&names.onboard_version), Some("1.1"));
    assert!(!store.exists(&names.onboard_firmware));
    assert!(!store.exists(&names.latest_firmware));
    assert!(!store.exists(&names.latest_version));
    assert_eq!(store.inner.get(&names.retry_count), Some("0"));
}
