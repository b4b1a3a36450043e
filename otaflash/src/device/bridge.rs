//! Device programmer over a serial bus bridge.
//!
//! Each [`DeviceProgrammer`] call becomes one command frame followed by one
//! ACK. Uploads are split into [`MAX_PAGE_SIZE`] pages; a page the bridge
//! rejects, or that gets a malformed or missing reply, counts as one write
//! error and the upload carries on with the next page.

use crate::device::{BootloaderStatus, DeviceProgrammer, ScanResult, timing};
use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::frame::{BridgeFrame, BridgeReply, MAX_PAGE_SIZE, read_frame};
use log::{debug, info, trace, warn};
use std::thread;
use std::time::Duration;

/// Device programmer speaking the bridge frame protocol.
///
/// Generic over the port type `P` so tests can drive it in memory.
pub struct BridgeProgrammer<P: Port> {
    port: P,
    settle: bool,
}

impl<P: Port> BridgeProgrammer<P> {
    /// Create a programmer over an opened port.
    pub fn new(port: P) -> Self {
        Self { port, settle: true }
    }

    /// Enable or disable the bootloader settle delays.
    #[must_use]
    pub fn with_settle_delays(mut self, settle: bool) -> Self {
        self.settle = settle;
        self
    }

    /// Get a reference to the port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Consume the programmer and return the port.
    pub fn into_port(self) -> P {
        self.port
    }

    fn wait(&self, delay: Duration) {
        if self.settle {
            thread::sleep(delay);
        }
    }

    fn transact(&mut self, frame: &BridgeFrame) -> Result<BridgeReply> {
        let data = frame.build();
        trace!("-> {:?} ({} bytes)", frame.command(), data.len());
        self.port.write_all_bytes(&data)?;
        let raw = read_frame(&mut self.port)?;
        let reply = BridgeReply::parse(&raw)?;
        trace!("<- result 0x{:02X}, {} bytes", reply.result, reply.payload.len());
        Ok(reply)
    }

    fn expect_success(&mut self, frame: &BridgeFrame) -> Result<BridgeReply> {
        let reply = self.transact(frame)?;
        if !reply.is_success() {
            return Err(Error::Device(format!(
                "{:?} rejected by target (result 0x{:02X})",
                frame.command(),
                reply.result
            )));
        }
        Ok(reply)
    }
}

impl<P: Port> DeviceProgrammer for BridgeProgrammer<P> {
    fn scan(&mut self) -> Result<ScanResult> {
        let reply = self.expect_success(&BridgeFrame::scan())?;
        let addr = reply.payload.first().copied().unwrap_or(0);
        let result = ScanResult::from_address(addr);
        debug!("Bus scan on {}: {result}", self.port.name());
        Ok(result)
    }

    fn get_status(&mut self, addr: u8) -> Result<BootloaderStatus> {
        let reply = self.expect_success(&BridgeFrame::status(addr))?;
        let status = BootloaderStatus::from_bytes(&reply.payload)?;
        debug!("Bootloader status: {status}");
        self.wait(timing::STATUS_SETTLE);
        Ok(status)
    }

    fn erase_application(&mut self, addr: u8) -> Result<()> {
        info!("Erasing application at 0x{addr:02X}...");
        self.expect_success(&BridgeFrame::erase(addr))?;
        self.wait(timing::ERASE_SETTLE);
        Ok(())
    }

    fn upload(
        &mut self,
        addr: u8,
        payload: &[u8],
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<usize> {
        let total = payload.len();
        let mut errors = 0usize;
        let mut done = 0usize;

        info!("Uploading {total} bytes to 0x{addr:02X}");
        progress(0, total);

        for chunk in payload.chunks(MAX_PAGE_SIZE) {
            if crate::is_interrupted_requested() {
                return Err(Error::Interrupted);
            }
            let page_addr = u16::try_from(done)
                .map_err(|_| Error::Device(format!("payload offset {done} exceeds 16 bits")))?;
            let frame = BridgeFrame::write_page(addr, page_addr, chunk)?;

            match self.transact(&frame) {
                Ok(reply) if reply.is_success() => {},
                Ok(reply) => {
                    warn!(
                        "Page 0x{page_addr:04X} rejected (result 0x{:02X})",
                        reply.result
                    );
                    errors += 1;
                },
                Err(e @ (Error::Protocol(_) | Error::Timeout(_))) => {
                    warn!("Page 0x{page_addr:04X} failed: {e}");
                    errors += 1;
                },
                Err(e) => return Err(e),
            }

            done += chunk.len();
            progress(done, total);
        }

        if errors > 0 {
            warn!("Upload finished with {errors} errors");
        } else {
            debug!("Upload complete");
        }
        Ok(errors)
    }

    fn run_application(&mut self, addr: u8) -> Result<()> {
        self.wait(timing::RUN_SETTLE);
        info!("Running application at 0x{addr:02X}");
        self.expect_success(&BridgeFrame::run(addr))?;
        Ok(())
    }

    fn request_reset(&mut self, addr: u8) -> Result<()> {
        info!("Requesting reset of application at 0x{addr:02X}");
        self.expect_success(&BridgeFrame::reset(addr))?;
        self.wait(timing::RESET_SETTLE);
        Ok(())
    }
}

// Native-specific convenience functions
#[cfg(feature = "native")]
mod native_impl {
    use super::{BridgeProgrammer, Duration, Error, Result, debug, thread, warn};
    use crate::port::{NativePort, SerialConfig};

    impl BridgeProgrammer<NativePort> {
        /// Open the bridge on a serial port, retrying a few times.
        pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
            const MAX_OPEN_PORT_ATTEMPTS: usize = 3;
            const OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);

            let mut last_error = None;

            for attempt in 1..=MAX_OPEN_PORT_ATTEMPTS {
                let config = SerialConfig::new(port_name, baud_rate);
                match NativePort::open(&config) {
                    Ok(port) => {
                        if attempt > 1 {
                            debug!("Port opened on attempt {attempt}");
                        }
                        return Ok(Self::new(port));
                    },
                    Err(e) => {
                        warn!(
                            "Failed to open port {port_name} (attempt {attempt}/{MAX_OPEN_PORT_ATTEMPTS}): {e}"
                        );
                        last_error = Some(e);

                        if attempt < MAX_OPEN_PORT_ATTEMPTS {
                            thread::sleep(OPEN_RETRY_DELAY);
                        }
                    },
                }
            }

            Err(last_error.unwrap_or_else(|| Error::Device(format!("cannot open {port_name}"))))
        }
    }
}
