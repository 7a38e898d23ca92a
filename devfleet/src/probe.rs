//! Connectivity probe seam: device discovery and shell command execution.

use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProbeError;
use crate::state::ConnectivityState;

/// One row of a device listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeDevice {
    pub serial: String,
    pub state: ConnectivityState,
}

impl ProbeDevice {
    pub fn new(serial: impl Into<String>, state: ConnectivityState) -> Self {
        Self {
            serial: serial.into(),
            state,
        }
    }
}

/// Raw presence notifications from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeEvent {
    Connected(ProbeDevice),
    StateChanged(ProbeDevice),
    Disconnected(String),
}

/// Receives streamed command output.
pub trait OutputSink: Send + Sync {
    fn add_output(&self, data: &[u8]);

    fn flush(&self) {}

    /// Long-running commands stop once their sink reports cancellation.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Sink that buffers everything it receives.
#[derive(Debug, Default)]
pub struct CollectingSink {
    buf: StdMutex<Vec<u8>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(&self) -> String {
        let buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl OutputSink for CollectingSink {
    fn add_output(&self, data: &[u8]) {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
    }
}

/// Wraps a sink so it reports cancellation when `token` fires.
pub struct CancellableSink<'a> {
    inner: &'a dyn OutputSink,
    token: CancellationToken,
}

impl<'a> CancellableSink<'a> {
    pub fn new(inner: &'a dyn OutputSink, token: CancellationToken) -> Self {
        Self { inner, token }
    }
}

impl OutputSink for CancellableSink<'_> {
    fn add_output(&self, data: &[u8]) {
        self.inner.add_output(data);
    }

    fn flush(&self) {
        self.inner.flush();
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.inner.is_cancelled()
    }
}

/// The transport used to reach devices.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<ProbeDevice>, ProbeError>;

    async fn is_visible(&self, serial: &str) -> bool {
        match self.list_devices().await {
            Ok(devices) => devices.iter().any(|d| d.serial == serial),
            Err(e) => {
                tracing::debug!(serial = %serial, error = %e, "Device listing failed");
                false
            }
        }
    }

    /// Run `command` on `serial`, streaming stdout into `sink`.
    ///
    /// `timeout == None` lets the command run until it exits or the sink is
    /// cancelled.
    async fn execute_shell_command(
        &self,
        serial: &str,
        command: &str,
        sink: &dyn OutputSink,
        timeout: Option<Duration>,
    ) -> Result<(), ProbeError>;

    /// Start delivering presence events. A second call replaces the first
    /// subscription.
    fn subscribe(&self) -> mpsc::Receiver<ProbeEvent>;

    /// Stop delivering events and release transport resources.
    async fn terminate(&self) {}
}
