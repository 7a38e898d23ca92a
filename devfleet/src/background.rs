//! Long-running shell command that survives device disconnects.
//!
//! The command restarts whenever it exits. Each (re)start writes a boundary
//! marker to the sink so consumers can tell segments apart; output around a
//! restart may be duplicated.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::device::ManagedDevice;
use crate::probe::{CancellableSink, OutputSink};

/// Online poll granularity while waiting for the device to come back.
const ONLINE_POLL: Duration = Duration::from_secs(5);

pub struct BackgroundDeviceAction {
    serial: String,
    descriptor: String,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundDeviceAction {
    /// Start running `command` on `device` until cancelled.
    pub fn start(
        device: Arc<ManagedDevice>,
        command: impl Into<String>,
        descriptor: impl Into<String>,
        sink: Arc<dyn OutputSink>,
        start_delay: Duration,
    ) -> Self {
        let serial = device.serial().to_string();
        let descriptor = descriptor.into();
        let cancel = CancellationToken::new();
        let task = ActionLoop {
            device,
            command: command.into(),
            descriptor: descriptor.clone(),
            sink,
            start_delay,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run());
        tracing::debug!(serial = %serial, descriptor = %descriptor, "Started background action");
        Self {
            serial,
            descriptor,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Request the loop to stop; blocked waits are interrupted.
    pub fn cancel(&self) {
        tracing::debug!(serial = %self.serial, descriptor = %self.descriptor, "Cancelling background action");
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Wait for the loop to exit.
    pub async fn join(mut self) {
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            tracing::error!(serial = %self.serial, error = %e, "Background action panicked");
        }
    }
}

impl Drop for BackgroundDeviceAction {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ActionLoop {
    device: Arc<ManagedDevice>,
    command: String,
    descriptor: String,
    sink: Arc<dyn OutputSink>,
    start_delay: Duration,
    cancel: CancellationToken,
}

impl ActionLoop {
    async fn run(self) {
        let serial = self.device.serial().to_string();
        while !self.cancel.is_cancelled() {
            if !self.start_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.start_delay) => {}
                    _ = self.cancel.cancelled() => break,
                }
            }

            if !self.block_until_online().await {
                break;
            }

            tracing::debug!(serial = %serial, descriptor = %self.descriptor, "Starting background command");
            let marker = format!(
                "========== beginning of new [{}] output ==========\n",
                self.descriptor
            );
            self.sink.add_output(marker.as_bytes());

            let sink = CancellableSink::new(self.sink.as_ref(), self.cancel.clone());
            let result = self
                .device
                .monitor()
                .probe()
                .execute_shell_command(&serial, &self.command, &sink, None)
                .await;
            self.sink.flush();

            match result {
                Ok(()) => {
                    tracing::debug!(serial = %serial, descriptor = %self.descriptor, "Background command exited");
                }
                Err(e) => {
                    tracing::warn!(
                        serial = %serial,
                        descriptor = %self.descriptor,
                        error = %e,
                        "Background command failed, waiting for device"
                    );
                    self.recover().await;
                }
            }
        }
        tracing::debug!(serial = %serial, descriptor = %self.descriptor, "Background action stopped");
    }

    /// Returns false if cancelled before the device came online.
    async fn block_until_online(&self) -> bool {
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let online = tokio::select! {
                r = self.device.monitor().wait_for_device_online(ONLINE_POLL) => r,
                _ = self.cancel.cancelled() => return false,
            };
            match online {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(serial = %self.device.serial(), error = %e, "Online wait failed");
                    tokio::select! {
                        _ = tokio::time::sleep(ONLINE_POLL) => {}
                        _ = self.cancel.cancelled() => return false,
                    }
                }
            }
        }
    }

    async fn recover(&self) {
        let timeout = self.device.monitor().config().online_timeout;
        tokio::select! {
            r = self.device.wait_for_device_online(timeout) => {
                if let Err(e) = r {
                    tracing::warn!(serial = %self.device.serial(), error = %e, "Recovery failed");
                }
            }
            _ = self.cancel.cancelled() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::device::{DeviceFactory, DeviceKind, ManagedDeviceFactory};
    use crate::error::ProbeError;
    use crate::probe::CollectingSink;
    use crate::state::ConnectivityState;
    use crate::testing::{FakeProbe, FakeRunner, ShellReply, test_config};

    fn device(probe: Arc<FakeProbe>) -> Arc<ManagedDevice> {
        ManagedDeviceFactory::new(probe, Arc::new(FakeRunner::new()), test_config())
            .create_device("serial-1", DeviceKind::Physical)
    }

    fn segments(output: &str) -> usize {
        output.matches("beginning of new [logcat] output").count()
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_after_transport_error_with_marker() {
        let probe = Arc::new(FakeProbe::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        probe.on_shell(move |_, cmd| {
            if cmd != "logcat" {
                return ShellReply::Output("1".into());
            }
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => ShellReply::Error(ProbeError::TransportRejected("device offline".into())),
                _ => ShellReply::Stream("line\n".into()),
            }
        });
        let device = device(Arc::clone(&probe));
        device.set_connectivity(ConnectivityState::Online);
        let sink = Arc::new(CollectingSink::new());

        let action = BackgroundDeviceAction::start(
            Arc::clone(&device),
            "logcat",
            "logcat",
            sink.clone(),
            Duration::ZERO,
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        action.cancel();
        action.join().await;

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        let output = sink.output();
        assert_eq!(segments(&output), 2);
        assert!(output.ends_with("line\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_device_before_starting() {
        let probe = Arc::new(FakeProbe::new());
        probe.on_shell(|_, _| ShellReply::Stream("x\n".into()));
        let device = device(Arc::clone(&probe));
        let sink = Arc::new(CollectingSink::new());

        let action = BackgroundDeviceAction::start(
            Arc::clone(&device),
            "logcat",
            "logcat",
            sink.clone(),
            Duration::ZERO,
        );
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(probe.shell_calls(), 0);
        assert!(sink.output().is_empty());

        device.set_connectivity(ConnectivityState::Online);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(probe.shell_calls(), 1);
        assert_eq!(segments(&sink.output()), 1);

        action.cancel();
        action.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_start_delay() {
        let probe = Arc::new(FakeProbe::new());
        let device = device(Arc::clone(&probe));
        device.set_connectivity(ConnectivityState::Online);

        let action = BackgroundDeviceAction::start(
            device,
            "logcat",
            "logcat",
            Arc::new(CollectingSink::new()),
            Duration::from_secs(3600),
        );
        let start = tokio::time::Instant::now();
        action.cancel();
        assert!(action.is_cancelled());
        action.join().await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(probe.shell_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn normal_exit_restarts_command() {
        let probe = Arc::new(FakeProbe::new());
        let device = device(Arc::clone(&probe));
        device.set_connectivity(ConnectivityState::Online);
        let sink = Arc::new(CollectingSink::new());

        let action = BackgroundDeviceAction::start(
            device,
            "logcat",
            "logcat",
            sink.clone(),
            Duration::from_millis(100),
        );
        tokio::time::sleep(Duration::from_millis(350)).await;
        action.cancel();
        action.join().await;
        assert_eq!(segments(&sink.output()), 3);
    }
}
