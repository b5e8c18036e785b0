#![allow(dead_code)]

use oibus::dispatcher::{DispatchSettings, Dispatcher, DispatcherHandle};
use oibus::transport::{Transport, TransportError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Scripted transport. Every write attempt is recorded, including failed ones.
#[derive(Default)]
pub struct MockState {
    pub writes: Vec<(Instant, Vec<u8>)>,
    pub write_faults: VecDeque<TransportError>,
    pub reads: VecDeque<Result<Vec<u8>, TransportError>>,
    pub open_faults: VecDeque<TransportError>,
    pub write_delay: Duration,
    pub discards: usize,
    pub opens: usize,
    pub closes: usize,
    pub baud_changes: Vec<u32>,
}

#[derive(Clone, Default)]
pub struct MockHandle(Arc<Mutex<MockState>>);

impl MockHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }

    pub fn fail_writes(&self, faults: impl IntoIterator<Item = TransportError>) {
        self.with(|s| s.write_faults.extend(faults));
    }

    pub fn queue_read(&self, bytes: &[u8]) {
        self.with(|s| s.reads.push_back(Ok(bytes.to_vec())));
    }

    pub fn queue_read_error(&self, err: TransportError) {
        self.with(|s| s.reads.push_back(Err(err)));
    }

    pub fn fail_opens(&self, faults: impl IntoIterator<Item = TransportError>) {
        self.with(|s| s.open_faults.extend(faults));
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.with(|s| s.write_delay = delay);
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.with(|s| s.writes.iter().map(|(_, w)| w.clone()).collect())
    }

    pub fn write_times(&self) -> Vec<Instant> {
        self.with(|s| s.writes.iter().map(|(t, _)| *t).collect())
    }

    pub fn discards(&self) -> usize {
        self.with(|s| s.discards)
    }

    pub fn opens(&self) -> usize {
        self.with(|s| s.opens)
    }

    pub fn closes(&self) -> usize {
        self.with(|s| s.closes)
    }

    pub fn baud_changes(&self) -> Vec<u32> {
        self.with(|s| s.baud_changes.clone())
    }
}

pub struct MockTransport {
    handle: MockHandle,
    open: bool,
}

impl Transport for MockTransport {
    type Config = MockHandle;

    async fn open(config: &MockHandle) -> Result<Self, TransportError> {
        config.with(|s| match s.open_faults.pop_front() {
            Some(fault) => Err(fault),
            None => {
                s.opens += 1;
                Ok(())
            }
        })?;
        Ok(Self {
            handle: config.clone(),
            open: true,
        })
    }

    async fn write(&mut self, bytes: &[u8], _timeout: Duration) -> Result<(), TransportError> {
        assert!(self.open, "write on a closed transport");
        let delay = self.handle.with(|s| s.write_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.handle.with(|s| {
            s.writes.push((Instant::now(), bytes.to_vec()));
            match s.write_faults.pop_front() {
                Some(fault) => Err(fault),
                None => Ok(()),
            }
        })
    }

    async fn read(&mut self, _len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let scripted = self.handle.with(|s| s.reads.pop_front());
        match scripted {
            Some(result) => result,
            None => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::Timeout)
            }
        }
    }

    async fn discard_input(&mut self) -> Result<(), TransportError> {
        self.handle.with(|s| s.discards += 1);
        Ok(())
    }

    async fn set_baud_rate(&mut self, bits_per_second: u32) -> Result<(), TransportError> {
        self.handle.with(|s| s.baud_changes.push(bits_per_second));
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.handle.with(|s| s.closes += 1);
        }
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.close();
    }
}

pub fn fast_settings() -> DispatchSettings {
    DispatchSettings {
        command_spacing: Duration::from_millis(2),
        mode_settle: Duration::from_millis(2),
        baud_settle: Duration::from_millis(2),
        read_timeout: Duration::from_millis(20),
        write_timeout: Duration::from_millis(20),
        max_retries: 3,
        backoff_base: Duration::from_millis(1),
    }
}

pub async fn start_dispatcher(mock: &MockHandle, settings: DispatchSettings) -> DispatcherHandle {
    let transport = MockTransport::open(mock).await.unwrap();
    let (dispatcher, handle) = Dispatcher::new(transport, mock.clone(), settings);
    tokio::spawn(dispatcher.run());
    handle
}
