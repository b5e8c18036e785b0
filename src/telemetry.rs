//! Sensor polling and the latest-value cache.
//!
//! A poll task periodically requests every packet somebody is subscribed to, going
//! through the dispatcher like any other command. Fresh values land in the
//! snapshot and go out on a broadcast channel; failed polls mark the cached value
//! stale instead of dropping it.

use crate::codec::{Command, PacketId, SensorPacket, SensorReadings};
use crate::dispatcher::{CommandOutcome, DispatchError, DispatcherHandle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
pub const DEFAULT_BROADCAST_CAPACITY: usize = 64;

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotEntry {
    pub packet: SensorPacket,
    pub sequence: u64,
    #[serde(skip)]
    pub received_at: Instant,
    pub received_at_ms: u64,
    /// Set when the most recent poll of this packet failed.
    pub stale: bool,
    pub consecutive_failures: u32,
}

impl SnapshotEntry {
    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetrySnapshot {
    entries: BTreeMap<PacketId, SnapshotEntry>,
}

impl TelemetrySnapshot {
    pub fn get(&self, packet: PacketId) -> Option<&SnapshotEntry> {
        self.entries.get(&packet)
    }

    pub fn entries(&self) -> impl Iterator<Item = &SnapshotEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn any_stale(&self) -> bool {
        self.entries.values().any(|e| e.stale)
    }

    /// All cached readings folded into one record, newest packet winning per field.
    pub fn merged(&self) -> SensorReadings {
        let mut ordered: Vec<&SnapshotEntry> = self.entries.values().collect();
        ordered.sort_by_key(|e| e.sequence);

        let mut merged = SensorReadings::default();
        for entry in ordered {
            merged.merge(&entry.packet.readings);
        }
        merged
    }
}

/// One fresh sensor value as published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorUpdate {
    pub sequence: u64,
    pub packet: SensorPacket,
    pub received_at_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryMetrics {
    pub cycles: u64,
    pub polls: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_cycle_us: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub succeeded: usize,
    pub failed: usize,
}

struct Shared {
    snapshot: RwLock<BTreeMap<PacketId, SnapshotEntry>>,
    subscriptions: Mutex<BTreeMap<PacketId, usize>>,
    updates: broadcast::Sender<SensorUpdate>,
    sequence: AtomicU64,
    metrics: Mutex<TelemetryMetrics>,
}

/// Shared telemetry state. Cheap to clone.
#[derive(Clone)]
pub struct Telemetry {
    shared: Arc<Shared>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl Telemetry {
    pub fn new(broadcast_capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(broadcast_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                snapshot: RwLock::new(BTreeMap::new()),
                subscriptions: Mutex::new(BTreeMap::new()),
                updates,
                sequence: AtomicU64::new(0),
                metrics: Mutex::new(TelemetryMetrics::default()),
            }),
        }
    }

    /// Adds `packet` to the poll set. Each call needs a matching `unwatch`.
    pub fn watch(&self, packet: PacketId) {
        let mut subs = self.shared.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        let count = subs.entry(packet).or_insert(0);
        *count += 1;
        if *count == 1 {
            info!("Polling sensor packet {}", packet);
        }
    }

    /// Returns false if `packet` was not being watched.
    pub fn unwatch(&self, packet: PacketId) -> bool {
        let mut subs = self.shared.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        match subs.get_mut(&packet) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                subs.remove(&packet);
                info!("Stopped polling sensor packet {}", packet);
                true
            }
            None => false,
        }
    }

    pub fn polled_packets(&self) -> Vec<PacketId> {
        let subs = self.shared.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        subs.keys().copied().collect()
    }

    /// Polls `packet` for as long as the returned stream lives.
    pub fn subscribe(&self, packet: PacketId) -> TelemetryStream {
        self.watch(packet);
        let receiver = self.shared.updates.subscribe();
        TelemetryStream {
            telemetry: self.clone(),
            filter: Some(packet),
            receiver,
            seed: self.latest_update(packet),
            registered: true,
        }
    }

    /// Every update, without changing the poll set.
    pub fn subscribe_all(&self) -> TelemetryStream {
        TelemetryStream {
            telemetry: self.clone(),
            filter: None,
            receiver: self.shared.updates.subscribe(),
            seed: None,
            registered: false,
        }
    }

    pub fn latest(&self, packet: PacketId) -> Option<SnapshotEntry> {
        let snapshot = self.shared.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        snapshot.get(&packet).cloned()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let snapshot = self.shared.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        TelemetrySnapshot {
            entries: snapshot.clone(),
        }
    }

    pub fn metrics(&self) -> TelemetryMetrics {
        *self.shared.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn latest_update(&self, packet: PacketId) -> Option<SensorUpdate> {
        self.latest(packet).filter(|e| !e.stale).map(|e| SensorUpdate {
            sequence: e.sequence,
            packet: e.packet,
            received_at_ms: e.received_at_ms,
        })
    }

    /// Stores a freshly decoded packet and publishes it.
    pub fn record(&self, packet: SensorPacket) -> SensorUpdate {
        let sequence = self.shared.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let received_at_ms = wall_clock_ms();
        let entry = SnapshotEntry {
            packet: packet.clone(),
            sequence,
            received_at: Instant::now(),
            received_at_ms,
            stale: false,
            consecutive_failures: 0,
        };

        let was_stale = {
            let mut snapshot = self.shared.snapshot.write().unwrap_or_else(PoisonError::into_inner);
            snapshot
                .insert(packet.packet, entry)
                .is_some_and(|previous| previous.stale)
        };
        if was_stale {
            info!("Sensor packet {} is fresh again", packet.packet);
        }

        let update = SensorUpdate {
            sequence,
            packet,
            received_at_ms,
        };
        // No receivers is fine
        let _ = self.shared.updates.send(update.clone());
        update
    }

    /// Flags the cached value of `packet` as stale. Nothing is cached yet means
    /// nothing to flag.
    pub fn mark_stale(&self, packet: PacketId, reason: &DispatchError) {
        let mut snapshot = self.shared.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = snapshot.get_mut(&packet) {
            if !entry.stale {
                warn!("Sensor packet {} is stale: {}", packet, reason);
            }
            entry.stale = true;
            entry.consecutive_failures += 1;
        } else {
            debug!("Poll of packet {} failed before any data arrived: {}", packet, reason);
        }
    }

    fn note_cycle(&self, report: CycleReport, took: Duration) {
        let mut metrics = self.shared.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        metrics.cycles += 1;
        metrics.polls += (report.succeeded + report.failed) as u64;
        metrics.successes += report.succeeded as u64;
        metrics.failures += report.failed as u64;
        metrics.last_cycle_us = took.as_micros() as u64;
    }
}

/// Lazy sequence of sensor updates. Dropping it ends the subscription.
pub struct TelemetryStream {
    telemetry: Telemetry,
    filter: Option<PacketId>,
    receiver: broadcast::Receiver<SensorUpdate>,
    seed: Option<SensorUpdate>,
    registered: bool,
}

impl TelemetryStream {
    /// Next update, or `None` once telemetry has shut down. A subscriber that falls
    /// behind skips what it missed.
    pub async fn next(&mut self) -> Option<SensorUpdate> {
        if let Some(seed) = self.seed.take() {
            return Some(seed);
        }

        loop {
            match self.receiver.recv().await {
                Ok(update) => {
                    if self.filter.map_or(true, |p| p == update.packet.packet) {
                        return Some(update);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!("Telemetry subscriber skipped {} updates", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Drops anything buffered and starts over from the current cached value.
    pub fn restart(&mut self) {
        self.receiver = self.receiver.resubscribe();
        self.seed = self.filter.and_then(|p| self.telemetry.latest_update(p));
    }

    pub fn packet(&self) -> Option<PacketId> {
        self.filter
    }
}

impl Drop for TelemetryStream {
    fn drop(&mut self) {
        if let (true, Some(packet)) = (self.registered, self.filter) {
            self.telemetry.unwatch(packet);
        }
    }
}

/// Periodic poll loop. Runs until the dispatcher goes away.
pub struct TelemetryPipeline {
    telemetry: Telemetry,
    dispatcher: DispatcherHandle,
    interval: Duration,
}

impl TelemetryPipeline {
    pub fn new(telemetry: Telemetry, dispatcher: DispatcherHandle, interval: Duration) -> Self {
        Self {
            telemetry,
            dispatcher,
            interval,
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.dispatcher.is_closed() {
                debug!("Dispatcher gone, telemetry polling stops");
                break;
            }
            self.poll_cycle().await;
        }
    }

    /// One request per polled packet, all queued up front so they go out back to back.
    pub async fn poll_cycle(&self) -> CycleReport {
        let started = Instant::now();
        let handles: Vec<_> = self
            .telemetry
            .polled_packets()
            .into_iter()
            .map(|packet| (packet, self.dispatcher.submit(Command::RequestSensor(packet))))
            .collect();

        let mut report = CycleReport::default();
        for (packet, handle) in handles {
            match handle.wait().await {
                Ok(CommandOutcome::Sensor(decoded)) => {
                    self.telemetry.record(decoded);
                    report.succeeded += 1;
                }
                Ok(CommandOutcome::Sent { .. }) => {
                    self.telemetry.mark_stale(packet, &DispatchError::ConnectionLost);
                    report.failed += 1;
                }
                Err(err) => {
                    self.telemetry.mark_stale(packet, &err);
                    report.failed += 1;
                }
            }
        }

        self.telemetry.note_cycle(report, started.elapsed());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voltage(mv: u16) -> SensorPacket {
        SensorPacket {
            packet: PacketId::VOLTAGE,
            readings: SensorReadings { voltage_mv: Some(mv), ..Default::default() },
        }
    }

    #[test]
    fn test_watch_is_refcounted() {
        let telemetry = Telemetry::default();
        telemetry.watch(PacketId::VOLTAGE);
        telemetry.watch(PacketId::VOLTAGE);
        assert!(telemetry.unwatch(PacketId::VOLTAGE));
        assert_eq!(telemetry.polled_packets(), vec![PacketId::VOLTAGE]);
        assert!(telemetry.unwatch(PacketId::VOLTAGE));
        assert!(telemetry.polled_packets().is_empty());
        assert!(!telemetry.unwatch(PacketId::VOLTAGE));
    }

    #[test]
    fn test_stale_flag_clears_on_fresh_value() {
        let telemetry = Telemetry::default();
        telemetry.record(voltage(15_000));
        telemetry.mark_stale(PacketId::VOLTAGE, &DispatchError::ConnectionLost);
        telemetry.mark_stale(PacketId::VOLTAGE, &DispatchError::ConnectionLost);

        let entry = telemetry.latest(PacketId::VOLTAGE).unwrap();
        assert!(entry.stale);
        assert_eq!(entry.consecutive_failures, 2);
        assert_eq!(entry.packet.readings.voltage_mv, Some(15_000));

        telemetry.record(voltage(14_900));
        let entry = telemetry.latest(PacketId::VOLTAGE).unwrap();
        assert!(!entry.stale);
        assert_eq!(entry.consecutive_failures, 0);
    }

    #[test]
    fn test_merged_snapshot_prefers_newest() {
        let telemetry = Telemetry::default();
        telemetry.record(SensorPacket {
            packet: PacketId::GROUP_3,
            readings: SensorReadings { voltage_mv: Some(15_000), temperature_c: Some(30), ..Default::default() },
        });
        telemetry.record(voltage(14_000));

        let merged = telemetry.snapshot().merged();
        assert_eq!(merged.voltage_mv, Some(14_000));
        assert_eq!(merged.temperature_c, Some(30));
    }
}
