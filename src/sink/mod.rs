//! Metrics/result sink.
//!
//! Records (node events with system utilisation, inference results) are
//! buffered in memory and appended to a `ResultStore` on every flush. A
//! periodic push reads back the newest persisted result; if it is recent
//! enough, every result inside the trailing push window is grouped per
//! deployment and handed to the `ResultPublisher`.
//!
//! `SinkWorker` drives flush, push and the periodic "Logging tick" event from
//! its own thread.

pub mod publish;
pub mod store;
pub mod system;

pub use publish::{group_by_deployment, PushEntry, PushPayload, ResultPublisher};
pub use store::{InMemoryResultStore, ResultStore, SqliteResultStore};
pub use system::SystemStats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::inference::InferenceResult;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Record {
    Event {
        timestamp_ms: u64,
        event: String,
        stats: SystemStats,
    },
    Inference(InferenceResult),
}

impl Record {
    pub fn timestamp_ms(&self) -> u64 {
        match self {
            Record::Event { timestamp_ms, .. } => *timestamp_ms,
            Record::Inference(result) => result.timestamp_ms,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SinkSettings {
    pub flush_interval: Duration,
    pub push_interval: Duration,
    /// Results newer than `now - push_window` are pushed.
    pub push_window: Duration,
    /// Skip the push when the newest result is older than this.
    pub stale_after: Duration,
    /// Interval of the periodic utilisation event.
    pub monitor_interval: Duration,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(3),
            push_interval: Duration::from_secs(12),
            push_window: Duration::from_secs(12),
            stale_after: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PushSummary {
    /// Nothing persisted, or the newest result is stale.
    Skipped,
    Sent { payloads: usize, delivered: usize },
}

pub struct ResultSink {
    buffer: Mutex<Vec<Record>>,
    store: Mutex<Box<dyn ResultStore>>,
    publisher: ResultPublisher,
    settings: SinkSettings,
}

impl ResultSink {
    pub fn new(
        store: Box<dyn ResultStore>,
        publisher: ResultPublisher,
        settings: SinkSettings,
    ) -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            store: Mutex::new(store),
            publisher,
            settings,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Box::new(InMemoryResultStore::new()),
            ResultPublisher::Log,
            SinkSettings::default(),
        )
    }

    pub fn settings(&self) -> &SinkSettings {
        &self.settings
    }

    fn push_record(&self, record: Record) -> Result<()> {
        self.buffer
            .lock()
            .map_err(|_| anyhow!("sink buffer lock poisoned"))?
            .push(record);
        Ok(())
    }

    /// Record a node event with the current system utilisation.
    pub fn record_event(&self, event: &str) -> Result<()> {
        log::debug!("event: {}", event);
        self.push_record(Record::Event {
            timestamp_ms: crate::now_ms()?,
            event: event.to_string(),
            stats: SystemStats::sample(),
        })
    }

    pub fn record_inference(&self, result: InferenceResult) -> Result<()> {
        self.push_record(Record::Inference(result))
    }

    pub fn pending(&self) -> usize {
        self.buffer.lock().map(|buffer| buffer.len()).unwrap_or(0)
    }

    /// Append buffered records to the store. Returns how many were written.
    pub fn flush(&self) -> Result<usize> {
        let records = {
            let mut buffer = self
                .buffer
                .lock()
                .map_err(|_| anyhow!("sink buffer lock poisoned"))?;
            std::mem::take(&mut *buffer)
        };
        if records.is_empty() {
            return Ok(0);
        }
        let outcome = self
            .store
            .lock()
            .map_err(|_| anyhow!("sink store lock poisoned"))?
            .append(&records);
        match outcome {
            Ok(()) => {
                log::debug!("flushed {} record(s)", records.len());
                Ok(records.len())
            }
            Err(err) => {
                // Keep the records for the next flush, ahead of newer ones.
                if let Ok(mut buffer) = self.buffer.lock() {
                    let newer = std::mem::replace(&mut *buffer, records);
                    buffer.extend(newer);
                }
                Err(err)
            }
        }
    }

    /// Push recent results relative to `now_ms`.
    pub fn push(&self, now_ms: u64) -> Result<PushSummary> {
        let results = {
            let store = self
                .store
                .lock()
                .map_err(|_| anyhow!("sink store lock poisoned"))?;
            let Some(latest) = store.last_inference_timestamp()? else {
                return Ok(PushSummary::Skipped);
            };
            let stale_ms = self.settings.stale_after.as_millis() as u64;
            if now_ms.saturating_sub(latest) > stale_ms {
                log::debug!("newest result is stale; skipping push");
                return Ok(PushSummary::Skipped);
            }
            let window_ms = self.settings.push_window.as_millis() as u64;
            store.inferences_since(now_ms.saturating_sub(window_ms))?
        };
        let payloads = group_by_deployment(&results);
        if payloads.is_empty() {
            return Ok(PushSummary::Skipped);
        }
        let delivered = self.publisher.publish(&payloads)?;
        Ok(PushSummary::Sent {
            payloads: payloads.len(),
            delivered,
        })
    }

    /// Read-only access to the underlying store.
    pub fn with_store<R>(&self, f: impl FnOnce(&dyn ResultStore) -> R) -> Result<R> {
        let store = self
            .store
            .lock()
            .map_err(|_| anyhow!("sink store lock poisoned"))?;
        Ok(f(store.as_ref()))
    }
}

/// Background flush/push/monitor loop.
pub struct SinkWorker {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    sink: Arc<ResultSink>,
}

impl SinkWorker {
    pub fn spawn(sink: Arc<ResultSink>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = stop.clone();
        let worker_sink = sink.clone();
        let join = thread::Builder::new()
            .name("sink".to_string())
            .spawn(move || run_worker(worker_sink, worker_stop))?;
        Ok(Self {
            stop,
            join: Some(join),
            sink,
        })
    }

    /// Stop the loop and flush what is left.
    pub fn stop(mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join().map_err(|_| anyhow!("sink worker panicked"))?;
        }
        self.sink.flush()?;
        Ok(())
    }
}

fn run_worker(sink: Arc<ResultSink>, stop: Arc<AtomicBool>) {
    let settings = sink.settings().clone();
    let mut last_flush = Instant::now();
    let mut last_push = Instant::now();
    let mut last_monitor = Instant::now();

    while !stop.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));

        if last_monitor.elapsed() >= settings.monitor_interval {
            last_monitor = Instant::now();
            if let Err(err) = sink.record_event("Logging tick") {
                log::warn!("monitor event failed: {:#}", err);
            }
        }
        if last_flush.elapsed() >= settings.flush_interval {
            last_flush = Instant::now();
            if let Err(err) = sink.flush() {
                log::warn!("sink flush failed: {:#}", err);
            }
        }
        if last_push.elapsed() >= settings.push_interval {
            last_push = Instant::now();
            let now = match crate::now_ms() {
                Ok(now) => now,
                Err(err) => {
                    log::warn!("clock error: {:#}", err);
                    continue;
                }
            };
            match sink.push(now) {
                Ok(PushSummary::Sent { payloads, delivered }) => {
                    log::info!("pushed {}/{} result payload(s)", delivered, payloads)
                }
                Ok(PushSummary::Skipped) => {}
                Err(err) => log::warn!("result push failed: {:#}", err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeploymentId;

    fn result(ts: u64, deployment: u64) -> InferenceResult {
        InferenceResult {
            timestamp_ms: ts,
            deployment: DeploymentId(deployment),
            class: "walk".to_string(),
            confidence: 90.0,
        }
    }

    struct FailingStore;

    impl ResultStore for FailingStore {
        fn append(&mut self, _records: &[Record]) -> Result<()> {
            Err(anyhow!("disk full"))
        }
        fn last_inference_timestamp(&self) -> Result<Option<u64>> {
            Ok(None)
        }
        fn inferences_since(&self, _since_ms: u64) -> Result<Vec<InferenceResult>> {
            Ok(Vec::new())
        }
        fn event_count(&self) -> Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn flush_moves_buffer_into_store() -> Result<()> {
        let sink = ResultSink::in_memory();
        sink.record_event("Sink successfully added")?;
        sink.record_inference(result(1_000, 7))?;
        assert_eq!(sink.pending(), 2);
        assert_eq!(sink.flush()?, 2);
        assert_eq!(sink.pending(), 0);
        assert_eq!(sink.with_store(|s| s.event_count())??, 1);
        assert_eq!(sink.flush()?, 0);
        Ok(())
    }

    #[test]
    fn failed_flush_keeps_records() -> Result<()> {
        let sink = ResultSink::new(
            Box::new(FailingStore),
            ResultPublisher::Log,
            SinkSettings::default(),
        );
        sink.record_inference(result(1_000, 7))?;
        assert!(sink.flush().is_err());
        assert_eq!(sink.pending(), 1);
        Ok(())
    }

    #[test]
    fn push_selects_trailing_window() -> Result<()> {
        let sink = ResultSink::in_memory();
        for (ts, dep) in [(10_000, 7), (50_000, 7), (55_000, 8), (58_000, 7)] {
            sink.record_inference(result(ts, dep))?;
        }
        sink.flush()?;
        // Window is 12 s: 46_000 < ts <= 58_000.
        let summary = sink.push(58_000)?;
        assert_eq!(
            summary,
            PushSummary::Sent {
                payloads: 2,
                delivered: 2
            }
        );
        Ok(())
    }

    #[test]
    fn push_is_skipped_when_results_are_stale() -> Result<()> {
        let sink = ResultSink::in_memory();
        assert_eq!(sink.push(1_000)?, PushSummary::Skipped);
        sink.record_inference(result(1_000, 7))?;
        sink.flush()?;
        assert_eq!(sink.push(1_000 + 31_000)?, PushSummary::Skipped);
        Ok(())
    }

    #[test]
    fn worker_flushes_on_stop() -> Result<()> {
        let sink = Arc::new(ResultSink::in_memory());
        let worker = SinkWorker::spawn(sink.clone())?;
        sink.record_inference(result(1_000, 7))?;
        worker.stop()?;
        assert_eq!(sink.pending(), 0);
        assert_eq!(sink.with_store(|s| s.last_inference_timestamp())??, Some(1_000));
        Ok(())
    }
}
