//! Frame collection and the per-deployment inference lane.
//!
//! The `FrameCollector` runs as a recurring scheduler callback. Each tick it
//! pulls at most the window's free capacity (minus frames still in flight)
//! from the deployment's tap and hands the tagged samples to the lane.
//!
//! The `InferenceLane` owns the frame window. It preprocesses each batch of
//! samples across a bounded set of worker threads, restores capture order,
//! fills the window and dispatches when the window is full.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Result};

use crate::frame::{self, Frame, PreprocessTarget, Sample};
use crate::graph::GraphRegistry;
use crate::inference::Dispatcher;
use crate::scheduler::TickControl;
use crate::sink::ResultSink;
use crate::window::{FrameWindow, OverflowPolicy, PushOutcome};
use crate::{DeploymentId, SourceId};

/// A pulled sample tagged with its capture sequence.
#[derive(Clone, Debug)]
pub struct CapturedSample {
    pub sequence: u64,
    pub sample: Sample,
}

/// Apply `f` to every item on at most `workers` threads; output keeps input order.
pub(crate) fn map_ordered<T, R, F>(items: Vec<T>, workers: usize, f: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let total = items.len();
    let workers = workers.clamp(1, total.max(1));
    if workers == 1 {
        return items.into_iter().map(f).collect();
    }

    let queue = std::sync::Mutex::new(items.into_iter().enumerate());
    let (tx, rx) = mpsc::channel();
    thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let queue = &queue;
            let f = &f;
            scope.spawn(move || loop {
                let next = match queue.lock() {
                    Ok(mut queue) => queue.next(),
                    Err(_) => None,
                };
                let Some((index, item)) = next else {
                    break;
                };
                if tx.send((index, f(item))).is_err() {
                    break;
                }
            });
        }
    });
    drop(tx);

    let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
    for (index, value) in rx {
        slots[index] = Some(value);
    }
    slots.into_iter().flatten().collect()
}

/// Preprocess samples in parallel and return frames in capture order.
///
/// Samples that fail to preprocess are logged and skipped.
pub fn preprocess_ordered(
    mut samples: Vec<CapturedSample>,
    target: PreprocessTarget,
    workers: usize,
) -> Vec<Frame> {
    samples.sort_by_key(|captured| captured.sequence);
    map_ordered(samples, workers, |captured| {
        frame::preprocess(&captured.sample, captured.sequence, target)
            .map_err(|err| (captured.sequence, err))
    })
    .into_iter()
    .filter_map(|outcome| match outcome {
        Ok(frame) => Some(frame),
        Err((sequence, err)) => {
            log::warn!("dropping frame {}: {:#}", sequence, err);
            None
        }
    })
    .collect()
}

/// Collector-side handle to a lane.
pub struct LaneFeeder {
    tx: Sender<Vec<CapturedSample>>,
    in_flight: Arc<AtomicUsize>,
    capacity: usize,
    next_sequence: u64,
}

impl LaneFeeder {
    /// How many samples may be pulled right now.
    pub fn budget(&self) -> usize {
        self.capacity
            .saturating_sub(self.in_flight.load(Ordering::SeqCst))
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Tag `samples` with capture sequences and send them to the lane.
    pub fn submit(&mut self, samples: Vec<Sample>) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let count = samples.len();
        let tagged = samples
            .into_iter()
            .map(|sample| {
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                CapturedSample { sequence, sample }
            })
            .collect();
        self.in_flight.fetch_add(count, Ordering::SeqCst);
        self.tx.send(tagged).map_err(|_| {
            self.in_flight.fetch_sub(count, Ordering::SeqCst);
            anyhow!("inference lane is gone")
        })
    }
}

#[derive(Clone, Debug)]
pub struct LaneSettings {
    pub preprocess_workers: usize,
    pub overflow: OverflowPolicy,
}

impl Default for LaneSettings {
    fn default() -> Self {
        Self {
            preprocess_workers: 4,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

/// Per-deployment preprocessing and dispatch thread.
pub struct InferenceLane {
    deployment: DeploymentId,
    join: Option<JoinHandle<()>>,
}

impl InferenceLane {
    pub fn spawn(
        deployment: DeploymentId,
        dispatcher: Dispatcher,
        sink: Arc<ResultSink>,
        settings: LaneSettings,
    ) -> Result<(Self, LaneFeeder)> {
        if settings.preprocess_workers == 0 {
            bail!("lane for deployment {} needs at least one preprocess worker", deployment);
        }
        let capacity = dispatcher.model().frame_count;
        let (tx, rx) = mpsc::channel();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let lane_in_flight = in_flight.clone();
        let join = thread::Builder::new()
            .name(format!("lane-{}", deployment.branch_name()))
            .spawn(move || run_lane(deployment, dispatcher, sink, settings, rx, lane_in_flight))?;
        Ok((
            Self {
                deployment,
                join: Some(join),
            },
            LaneFeeder {
                tx,
                in_flight,
                capacity,
                next_sequence: 0,
            },
        ))
    }

    /// Wait for the lane to finish. The feeder must already be dropped.
    pub fn join(mut self) -> Result<()> {
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("lane for deployment {} panicked", self.deployment))?;
        }
        Ok(())
    }
}

fn run_lane(
    deployment: DeploymentId,
    dispatcher: Dispatcher,
    sink: Arc<ResultSink>,
    settings: LaneSettings,
    rx: Receiver<Vec<CapturedSample>>,
    in_flight: Arc<AtomicUsize>,
) {
    let target = dispatcher.model().preprocess_target();
    let mut window = FrameWindow::new(dispatcher.model().frame_count, settings.overflow);
    let branch = deployment.branch_name();

    for batch in rx {
        let received = batch.len();
        let frames = preprocess_ordered(batch, target, settings.preprocess_workers);
        let mut released = received - frames.len();

        for frame in frames {
            match window.push(frame) {
                PushOutcome::Stored => {}
                PushOutcome::Evicted(old) => {
                    log::debug!("{}: evicted frame {}", branch, old.sequence);
                    released += 1;
                }
                PushOutcome::Rejected(frame) | PushOutcome::OutOfOrder(frame) => {
                    log::debug!("{}: refused frame {}", branch, frame.sequence);
                    released += 1;
                }
            }
            if window.is_full() {
                released += window.len();
                match dispatcher.dispatch(&mut window) {
                    Ok(result) => {
                        log::info!(
                            "{}: {} ({:.4})",
                            branch,
                            result.class,
                            result.confidence
                        );
                        let event = format!("Inference for deployment: {}", branch);
                        if let Err(err) = sink
                            .record_event(&event)
                            .and_then(|_| sink.record_inference(result))
                        {
                            log::warn!("{}: could not record result: {:#}", branch, err);
                        }
                    }
                    Err(err) if err.is_server() => {
                        log::error!("{}: inference server error: {}", branch, err)
                    }
                    Err(err) => log::warn!("{}: inference failed: {}", branch, err),
                }
            }
        }
        in_flight.fetch_sub(released.min(in_flight.load(Ordering::SeqCst)), Ordering::SeqCst);
    }
    log::debug!("{}: lane finished", branch);
}

/// Recurring pull task for one deployment.
pub struct FrameCollector {
    deployment: DeploymentId,
    source: SourceId,
    feeder: LaneFeeder,
}

impl FrameCollector {
    pub fn new(deployment: DeploymentId, source: SourceId, feeder: LaneFeeder) -> Self {
        Self {
            deployment,
            source,
            feeder,
        }
    }

    /// Scheduler key of the collector for `deployment`.
    pub fn task_key(deployment: DeploymentId) -> String {
        format!("collector:{}", deployment.branch_name())
    }

    pub fn tick(&mut self, graphs: &mut GraphRegistry) -> TickControl {
        let Some(graph) = graphs.get_mut(&self.source) else {
            log::warn!("collector {}: source {} is gone", self.deployment, self.source);
            return TickControl::Stop;
        };
        if !graph.has_tap(self.deployment) {
            log::warn!(
                "collector {}: tap disappeared from {}",
                self.deployment,
                self.source
            );
            return TickControl::Stop;
        }

        let budget = self.feeder.budget();
        let mut samples = Vec::with_capacity(budget);
        while samples.len() < budget {
            match graph.pull_sample(self.deployment) {
                Ok(Some(sample)) => samples.push(sample),
                Ok(None) => break,
                Err(err) => {
                    log::warn!("collector {}: pull failed: {:#}", self.deployment, err);
                    break;
                }
            }
        }
        log::debug!(
            "collector {}: pulled {} sample(s), budget {}",
            self.deployment,
            samples.len(),
            budget
        );
        match self.feeder.submit(samples) {
            Ok(()) => TickControl::Continue,
            Err(err) => {
                log::warn!("collector {}: {:#}", self.deployment, err);
                TickControl::Stop
            }
        }
    }
}
