//! Cooperative single-threaded scheduler.
//!
//! One thread owns the `GraphRegistry` and runs a fixed-granularity tick. At
//! each tick it runs the one-shot callbacks queued since the previous tick, in
//! submission order, then every recurring callback. Callbacks never overlap.
//!
//! Other threads interact only through a `SchedulerHandle`: they queue
//! callbacks and, with `call`, wait on a completion channel for the result.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::graph::GraphRegistry;

type OneShot = Box<dyn FnOnce(&mut SchedulerCtx) + Send>;
type Recurring = Box<dyn FnMut(&mut GraphRegistry) -> TickControl + Send>;

/// Returned by recurring callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickControl {
    Continue,
    Stop,
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("scheduler call did not complete within {0:?}")]
    TimedOut(Duration),
    #[error("scheduler dropped the call before completing it")]
    Dropped,
    #[error("scheduler is not running")]
    Stopped,
}

enum Command {
    Run(OneShot),
    Shutdown,
}

/// State visible to one-shot callbacks.
pub struct SchedulerCtx {
    graphs: GraphRegistry,
    recurring: Vec<(String, Recurring)>,
}

impl SchedulerCtx {
    pub fn graphs(&self) -> &GraphRegistry {
        &self.graphs
    }

    pub fn graphs_mut(&mut self) -> &mut GraphRegistry {
        &mut self.graphs
    }

    /// Register a recurring callback under `key`, replacing any previous one.
    pub fn add_recurring<F>(&mut self, key: impl Into<String>, task: F)
    where
        F: FnMut(&mut GraphRegistry) -> TickControl + Send + 'static,
    {
        let key = key.into();
        self.recurring.retain(|(existing, _)| *existing != key);
        log::debug!("recurring task {} registered", key);
        self.recurring.push((key, Box::new(task)));
    }

    /// Returns whether a task was registered under `key`.
    pub fn cancel_recurring(&mut self, key: &str) -> bool {
        let before = self.recurring.len();
        self.recurring.retain(|(existing, _)| existing != key);
        before != self.recurring.len()
    }

    pub fn has_recurring(&self, key: &str) -> bool {
        self.recurring.iter().any(|(existing, _)| existing == key)
    }

    fn run_recurring(&mut self) {
        let tasks = std::mem::take(&mut self.recurring);
        let graphs = &mut self.graphs;
        let mut kept = Vec::with_capacity(tasks.len());
        for (key, mut task) in tasks {
            match panic::catch_unwind(AssertUnwindSafe(|| task(graphs))) {
                Ok(TickControl::Continue) => kept.push((key, task)),
                Ok(TickControl::Stop) => log::debug!("recurring task {} finished", key),
                Err(_) => log::error!("recurring task {} panicked; dropping it", key),
            }
        }
        self.recurring = kept;
    }
}

#[derive(Clone)]
pub struct SchedulerHandle {
    tx: Sender<Command>,
}

impl SchedulerHandle {
    /// Queue a one-shot callback for the next tick.
    pub fn schedule<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut SchedulerCtx) + Send + 'static,
    {
        self.tx
            .send(Command::Run(Box::new(task)))
            .map_err(|_| anyhow!(CallError::Stopped))
    }

    /// Run `task` on the scheduler and wait for its value.
    ///
    /// `None` waits without bound. A timed-out call still runs later.
    pub fn call<T, F>(&self, timeout: Option<Duration>, task: F) -> Result<T, CallError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SchedulerCtx) -> T + Send + 'static,
    {
        let (done_tx, done_rx) = mpsc::channel();
        self.tx
            .send(Command::Run(Box::new(move |ctx| {
                let _ = done_tx.send(task(ctx));
            })))
            .map_err(|_| CallError::Stopped)?;
        match timeout {
            Some(limit) => done_rx.recv_timeout(limit).map_err(|err| match err {
                RecvTimeoutError::Timeout => CallError::TimedOut(limit),
                RecvTimeoutError::Disconnected => CallError::Dropped,
            }),
            None => done_rx.recv().map_err(|_| CallError::Dropped),
        }
    }
}

pub struct Scheduler {
    handle: SchedulerHandle,
    join: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn spawn(tick: Duration, graphs: GraphRegistry) -> Result<Self> {
        let tick = tick.max(Duration::from_millis(1));
        let (tx, rx) = mpsc::channel();
        let join = thread::Builder::new()
            .name("scheduler".to_string())
            .spawn(move || run_loop(tick, graphs, rx))?;
        log::info!("scheduler started (tick {:?})", tick);
        Ok(Self {
            handle: SchedulerHandle { tx },
            join: Some(join),
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Run already-queued callbacks, then stop the thread.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(join) = self.join.take() else {
            return Ok(());
        };
        let _ = self.handle.tx.send(Command::Shutdown);
        join.join()
            .map_err(|_| anyhow!("scheduler thread panicked"))?;
        log::info!("scheduler stopped");
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("{:#}", err);
        }
    }
}

fn run_one_shots(ctx: &mut SchedulerCtx, pending: &mut Vec<OneShot>) {
    for task in pending.drain(..) {
        if panic::catch_unwind(AssertUnwindSafe(|| task(ctx))).is_err() {
            log::error!("scheduled callback panicked");
        }
    }
}

fn run_loop(tick: Duration, graphs: GraphRegistry, rx: Receiver<Command>) {
    let mut ctx = SchedulerCtx {
        graphs,
        recurring: Vec::new(),
    };
    let mut pending: Vec<OneShot> = Vec::new();
    let mut next_tick = Instant::now() + tick;

    loop {
        let now = Instant::now();
        if now < next_tick {
            match rx.recv_timeout(next_tick - now) {
                Ok(Command::Run(task)) => {
                    pending.push(task);
                    continue;
                }
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }

        run_one_shots(&mut ctx, &mut pending);
        ctx.run_recurring();

        next_tick += tick;
        let now = Instant::now();
        if next_tick <= now {
            next_tick = now + tick;
        }
    }

    run_one_shots(&mut ctx, &mut pending);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn scheduler() -> Scheduler {
        Scheduler::spawn(Duration::from_millis(5), GraphRegistry::new()).unwrap()
    }

    #[test]
    fn one_shots_run_in_submission_order() {
        let scheduler = scheduler();
        let handle = scheduler.handle();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let seen = seen.clone();
            handle
                .schedule(move |_| seen.lock().unwrap().push(i))
                .unwrap();
        }
        handle.call(Some(Duration::from_secs(2)), |_| ()).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn one_shots_precede_recurring_in_a_tick() {
        let scheduler = scheduler();
        let handle = scheduler.handle();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let marker = seen.clone();
        handle
            .schedule(move |ctx| {
                ctx.add_recurring("recorder", move |_| {
                    recorder.lock().unwrap().push("recurring");
                    TickControl::Stop
                });
                marker.lock().unwrap().push("one-shot");
            })
            .unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(*seen.lock().unwrap(), vec!["one-shot", "recurring"]);
    }

    #[test]
    fn recurring_runs_until_cancelled() {
        let scheduler = scheduler();
        let handle = scheduler.handle();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        handle
            .schedule(move |ctx| {
                ctx.add_recurring("count", move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    TickControl::Continue
                })
            })
            .unwrap();
        thread::sleep(Duration::from_millis(60));
        let cancelled = handle
            .call(Some(Duration::from_secs(2)), |ctx| ctx.cancel_recurring("count"))
            .unwrap();
        assert!(cancelled);
        let after_cancel = count.load(Ordering::SeqCst);
        assert!(after_cancel >= 2);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
    }

    #[test]
    fn panicking_callbacks_do_not_stop_the_loop() {
        let scheduler = scheduler();
        let handle = scheduler.handle();
        handle.schedule(|_| panic!("boom")).unwrap();
        handle
            .schedule(|ctx| ctx.add_recurring("bad", |_| panic!("tick boom")))
            .unwrap();
        thread::sleep(Duration::from_millis(30));
        let still_there = handle
            .call(Some(Duration::from_secs(2)), |ctx| ctx.has_recurring("bad"))
            .unwrap();
        assert!(!still_there);
    }

    #[test]
    fn call_times_out_when_tick_is_slow() {
        let scheduler = Scheduler::spawn(Duration::from_millis(200), GraphRegistry::new()).unwrap();
        let handle = scheduler.handle();
        let outcome = handle.call(Some(Duration::from_millis(10)), |_| 1);
        assert!(matches!(outcome, Err(CallError::TimedOut(_))));
    }

    #[test]
    fn shutdown_rejects_new_work() {
        let scheduler = scheduler();
        let handle = scheduler.handle();
        scheduler.shutdown().unwrap();
        assert!(matches!(handle.call(None, |_| 1), Err(CallError::Stopped)));
    }
}
