//! Deployment lifecycle management.
//!
//! Start and stop requests arrive from API threads. The manager validates the
//! deployment's state, schedules the branch mutation on the scheduler and
//! waits on its completion channel within a bounded time. Graph state is only
//! ever read or written inside scheduler callbacks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::collector::{FrameCollector, InferenceLane, LaneSettings};
use crate::deployment::{ControlOutcome, Deployment, DeploymentState, ModelCatalog, ModelSpec};
use crate::inference::{Dispatcher, InferenceClient};
use crate::mutator::{self, BranchSettings, DetachReport, LinkPolicy};
use crate::scheduler::{CallError, SchedulerHandle};
use crate::sink::ResultSink;
use crate::{DeploymentId, SourceId};

#[derive(Clone, Debug)]
pub struct ManagerSettings {
    /// Attach wait is `attach_attempts * poll_interval`.
    pub attach_attempts: u32,
    pub poll_interval: Duration,
    /// `None` waits for detach without bound.
    pub detach_timeout: Option<Duration>,
    pub link_policy: LinkPolicy,
    pub branch: BranchSettings,
    pub lane: LaneSettings,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            attach_attempts: 60,
            poll_interval: Duration::from_secs(1),
            detach_timeout: Some(Duration::from_secs(60)),
            link_policy: LinkPolicy::default(),
            branch: BranchSettings::default(),
            lane: LaneSettings::default(),
        }
    }
}

impl ManagerSettings {
    pub fn attach_timeout(&self) -> Duration {
        self.poll_interval.saturating_mul(self.attach_attempts.max(1))
    }
}

struct Entry {
    deployment: Deployment,
    lane: Option<InferenceLane>,
}

/// Wait applied to read-only graph queries.
const OBSERVE_TIMEOUT: Duration = Duration::from_secs(5);

/// What a scheduler-side observation found.
enum Observation {
    /// The requested source has no graph.
    NoGraph,
    Clean,
    /// Stages named for the deployment, per source holding them.
    Remnants(Vec<(SourceId, Vec<String>)>),
}

pub struct DeploymentManager {
    scheduler: SchedulerHandle,
    catalog: Arc<dyn ModelCatalog>,
    client: Arc<dyn InferenceClient>,
    sink: Arc<ResultSink>,
    settings: ManagerSettings,
    entries: Mutex<HashMap<DeploymentId, Entry>>,
}

impl DeploymentManager {
    pub fn new(
        scheduler: SchedulerHandle,
        catalog: Arc<dyn ModelCatalog>,
        client: Arc<dyn InferenceClient>,
        sink: Arc<ResultSink>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            scheduler,
            catalog,
            client,
            sink,
            settings,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<DeploymentId, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("deployment table lock poisoned"))
    }

    fn event(&self, event: String) {
        if let Err(err) = self.sink.record_event(&event) {
            log::warn!("could not record event '{}': {:#}", event, err);
        }
    }

    /// Look for the deployment's stages on every graph, not only `source`.
    fn observe(&self, id: DeploymentId, source: &SourceId) -> Result<Observation, CallError> {
        let source = source.clone();
        self.scheduler.call(Some(OBSERVE_TIMEOUT), move |ctx| {
            if !ctx.graphs().contains(&source) {
                return Observation::NoGraph;
            }
            let holding = ctx.graphs().holding(id);
            if holding.is_empty() {
                Observation::Clean
            } else {
                Observation::Remnants(holding)
            }
        })
    }

    pub fn status(&self, id: DeploymentId) -> Option<DeploymentState> {
        self.entries
            .lock()
            .ok()?
            .get(&id)
            .map(|entry| entry.deployment.state())
    }

    pub fn list(&self) -> Vec<Deployment> {
        let mut deployments: Vec<Deployment> = match self.entries.lock() {
            Ok(entries) => entries.values().map(|e| e.deployment.clone()).collect(),
            Err(_) => Vec::new(),
        };
        deployments.sort_by_key(|d| d.id);
        deployments
    }

    /// Start inference for `id` on `source` with model `model_id`.
    pub fn start_inference(&self, id: DeploymentId, source: &SourceId, model_id: &str) -> ControlOutcome {
        match self.try_start(id, source, model_id) {
            Ok(outcome) => outcome,
            Err(err) => {
                log::error!("start of deployment {} failed: {:#}", id, err);
                ControlOutcome::Failed(format!("{:#}", err))
            }
        }
    }

    fn try_start(&self, id: DeploymentId, source: &SourceId, model_id: &str) -> Result<ControlOutcome> {
        if let Some(entry) = self.entries()?.get(&id) {
            if entry.deployment.state().is_live() {
                log::info!("deployment {} is already {}", id, entry.deployment.state());
                return Ok(ControlOutcome::AlreadyActive);
            }
        }

        match self.observe(id, source) {
            Ok(Observation::NoGraph) => return Ok(ControlOutcome::UnknownSource),
            Ok(Observation::Remnants(holding)) => {
                for (held_by, stages) in holding {
                    log::warn!(
                        "deployment {} still has stages on {}: {}",
                        id,
                        held_by,
                        stages.join(", ")
                    );
                }
                return Ok(ControlOutcome::AlreadyActive);
            }
            Ok(Observation::Clean) => {}
            Err(err) => return Ok(ControlOutcome::Failed(err.to_string())),
        }

        let Some(model) = self.catalog.resolve(model_id) else {
            return Ok(ControlOutcome::UnknownModel);
        };

        {
            let mut entries = self.entries()?;
            if entries
                .get(&id)
                .is_some_and(|entry| entry.deployment.state().is_live())
            {
                return Ok(ControlOutcome::AlreadyActive);
            }
            let mut deployment = Deployment::new(id, source.clone(), model.clone());
            deployment.transition(DeploymentState::Attaching)?;
            entries.insert(
                id,
                Entry {
                    deployment,
                    lane: None,
                },
            );
        }

        self.event(format!("Launching inference for {}", source));
        let timeout = self.settings.attach_timeout();
        let policy = self.settings.link_policy;
        let branch = self.settings.branch.clone();
        let attach_source = source.clone();
        let attached = self.scheduler.call(Some(timeout), move |ctx| {
            let graph = ctx
                .graphs_mut()
                .get_mut(&attach_source)
                .ok_or_else(|| anyhow!("graph for {} disappeared", attach_source))?;
            let report = mutator::attach(graph, id, policy, &branch)?;
            Ok::<_, anyhow::Error>((report, graph.has_tap(id)))
        });

        let failure = match attached {
            Ok(Ok((_, true))) => None,
            Ok(Ok((report, false))) => Some((
                ControlOutcome::Failed("tap not observable after attach".to_string()),
                format!("tap not observable ({} failed step(s))", report.failures.len()),
            )),
            Ok(Err(err)) => Some((
                ControlOutcome::Failed(format!("{:#}", err)),
                format!("{:#}", err),
            )),
            Err(CallError::TimedOut(limit)) => Some((
                ControlOutcome::TimedOut,
                format!("attach not confirmed within {:?}", limit),
            )),
            Err(err) => Some((ControlOutcome::Failed(err.to_string()), err.to_string())),
        };
        if let Some((outcome, reason)) = failure {
            self.event("Failed to add sink".to_string());
            log::warn!("deployment {} on {}: {}", id, source, reason);
            if let Some(entry) = self.entries()?.get_mut(&id) {
                entry.deployment.fail(reason)?;
            }
            return Ok(outcome);
        }
        self.event("Sink successfully added".to_string());

        let lane = match self.launch_lane(id, source, model) {
            Ok(lane) => lane,
            Err(err) => {
                // The branch stays on the graph; a later stop detaches it.
                self.event("Failed to add sink".to_string());
                log::warn!("deployment {} on {}: {:#}", id, source, err);
                if let Some(entry) = self.entries()?.get_mut(&id) {
                    entry.deployment.fail(format!("{:#}", err))?;
                }
                return Ok(ControlOutcome::Failed(format!("{:#}", err)));
            }
        };

        let mut entries = self.entries()?;
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| anyhow!("deployment {} vanished while attaching", id))?;
        entry.lane = Some(lane);
        entry.deployment.transition(DeploymentState::Active)?;
        Ok(ControlOutcome::Started)
    }

    /// Spawn the deployment's lane and register its collector.
    fn launch_lane(
        &self,
        id: DeploymentId,
        source: &SourceId,
        model: ModelSpec,
    ) -> Result<InferenceLane> {
        let dispatcher = Dispatcher::new(self.client.clone(), id, model);
        let (lane, feeder) =
            InferenceLane::spawn(id, dispatcher, self.sink.clone(), self.settings.lane.clone())?;
        let mut collector = FrameCollector::new(id, source.clone(), feeder);
        let scheduled = self.scheduler.schedule(move |ctx| {
            ctx.add_recurring(FrameCollector::task_key(id), move |graphs| {
                collector.tick(graphs)
            })
        });
        if let Err(err) = scheduled {
            // The refused task dropped the feeder, so the lane winds down.
            if let Err(join_err) = lane.join() {
                log::warn!("{:#}", join_err);
            }
            return Err(err);
        }
        Ok(lane)
    }

    /// Stop inference for `id` on `source`.
    pub fn stop_inference(&self, id: DeploymentId, source: &SourceId) -> ControlOutcome {
        match self.try_stop(id, source) {
            Ok(outcome) => outcome,
            Err(err) => {
                log::error!("stop of deployment {} failed: {:#}", id, err);
                ControlOutcome::Failed(format!("{:#}", err))
            }
        }
    }

    fn try_stop(&self, id: DeploymentId, source: &SourceId) -> Result<ControlOutcome> {
        let state = match self.entries()?.get(&id) {
            Some(entry) if entry.deployment.source == *source => entry.deployment.state(),
            _ => return Ok(ControlOutcome::AlreadyInactive),
        };
        match state {
            DeploymentState::Active => {}
            DeploymentState::Failed => match self.observe(id, source) {
                Ok(Observation::Remnants(holding))
                    if holding.iter().any(|(held_by, _)| held_by == source) => {}
                Ok(_) => {
                    self.entries()?.remove(&id);
                    return Ok(ControlOutcome::AlreadyInactive);
                }
                Err(err) => return Ok(ControlOutcome::Failed(err.to_string())),
            },
            other if other.in_transition() => return Ok(ControlOutcome::InTransition(other)),
            _ => return Ok(ControlOutcome::AlreadyInactive),
        }

        let lane = {
            let mut entries = self.entries()?;
            let entry = entries
                .get_mut(&id)
                .ok_or_else(|| anyhow!("deployment {} vanished", id))?;
            if entry.deployment.state() != state {
                return Ok(ControlOutcome::InTransition(entry.deployment.state()));
            }
            entry.deployment.transition(DeploymentState::Detaching)?;
            entry.lane.take()
        };

        let detach_source = source.clone();
        let detached = self.scheduler.call(self.settings.detach_timeout, move |ctx| {
            ctx.cancel_recurring(&FrameCollector::task_key(id));
            ctx.graphs_mut()
                .get_mut(&detach_source)
                .map(|graph| mutator::detach(graph, id))
        });

        let (outcome, failure) = match detached {
            Ok(Some(report)) if report.is_complete() => (ControlOutcome::Stopped, None),
            Ok(None) => (ControlOutcome::Stopped, None),
            Ok(Some(DetachReport { remaining, .. })) => {
                let reason = format!("stages remain: {}", remaining.join(", "));
                (ControlOutcome::Failed(reason.clone()), Some(reason))
            }
            Err(CallError::TimedOut(limit)) => (
                ControlOutcome::TimedOut,
                Some(format!("detach not confirmed within {:?}", limit)),
            ),
            Err(err) => (ControlOutcome::Failed(err.to_string()), Some(err.to_string())),
        };

        match failure {
            None => {
                if let Some(lane) = lane {
                    if let Err(err) = lane.join() {
                        log::warn!("{:#}", err);
                    }
                }
                let mut entries = self.entries()?;
                if let Some(mut entry) = entries.remove(&id) {
                    entry.deployment.transition(DeploymentState::Removed)?;
                }
                drop(entries);
                self.event("Sink successfully removed".to_string());
            }
            Some(reason) => {
                log::warn!("deployment {} on {}: {}", id, source, reason);
                if let Some(entry) = self.entries()?.get_mut(&id) {
                    entry.deployment.fail(reason)?;
                }
            }
        }
        Ok(outcome)
    }

    /// Stop every deployment that is active or failed with remnants.
    pub fn stop_all(&self) -> Vec<(DeploymentId, ControlOutcome)> {
        self.list()
            .into_iter()
            .filter(|d| matches!(d.state(), DeploymentState::Active | DeploymentState::Failed))
            .map(|d| (d.id, self.stop_inference(d.id, &d.source)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::{ModelSpec, StaticModelCatalog};
    use crate::graph::{GraphRegistry, ProcessingGraph};
    use crate::inference::StaticInferenceClient;
    use crate::media::{Journal, MediaPlatform, SyntheticPlatform};
    use crate::scheduler::Scheduler;
    use std::thread;

    struct Fixture {
        _scheduler: Scheduler,
        handle: SchedulerHandle,
        manager: DeploymentManager,
        journal: Journal,
        platform: SyntheticPlatform,
    }

    fn model() -> ModelSpec {
        ModelSpec {
            name: "m1".to_string(),
            frame_count: 4,
            input_width: 8,
            input_height: 8,
            input_name: "input_1".to_string(),
            output_name: "dense".to_string(),
            classes: vec!["walk".into(), "run".into()],
        }
    }

    fn fast_settings() -> ManagerSettings {
        ManagerSettings {
            attach_attempts: 200,
            poll_interval: Duration::from_millis(10),
            detach_timeout: Some(Duration::from_secs(2)),
            ..ManagerSettings::default()
        }
    }

    fn fixture_with(tick: Duration, settings: ManagerSettings) -> Result<Fixture> {
        fixture_on(&["cam1"], tick, settings)
    }

    fn fixture_on(cameras: &[&str], tick: Duration, settings: ManagerSettings) -> Result<Fixture> {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let platform = SyntheticPlatform::with_cameras(cameras).with_journal(journal.clone());
        let mut registry = GraphRegistry::new();
        for device in platform.discover()? {
            let mut graph = ProcessingGraph::new(device.clone(), platform.create_graph(&device)?);
            graph.play()?;
            registry.insert(graph)?;
        }
        journal.lock().unwrap().clear();
        let scheduler = Scheduler::spawn(tick, registry)?;
        let handle = scheduler.handle();
        let manager = DeploymentManager::new(
            handle.clone(),
            Arc::new(StaticModelCatalog::new([model()])),
            Arc::new(StaticInferenceClient::new(vec![0.3, 0.7])),
            Arc::new(ResultSink::in_memory()),
            settings,
        );
        Ok(Fixture {
            _scheduler: scheduler,
            handle,
            manager,
            journal,
            platform,
        })
    }

    fn fixture() -> Result<Fixture> {
        fixture_with(Duration::from_millis(5), fast_settings())
    }

    fn journal_len(fx: &Fixture) -> usize {
        fx.journal.lock().unwrap().len()
    }

    fn stages_on(fx: &Fixture, camera: &str, id: DeploymentId) -> Vec<String> {
        let source = SourceId::new(camera);
        fx.handle
            .call(Some(Duration::from_secs(2)), move |ctx| {
                ctx.graphs()
                    .get(&source)
                    .map(|g| g.remaining_stages(id))
                    .unwrap_or_default()
            })
            .unwrap()
    }

    #[test]
    fn start_then_stop() -> Result<()> {
        let fx = fixture()?;
        let cam = SourceId::new("cam1");
        assert_eq!(fx.manager.start_inference(DeploymentId(7), &cam, "m1"), ControlOutcome::Started);
        assert_eq!(fx.manager.status(DeploymentId(7)), Some(DeploymentState::Active));
        assert_eq!(fx.manager.stop_inference(DeploymentId(7), &cam), ControlOutcome::Stopped);
        assert_eq!(fx.manager.status(DeploymentId(7)), None);
        Ok(())
    }

    #[test]
    fn start_on_active_is_already_active_without_mutation() -> Result<()> {
        let fx = fixture()?;
        let cam = SourceId::new("cam1");
        fx.manager.start_inference(DeploymentId(7), &cam, "m1");
        let before = journal_len(&fx);
        assert_eq!(
            fx.manager.start_inference(DeploymentId(7), &cam, "m1"),
            ControlOutcome::AlreadyActive
        );
        assert_eq!(journal_len(&fx), before);
        Ok(())
    }

    #[test]
    fn stop_without_branch_is_already_inactive_without_scheduling() -> Result<()> {
        // A long tick makes any scheduler round trip visible as a delay.
        let fx = fixture_with(Duration::from_secs(5), fast_settings())?;
        let started = std::time::Instant::now();
        assert_eq!(
            fx.manager.stop_inference(DeploymentId(9), &SourceId::new("cam1")),
            ControlOutcome::AlreadyInactive
        );
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(journal_len(&fx), 0);
        Ok(())
    }

    #[test]
    fn unknown_source_and_model_are_reported() -> Result<()> {
        let fx = fixture()?;
        assert_eq!(
            fx.manager.start_inference(DeploymentId(1), &SourceId::new("cam9"), "m1"),
            ControlOutcome::UnknownSource
        );
        assert_eq!(
            fx.manager.start_inference(DeploymentId(1), &SourceId::new("cam1"), "m9"),
            ControlOutcome::UnknownModel
        );
        assert!(fx.manager.list().is_empty());
        Ok(())
    }

    #[test]
    fn strict_attach_failure_marks_deployment_failed() -> Result<()> {
        let fx = fixture()?;
        fx.platform.faults().lock().unwrap().fail_port_links = true;
        let cam = SourceId::new("cam1");
        let outcome = fx.manager.start_inference(DeploymentId(4), &cam, "m1");
        assert!(matches!(outcome, ControlOutcome::Failed(_)));
        assert_eq!(fx.manager.status(DeploymentId(4)), Some(DeploymentState::Failed));
        // Rolled back: nothing left to stop.
        assert_eq!(fx.manager.stop_inference(DeploymentId(4), &cam), ControlOutcome::AlreadyInactive);
        assert_eq!(fx.manager.status(DeploymentId(4)), None);
        Ok(())
    }

    #[test]
    fn attach_timeout_leaves_remnants_that_stop_cleans_up() -> Result<()> {
        let settings = ManagerSettings {
            attach_attempts: 1,
            poll_interval: Duration::from_millis(50),
            ..fast_settings()
        };
        let fx = fixture_with(Duration::from_millis(5), settings)?;
        let cam = SourceId::new("cam1");

        // Slow stage creation so the attach cannot complete in time.
        let faults = fx.platform.faults();
        faults.lock().unwrap().stall_mutations = Some(Duration::from_millis(100));
        assert_eq!(fx.manager.start_inference(DeploymentId(5), &cam, "m1"), ControlOutcome::TimedOut);
        assert_eq!(fx.manager.status(DeploymentId(5)), Some(DeploymentState::Failed));
        faults.lock().unwrap().stall_mutations = None;

        // The attach still lands later.
        thread::sleep(Duration::from_millis(400));
        assert_eq!(
            fx.manager.start_inference(DeploymentId(5), &cam, "m1"),
            ControlOutcome::AlreadyActive
        );
        assert_eq!(fx.manager.stop_inference(DeploymentId(5), &cam), ControlOutcome::Stopped);
        let leftover = fx
            .handle
            .call(Some(Duration::from_secs(1)), move |ctx| {
                ctx.graphs()
                    .get(&SourceId::new("cam1"))
                    .map(|g| g.remaining_stages(DeploymentId(5)))
            })
            .unwrap();
        assert_eq!(leftover, Some(Vec::new()));
        Ok(())
    }

    #[test]
    fn detach_timeout_marks_deployment_failed() -> Result<()> {
        let settings = ManagerSettings {
            detach_timeout: Some(Duration::from_millis(50)),
            ..fast_settings()
        };
        let fx = fixture_with(Duration::from_millis(5), settings)?;
        let cam = SourceId::new("cam1");
        assert_eq!(fx.manager.start_inference(DeploymentId(6), &cam, "m1"), ControlOutcome::Started);

        fx.handle.schedule(|_| thread::sleep(Duration::from_millis(300)))?;
        thread::sleep(Duration::from_millis(20));
        assert_eq!(fx.manager.stop_inference(DeploymentId(6), &cam), ControlOutcome::TimedOut);
        assert_eq!(fx.manager.status(DeploymentId(6)), Some(DeploymentState::Failed));
        Ok(())
    }

    #[test]
    fn stop_on_other_source_is_already_inactive() -> Result<()> {
        let fx = fixture()?;
        fx.manager.start_inference(DeploymentId(7), &SourceId::new("cam1"), "m1");
        assert_eq!(
            fx.manager.stop_inference(DeploymentId(7), &SourceId::new("cam2")),
            ControlOutcome::AlreadyInactive
        );
        assert_eq!(fx.manager.status(DeploymentId(7)), Some(DeploymentState::Active));
        Ok(())
    }

    #[test]
    fn stages_left_on_one_source_block_start_on_another() -> Result<()> {
        let settings = ManagerSettings {
            attach_attempts: 1,
            poll_interval: Duration::from_millis(50),
            ..fast_settings()
        };
        let fx = fixture_on(&["cam1", "cam2"], Duration::from_millis(5), settings)?;
        let cam1 = SourceId::new("cam1");
        let cam2 = SourceId::new("cam2");
        let id = DeploymentId(7);

        let faults = fx.platform.faults();
        faults.lock().unwrap().stall_mutations = Some(Duration::from_millis(100));
        assert_eq!(fx.manager.start_inference(id, &cam1, "m1"), ControlOutcome::TimedOut);
        faults.lock().unwrap().stall_mutations = None;

        // The late attach lands on cam1 before the next request is served.
        assert_eq!(
            fx.manager.start_inference(id, &cam2, "m1"),
            ControlOutcome::AlreadyActive
        );
        assert_eq!(stages_on(&fx, "cam1", id).len(), 4);
        assert!(stages_on(&fx, "cam2", id).is_empty());
        assert_eq!(fx.manager.status(id), Some(DeploymentState::Failed));

        assert_eq!(fx.manager.stop_inference(id, &cam1), ControlOutcome::Stopped);
        assert!(stages_on(&fx, "cam1", id).is_empty());
        assert_eq!(fx.manager.start_inference(id, &cam2, "m1"), ControlOutcome::Started);
        assert_eq!(stages_on(&fx, "cam2", id).len(), 4);
        Ok(())
    }

    #[test]
    fn lane_failure_after_attach_leaves_a_stoppable_deployment() -> Result<()> {
        let mut settings = fast_settings();
        settings.lane.preprocess_workers = 0;
        let fx = fixture_with(Duration::from_millis(5), settings)?;
        let cam = SourceId::new("cam1");
        let id = DeploymentId(3);

        assert!(matches!(
            fx.manager.start_inference(id, &cam, "m1"),
            ControlOutcome::Failed(_)
        ));
        assert_eq!(fx.manager.status(id), Some(DeploymentState::Failed));
        assert_eq!(stages_on(&fx, "cam1", id).len(), 4);

        assert_eq!(fx.manager.start_inference(id, &cam, "m1"), ControlOutcome::AlreadyActive);
        assert_eq!(fx.manager.stop_inference(id, &cam), ControlOutcome::Stopped);
        assert!(stages_on(&fx, "cam1", id).is_empty());
        assert_eq!(fx.manager.status(id), None);
        Ok(())
    }
}
