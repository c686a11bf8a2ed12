//! Branch attach/detach on a live processing graph.
//!
//! Both operations run on the scheduler thread, so they never interleave with
//! a frame pull or with each other.
//!
//! Attach: add buffer, convert, scale and tap; link them; request a junction
//! port and link it to the buffer; sync each new stage with the graph state.
//!
//! Detach: every stage to `Null`, unlink downstream to upstream, release the
//! junction port, remove the stages. Teardown always runs to the end.

use anyhow::{anyhow, bail, Result};

use crate::graph::{Branch, BranchStages, ProcessingGraph};
use crate::media::{JunctionPort, RunState, StageKind, StageSpec};
use crate::DeploymentId;

/// How attach reacts to a failed link or state-sync step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LinkPolicy {
    /// Abort on the first failure and tear the partial branch down.
    #[default]
    Strict,
    /// Log the failure and keep going; callers confirm by observing the tap.
    BestEffort,
}

impl std::str::FromStr for LinkPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(LinkPolicy::Strict),
            "best_effort" | "best-effort" | "besteffort" => Ok(LinkPolicy::BestEffort),
            other => Err(anyhow!("unknown link policy '{}'", other)),
        }
    }
}

/// Buffer and tap limits applied to every new branch.
#[derive(Clone, Debug, PartialEq)]
pub struct BranchSettings {
    pub queue_max_buffers: u32,
    pub queue_max_time_ns: u64,
    pub tap_max_buffers: u32,
    pub tap_drop: bool,
}

impl Default for BranchSettings {
    fn default() -> Self {
        Self {
            queue_max_buffers: 5,
            queue_max_time_ns: 16_000_000,
            tap_max_buffers: 5,
            tap_drop: true,
        }
    }
}

impl BranchSettings {
    fn specs(&self, stages: &BranchStages) -> [StageSpec; 4] {
        [
            StageSpec {
                name: stages.buffer.clone(),
                kind: StageKind::Buffer {
                    max_buffers: self.queue_max_buffers,
                    max_time_ns: self.queue_max_time_ns,
                },
            },
            StageSpec {
                name: stages.convert.clone(),
                kind: StageKind::Convert,
            },
            StageSpec {
                name: stages.scale.clone(),
                kind: StageKind::Scale,
            },
            StageSpec {
                name: stages.tap.clone(),
                kind: StageKind::Tap {
                    max_buffers: self.tap_max_buffers,
                    drop: self.tap_drop,
                },
            },
        ]
    }
}

#[derive(Clone, Debug)]
pub struct AttachReport {
    pub stages: BranchStages,
    pub port: Option<JunctionPort>,
    /// Steps that failed under `LinkPolicy::BestEffort`.
    pub failures: Vec<String>,
}

impl AttachReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct DetachReport {
    pub failures: Vec<String>,
    /// Stages still present after teardown.
    pub remaining: Vec<String>,
}

impl DetachReport {
    pub fn is_complete(&self) -> bool {
        self.remaining.is_empty()
    }
}

/// Attach the branch for `id` to `graph`.
pub fn attach(
    graph: &mut ProcessingGraph,
    id: DeploymentId,
    policy: LinkPolicy,
    settings: &BranchSettings,
) -> Result<AttachReport> {
    let stages = BranchStages::for_deployment(id);
    if graph.branch(id).is_some() || !graph.remaining_stages(id).is_empty() {
        bail!("{} already carries a branch for deployment {}", graph.source(), id);
    }

    let mut added: Vec<String> = Vec::new();
    for spec in settings.specs(&stages) {
        if let Err(err) = graph.media_mut().add_stage(&spec) {
            log::warn!("failed to add {} to {}: {:#}", spec.name, graph.source(), err);
            rollback(graph, &added, None);
            return Err(err.context(format!("add stage {}", spec.name)));
        }
        added.push(spec.name);
    }

    let mut failures = Vec::new();
    let mut port: Option<JunctionPort> = None;

    let chain = stages.in_order();
    for pair in chain.windows(2) {
        let outcome = graph.media_mut().link(pair[0], pair[1]);
        if let Err(err) = outcome {
            let message = format!("link {} -> {}: {:#}", pair[0], pair[1], err);
            if step_failed(graph, policy, &added, port.as_ref(), &message, &mut failures) {
                return Err(anyhow!(message));
            }
        }
    }

    match graph.media_mut().request_junction_port() {
        Ok(requested) => {
            let linked = graph
                .media_mut()
                .link_junction_port(&requested, &stages.buffer);
            port = Some(requested);
            if let Err(err) = linked {
                let message = format!("link junction port -> {}: {:#}", stages.buffer, err);
                if step_failed(graph, policy, &added, port.as_ref(), &message, &mut failures) {
                    return Err(anyhow!(message));
                }
            }
        }
        Err(err) => {
            let message = format!("request junction port: {:#}", err);
            if step_failed(graph, policy, &added, None, &message, &mut failures) {
                return Err(anyhow!(message));
            }
        }
    }

    for stage in chain {
        if let Err(err) = graph.media_mut().sync_stage_state(stage) {
            let message = format!("sync state of {}: {:#}", stage, err);
            if step_failed(graph, policy, &added, port.as_ref(), &message, &mut failures) {
                return Err(anyhow!(message));
            }
        }
    }

    graph.record_branch(
        id,
        Branch {
            stages: stages.clone(),
            port: port.clone(),
        },
    );
    if failures.is_empty() {
        log::info!("branch {} attached to {}", id.branch_name(), graph.source());
    } else {
        log::warn!(
            "branch {} attached to {} with {} failed step(s)",
            id.branch_name(),
            graph.source(),
            failures.len()
        );
    }
    Ok(AttachReport {
        stages,
        port,
        failures,
    })
}

/// Returns true when the attach must abort (strict policy, branch rolled back).
fn step_failed(
    graph: &mut ProcessingGraph,
    policy: LinkPolicy,
    added: &[String],
    port: Option<&JunctionPort>,
    message: &str,
    failures: &mut Vec<String>,
) -> bool {
    log::warn!("attach on {}: {}", graph.source(), message);
    match policy {
        LinkPolicy::BestEffort => {
            failures.push(message.to_string());
            false
        }
        LinkPolicy::Strict => {
            rollback(graph, added, port);
            true
        }
    }
}

fn rollback(graph: &mut ProcessingGraph, added: &[String], port: Option<&JunctionPort>) {
    let media = graph.media_mut();
    for stage in added.iter().rev() {
        let _ = media.set_stage_state(stage, RunState::Null);
    }
    for pair in added.windows(2).rev() {
        let _ = media.unlink(&pair[0], &pair[1]);
    }
    if let Some(port) = port {
        if let Err(err) = media.release_junction_port(port) {
            log::warn!("rollback: release {}: {:#}", port.0, err);
        }
    }
    for stage in added.iter().rev() {
        if let Err(err) = media.remove_stage(stage) {
            log::warn!("rollback: remove {}: {:#}", stage, err);
        }
    }
}

/// Detach the branch for `id` from `graph`.
pub fn detach(graph: &mut ProcessingGraph, id: DeploymentId) -> DetachReport {
    let recorded = graph.forget_branch(id);
    let stages = recorded
        .as_ref()
        .map(|branch| branch.stages.clone())
        .unwrap_or_else(|| BranchStages::for_deployment(id));
    let source = graph.source().clone();
    let mut failures = Vec::new();
    let media = graph.media_mut();

    let present: Vec<bool> = stages
        .in_order()
        .iter()
        .map(|stage| media.has_stage(stage))
        .collect();
    let port = recorded
        .and_then(|branch| branch.port)
        .or_else(|| media.junction_port_for(&stages.buffer));

    let chain = stages.in_order();
    for (index, stage) in chain.iter().enumerate().rev() {
        if !present[index] {
            continue;
        }
        if let Err(err) = media.set_stage_state(stage, RunState::Null) {
            failures.push(format!("set {} to Null: {:#}", stage, err));
        }
    }

    for index in (0..chain.len() - 1).rev() {
        if !(present[index] && present[index + 1]) {
            continue;
        }
        if let Err(err) = media.unlink(chain[index], chain[index + 1]) {
            failures.push(format!("unlink {} -> {}: {:#}", chain[index], chain[index + 1], err));
        }
    }

    if let Some(port) = port {
        if let Err(err) = media.release_junction_port(&port) {
            failures.push(format!("release junction port {}: {:#}", port.0, err));
        }
    }

    for (index, stage) in chain.iter().enumerate().rev() {
        if !present[index] {
            continue;
        }
        if let Err(err) = media.remove_stage(stage) {
            failures.push(format!("remove {}: {:#}", stage, err));
        }
    }

    for failure in &failures {
        log::warn!("detach on {}: {}", source, failure);
    }
    let remaining = graph.remaining_stages(id);
    if remaining.is_empty() {
        log::info!("branch {} detached from {}", id.branch_name(), source);
    }
    DetachReport {
        failures,
        remaining,
    }
}
