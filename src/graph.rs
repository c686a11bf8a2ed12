//! Processing graph model.
//!
//! A `ProcessingGraph` wraps one camera's media graph together with the
//! bookkeeping the node needs: the branch attached for each deployment and the
//! graph's build phase. The `GraphRegistry` holding every graph is owned by the
//! scheduler thread; nothing else touches it.

use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, HashMap};

use crate::frame::Sample;
use crate::media::{DeviceInfo, JunctionPort, MediaGraph, RunState};
use crate::{DeploymentId, SourceId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GraphPhase {
    /// Upstream chain created, not yet playing.
    Building,
    /// Playing; only branch-scoped changes are allowed.
    Running,
}

/// Stage names of one deployment's branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchStages {
    pub buffer: String,
    pub convert: String,
    pub scale: String,
    pub tap: String,
}

impl BranchStages {
    pub fn for_deployment(id: DeploymentId) -> Self {
        let branch = id.branch_name();
        Self {
            buffer: format!("queue_{}", branch),
            convert: format!("videoconvert_{}", branch),
            scale: format!("videoscale_{}", branch),
            tap: format!("sink_{}", branch),
        }
    }

    /// Upstream to downstream.
    pub fn in_order(&self) -> [&str; 4] {
        [&self.buffer, &self.convert, &self.scale, &self.tap]
    }
}

#[derive(Clone, Debug)]
pub struct Branch {
    pub stages: BranchStages,
    pub port: Option<JunctionPort>,
}

pub struct ProcessingGraph {
    source: SourceId,
    device: DeviceInfo,
    media: Box<dyn MediaGraph>,
    phase: GraphPhase,
    branches: HashMap<DeploymentId, Branch>,
}

impl ProcessingGraph {
    pub fn new(device: DeviceInfo, media: Box<dyn MediaGraph>) -> Self {
        Self {
            source: SourceId::new(device.name.clone()),
            device,
            media,
            phase: GraphPhase::Building,
            branches: HashMap::new(),
        }
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn phase(&self) -> GraphPhase {
        self.phase
    }

    pub fn media(&self) -> &dyn MediaGraph {
        self.media.as_ref()
    }

    pub fn media_mut(&mut self) -> &mut dyn MediaGraph {
        self.media.as_mut()
    }

    /// Set the graph playing and freeze the upstream chain.
    pub fn play(&mut self) -> Result<()> {
        self.media.set_state(RunState::Playing)?;
        if self.phase == GraphPhase::Building {
            log::info!("graph {} for {} is running", self.media.name(), self.device.path);
        }
        self.phase = GraphPhase::Running;
        Ok(())
    }

    pub fn halt(&mut self) -> Result<()> {
        self.media.set_state(RunState::Null)
    }

    /// Whether the deployment's tap is present on the graph.
    pub fn has_tap(&self, id: DeploymentId) -> bool {
        self.media.has_stage(&BranchStages::for_deployment(id).tap)
    }

    /// Stages named for the deployment that are still present.
    pub fn remaining_stages(&self, id: DeploymentId) -> Vec<String> {
        BranchStages::for_deployment(id)
            .in_order()
            .iter()
            .filter(|stage| self.media.has_stage(stage))
            .map(|stage| stage.to_string())
            .collect()
    }

    pub fn branch(&self, id: DeploymentId) -> Option<&Branch> {
        self.branches.get(&id)
    }

    pub fn branch_ids(&self) -> Vec<DeploymentId> {
        let mut ids: Vec<_> = self.branches.keys().copied().collect();
        ids.sort();
        ids
    }

    pub(crate) fn record_branch(&mut self, id: DeploymentId, branch: Branch) {
        self.branches.insert(id, branch);
    }

    pub(crate) fn forget_branch(&mut self, id: DeploymentId) -> Option<Branch> {
        self.branches.remove(&id)
    }

    pub fn pull_sample(&mut self, id: DeploymentId) -> Result<Option<Sample>> {
        let tap = BranchStages::for_deployment(id).tap;
        if !self.media.has_stage(&tap) {
            return Err(anyhow!("{} has no tap for deployment {}", self.source, id));
        }
        self.media.pull_sample(&tap)
    }
}

/// Every processing graph on the node, keyed by source.
#[derive(Default)]
pub struct GraphRegistry {
    graphs: BTreeMap<SourceId, ProcessingGraph>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a graph. A second graph for the same source is refused.
    pub fn insert(&mut self, graph: ProcessingGraph) -> Result<()> {
        if self.graphs.contains_key(graph.source()) {
            return Err(anyhow!("a graph already exists for {}", graph.source()));
        }
        self.graphs.insert(graph.source().clone(), graph);
        Ok(())
    }

    pub fn get(&self, source: &SourceId) -> Option<&ProcessingGraph> {
        self.graphs.get(source)
    }

    pub fn get_mut(&mut self, source: &SourceId) -> Option<&mut ProcessingGraph> {
        self.graphs.get_mut(source)
    }

    pub fn contains(&self, source: &SourceId) -> bool {
        self.graphs.contains_key(source)
    }

    pub fn sources(&self) -> Vec<SourceId> {
        self.graphs.keys().cloned().collect()
    }

    /// Sources whose graph still carries stages named for `id`.
    pub fn holding(&self, id: DeploymentId) -> Vec<(SourceId, Vec<String>)> {
        self.graphs
            .iter()
            .map(|(source, graph)| (source.clone(), graph.remaining_stages(id)))
            .filter(|(_, stages)| !stages.is_empty())
            .collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ProcessingGraph> {
        self.graphs.values_mut()
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaPlatform, SyntheticPlatform};

    fn graph(name: &str) -> Result<ProcessingGraph> {
        let platform = SyntheticPlatform::with_cameras(&[name]);
        let device = platform.discover()?.remove(0);
        let media = platform.create_graph(&device)?;
        Ok(ProcessingGraph::new(device, media))
    }

    #[test]
    fn branch_stage_names_follow_deployment() {
        let stages = BranchStages::for_deployment(DeploymentId(7));
        assert_eq!(
            stages.in_order(),
            [
                "queue_deployment_7",
                "videoconvert_deployment_7",
                "videoscale_deployment_7",
                "sink_deployment_7"
            ]
        );
    }

    #[test]
    fn play_moves_graph_to_running() -> Result<()> {
        let mut graph = graph("cam1")?;
        assert_eq!(graph.phase(), GraphPhase::Building);
        graph.play()?;
        assert_eq!(graph.phase(), GraphPhase::Running);
        assert_eq!(graph.media().state(), RunState::Playing);
        Ok(())
    }

    #[test]
    fn registry_holds_one_graph_per_source() -> Result<()> {
        let mut registry = GraphRegistry::new();
        registry.insert(graph("cam1")?)?;
        assert!(registry.insert(graph("cam1")?).is_err());
        registry.insert(graph("cam2")?)?;
        assert_eq!(
            registry.sources(),
            vec![SourceId::new("cam1"), SourceId::new("cam2")]
        );
        Ok(())
    }

    #[test]
    fn holding_lists_only_sources_with_stages() -> Result<()> {
        use crate::mutator::{self, BranchSettings, LinkPolicy};

        let mut registry = GraphRegistry::new();
        for name in ["cam1", "cam2"] {
            let mut graph = graph(name)?;
            graph.play()?;
            registry.insert(graph)?;
        }
        let cam2 = SourceId::new("cam2");
        let graph = registry
            .get_mut(&cam2)
            .ok_or_else(|| anyhow!("cam2 missing"))?;
        mutator::attach(graph, DeploymentId(5), LinkPolicy::Strict, &BranchSettings::default())?;

        let holding = registry.holding(DeploymentId(5));
        assert_eq!(holding.len(), 1);
        assert_eq!(holding[0].0, cam2);
        assert_eq!(holding[0].1.len(), 4);
        assert!(registry.holding(DeploymentId(6)).is_empty());
        Ok(())
    }

    #[test]
    fn pull_without_tap_is_an_error() -> Result<()> {
        let mut graph = graph("cam1")?;
        assert!(graph.pull_sample(DeploymentId(3)).is_err());
        Ok(())
    }
}
