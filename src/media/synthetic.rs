//! Synthetic media backend for `stub://` devices.
//!
//! Models a processing graph in memory: named stages, directed links, junction
//! ports and run states. Taps produce generated RGB frames once the graph is
//! playing and the tap is connected all the way back to a junction port.
//!
//! Tests can inject structural faults through `SyntheticFaults` and record every
//! primitive call in a `Journal` to check mutation ordering.

use anyhow::{anyhow, bail, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{DeviceInfo, JunctionPort, MediaGraph, MediaPlatform, RunState, StageKind, StageSpec};
use crate::frame::{PixelFormat, Sample};

/// Upstream chain of every synthetic graph, capture first.
const UPSTREAM_STAGES: [&str; 6] = [
    "source",
    "videoconvert",
    "caps",
    "videoconvert2",
    "rgb_caps",
    "tee",
];

/// Primitive calls recorded by a journal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GraphOp {
    AddStage(String),
    Link(String, String),
    Unlink(String, String),
    RequestPort(String),
    LinkPort(String, String),
    ReleasePort(String),
    SetStageState(String, RunState),
    SyncStageState(String),
    RemoveStage(String),
    SetState(RunState),
}

pub type Journal = Arc<Mutex<Vec<GraphOp>>>;

/// Faults injected into synthetic graphs.
#[derive(Clone, Debug, Default)]
pub struct SyntheticFaults {
    /// Links (upstream, downstream) that fail.
    pub fail_links: HashSet<(String, String)>,
    /// Junction port links fail.
    pub fail_port_links: bool,
    /// Device names whose graph cannot be created.
    pub fail_create: HashSet<String>,
    /// Taps that never yield a sample.
    pub starve_taps: HashSet<String>,
    /// Each graph stops yielding once it has emitted this many frames.
    pub frame_limit: Option<u64>,
    /// Delay applied to every stage add and removal.
    pub stall_mutations: Option<Duration>,
}

/// Shape of generated frames.
#[derive(Clone, Copy, Debug)]
pub struct SyntheticFrameSpec {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Default for SyntheticFrameSpec {
    fn default() -> Self {
        Self {
            width: 64,
            height: 48,
            format: PixelFormat::Rgb,
        }
    }
}

pub struct SyntheticPlatform {
    devices: Mutex<Vec<DeviceInfo>>,
    frame: SyntheticFrameSpec,
    faults: Arc<Mutex<SyntheticFaults>>,
    journal: Option<Journal>,
}

impl SyntheticPlatform {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices: Mutex::new(devices),
            frame: SyntheticFrameSpec::default(),
            faults: Arc::new(Mutex::new(SyntheticFaults::default())),
            journal: None,
        }
    }

    /// One `stub://<name>` device per name.
    pub fn with_cameras(names: &[&str]) -> Self {
        Self::new(
            names
                .iter()
                .map(|name| DeviceInfo {
                    name: name.to_string(),
                    path: format!("stub://{}", name),
                })
                .collect(),
        )
    }

    pub fn with_frame(mut self, frame: SyntheticFrameSpec) -> Self {
        self.frame = frame;
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Shared fault plan; changes apply to graphs already created.
    pub fn faults(&self) -> Arc<Mutex<SyntheticFaults>> {
        self.faults.clone()
    }

    /// Replace the set of devices reported by discovery.
    pub fn set_devices(&self, devices: Vec<DeviceInfo>) -> Result<()> {
        let mut guard = self
            .devices
            .lock()
            .map_err(|_| anyhow!("synthetic device list lock poisoned"))?;
        *guard = devices;
        Ok(())
    }
}

impl MediaPlatform for SyntheticPlatform {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn discover(&self) -> Result<Vec<DeviceInfo>> {
        let guard = self
            .devices
            .lock()
            .map_err(|_| anyhow!("synthetic device list lock poisoned"))?;
        Ok(guard.clone())
    }

    fn create_graph(&self, device: &DeviceInfo) -> Result<Box<dyn MediaGraph>> {
        if !device.path.starts_with("stub://") {
            bail!(
                "synthetic platform only serves stub:// devices, got {}",
                device.path
            );
        }
        let refused = self
            .faults
            .lock()
            .map(|faults| faults.fail_create.contains(&device.name))
            .unwrap_or(false);
        if refused {
            bail!("device {} refused graph creation", device.name);
        }
        let mut graph = SyntheticGraph::new(
            format!("dynamic-pipeline-{}", device.path),
            self.frame,
            self.faults.clone(),
        );
        if let Some(journal) = &self.journal {
            graph = graph.with_journal(journal.clone());
        }
        log::info!("synthetic graph created for {} ({})", device.name, device.path);
        Ok(Box::new(graph))
    }
}

struct SyntheticStage {
    kind: Option<StageKind>,
    state: RunState,
}

pub struct SyntheticGraph {
    name: String,
    state: RunState,
    stages: HashMap<String, SyntheticStage>,
    links: HashSet<(String, String)>,
    /// Junction ports and the stage each one feeds.
    ports: BTreeMap<String, Option<String>>,
    next_port: u32,
    frame: SyntheticFrameSpec,
    frames_emitted: u64,
    faults: Arc<Mutex<SyntheticFaults>>,
    journal: Option<Journal>,
}

impl SyntheticGraph {
    pub fn new(
        name: impl Into<String>,
        frame: SyntheticFrameSpec,
        faults: Arc<Mutex<SyntheticFaults>>,
    ) -> Self {
        let mut stages = HashMap::new();
        for stage in UPSTREAM_STAGES {
            stages.insert(
                stage.to_string(),
                SyntheticStage {
                    kind: None,
                    state: RunState::Null,
                },
            );
        }
        let links = UPSTREAM_STAGES
            .windows(2)
            .map(|pair| (pair[0].to_string(), pair[1].to_string()))
            .collect();
        Self {
            name: name.into(),
            state: RunState::Null,
            stages,
            links,
            ports: BTreeMap::new(),
            next_port: 0,
            frame,
            frames_emitted: 0,
            faults,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    fn record(&self, op: GraphOp) {
        if let Some(journal) = &self.journal {
            if let Ok(mut ops) = journal.lock() {
                ops.push(op);
            }
        }
    }

    fn faults(&self) -> SyntheticFaults {
        self.faults
            .lock()
            .map(|faults| faults.clone())
            .unwrap_or_default()
    }

    fn stall(&self) {
        if let Some(delay) = self.faults().stall_mutations {
            std::thread::sleep(delay);
        }
    }

    fn require_stage(&self, stage: &str) -> Result<()> {
        if self.stages.contains_key(stage) {
            Ok(())
        } else {
            Err(anyhow!("stage '{}' not found in {}", stage, self.name))
        }
    }

    /// True when `tap` reaches a junction port through links.
    fn connected_to_junction(&self, tap: &str) -> bool {
        let mut current = tap.to_string();
        let mut hops = 0;
        loop {
            if self.ports.values().any(|peer| peer.as_deref() == Some(&current)) {
                return true;
            }
            let upstream = self
                .links
                .iter()
                .find(|(_, down)| *down == current)
                .map(|(up, _)| up.clone());
            match upstream {
                Some(up) if hops < self.stages.len() => {
                    current = up;
                    hops += 1;
                }
                _ => return false,
            }
        }
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        self.frames_emitted += 1;
        let len = (self.frame.width * self.frame.height) as usize * self.frame.format.channels();
        let offset = self.frames_emitted + u64::from(rand::random::<u8>() % 4);
        (0..len)
            .map(|i| ((i as u64 + offset) % 256) as u8)
            .collect()
    }
}

impl MediaGraph for SyntheticGraph {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_stage(&mut self, spec: &StageSpec) -> Result<()> {
        self.stall();
        if self.stages.contains_key(&spec.name) {
            bail!("stage '{}' already exists in {}", spec.name, self.name);
        }
        self.stages.insert(
            spec.name.clone(),
            SyntheticStage {
                kind: Some(spec.kind.clone()),
                state: RunState::Null,
            },
        );
        self.record(GraphOp::AddStage(spec.name.clone()));
        Ok(())
    }

    fn link(&mut self, upstream: &str, downstream: &str) -> Result<()> {
        self.require_stage(upstream)?;
        self.require_stage(downstream)?;
        self.record(GraphOp::Link(upstream.to_string(), downstream.to_string()));
        let key = (upstream.to_string(), downstream.to_string());
        if self.faults().fail_links.contains(&key) {
            bail!("could not link {} to {}", upstream, downstream);
        }
        self.links.insert(key);
        Ok(())
    }

    fn unlink(&mut self, upstream: &str, downstream: &str) -> Result<()> {
        self.record(GraphOp::Unlink(upstream.to_string(), downstream.to_string()));
        if !self
            .links
            .remove(&(upstream.to_string(), downstream.to_string()))
        {
            bail!("{} is not linked to {}", upstream, downstream);
        }
        Ok(())
    }

    fn request_junction_port(&mut self) -> Result<JunctionPort> {
        let name = format!("src_{}", self.next_port);
        self.next_port += 1;
        self.ports.insert(name.clone(), None);
        self.record(GraphOp::RequestPort(name.clone()));
        Ok(JunctionPort(name))
    }

    fn link_junction_port(&mut self, port: &JunctionPort, stage: &str) -> Result<()> {
        self.require_stage(stage)?;
        self.record(GraphOp::LinkPort(port.0.clone(), stage.to_string()));
        if self.faults().fail_port_links {
            bail!("could not link junction port {} to {}", port.0, stage);
        }
        match self.ports.get_mut(&port.0) {
            Some(peer @ None) => {
                *peer = Some(stage.to_string());
                Ok(())
            }
            Some(Some(other)) => Err(anyhow!("port {} already feeds {}", port.0, other)),
            None => Err(anyhow!("port {} was never requested", port.0)),
        }
    }

    fn junction_port_for(&self, stage: &str) -> Option<JunctionPort> {
        self.ports
            .iter()
            .find(|(_, peer)| peer.as_deref() == Some(stage))
            .map(|(name, _)| JunctionPort(name.clone()))
    }

    fn release_junction_port(&mut self, port: &JunctionPort) -> Result<()> {
        self.record(GraphOp::ReleasePort(port.0.clone()));
        self.ports
            .remove(&port.0)
            .map(|_| ())
            .ok_or_else(|| anyhow!("port {} is not held by the junction", port.0))
    }

    fn set_stage_state(&mut self, stage: &str, state: RunState) -> Result<()> {
        self.record(GraphOp::SetStageState(stage.to_string(), state));
        let entry = self
            .stages
            .get_mut(stage)
            .ok_or_else(|| anyhow!("stage '{}' not found", stage))?;
        entry.state = state;
        Ok(())
    }

    fn sync_stage_state(&mut self, stage: &str) -> Result<()> {
        self.record(GraphOp::SyncStageState(stage.to_string()));
        let state = self.state;
        let entry = self
            .stages
            .get_mut(stage)
            .ok_or_else(|| anyhow!("stage '{}' not found", stage))?;
        entry.state = state;
        Ok(())
    }

    fn remove_stage(&mut self, stage: &str) -> Result<()> {
        self.stall();
        self.record(GraphOp::RemoveStage(stage.to_string()));
        if self.stages.remove(stage).is_none() {
            bail!("stage '{}' not found", stage);
        }
        self.links
            .retain(|(up, down)| up.as_str() != stage && down.as_str() != stage);
        Ok(())
    }

    fn has_stage(&self, stage: &str) -> bool {
        self.stages.contains_key(stage)
    }

    fn set_state(&mut self, state: RunState) -> Result<()> {
        self.record(GraphOp::SetState(state));
        self.state = state;
        for stage in self.stages.values_mut() {
            stage.state = state;
        }
        Ok(())
    }

    fn state(&self) -> RunState {
        self.state
    }

    fn pull_sample(&mut self, tap: &str) -> Result<Option<Sample>> {
        let stage = self
            .stages
            .get(tap)
            .ok_or_else(|| anyhow!("tap '{}' not found", tap))?;
        if !matches!(stage.kind, Some(StageKind::Tap { .. })) {
            bail!("stage '{}' is not a tap", tap);
        }
        if self.state != RunState::Playing || stage.state != RunState::Playing {
            return Ok(None);
        }
        let faults = self.faults();
        if faults.starve_taps.contains(tap) || !self.connected_to_junction(tap) {
            return Ok(None);
        }
        if faults
            .frame_limit
            .is_some_and(|limit| self.frames_emitted >= limit)
        {
            return Ok(None);
        }
        let pixels = self.generate_pixels();
        Sample::new(pixels, self.frame.width, self.frame.height, self.frame.format).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> SyntheticGraph {
        SyntheticGraph::new(
            "test",
            SyntheticFrameSpec::default(),
            Arc::new(Mutex::new(SyntheticFaults::default())),
        )
    }

    fn tap(name: &str) -> StageSpec {
        StageSpec {
            name: name.to_string(),
            kind: StageKind::Tap {
                max_buffers: 5,
                drop: true,
            },
        }
    }

    #[test]
    fn upstream_chain_exists_on_creation() {
        let graph = graph();
        for stage in UPSTREAM_STAGES {
            assert!(graph.has_stage(stage));
        }
    }

    #[test]
    fn tap_yields_nothing_until_connected_and_playing() -> Result<()> {
        let mut graph = graph();
        graph.add_stage(&tap("sink_a"))?;
        graph.set_state(RunState::Playing)?;
        assert!(graph.pull_sample("sink_a")?.is_none());

        let port = graph.request_junction_port()?;
        graph.link_junction_port(&port, "sink_a")?;
        let sample = graph.pull_sample("sink_a")?.expect("connected tap yields");
        assert_eq!((sample.width, sample.height), (64, 48));
        Ok(())
    }

    #[test]
    fn starved_and_exhausted_taps_yield_nothing() -> Result<()> {
        let faults = Arc::new(Mutex::new(SyntheticFaults::default()));
        let mut graph = SyntheticGraph::new("test", SyntheticFrameSpec::default(), faults.clone());
        graph.add_stage(&tap("sink_a"))?;
        graph.set_state(RunState::Playing)?;
        let port = graph.request_junction_port()?;
        graph.link_junction_port(&port, "sink_a")?;

        faults.lock().unwrap().starve_taps.insert("sink_a".to_string());
        assert!(graph.pull_sample("sink_a")?.is_none());

        {
            let mut faults = faults.lock().unwrap();
            faults.starve_taps.clear();
            faults.frame_limit = Some(3);
        }
        let mut pulled = 0;
        while graph.pull_sample("sink_a")?.is_some() {
            pulled += 1;
            assert!(pulled <= 3);
        }
        assert_eq!(pulled, 3);
        assert_eq!(graph.frames_emitted(), 3);
        Ok(())
    }

    #[test]
    fn configured_frame_shape_reaches_samples() -> Result<()> {
        let platform = SyntheticPlatform::with_cameras(&["cam1"]).with_frame(SyntheticFrameSpec {
            width: 4,
            height: 2,
            format: PixelFormat::Bgr,
        });
        let device = platform.discover()?.remove(0);
        let mut graph = platform.create_graph(&device)?;
        graph.add_stage(&tap("sink_a"))?;
        graph.set_state(RunState::Playing)?;
        let port = graph.request_junction_port()?;
        graph.link_junction_port(&port, "sink_a")?;
        let sample = graph.pull_sample("sink_a")?.expect("connected tap yields");
        assert_eq!((sample.width, sample.height), (4, 2));
        assert_eq!(sample.format, PixelFormat::Bgr);
        Ok(())
    }

    #[test]
    fn platform_rejects_non_stub_paths() {
        let platform = SyntheticPlatform::new(vec![DeviceInfo {
            name: "usb".into(),
            path: "/dev/video0".into(),
        }]);
        let device = platform.discover().unwrap().remove(0);
        assert!(platform.create_graph(&device).is_err());
    }

    #[test]
    fn injected_link_fault_fails_link() -> Result<()> {
        let faults = Arc::new(Mutex::new(SyntheticFaults::default()));
        faults
            .lock()
            .unwrap()
            .fail_links
            .insert(("a".to_string(), "b".to_string()));
        let mut graph = SyntheticGraph::new("test", SyntheticFrameSpec::default(), faults);
        graph.add_stage(&tap("a"))?;
        graph.add_stage(&tap("b"))?;
        assert!(graph.link("a", "b").is_err());
        Ok(())
    }
}
