//! Vision Node
//!
//! Edge-node runtime that turns live camera feeds into classified events.
//!
//! # Architecture
//!
//! Every camera owns one processing graph: a fixed capture chain ending in a
//! fan-out junction. Each running inference deployment hangs its own branch
//! (buffer, convert, scale, tap) off that junction. Branches are attached and
//! detached while frames keep flowing.
//!
//! Two execution domains exist:
//!
//! 1. **Scheduler**: one thread owns every graph. Attach, detach and frame pulls
//!    run there as callbacks and never overlap.
//! 2. **Everything else**: API connections, discovery, flushing and the
//!    per-deployment inference lanes. They only schedule callbacks onto the
//!    scheduler and wait on completion channels.
//!
//! # Module Structure
//!
//! - `media`: platform layer (synthetic `stub://` devices, GStreamer)
//! - `graph`, `mutator`: processing graph model and branch attach/detach
//! - `scheduler`: cooperative single-threaded tick loop
//! - `frame`, `window`, `collector`: sample preprocessing and frame windows
//! - `inference`: inference service clients and batch dispatch
//! - `deployment`, `manager`: deployment lifecycle state machine
//! - `sink`: buffered event/result log and periodic result push
//! - `node`, `api`: orchestration and the control API

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod api;
pub mod collector;
pub mod config;
pub mod deployment;
pub mod frame;
pub mod graph;
pub mod inference;
pub mod manager;
pub mod media;
pub mod mutator;
pub mod node;
pub mod scheduler;
pub mod sink;
pub mod window;

pub use collector::{
    preprocess_ordered, CapturedSample, FrameCollector, InferenceLane, LaneFeeder, LaneSettings,
};
pub use config::{AutostartDeployment, MediaBackend, NodeConfig};
pub use deployment::{
    ControlOutcome, Deployment, DeploymentState, ModelCatalog, ModelSpec, StaticModelCatalog,
};
pub use frame::{Frame, PixelFormat, Sample};
pub use graph::{Branch, BranchStages, GraphPhase, GraphRegistry, ProcessingGraph};
pub use inference::{
    format_confidence, Dispatcher, HttpInferenceClient, InferenceClient, InferenceError,
    InferenceResult, StaticInferenceClient,
};
pub use manager::{DeploymentManager, ManagerSettings};
pub use media::{CaptureSettings, DeviceInfo, MediaGraph, MediaPlatform, RunState, SyntheticPlatform};
pub use mutator::{AttachReport, BranchSettings, DetachReport, LinkPolicy};
pub use node::{Node, NodeControl};
pub use scheduler::{CallError, Scheduler, SchedulerHandle, TickControl};
pub use sink::{
    InMemoryResultStore, PushSummary, Record, ResultSink, ResultStore, SinkSettings, SinkWorker,
    SqliteResultStore,
};
pub use window::{FrameWindow, OverflowPolicy, PushOutcome};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as u64)
}

// -------------------- Identifiers --------------------

/// Camera identifier (the display name reported by discovery).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Deployment identifier assigned by the master server.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DeploymentId(pub u64);

impl DeploymentId {
    /// Branch name used to label every stage of this deployment's branch.
    pub fn branch_name(self) -> String {
        format!("deployment_{}", self.0)
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_uses_deployment_prefix() {
        assert_eq!(DeploymentId(7).branch_name(), "deployment_7");
    }

    #[test]
    fn source_id_serializes_as_plain_string() -> Result<()> {
        let json = serde_json::to_string(&SourceId::new("cam1"))?;
        assert_eq!(json, "\"cam1\"");
        Ok(())
    }
}
