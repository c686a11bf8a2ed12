//! Platform media layer.
//!
//! The core never talks to a camera or a media framework directly. It consumes
//! two traits:
//!
//! - `MediaPlatform`: device discovery and "create graph for source"
//! - `MediaGraph`: stage creation, linking, run-state changes, junction ports
//!   and non-blocking sample pulls on one camera's graph
//!
//! Backends:
//! - `SyntheticPlatform` for `stub://` devices (tests, demos, offline nodes)
//! - `GstreamerPlatform` for V4L2 cameras (feature: media-gstreamer)

use anyhow::Result;

use crate::frame::Sample;

#[cfg(feature = "media-gstreamer")]
pub mod gstreamer;
pub mod synthetic;

#[cfg(feature = "media-gstreamer")]
pub use self::gstreamer::GstreamerPlatform;
pub use synthetic::{
    GraphOp, Journal, SyntheticFaults, SyntheticFrameSpec, SyntheticGraph, SyntheticPlatform,
};

/// A camera reported by discovery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Display name; used as the source identifier.
    pub name: String,
    /// System path (e.g. `/dev/video0`, `stub://cam1`).
    pub path: String,
}

/// Capture format requested from a camera.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureSettings {
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub framerate: i32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            format: "UYVY".to_string(),
            width: 1920,
            height: 1080,
            framerate: 30,
        }
    }
}

/// Run state of a graph or a single stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Null,
    Ready,
    Paused,
    Playing,
}

/// Stage roles used by branches.
#[derive(Clone, Debug, PartialEq)]
pub enum StageKind {
    /// Leaky queue decoupling the branch from the junction.
    Buffer {
        max_buffers: u32,
        max_time_ns: u64,
    },
    /// Colour-space conversion.
    Convert,
    /// Scaling.
    Scale,
    /// Terminal stage frames are pulled from.
    Tap { max_buffers: u32, drop: bool },
}

#[derive(Clone, Debug, PartialEq)]
pub struct StageSpec {
    pub name: String,
    pub kind: StageKind,
}

/// Output port requested from a graph's fan-out junction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct JunctionPort(pub String);

/// Structural and data primitives on one camera's processing graph.
///
/// Every method is called from the scheduler thread only.
pub trait MediaGraph: Send {
    fn name(&self) -> &str;

    fn add_stage(&mut self, spec: &StageSpec) -> Result<()>;

    fn link(&mut self, upstream: &str, downstream: &str) -> Result<()>;

    fn unlink(&mut self, upstream: &str, downstream: &str) -> Result<()>;

    /// Request a fresh output port on the fan-out junction.
    fn request_junction_port(&mut self) -> Result<JunctionPort>;

    /// Connect a junction port to the input of `stage`.
    fn link_junction_port(&mut self, port: &JunctionPort, stage: &str) -> Result<()>;

    /// Junction port currently feeding the input of `stage`, if any.
    fn junction_port_for(&self, stage: &str) -> Option<JunctionPort>;

    /// Disconnect a junction port and hand it back to the junction.
    fn release_junction_port(&mut self, port: &JunctionPort) -> Result<()>;

    fn set_stage_state(&mut self, stage: &str, state: RunState) -> Result<()>;

    /// Align a stage's run state with the graph's.
    fn sync_stage_state(&mut self, stage: &str) -> Result<()>;

    fn remove_stage(&mut self, stage: &str) -> Result<()>;

    fn has_stage(&self, stage: &str) -> bool;

    fn set_state(&mut self, state: RunState) -> Result<()>;

    fn state(&self) -> RunState;

    /// Non-blocking pull. `Ok(None)` means no frame is ready yet.
    fn pull_sample(&mut self, tap: &str) -> Result<Option<Sample>>;
}

/// Camera discovery and graph construction.
pub trait MediaPlatform: Send + Sync {
    fn name(&self) -> &'static str;

    fn discover(&self) -> Result<Vec<DeviceInfo>>;

    /// Build the upstream chain (capture, normalisation, junction) for a device.
    fn create_graph(&self, device: &DeviceInfo) -> Result<Box<dyn MediaGraph>>;
}
