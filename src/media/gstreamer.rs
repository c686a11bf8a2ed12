//! GStreamer backend for V4L2 cameras.
//!
//! Upstream chain per camera:
//!
//! `v4l2src ! videoconvert ! video/x-raw,format=UYVY,... ! videoconvert ! video/x-raw,format=RGB ! tee`
//!
//! Branch stages map onto `queue`, `videoconvert`, `videoscale` and `appsink`.
//! The tee allows unlinked pads so a graph with no branches keeps running.

use ::gstreamer as gst;
use ::gstreamer::prelude::*;
use anyhow::{anyhow, Context, Result};
use gstreamer_app as gst_app;
use std::collections::HashMap;

use super::{
    CaptureSettings, DeviceInfo, JunctionPort, MediaGraph, MediaPlatform, RunState, StageKind,
    StageSpec,
};
use crate::frame::{PixelFormat, Sample};

const JUNCTION: &str = "tee";

pub struct GstreamerPlatform {
    capture: CaptureSettings,
}

impl GstreamerPlatform {
    pub fn new(capture: CaptureSettings) -> Result<Self> {
        gst::init().context("initialize gstreamer")?;
        Ok(Self { capture })
    }
}

impl MediaPlatform for GstreamerPlatform {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn discover(&self) -> Result<Vec<DeviceInfo>> {
        let monitor = gst::DeviceMonitor::new();
        let caps = gst::Caps::new_empty_simple("video/x-raw");
        monitor.add_filter(Some("Video/Source"), Some(&caps));
        monitor.start().context("start device monitor")?;

        let mut devices = Vec::new();
        for device in monitor.devices() {
            let name = device.display_name().to_string();
            let path = device
                .properties()
                .and_then(|props| props.get::<String>("device.path").ok());
            match path {
                Some(path) => devices.push(DeviceInfo { name, path }),
                None => log::debug!("device {} has no device.path, skipping", name),
            }
        }
        monitor.stop();
        Ok(devices)
    }

    fn create_graph(&self, device: &DeviceInfo) -> Result<Box<dyn MediaGraph>> {
        let graph = GstreamerGraph::build(device, &self.capture)?;
        log::info!("pipeline {} created for {}", graph.name, device.name);
        Ok(Box::new(graph))
    }
}

pub struct GstreamerGraph {
    name: String,
    pipeline: gst::Pipeline,
    tee: gst::Element,
    ports: HashMap<String, gst::Pad>,
}

impl GstreamerGraph {
    fn build(device: &DeviceInfo, capture: &CaptureSettings) -> Result<Self> {
        let name = format!("dynamic-pipeline-{}", device.path);
        let pipeline = gst::Pipeline::builder().name(name.as_str()).build();

        let source = gst::ElementFactory::make("v4l2src")
            .name("source")
            .property("device", device.path.as_str())
            .build()
            .context("create v4l2src")?;
        let convert = make("videoconvert", "videoconvert")?;
        let capture_caps = gst::Caps::builder("video/x-raw")
            .field("format", capture.format.as_str())
            .field("width", capture.width as i32)
            .field("height", capture.height as i32)
            .field("framerate", gst::Fraction::new(capture.framerate, 1))
            .build();
        let caps = gst::ElementFactory::make("capsfilter")
            .name("caps")
            .property("caps", &capture_caps)
            .build()
            .context("create capture capsfilter")?;
        let convert2 = make("videoconvert", "videoconvert2")?;
        let rgb_caps = gst::ElementFactory::make("capsfilter")
            .name("rgb_caps")
            .property(
                "caps",
                gst::Caps::builder("video/x-raw").field("format", "RGB").build(),
            )
            .build()
            .context("create RGB capsfilter")?;
        let tee = gst::ElementFactory::make("tee")
            .name(JUNCTION)
            .property("allow-not-linked", true)
            .build()
            .context("create tee")?;

        let chain = [&source, &convert, &caps, &convert2, &rgb_caps, &tee];
        pipeline
            .add_many(chain)
            .context("add upstream chain to pipeline")?;
        gst::Element::link_many(chain).context("link upstream chain")?;

        Ok(Self {
            name,
            pipeline,
            tee,
            ports: HashMap::new(),
        })
    }

    fn element(&self, stage: &str) -> Result<gst::Element> {
        self.pipeline
            .by_name(stage)
            .ok_or_else(|| anyhow!("stage '{}' not found in {}", stage, self.name))
    }

    fn sink_pad(&self, stage: &str) -> Result<gst::Pad> {
        self.element(stage)?
            .static_pad("sink")
            .ok_or_else(|| anyhow!("stage '{}' has no sink pad", stage))
    }
}

fn make(factory: &str, name: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(factory)
        .name(name)
        .build()
        .with_context(|| format!("create {} '{}'", factory, name))
}

fn to_gst_state(state: RunState) -> gst::State {
    match state {
        RunState::Null => gst::State::Null,
        RunState::Ready => gst::State::Ready,
        RunState::Paused => gst::State::Paused,
        RunState::Playing => gst::State::Playing,
    }
}

impl MediaGraph for GstreamerGraph {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_stage(&mut self, spec: &StageSpec) -> Result<()> {
        let element = match &spec.kind {
            StageKind::Buffer {
                max_buffers,
                max_time_ns,
            } => gst::ElementFactory::make("queue")
                .name(spec.name.as_str())
                .property_from_str("leaky", "downstream")
                .property("max-size-buffers", *max_buffers)
                .property("max-size-time", *max_time_ns)
                .build(),
            StageKind::Convert => gst::ElementFactory::make("videoconvert")
                .name(spec.name.as_str())
                .build(),
            StageKind::Scale => gst::ElementFactory::make("videoscale")
                .name(spec.name.as_str())
                .build(),
            StageKind::Tap { max_buffers, drop } => gst::ElementFactory::make("appsink")
                .name(spec.name.as_str())
                .property("emit-signals", true)
                .property("sync", false)
                .property("max-buffers", *max_buffers)
                .property("drop", *drop)
                .build(),
        }
        .with_context(|| format!("create stage '{}'", spec.name))?;
        self.pipeline
            .add(&element)
            .with_context(|| format!("add stage '{}' to {}", spec.name, self.name))
    }

    fn link(&mut self, upstream: &str, downstream: &str) -> Result<()> {
        let up = self.element(upstream)?;
        let down = self.element(downstream)?;
        up.link(&down)
            .with_context(|| format!("link {} to {}", upstream, downstream))
    }

    fn unlink(&mut self, upstream: &str, downstream: &str) -> Result<()> {
        let up = self.element(upstream)?;
        let down = self.element(downstream)?;
        up.unlink(&down);
        Ok(())
    }

    fn request_junction_port(&mut self) -> Result<JunctionPort> {
        let pad = self
            .tee
            .request_pad_simple("src_%u")
            .ok_or_else(|| anyhow!("tee refused a new src pad"))?;
        let name = pad.name().to_string();
        self.ports.insert(name.clone(), pad);
        Ok(JunctionPort(name))
    }

    fn link_junction_port(&mut self, port: &JunctionPort, stage: &str) -> Result<()> {
        let pad = self
            .ports
            .get(&port.0)
            .ok_or_else(|| anyhow!("tee pad {} was never requested", port.0))?;
        let sink = self.sink_pad(stage)?;
        pad.link(&sink)
            .map(|_| ())
            .map_err(|err| anyhow!("link tee pad {} to {}: {:?}", port.0, stage, err))
    }

    fn junction_port_for(&self, stage: &str) -> Option<JunctionPort> {
        let peer = self.sink_pad(stage).ok()?.peer()?;
        let name = peer.name().to_string();
        self.ports.contains_key(&name).then_some(JunctionPort(name))
    }

    fn release_junction_port(&mut self, port: &JunctionPort) -> Result<()> {
        let pad = self
            .ports
            .remove(&port.0)
            .ok_or_else(|| anyhow!("tee pad {} is not held", port.0))?;
        if let Some(peer) = pad.peer() {
            pad.unlink(&peer)
                .with_context(|| format!("unlink tee pad {}", port.0))?;
        }
        self.tee.release_request_pad(&pad);
        Ok(())
    }

    fn set_stage_state(&mut self, stage: &str, state: RunState) -> Result<()> {
        self.element(stage)?
            .set_state(to_gst_state(state))
            .map(|_| ())
            .map_err(|err| anyhow!("set {} to {:?}: {:?}", stage, state, err))
    }

    fn sync_stage_state(&mut self, stage: &str) -> Result<()> {
        self.element(stage)?
            .sync_state_with_parent()
            .with_context(|| format!("sync state of {}", stage))
    }

    fn remove_stage(&mut self, stage: &str) -> Result<()> {
        let element = self.element(stage)?;
        self.pipeline
            .remove(&element)
            .with_context(|| format!("remove {} from {}", stage, self.name))
    }

    fn has_stage(&self, stage: &str) -> bool {
        self.pipeline.by_name(stage).is_some()
    }

    fn set_state(&mut self, state: RunState) -> Result<()> {
        self.pipeline
            .set_state(to_gst_state(state))
            .map(|_| ())
            .map_err(|err| anyhow!("set {} to {:?}: {:?}", self.name, state, err))
    }

    fn state(&self) -> RunState {
        match self.pipeline.current_state() {
            gst::State::Playing => RunState::Playing,
            gst::State::Paused => RunState::Paused,
            gst::State::Ready => RunState::Ready,
            _ => RunState::Null,
        }
    }

    fn pull_sample(&mut self, tap: &str) -> Result<Option<Sample>> {
        let appsink = self
            .element(tap)?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| anyhow!("stage '{}' is not an appsink", tap))?;
        match appsink.try_pull_sample(gst::ClockTime::ZERO) {
            Some(sample) => sample_to_frame(&sample).map(Some),
            None => Ok(None),
        }
    }
}

fn sample_to_frame(sample: &gst::Sample) -> Result<Sample> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let format = PixelFormat::from_format_name(info.format().to_str())
        .ok_or_else(|| anyhow!("unsupported tap format {}", info.format().to_str()))?;
    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * format.channels();
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map sample buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data.get(..len).context("sample buffer is truncated")?;
        return Sample::new(pixels.to_vec(), width, height, format);
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(data.get(start..end).context("buffer row is out of bounds")?);
    }
    Sample::new(pixels, width, height, format)
}
