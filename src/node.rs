//! Node orchestration.
//!
//! `Node` wires the scheduler, the deployment manager, the result sink and the
//! discovery loop together. Discovery runs on its own thread: it lists devices,
//! keeps the camera list current and creates a running graph for every newly
//! observed device. Graphs are built and set playing inside scheduler
//! callbacks, so the registry only ever changes on the scheduler thread.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::config::{AutostartDeployment, MediaBackend, NodeConfig};
use crate::deployment::StaticModelCatalog;
use crate::graph::{GraphRegistry, ProcessingGraph};
use crate::inference::{HttpInferenceClient, InferenceClient, StaticInferenceClient};
use crate::manager::DeploymentManager;
use crate::media::{DeviceInfo, MediaPlatform, SyntheticPlatform};
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::sink::{
    InMemoryResultStore, ResultPublisher, ResultSink, ResultStore, SinkWorker, SqliteResultStore,
};
use crate::{DeploymentId, SourceId};

/// Wait applied to graph creation and shutdown callbacks.
const GRAPH_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// What the control API needs from a running node.
#[derive(Clone)]
pub struct NodeControl {
    pub node_id: String,
    pub manager: Arc<DeploymentManager>,
    pub cameras: Arc<Mutex<Vec<DeviceInfo>>>,
}

impl NodeControl {
    pub fn cameras(&self) -> Vec<DeviceInfo> {
        self.cameras
            .lock()
            .map(|cameras| cameras.clone())
            .unwrap_or_default()
    }
}

struct Discovery {
    platform: Arc<dyn MediaPlatform>,
    scheduler: SchedulerHandle,
    manager: Arc<DeploymentManager>,
    cameras: Arc<Mutex<Vec<DeviceInfo>>>,
    known: HashSet<String>,
    autostart: Vec<AutostartDeployment>,
}

impl Discovery {
    /// One discovery pass. Returns how many graphs were created.
    fn discover_once(&mut self) -> Result<usize> {
        let devices = self.platform.discover()?;
        {
            let mut cameras = self
                .cameras
                .lock()
                .map_err(|_| anyhow!("camera list lock poisoned"))?;
            if *cameras != devices {
                log::info!(
                    "camera list changed: {}",
                    devices
                        .iter()
                        .map(|d| d.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                *cameras = devices.clone();
            }
        }

        let mut created = 0;
        for device in devices {
            if self.known.contains(&device.path) {
                continue;
            }
            match self.create_graph(device.clone()) {
                Ok(()) => {
                    self.known.insert(device.path.clone());
                    created += 1;
                    self.autostart_for(&device);
                }
                Err(err) => log::warn!("skipping source {}: {:#}", device.name, err),
            }
        }
        Ok(created)
    }

    fn create_graph(&self, device: DeviceInfo) -> Result<()> {
        let platform = self.platform.clone();
        self.scheduler
            .call(Some(GRAPH_CALL_TIMEOUT), move |ctx| -> Result<()> {
                let source = SourceId::new(device.name.clone());
                if ctx.graphs().contains(&source) {
                    return Ok(());
                }
                let media = platform.create_graph(&device)?;
                let mut graph = ProcessingGraph::new(device, media);
                graph.play()?;
                ctx.graphs_mut().insert(graph)
            })
            .map_err(|err| anyhow!(err))?
    }

    fn autostart_for(&self, device: &DeviceInfo) {
        let source = SourceId::new(device.name.clone());
        for entry in self
            .autostart
            .iter()
            .filter(|entry| entry.device_name == device.name)
        {
            let id = DeploymentId(entry.deployment_id);
            let outcome = self.manager.start_inference(id, &source, &entry.model_id);
            log::info!("autostart deployment {} on {}: {}", id, source, outcome);
        }
    }
}

struct DiscoveryLoop {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl DiscoveryLoop {
    fn spawn(mut discovery: Discovery, interval: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let loop_stop = stop.clone();
        let join = thread::Builder::new()
            .name("discovery".to_string())
            .spawn(move || {
                let mut last = Instant::now();
                while !loop_stop.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(100));
                    if last.elapsed() < interval {
                        continue;
                    }
                    last = Instant::now();
                    if let Err(err) = discovery.discover_once() {
                        log::warn!("discovery failed: {:#}", err);
                    }
                }
            })?;
        Ok(Self {
            stop,
            join: Some(join),
        })
    }

    fn stop(mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("discovery thread panicked"))?;
        }
        Ok(())
    }
}

pub struct Node {
    control: NodeControl,
    sink: Arc<ResultSink>,
    scheduler: Scheduler,
    discovery: DiscoveryLoop,
    worker: SinkWorker,
}

impl Node {
    /// Build platform, client and store from `config`, then start.
    pub fn from_config(config: &NodeConfig) -> Result<Self> {
        let platform: Arc<dyn MediaPlatform> = match config.discovery.backend {
            MediaBackend::Synthetic => {
                let names: Vec<&str> = config
                    .discovery
                    .sources
                    .iter()
                    .map(String::as_str)
                    .collect();
                Arc::new(SyntheticPlatform::with_cameras(&names))
            }
            #[cfg(feature = "media-gstreamer")]
            MediaBackend::Gstreamer => Arc::new(crate::media::GstreamerPlatform::new(
                config.capture.clone(),
            )?),
            #[cfg(not(feature = "media-gstreamer"))]
            MediaBackend::Gstreamer => {
                return Err(anyhow!(
                    "gstreamer backend requires the media-gstreamer feature"
                ))
            }
        };

        let client: Arc<dyn InferenceClient> = match &config.inference.url {
            Some(url) => Arc::new(HttpInferenceClient::new(url, config.inference.timeout)?),
            None => {
                log::warn!("no inference url configured; results come from a fixed-output client");
                Arc::new(StaticInferenceClient::new(vec![1.0]))
            }
        };

        let store: Box<dyn ResultStore> = match &config.sink.db_path {
            Some(path) => Box::new(SqliteResultStore::open(path)?),
            None => Box::new(InMemoryResultStore::new()),
        };

        Self::start(config, platform, client, store)
    }

    pub fn start(
        config: &NodeConfig,
        platform: Arc<dyn MediaPlatform>,
        client: Arc<dyn InferenceClient>,
        store: Box<dyn ResultStore>,
    ) -> Result<Self> {
        let publisher = match &config.sink.push_url {
            Some(url) => ResultPublisher::http(url, config.inference.timeout)?,
            None => ResultPublisher::Log,
        };
        let sink = Arc::new(ResultSink::new(
            store,
            publisher,
            config.sink.settings.clone(),
        ));

        let scheduler = Scheduler::spawn(config.scheduler.tick, GraphRegistry::new())?;
        let catalog = Arc::new(StaticModelCatalog::new(config.models.clone()));
        let manager = Arc::new(DeploymentManager::new(
            scheduler.handle(),
            catalog,
            client,
            sink.clone(),
            config.manager_settings(),
        ));
        let worker = SinkWorker::spawn(sink.clone())?;
        let cameras = Arc::new(Mutex::new(Vec::new()));

        log::info!(
            "node {} starting on {} platform",
            config.node_id,
            platform.name()
        );
        let mut discovery = Discovery {
            platform,
            scheduler: scheduler.handle(),
            manager: manager.clone(),
            cameras: cameras.clone(),
            known: HashSet::new(),
            autostart: config.deployments.clone(),
        };
        match discovery.discover_once() {
            Ok(created) => log::info!("{} graph(s) running", created),
            Err(err) => log::warn!("initial discovery failed: {:#}", err),
        }
        let discovery = DiscoveryLoop::spawn(discovery, config.discovery.interval)?;

        Ok(Self {
            control: NodeControl {
                node_id: config.node_id.clone(),
                manager,
                cameras,
            },
            sink,
            scheduler,
            discovery,
            worker,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.control.node_id
    }

    pub fn control(&self) -> NodeControl {
        self.control.clone()
    }

    pub fn manager(&self) -> &Arc<DeploymentManager> {
        &self.control.manager
    }

    pub fn sink(&self) -> &Arc<ResultSink> {
        &self.sink
    }

    pub fn cameras(&self) -> Vec<DeviceInfo> {
        self.control.cameras()
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.scheduler.handle()
    }

    /// Sources that currently own a graph.
    pub fn sources(&self) -> Result<Vec<SourceId>> {
        self.scheduler
            .handle()
            .call(Some(GRAPH_CALL_TIMEOUT), |ctx| ctx.graphs().sources())
            .map_err(|err| anyhow!(err))
    }

    /// Stop discovery, detach every deployment, halt graphs, flush the sink.
    pub fn shutdown(self) -> Result<()> {
        self.discovery.stop()?;

        for (id, outcome) in self.control.manager.stop_all() {
            log::info!("shutdown: deployment {}: {}", id, outcome);
        }

        let halted = self
            .scheduler
            .handle()
            .call(Some(GRAPH_CALL_TIMEOUT), |ctx| {
                let mut halted = 0;
                for graph in ctx.graphs_mut().iter_mut() {
                    match graph.halt() {
                        Ok(()) => halted += 1,
                        Err(err) => log::warn!("could not halt {}: {:#}", graph.source(), err),
                    }
                }
                halted
            });
        match halted {
            Ok(count) => log::info!("{} graph(s) halted", count),
            Err(err) => log::warn!("graph halt did not complete: {}", err),
        }

        self.scheduler.shutdown()?;
        self.worker.stop()?;
        log::info!("node {} stopped", self.control.node_id);
        Ok(())
    }
}
