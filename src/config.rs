use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::collector::LaneSettings;
use crate::deployment::ModelSpec;
use crate::manager::ManagerSettings;
use crate::media::CaptureSettings;
use crate::mutator::{BranchSettings, LinkPolicy};
use crate::sink::SinkSettings;
use crate::window::OverflowPolicy;

const DEFAULT_NODE_ID: &str = "node-1";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_DB_PATH: &str = "vision_node.db";
const DEFAULT_TICK_MS: u64 = 1_000;
const DEFAULT_ATTACH_ATTEMPTS: u32 = 60;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_DETACH_TIMEOUT_SECS: u64 = 60;
const DEFAULT_INFERENCE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_DISCOVERY_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Deserialize, Default)]
struct NodeConfigFile {
    node_id: Option<String>,
    api: Option<ApiConfigFile>,
    scheduler: Option<SchedulerConfigFile>,
    collector: Option<CollectorConfigFile>,
    branch: Option<BranchConfigFile>,
    inference: Option<InferenceConfigFile>,
    sink: Option<SinkConfigFile>,
    discovery: Option<DiscoveryConfigFile>,
    capture: Option<CaptureConfigFile>,
    #[serde(default)]
    models: Vec<ModelSpec>,
    #[serde(default)]
    deployments: Vec<AutostartDeployment>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SchedulerConfigFile {
    tick_ms: Option<u64>,
    attach_attempts: Option<u32>,
    poll_interval_ms: Option<u64>,
    /// 0 waits for detach without bound.
    detach_timeout_secs: Option<u64>,
    link_policy: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CollectorConfigFile {
    preprocess_workers: Option<usize>,
    overflow: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct BranchConfigFile {
    queue_max_buffers: Option<u32>,
    queue_max_time_ns: Option<u64>,
    tap_max_buffers: Option<u32>,
    tap_drop: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct InferenceConfigFile {
    url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SinkConfigFile {
    db_path: Option<String>,
    flush_interval_secs: Option<u64>,
    push_interval_secs: Option<u64>,
    push_window_secs: Option<u64>,
    stale_after_secs: Option<u64>,
    monitor_interval_secs: Option<u64>,
    push_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DiscoveryConfigFile {
    interval_secs: Option<u64>,
    backend: Option<String>,
    sources: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    format: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    framerate: Option<i32>,
}

/// A deployment started as soon as its camera's graph is running.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AutostartDeployment {
    pub deployment_id: u64,
    pub model_id: String,
    pub device_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaBackend {
    /// `stub://` devices named in `discovery.sources`.
    Synthetic,
    /// V4L2 cameras through GStreamer.
    Gstreamer,
}

impl std::str::FromStr for MediaBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "synthetic" | "stub" => Ok(MediaBackend::Synthetic),
            "gstreamer" => Ok(MediaBackend::Gstreamer),
            other => Err(anyhow!("unknown media backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick: Duration,
    pub attach_attempts: u32,
    pub poll_interval: Duration,
    pub detach_timeout: Option<Duration>,
    pub link_policy: LinkPolicy,
}

#[derive(Debug, Clone)]
pub struct InferenceSettings {
    /// Base URL of the inference service; `None` uses a fixed-output client.
    pub url: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// SQLite path; `None` keeps results in memory.
    pub db_path: Option<String>,
    pub push_url: Option<String>,
    pub settings: SinkSettings,
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub interval: Duration,
    pub backend: MediaBackend,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub api_addr: String,
    pub scheduler: SchedulerSettings,
    pub collector: LaneSettings,
    pub branch: BranchSettings,
    pub inference: InferenceSettings,
    pub sink: SinkConfig,
    pub discovery: DiscoverySettings,
    pub capture: CaptureSettings,
    pub models: Vec<ModelSpec>,
    pub deployments: Vec<AutostartDeployment>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: DEFAULT_NODE_ID.to_string(),
            api_addr: DEFAULT_API_ADDR.to_string(),
            scheduler: SchedulerSettings {
                tick: Duration::from_millis(DEFAULT_TICK_MS),
                attach_attempts: DEFAULT_ATTACH_ATTEMPTS,
                poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
                detach_timeout: Some(Duration::from_secs(DEFAULT_DETACH_TIMEOUT_SECS)),
                link_policy: LinkPolicy::default(),
            },
            collector: LaneSettings::default(),
            branch: BranchSettings::default(),
            inference: InferenceSettings {
                url: None,
                timeout: Duration::from_secs(DEFAULT_INFERENCE_TIMEOUT_SECS),
            },
            sink: SinkConfig {
                db_path: Some(DEFAULT_DB_PATH.to_string()),
                push_url: None,
                settings: SinkSettings::default(),
            },
            discovery: DiscoverySettings {
                interval: Duration::from_secs(DEFAULT_DISCOVERY_INTERVAL_SECS),
                backend: MediaBackend::Synthetic,
                sources: Vec::new(),
            },
            capture: CaptureSettings::default(),
            models: Vec::new(),
            deployments: Vec::new(),
        }
    }
}

impl NodeConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("VISION_NODE_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load `path` (or defaults), then apply environment overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a config document (TOML) without consulting the environment.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: NodeConfigFile =
            toml::from_str(raw).map_err(|e| anyhow!("invalid config: {}", e))?;
        let mut cfg = Self::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: NodeConfigFile) -> Result<Self> {
        let node_id = file
            .node_id
            .unwrap_or_else(|| DEFAULT_NODE_ID.to_string());
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());

        let sched = file.scheduler.unwrap_or_default();
        let detach_secs = sched
            .detach_timeout_secs
            .unwrap_or(DEFAULT_DETACH_TIMEOUT_SECS);
        let scheduler = SchedulerSettings {
            tick: Duration::from_millis(sched.tick_ms.unwrap_or(DEFAULT_TICK_MS)),
            attach_attempts: sched.attach_attempts.unwrap_or(DEFAULT_ATTACH_ATTEMPTS),
            poll_interval: Duration::from_millis(
                sched.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            detach_timeout: (detach_secs > 0).then(|| Duration::from_secs(detach_secs)),
            link_policy: match sched.link_policy {
                Some(policy) => policy.parse()?,
                None => LinkPolicy::default(),
            },
        };

        let coll = file.collector.unwrap_or_default();
        let lane_defaults = LaneSettings::default();
        let collector = LaneSettings {
            preprocess_workers: coll
                .preprocess_workers
                .unwrap_or(lane_defaults.preprocess_workers),
            overflow: match coll.overflow {
                Some(policy) => policy.parse()?,
                None => OverflowPolicy::default(),
            },
        };

        let br = file.branch.unwrap_or_default();
        let branch_defaults = BranchSettings::default();
        let branch = BranchSettings {
            queue_max_buffers: br
                .queue_max_buffers
                .unwrap_or(branch_defaults.queue_max_buffers),
            queue_max_time_ns: br
                .queue_max_time_ns
                .unwrap_or(branch_defaults.queue_max_time_ns),
            tap_max_buffers: br.tap_max_buffers.unwrap_or(branch_defaults.tap_max_buffers),
            tap_drop: br.tap_drop.unwrap_or(branch_defaults.tap_drop),
        };

        let inf = file.inference.unwrap_or_default();
        let inference = InferenceSettings {
            url: inf.url.filter(|url| !url.trim().is_empty()),
            timeout: Duration::from_secs(
                inf.timeout_secs.unwrap_or(DEFAULT_INFERENCE_TIMEOUT_SECS),
            ),
        };

        let snk = file.sink.unwrap_or_default();
        let sink_defaults = SinkSettings::default();
        let secs_or = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_secs).unwrap_or(default)
        };
        let sink = SinkConfig {
            db_path: match snk.db_path {
                Some(path) if path.trim().is_empty() => None,
                Some(path) => Some(path),
                None => Some(DEFAULT_DB_PATH.to_string()),
            },
            push_url: snk.push_url.filter(|url| !url.trim().is_empty()),
            settings: SinkSettings {
                flush_interval: secs_or(snk.flush_interval_secs, sink_defaults.flush_interval),
                push_interval: secs_or(snk.push_interval_secs, sink_defaults.push_interval),
                push_window: secs_or(snk.push_window_secs, sink_defaults.push_window),
                stale_after: secs_or(snk.stale_after_secs, sink_defaults.stale_after),
                monitor_interval: secs_or(
                    snk.monitor_interval_secs,
                    sink_defaults.monitor_interval,
                ),
            },
        };

        let disc = file.discovery.unwrap_or_default();
        let discovery = DiscoverySettings {
            interval: Duration::from_secs(
                disc.interval_secs
                    .unwrap_or(DEFAULT_DISCOVERY_INTERVAL_SECS),
            ),
            backend: match disc.backend {
                Some(backend) => backend.parse()?,
                None => MediaBackend::Synthetic,
            },
            sources: disc.sources.unwrap_or_default(),
        };

        let cap = file.capture.unwrap_or_default();
        let capture_defaults = CaptureSettings::default();
        let capture = CaptureSettings {
            format: cap.format.unwrap_or(capture_defaults.format),
            width: cap.width.unwrap_or(capture_defaults.width),
            height: cap.height.unwrap_or(capture_defaults.height),
            framerate: cap.framerate.unwrap_or(capture_defaults.framerate),
        };

        Ok(Self {
            node_id,
            api_addr,
            scheduler,
            collector,
            branch,
            inference,
            sink,
            discovery,
            capture,
            models: file.models,
            deployments: file.deployments,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(id) = std::env::var("VISION_NODE_ID") {
            if !id.trim().is_empty() {
                self.node_id = id;
            }
        }
        if let Ok(addr) = std::env::var("VISION_NODE_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(url) = std::env::var("VISION_NODE_INFERENCE_URL") {
            if !url.trim().is_empty() {
                self.inference.url = Some(url);
            }
        }
        if let Ok(path) = std::env::var("VISION_NODE_RESULTS_DB") {
            self.sink.db_path = if path.trim().is_empty() {
                None
            } else {
                Some(path)
            };
        }
        if let Ok(url) = std::env::var("VISION_NODE_PUSH_URL") {
            if !url.trim().is_empty() {
                self.sink.push_url = Some(url);
            }
        }
        if let Ok(tick) = std::env::var("VISION_NODE_TICK_MS") {
            let ms: u64 = tick
                .parse()
                .map_err(|_| anyhow!("VISION_NODE_TICK_MS must be an integer number of milliseconds"))?;
            self.scheduler.tick = Duration::from_millis(ms);
        }
        if let Ok(policy) = std::env::var("VISION_NODE_LINK_POLICY") {
            self.scheduler.link_policy = policy.parse()?;
        }
        if let Ok(timeout) = std::env::var("VISION_NODE_DETACH_TIMEOUT_SECS") {
            let secs: u64 = timeout.parse().map_err(|_| {
                anyhow!("VISION_NODE_DETACH_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.scheduler.detach_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Ok(sources) = std::env::var("VISION_NODE_SOURCES") {
            let parsed = split_csv(&sources);
            if !parsed.is_empty() {
                self.discovery.sources = parsed;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.api_addr
            .parse::<SocketAddr>()
            .map_err(|_| anyhow!("api addr '{}' is not a socket address", self.api_addr))?;
        if self.node_id.trim().is_empty() {
            return Err(anyhow!("node_id must not be empty"));
        }
        if self.scheduler.tick.is_zero() {
            return Err(anyhow!("scheduler tick must be greater than zero"));
        }
        if self.scheduler.attach_attempts == 0 || self.scheduler.poll_interval.is_zero() {
            return Err(anyhow!("attach attempts and poll interval must be greater than zero"));
        }
        if self.collector.preprocess_workers == 0 {
            return Err(anyhow!("collector needs at least one preprocess worker"));
        }
        if self.discovery.interval.is_zero() {
            return Err(anyhow!("discovery interval must be greater than zero"));
        }
        for url in self.inference.url.iter().chain(self.sink.push_url.iter()) {
            url::Url::parse(url).map_err(|e| anyhow!("invalid url '{}': {}", url, e))?;
        }

        let mut names = HashSet::new();
        for model in &self.models {
            model.validate()?;
            if !names.insert(model.name.as_str()) {
                return Err(anyhow!("model {} is defined twice", model.name));
            }
        }
        let mut ids = HashSet::new();
        for deployment in &self.deployments {
            if !names.contains(deployment.model_id.as_str()) {
                return Err(anyhow!(
                    "deployment {} references unknown model {}",
                    deployment.deployment_id,
                    deployment.model_id
                ));
            }
            if !ids.insert(deployment.deployment_id) {
                return Err(anyhow!(
                    "deployment {} is listed twice",
                    deployment.deployment_id
                ));
            }
        }
        Ok(())
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            attach_attempts: self.scheduler.attach_attempts,
            poll_interval: self.scheduler.poll_interval,
            detach_timeout: self.scheduler.detach_timeout,
            link_policy: self.scheduler.link_policy,
            branch: self.branch.clone(),
            lane: self.collector.clone(),
        }
    }
}

fn read_config_file(path: &Path) -> Result<NodeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_node_runtime() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.scheduler.tick, Duration::from_secs(1));
        assert_eq!(cfg.manager_settings().attach_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.scheduler.detach_timeout, Some(Duration::from_secs(60)));
        assert_eq!(cfg.sink.settings.flush_interval, Duration::from_secs(3));
        assert_eq!(cfg.sink.settings.push_interval, Duration::from_secs(12));
        assert_eq!(cfg.discovery.interval, Duration::from_secs(10));
        assert_eq!(cfg.branch.queue_max_time_ns, 16_000_000);
    }

    #[test]
    fn deployments_must_reference_known_models() {
        let raw = r#"
            [[deployments]]
            deployment_id = 7
            model_id = "m1"
            device_name = "cam1"
        "#;
        assert!(NodeConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn zero_detach_timeout_means_unbounded() -> Result<()> {
        let cfg = NodeConfig::from_toml_str("[scheduler]\ndetach_timeout_secs = 0\n")?;
        assert_eq!(cfg.scheduler.detach_timeout, None);
        Ok(())
    }

    #[test]
    fn empty_db_path_keeps_results_in_memory() -> Result<()> {
        let cfg = NodeConfig::from_toml_str("[sink]\ndb_path = \"\"\n")?;
        assert_eq!(cfg.sink.db_path, None);
        Ok(())
    }
}
