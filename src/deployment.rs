//! Deployments, their lifecycle and the model catalog.
//!
//! Lifecycle:
//!
//! ```text
//! Requested -> Attaching -> Active -> Detaching -> Removed
//!                  |                      |
//!                  +------> Failed <------+
//! ```
//!
//! A Failed deployment whose branch remnants are still on the graph can be
//! stopped again (Failed -> Detaching).

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::frame::PreprocessTarget;
use crate::{DeploymentId, SourceId};

/// What a model needs to be fed and how to read its answer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    /// Frames per inference; also the window capacity.
    pub frame_count: usize,
    pub input_width: u32,
    pub input_height: u32,
    pub input_name: String,
    pub output_name: String,
    pub classes: Vec<String>,
}

impl ModelSpec {
    pub fn preprocess_target(&self) -> PreprocessTarget {
        PreprocessTarget {
            width: self.input_width,
            height: self.input_height,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("model name must not be empty"));
        }
        if self.frame_count == 0 {
            return Err(anyhow!("model {}: frame_count must be > 0", self.name));
        }
        if self.input_width == 0 || self.input_height == 0 {
            return Err(anyhow!("model {}: input size must be non-zero", self.name));
        }
        if self.classes.is_empty() {
            return Err(anyhow!("model {}: class list must not be empty", self.name));
        }
        Ok(())
    }
}

/// Resolves a model id to its spec.
pub trait ModelCatalog: Send + Sync {
    fn resolve(&self, model_id: &str) -> Option<ModelSpec>;
}

#[derive(Clone, Debug, Default)]
pub struct StaticModelCatalog {
    models: HashMap<String, ModelSpec>,
}

impl StaticModelCatalog {
    pub fn new(models: impl IntoIterator<Item = ModelSpec>) -> Self {
        Self {
            models: models
                .into_iter()
                .map(|model| (model.name.clone(), model))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl ModelCatalog for StaticModelCatalog {
    fn resolve(&self, model_id: &str) -> Option<ModelSpec> {
        self.models.get(model_id).cloned()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Requested,
    Attaching,
    Active,
    Detaching,
    Removed,
    Failed,
}

impl DeploymentState {
    pub fn can_transition(self, to: DeploymentState) -> bool {
        use DeploymentState::*;
        matches!(
            (self, to),
            (Requested, Attaching)
                | (Requested, Failed)
                | (Attaching, Active)
                | (Attaching, Failed)
                | (Active, Detaching)
                | (Failed, Detaching)
                | (Detaching, Removed)
                | (Detaching, Failed)
        )
    }

    /// States in which the deployment owns (or is building) a branch.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            DeploymentState::Requested
                | DeploymentState::Attaching
                | DeploymentState::Active
                | DeploymentState::Detaching
        )
    }

    pub fn in_transition(self) -> bool {
        matches!(
            self,
            DeploymentState::Requested | DeploymentState::Attaching | DeploymentState::Detaching
        )
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeploymentState::Requested => "requested",
            DeploymentState::Attaching => "attaching",
            DeploymentState::Active => "active",
            DeploymentState::Detaching => "detaching",
            DeploymentState::Removed => "removed",
            DeploymentState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub source: SourceId,
    pub model: ModelSpec,
    state: DeploymentState,
    /// Reason for the last transition to Failed.
    pub failure: Option<String>,
}

impl Deployment {
    pub fn new(id: DeploymentId, source: SourceId, model: ModelSpec) -> Self {
        Self {
            id,
            source,
            model,
            state: DeploymentState::Requested,
            failure: None,
        }
    }

    pub fn state(&self) -> DeploymentState {
        self.state
    }

    pub fn transition(&mut self, to: DeploymentState) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(anyhow!(
                "deployment {}: invalid transition {} -> {}",
                self.id,
                self.state,
                to
            ));
        }
        log::info!("deployment {} on {}: {} -> {}", self.id, self.source, self.state, to);
        self.state = to;
        if to != DeploymentState::Failed {
            self.failure = None;
        }
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(DeploymentState::Failed)?;
        self.failure = Some(reason.into());
        Ok(())
    }
}

/// Result of a start or stop request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlOutcome {
    Started,
    Stopped,
    AlreadyActive,
    AlreadyInactive,
    TimedOut,
    UnknownSource,
    UnknownModel,
    InTransition(DeploymentState),
    Failed(String),
}

impl ControlOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ControlOutcome::Started | ControlOutcome::Stopped)
    }

    pub fn status(&self) -> &'static str {
        match self {
            ControlOutcome::Started => "started",
            ControlOutcome::Stopped => "stopped",
            ControlOutcome::AlreadyActive => "already_active",
            ControlOutcome::AlreadyInactive => "already_inactive",
            ControlOutcome::TimedOut => "timed_out",
            ControlOutcome::UnknownSource => "unknown_source",
            ControlOutcome::UnknownModel => "unknown_model",
            ControlOutcome::InTransition(_) => "in_transition",
            ControlOutcome::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for ControlOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlOutcome::InTransition(state) => write!(f, "in_transition ({})", state),
            ControlOutcome::Failed(reason) => write!(f, "failed: {}", reason),
            other => f.write_str(other.status()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(name: &str) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            frame_count: 20,
            input_width: 32,
            input_height: 32,
            input_name: "input_1".to_string(),
            output_name: "dense".to_string(),
            classes: vec!["walk".into(), "run".into()],
        }
    }

    #[test]
    fn lifecycle_follows_allowed_path() -> Result<()> {
        let mut deployment = Deployment::new(DeploymentId(7), SourceId::new("cam1"), model("m1"));
        for state in [
            DeploymentState::Attaching,
            DeploymentState::Active,
            DeploymentState::Detaching,
            DeploymentState::Removed,
        ] {
            deployment.transition(state)?;
        }
        assert_eq!(deployment.state(), DeploymentState::Removed);
        Ok(())
    }

    #[test]
    fn active_cannot_jump_back_to_attaching() -> Result<()> {
        let mut deployment = Deployment::new(DeploymentId(7), SourceId::new("cam1"), model("m1"));
        deployment.transition(DeploymentState::Attaching)?;
        deployment.transition(DeploymentState::Active)?;
        assert!(deployment.transition(DeploymentState::Attaching).is_err());
        assert!(deployment.transition(DeploymentState::Failed).is_err());
        Ok(())
    }

    #[test]
    fn failure_keeps_reason_until_next_transition() -> Result<()> {
        let mut deployment = Deployment::new(DeploymentId(7), SourceId::new("cam1"), model("m1"));
        deployment.transition(DeploymentState::Attaching)?;
        deployment.fail("attach timed out")?;
        assert_eq!(deployment.failure.as_deref(), Some("attach timed out"));
        deployment.transition(DeploymentState::Detaching)?;
        assert!(deployment.failure.is_none());
        Ok(())
    }

    #[test]
    fn catalog_resolves_by_name() {
        let catalog = StaticModelCatalog::new([model("m1"), model("m2")]);
        assert_eq!(catalog.resolve("m2").map(|m| m.name), Some("m2".to_string()));
        assert!(catalog.resolve("m3").is_none());
    }

    #[test]
    fn model_validation_rejects_zero_frames() {
        let mut spec = model("m1");
        spec.frame_count = 0;
        assert!(spec.validate().is_err());
    }
}
