//! Batch dispatch.
//!
//! A full window becomes one `[1, frames, H, W, 3]` request. The window is
//! drained before the request is issued, so it is empty afterwards whether or
//! not the call succeeded.

use std::sync::Arc;

use serde::Serialize;

use super::client::{InferenceClient, InferenceError, InferenceRequest};
use crate::deployment::ModelSpec;
use crate::window::FrameWindow;
use crate::DeploymentId;

/// One classified batch.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InferenceResult {
    pub timestamp_ms: u64,
    pub deployment: DeploymentId,
    pub class: String,
    pub confidence: f64,
}

/// Index and value of the largest output.
pub fn argmax(output: &[f32]) -> Option<(usize, f32)> {
    output
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, value)| !value.is_nan())
        .fold(None, |best, (index, value)| match best {
            Some((_, top)) if top >= value => best,
            _ => Some((index, value)),
        })
}

/// Probabilities below 1 are reported as percentages; everything is rounded
/// to four decimals.
pub fn format_confidence(max: f64) -> f64 {
    let value = if max < 1.0 { max * 100.0 } else { max };
    (value * 10_000.0).round() / 10_000.0
}

pub struct Dispatcher {
    client: Arc<dyn InferenceClient>,
    deployment: DeploymentId,
    model: ModelSpec,
}

impl Dispatcher {
    pub fn new(client: Arc<dyn InferenceClient>, deployment: DeploymentId, model: ModelSpec) -> Self {
        Self {
            client,
            deployment,
            model,
        }
    }

    pub fn model(&self) -> &ModelSpec {
        &self.model
    }

    /// Drain `window` and classify its frames.
    pub fn dispatch(&self, window: &mut FrameWindow) -> Result<InferenceResult, InferenceError> {
        let frames = window.drain();
        let Some(first) = frames.first() else {
            return Err(InferenceError::InvalidInput("window is empty".to_string()));
        };
        let (width, height) = (first.width, first.height);
        if frames.iter().any(|f| f.width != width || f.height != height) {
            return Err(InferenceError::InvalidInput(
                "frames in one window differ in size".to_string(),
            ));
        }

        let mut data = Vec::with_capacity(frames.len() * frames[0].pixels().len());
        for frame in &frames {
            data.extend_from_slice(frame.pixels());
        }
        let request = InferenceRequest {
            model: self.model.name.clone(),
            input_name: self.model.input_name.clone(),
            shape: [1, frames.len(), height as usize, width as usize, 3],
            data,
            output_name: self.model.output_name.clone(),
        };
        log::debug!(
            "dispatching {} frame(s) for deployment {} to {}",
            frames.len(),
            self.deployment,
            self.client.name()
        );

        let output = self.client.infer(&request)?;
        let (index, max) = argmax(&output)
            .ok_or_else(|| InferenceError::InvalidOutput("empty output vector".to_string()))?;
        let class = self.model.classes.get(index).cloned().ok_or_else(|| {
            InferenceError::InvalidOutput(format!(
                "output index {} outside {} class label(s)",
                index,
                self.model.classes.len()
            ))
        })?;
        let timestamp_ms =
            crate::now_ms().map_err(|err| InferenceError::InvalidOutput(format!("{:#}", err)))?;

        Ok(InferenceResult {
            timestamp_ms,
            deployment: self.deployment,
            class,
            confidence: format_confidence(f64::from(max)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::inference::StaticInferenceClient;
    use crate::window::OverflowPolicy;

    fn model() -> ModelSpec {
        ModelSpec {
            name: "m1".to_string(),
            frame_count: 3,
            input_width: 2,
            input_height: 2,
            input_name: "input_1".to_string(),
            output_name: "dense".to_string(),
            classes: vec!["walk".into(), "run".into(), "idle".into()],
        }
    }

    fn full_window() -> FrameWindow {
        let mut window = FrameWindow::new(3, OverflowPolicy::DropOldest);
        for seq in 0..3 {
            window.push(Frame::from_pixels(seq, 2, 2, vec![0.5; 12]).unwrap());
        }
        window
    }

    #[test]
    fn probability_outputs_become_percentages() {
        let (index, max) = argmax(&[0.12, 0.81, 0.07]).unwrap();
        assert_eq!(index, 1);
        assert_eq!(format_confidence(f64::from(max)), 81.0);
    }

    #[test]
    fn outputs_at_or_above_one_are_kept() {
        let (index, max) = argmax(&[0.3, 12.0, 0.1]).unwrap();
        assert_eq!(index, 1);
        assert_eq!(format_confidence(f64::from(max)), 12.0);
        assert_eq!(format_confidence(1.0), 1.0);
        assert_eq!(format_confidence(0.123456), 12.3456);
    }

    #[test]
    fn argmax_of_empty_output_is_none() {
        assert!(argmax(&[]).is_none());
    }

    #[test]
    fn dispatch_labels_batch_with_model_class() {
        let client = Arc::new(StaticInferenceClient::new(vec![0.12, 0.81, 0.07]));
        let dispatcher = Dispatcher::new(client.clone(), DeploymentId(7), model());
        let mut window = full_window();
        let result = dispatcher.dispatch(&mut window).unwrap();
        assert_eq!(result.class, "run");
        assert_eq!(result.confidence, 81.0);
        assert_eq!(result.deployment, DeploymentId(7));
        assert_eq!(client.last_shape(), Some([1, 3, 2, 2, 3]));
        assert!(window.is_empty());
    }

    #[test]
    fn failed_dispatch_still_clears_window() {
        let client = Arc::new(StaticInferenceClient::failing(InferenceError::Server {
            status: 500,
            message: "model not ready".to_string(),
        }));
        let dispatcher = Dispatcher::new(client, DeploymentId(7), model());
        let mut window = full_window();
        let err = dispatcher.dispatch(&mut window).unwrap_err();
        assert!(err.is_server());
        assert!(window.is_empty());
    }

    #[test]
    fn output_beyond_label_list_is_rejected() {
        let client = Arc::new(StaticInferenceClient::new(vec![0.0, 0.0, 0.0, 0.9]));
        let dispatcher = Dispatcher::new(client, DeploymentId(7), model());
        let err = dispatcher.dispatch(&mut full_window()).unwrap_err();
        assert!(matches!(err, InferenceError::InvalidOutput(_)));
    }
}
