use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use thiserror::Error;

/// Failures at the inference boundary.
///
/// None of these stop a deployment; the batch is discarded and the next
/// window is dispatched as usual.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    /// The service answered with an error status or error body.
    #[error("inference server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// The request never got an answer (connect, timeout, read).
    #[error("inference transport error: {0}")]
    Transport(String),

    /// The batch could not be built.
    #[error("invalid inference input: {0}")]
    InvalidInput(String),

    /// The answer could not be interpreted.
    #[error("invalid inference output: {0}")]
    InvalidOutput(String),
}

impl InferenceError {
    pub fn is_server(&self) -> bool {
        matches!(self, InferenceError::Server { .. })
    }
}

/// One synchronous request: a single named FP32 input tensor and the name of
/// the output to return.
#[derive(Clone, Debug)]
pub struct InferenceRequest {
    pub model: String,
    pub input_name: String,
    /// `[1, frames, height, width, 3]`
    pub shape: [usize; 5],
    pub data: Vec<f32>,
    pub output_name: String,
}

pub trait InferenceClient: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run the request and return the named output vector.
    fn infer(&self, request: &InferenceRequest) -> Result<Vec<f32>, InferenceError>;
}

/// Answers every request with the same output (or the same error).
pub struct StaticInferenceClient {
    answer: Result<Vec<f32>, InferenceError>,
    calls: AtomicUsize,
    last_shape: Mutex<Option<[usize; 5]>>,
}

impl StaticInferenceClient {
    pub fn new(output: Vec<f32>) -> Self {
        Self {
            answer: Ok(output),
            calls: AtomicUsize::new(0),
            last_shape: Mutex::new(None),
        }
    }

    pub fn failing(error: InferenceError) -> Self {
        Self {
            answer: Err(error),
            calls: AtomicUsize::new(0),
            last_shape: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_shape(&self) -> Option<[usize; 5]> {
        self.last_shape.lock().ok().and_then(|shape| *shape)
    }
}

impl InferenceClient for StaticInferenceClient {
    fn name(&self) -> &'static str {
        "static"
    }

    fn infer(&self, request: &InferenceRequest) -> Result<Vec<f32>, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut shape) = self.last_shape.lock() {
            *shape = Some(request.shape);
        }
        let expected: usize = request.shape.iter().product();
        if request.data.len() != expected {
            return Err(InferenceError::InvalidInput(format!(
                "shape {:?} needs {} values, got {}",
                request.shape,
                expected,
                request.data.len()
            )));
        }
        self.answer.clone()
    }
}
