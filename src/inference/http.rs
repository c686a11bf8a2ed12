//! KServe v2 / Triton HTTP JSON client.
//!
//! `POST {base}/v2/models/{model}/infer` with one FP32 input tensor and one
//! requested output.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use super::client::{InferenceClient, InferenceError, InferenceRequest};

#[derive(Serialize)]
struct InferBody<'a> {
    inputs: [InputTensor<'a>; 1],
    outputs: [RequestedOutput<'a>; 1],
}

#[derive(Serialize)]
struct InputTensor<'a> {
    name: &'a str,
    shape: &'a [usize],
    datatype: &'static str,
    data: &'a [f32],
}

#[derive(Serialize)]
struct RequestedOutput<'a> {
    name: &'a str,
}

#[derive(Deserialize)]
struct InferResponse {
    #[serde(default)]
    outputs: Vec<OutputTensor>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct OutputTensor {
    name: String,
    #[serde(default)]
    data: Vec<f32>,
}

pub struct HttpInferenceClient {
    base: Url,
    agent: ureq::Agent,
}

impl HttpInferenceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base_url).context("parse inference url")?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self { base, agent })
    }

    pub fn infer_url(&self, model: &str) -> Result<Url> {
        self.base
            .join(&format!("v2/models/{}/infer", model))
            .with_context(|| format!("build infer url for model {}", model))
    }
}

impl InferenceClient for HttpInferenceClient {
    fn name(&self) -> &'static str {
        "kserve-http"
    }

    fn infer(&self, request: &InferenceRequest) -> Result<Vec<f32>, InferenceError> {
        let url = self
            .infer_url(&request.model)
            .map_err(|err| InferenceError::InvalidInput(format!("{:#}", err)))?;
        let body = serde_json::to_string(&InferBody {
            inputs: [InputTensor {
                name: &request.input_name,
                shape: &request.shape,
                datatype: "FP32",
                data: &request.data,
            }],
            outputs: [RequestedOutput {
                name: &request.output_name,
            }],
        })
        .map_err(|err| InferenceError::InvalidInput(err.to_string()))?;

        let response = match self
            .agent
            .post(url.as_str())
            .set("Content-Type", "application/json")
            .send_string(&body)
        {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                let message = response
                    .into_string()
                    .unwrap_or_else(|_| "unreadable error body".to_string());
                return Err(InferenceError::Server { status, message });
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(InferenceError::Transport(transport.to_string()));
            }
        };

        let status = response.status();
        let text = response
            .into_string()
            .map_err(|err| InferenceError::Transport(err.to_string()))?;
        let parsed: InferResponse = serde_json::from_str(&text)
            .map_err(|err| InferenceError::InvalidOutput(err.to_string()))?;
        if let Some(message) = parsed.error {
            return Err(InferenceError::Server { status, message });
        }
        parsed
            .outputs
            .into_iter()
            .find(|output| output.name == request.output_name)
            .map(|output| output.data)
            .ok_or_else(|| {
                InferenceError::InvalidOutput(format!(
                    "response has no output named {}",
                    request.output_name
                ))
            })
    }
}
