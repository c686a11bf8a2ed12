//! Result push to the aggregator.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use url::Url;

use crate::inference::InferenceResult;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PushEntry {
    pub timestamp: u64,
    pub class: String,
    pub confidence: f64,
}

/// Results of one deployment within the push window.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PushPayload {
    pub deployment_id: u64,
    pub data: Vec<PushEntry>,
}

/// Group results per deployment, ordered by deployment id.
pub fn group_by_deployment(results: &[InferenceResult]) -> Vec<PushPayload> {
    let mut grouped: BTreeMap<u64, Vec<PushEntry>> = BTreeMap::new();
    for result in results {
        grouped
            .entry(result.deployment.0)
            .or_default()
            .push(PushEntry {
                timestamp: result.timestamp_ms,
                class: result.class.clone(),
                confidence: result.confidence,
            });
    }
    grouped
        .into_iter()
        .map(|(deployment_id, data)| PushPayload {
            deployment_id,
            data,
        })
        .collect()
}

pub enum ResultPublisher {
    /// POST each payload as JSON.
    Http { url: Url, agent: ureq::Agent },
    /// No aggregator configured; payloads are only logged.
    Log,
}

impl ResultPublisher {
    pub fn http(url: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url).context("parse push url")?;
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(ResultPublisher::Http { url, agent })
    }

    /// Send every payload; returns how many were delivered.
    pub fn publish(&self, payloads: &[PushPayload]) -> Result<usize> {
        match self {
            ResultPublisher::Log => {
                for payload in payloads {
                    log::info!(
                        "results for deployment {}: {} record(s)",
                        payload.deployment_id,
                        payload.data.len()
                    );
                }
                Ok(payloads.len())
            }
            ResultPublisher::Http { url, agent } => {
                let mut delivered = 0;
                let mut last_error = None;
                for payload in payloads {
                    let body = serde_json::to_string(payload)?;
                    match agent
                        .post(url.as_str())
                        .set("Content-Type", "application/json")
                        .send_string(&body)
                    {
                        Ok(_) => delivered += 1,
                        Err(err) => {
                            log::warn!(
                                "push for deployment {} to {} failed: {}",
                                payload.deployment_id,
                                url,
                                err
                            );
                            last_error = Some(err);
                        }
                    }
                }
                match (delivered, last_error) {
                    (0, Some(err)) => Err(anyhow!("result push failed: {}", err)),
                    _ => Ok(delivered),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeploymentId;

    fn result(ts: u64, deployment: u64, class: &str) -> InferenceResult {
        InferenceResult {
            timestamp_ms: ts,
            deployment: DeploymentId(deployment),
            class: class.to_string(),
            confidence: 12.5,
        }
    }

    #[test]
    fn results_are_grouped_per_deployment() -> Result<()> {
        let payloads = group_by_deployment(&[
            result(1, 8, "run"),
            result(2, 7, "walk"),
            result(3, 8, "idle"),
        ]);
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0].deployment_id, 7);
        assert_eq!(payloads[1].data.len(), 2);

        let json = serde_json::to_value(&payloads[0])?;
        assert_eq!(
            json,
            serde_json::json!({
                "deployment_id": 7,
                "data": [{"timestamp": 2, "class": "walk", "confidence": 12.5}]
            })
        );
        Ok(())
    }

    #[test]
    fn log_publisher_accepts_everything() -> Result<()> {
        let payloads = group_by_deployment(&[result(1, 7, "walk")]);
        assert_eq!(ResultPublisher::Log.publish(&payloads)?, 1);
        Ok(())
    }
}
