//! Inference boundary.
//!
//! - `client`: the `InferenceClient` trait, request/error types and a fixed-output client
//! - `http`: KServe v2 / Triton HTTP JSON client
//! - `dispatch`: turns a full frame window into one request and one result

pub mod client;
pub mod dispatch;
pub mod http;

pub use client::{InferenceClient, InferenceError, InferenceRequest, StaticInferenceClient};
pub use dispatch::{argmax, format_confidence, Dispatcher, InferenceResult};
pub use http::HttpInferenceClient;
