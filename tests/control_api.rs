use anyhow::{anyhow, Result};
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use vision_node::api::{ApiConfig, ApiHandle, ApiServer};
use vision_node::{
    InMemoryResultStore, ModelSpec, Node, NodeConfig, StaticInferenceClient, SyntheticPlatform,
};

fn node_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node_id = "node-test".to_string();
    config.scheduler.tick = Duration::from_millis(10);
    config.scheduler.poll_interval = Duration::from_millis(10);
    config.scheduler.attach_attempts = 200;
    config.scheduler.detach_timeout = Some(Duration::from_secs(5));
    config.sink.db_path = None;
    config.models = vec![ModelSpec {
        name: "m1".to_string(),
        frame_count: 4,
        input_width: 8,
        input_height: 8,
        input_name: "input_1".to_string(),
        output_name: "dense".to_string(),
        classes: vec!["walk".into(), "run".into()],
    }];
    config
}

struct TestApi {
    node: Option<Node>,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new() -> Result<Self> {
        let node = Node::start(
            &node_config(),
            Arc::new(SyntheticPlatform::with_cameras(&["cam1"])),
            Arc::new(StaticInferenceClient::new(vec![0.2, 0.8])),
            Box::new(InMemoryResultStore::new()),
        )?;
        let api_handle = ApiServer::new(
            ApiConfig {
                addr: "127.0.0.1:0".to_string(),
            },
            node.control(),
        )
        .spawn()?;
        Ok(Self {
            node: Some(node),
            api_handle: Some(api_handle),
        })
    }

    fn addr(&self) -> Result<SocketAddr> {
        self.api_handle
            .as_ref()
            .map(|handle| handle.addr)
            .ok_or_else(|| anyhow!("api handle missing"))
    }

    fn request(&self, method: &str, path: &str, body: &str) -> Result<(u16, String)> {
        let mut stream = TcpStream::connect(self.addr()?)?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {len}\r\n\r\n{body}",
            len = body.len()
        );
        stream.write_all(request.as_bytes())?;
        let mut response = String::new();
        stream.read_to_string(&mut response)?;
        let mut parts = response.splitn(2, "\r\n\r\n");
        let headers = parts.next().unwrap_or("");
        let status = headers
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| anyhow!("missing status line"))?
            .parse()?;
        Ok((status, parts.next().unwrap_or("").to_string()))
    }

    fn deployments(&self, path: &str, body: &str) -> Result<(u16, Value)> {
        let (status, body) = self.request("POST", path, body)?;
        Ok((status, serde_json::from_str(&body)?))
    }

    fn shutdown(mut self) -> Result<()> {
        if let Some(handle) = self.api_handle.take() {
            handle.stop()?;
        }
        if let Some(node) = self.node.take() {
            node.shutdown()?;
        }
        Ok(())
    }
}

const START_7: &str =
    r#"{"deployment_information":[{"deployment_id":7,"model_id":"m1","device_name":"cam1"}]}"#;
const STOP_7: &str = r#"{"deployment_information":[{"deployment_id":7,"device_name":"cam1"}]}"#;

#[test]
fn availability_and_camera_listing() -> Result<()> {
    let api = TestApi::new()?;

    let (status, body) = api.request("GET", "/node/available", "")?;
    assert_eq!(status, 200);
    assert_eq!(body, "Available");

    let (status, body) = api.request("GET", "/node/cameras", "")?;
    assert_eq!(status, 200);
    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["get_cameras"]["node_id"], "node-test");
    assert_eq!(value["get_cameras"]["cameras"][0], "cam1");

    api.shutdown()
}

#[test]
fn start_and_stop_round_trip_with_conflicts() -> Result<()> {
    let api = TestApi::new()?;

    let (status, body) = api.deployments("/node/deployments/initialise", START_7)?;
    assert_eq!(status, 200);
    assert_eq!(body[0]["status"], "started");
    assert_eq!(body[0]["deployment_id"], 7);

    let (status, body) = api.deployments("/node/deployments/initialise", START_7)?;
    assert_eq!(status, 409);
    assert_eq!(body[0]["status"], "already_active");

    let (status, body) = api.deployments("/node/deployments/stop", STOP_7)?;
    assert_eq!(status, 200);
    assert_eq!(body[0]["status"], "stopped");

    let (status, body) = api.deployments("/node/deployments/stop", STOP_7)?;
    assert_eq!(status, 409);
    assert_eq!(body[0]["status"], "already_inactive");

    api.shutdown()
}

#[test]
fn unknown_model_and_source_are_not_found() -> Result<()> {
    let api = TestApi::new()?;

    let (status, body) = api.deployments(
        "/node/deployments/initialise",
        r#"{"deployment_information":[{"deployment_id":8,"model_id":"nope","device_name":"cam1"}]}"#,
    )?;
    assert_eq!(status, 404);
    assert_eq!(body[0]["status"], "unknown_model");

    let (status, body) = api.deployments(
        "/node/deployments/initialise",
        r#"{"deployment_information":[{"deployment_id":9,"model_id":"m1","device_name":"cam9"}]}"#,
    )?;
    assert_eq!(status, 404);
    assert_eq!(body[0]["status"], "unknown_source");

    api.shutdown()
}

#[test]
fn malformed_requests_are_rejected() -> Result<()> {
    let api = TestApi::new()?;

    let (status, _) = api.request("POST", "/node/deployments/initialise", "{not json")?;
    assert_eq!(status, 400);

    let (status, _) = api.request(
        "POST",
        "/node/deployments/initialise",
        r#"{"deployment_information":[]}"#,
    )?;
    assert_eq!(status, 400);

    let (status, _) = api.request("GET", "/node/deployments/stop", "")?;
    assert_eq!(status, 405);

    let (status, _) = api.request("GET", "/node/unknown", "")?;
    assert_eq!(status, 404);

    api.shutdown()
}
