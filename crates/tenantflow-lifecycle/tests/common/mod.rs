use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tenantflow_lifecycle::{
    ManualClock, Method, Request, RequestExecutor, ResourceController, ResourceDescriptor,
    Response, Result, RetryPolicy,
};

pub const COLLECTION: &str = "https://api.example.com/environments";
pub const OPERATION: &str = "https://api.example.com/operations/op-1";

/// Replays canned responses in order and records every request
pub struct ScriptedExecutor {
    responses: Mutex<VecDeque<Result<Response>>>,
    requests: Mutex<Vec<Request>>,
}

impl ScriptedExecutor {
    pub fn new(responses: Vec<Result<Response>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn methods(&self) -> Vec<Method> {
        self.requests().iter().map(|r| r.method).collect()
    }

    #[allow(dead_code)]
    pub fn remaining(&self) -> usize {
        self.responses.lock().unwrap().len()
    }
}

#[async_trait]
impl RequestExecutor for ScriptedExecutor {
    async fn execute(&self, request: Request) -> Result<Response> {
        let description = format!("{} {}", request.method, request.url);
        self.requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected request: {}", description))
    }
}

pub fn json_response(status: u16, body: Value) -> Result<Response> {
    Ok(Response::new(status).with_body(body))
}

pub fn accepted() -> Result<Response> {
    Ok(Response::new(202).with_header("Location", OPERATION))
}

pub fn op_status(status: &str) -> Result<Response> {
    json_response(200, json!({ "status": status }))
}

pub fn policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 100,
        max_delay_ms: 1_000,
        backoff_multiplier: 2.0,
        jitter: 0.0,
        ..RetryPolicy::default()
    }
}

pub fn descriptor() -> ResourceDescriptor {
    ResourceDescriptor::new("environment", COLLECTION)
}

pub fn controller(
    descriptor: ResourceDescriptor,
    executor: Arc<ScriptedExecutor>,
    clock: Arc<ManualClock>,
) -> ResourceController {
    ResourceController::new(descriptor, executor, policy(), clock)
        .with_timeout(Duration::from_secs(60))
}
