//! In-memory egress and signing doubles for unit tests

use crate::core::errors::TransportError;
use crate::core::kernel::proxy::ProxyDescriptor;
use crate::core::kernel::rest::{Egress, EgressFactory, OutboundRequest, RawResponse};
use crate::core::kernel::signature::{ElapsedSource, SignatureProvider};
use crate::core::types::HeaderSet;
use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Barrier;

const OK_BODY: &str = r#"{"api:statuscode":0}"#;

#[derive(Debug, Clone)]
pub enum Reply {
    Network,
    /// Network failure once every holder of the barrier has dispatched
    HeldNetwork(Arc<Barrier>),
    Status(u16, String),
}

/// Replies handed out in order, across every egress; `{"api:statuscode":0}` once drained
#[derive(Debug, Clone, Default)]
pub struct Script {
    replies: Vec<Reply>,
}

impl Script {
    pub fn then(mut self, reply: Reply) -> Self {
        self.replies.push(reply);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Dispatched {
    pub label: String,
    pub method: Method,
    pub url: String,
    pub headers: HeaderSet,
    pub body: Option<Vec<u8>>,
}

#[derive(Default)]
struct State {
    events: Vec<String>,
    open: usize,
    refused: Vec<String>,
    replies: VecDeque<Reply>,
    dispatched: Vec<Dispatched>,
}

pub struct FakeFactory {
    state: Arc<Mutex<State>>,
}

impl FakeFactory {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(State {
                replies: script.replies.into(),
                ..State::default()
            })),
        })
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn open_tunnels(&self) -> usize {
        self.state.lock().unwrap().open
    }

    pub fn dispatched(&self) -> Vec<Dispatched> {
        self.state.lock().unwrap().dispatched.clone()
    }

    /// Fail to open tunnels whose host contains `host`
    pub fn refuse_tunnel(&self, host: &str) {
        self.state.lock().unwrap().refused.push(host.to_string());
    }
}

impl EgressFactory for FakeFactory {
    fn direct(&self) -> Result<Arc<dyn Egress>, TransportError> {
        Ok(Arc::new(FakeEgress {
            label: "direct".to_string(),
            tunnel: false,
            closed: AtomicBool::new(false),
            state: self.state.clone(),
        }))
    }

    fn tunnel(&self, proxy: &ProxyDescriptor) -> Result<Arc<dyn Egress>, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.refused.iter().any(|h| proxy.host.contains(h.as_str())) {
            return Err(TransportError::Network(format!("connection refused by {}", proxy)));
        }
        state.events.push(format!("open {}", proxy));
        state.open += 1;

        Ok(Arc::new(FakeEgress {
            label: proxy.to_string(),
            tunnel: true,
            closed: AtomicBool::new(false),
            state: self.state.clone(),
        }))
    }
}

struct FakeEgress {
    label: String,
    tunnel: bool,
    closed: AtomicBool,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl Egress for FakeEgress {
    async fn dispatch(&self, request: OutboundRequest) -> Result<RawResponse, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Network(format!("{} is closed", self.label)));
        }

        let reply = {
            let mut state = self.state.lock().unwrap();
            state.dispatched.push(Dispatched {
                label: self.label.clone(),
                method: request.method,
                url: request.url,
                headers: request.headers,
                body: request.body,
            });
            state
                .replies
                .pop_front()
                .unwrap_or_else(|| Reply::Status(200, OK_BODY.to_string()))
        };

        match reply {
            Reply::Network => Err(TransportError::Network("connection reset".to_string())),
            Reply::HeldNetwork(barrier) => {
                barrier.wait().await;
                Err(TransportError::Network("connection reset".to_string()))
            }
            Reply::Status(status, body) => Ok(RawResponse {
                status,
                body: body.into_bytes(),
            }),
        }
    }

    fn close(&self) {
        if self.tunnel && !self.closed.swap(true, Ordering::SeqCst) {
            let mut state = self.state.lock().unwrap();
            state.events.push(format!("close {}", self.label));
            state.open -= 1;
        }
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// Signing service double; counts elapsed-realtime fetches
pub struct FakeSignatureService {
    signature: Option<String>,
    elapsed: u64,
    elapsed_calls: AtomicU64,
}

impl FakeSignatureService {
    pub fn signing(signature: &str) -> Self {
        Self {
            signature: Some(signature.to_string()),
            elapsed: 1_000_000,
            elapsed_calls: AtomicU64::new(0),
        }
    }

    pub fn refusing() -> Self {
        Self {
            signature: None,
            elapsed: 1_000_000,
            elapsed_calls: AtomicU64::new(0),
        }
    }

    pub fn with_elapsed(mut self, elapsed: u64) -> Self {
        self.elapsed = elapsed;
        self
    }

    pub fn elapsed_calls(&self) -> u64 {
        self.elapsed_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignatureProvider for FakeSignatureService {
    async fn ecdsa(&self, _payload: &str, _user_id: &str) -> Result<String, TransportError> {
        self.signature
            .clone()
            .ok_or_else(|| TransportError::SigningProvider("Invalid API key".to_string()))
    }

    async fn public_key_credentials(&self, user_id: &str) -> Result<Value, TransportError> {
        Ok(serde_json::json!({ "userId": user_id }))
    }
}

#[async_trait]
impl ElapsedSource for FakeSignatureService {
    async fn elapsed_realtime(&self) -> Result<u64, TransportError> {
        self.elapsed_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.elapsed)
    }
}
