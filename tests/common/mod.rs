//! Shared test doubles for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use ledger_sync::{
    Channel, Connector, FetchError, HttpRequest, HttpResponse, Identity, MemorySessionStore,
    Requester, Result, Role, SyncConfig, SyncEngine, SyncError,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const LATENCY: Duration = Duration::from_millis(10);

/// In-process API: every path answers `{"path", "version"}` where
/// `version` counts the requests seen for that path.
pub struct MockApi {
    pub identity: Identity,
    calls: Mutex<Vec<String>>,
    versions: Mutex<HashMap<String, u64>>,
    /// Next N data requests answer 401.
    pub reject_next: AtomicUsize,
    pub session_valid: AtomicBool,
    pub offline: AtomicBool,
}

impl MockApi {
    pub fn new(identity: Identity) -> Arc<Self> {
        Arc::new(Self {
            identity,
            calls: Mutex::new(Vec::new()),
            versions: Mutex::new(HashMap::new()),
            reject_next: AtomicUsize::new(0),
            session_valid: AtomicBool::new(true),
            offline: AtomicBool::new(false),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, path: &str) -> usize {
        self.calls.lock().iter().filter(|p| p.as_str() == path).count()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait]
impl Requester for MockApi {
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, FetchError> {
        self.calls.lock().push(request.path.clone());
        tokio::time::sleep(LATENCY).await;

        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::Transport("network unreachable".into()));
        }

        if request.path == "/api/auth/me" {
            return Ok(if self.session_valid.load(Ordering::SeqCst) {
                HttpResponse::ok(serde_json::to_value(&self.identity).unwrap())
            } else {
                HttpResponse::new(401, json!({"message": "Non authentifié"}))
            });
        }

        let rejected = self
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Ok(HttpResponse::new(401, json!({"message": "Non authentifié"})));
        }

        let version = {
            let mut versions = self.versions.lock();
            let v = versions.entry(request.path.clone()).or_insert(0);
            *v += 1;
            *v
        };
        Ok(HttpResponse::ok(json!({"path": request.path, "version": version})))
    }
}

pub enum Step {
    /// Stays open; frames come from the paired sender.
    Open(mpsc::UnboundedReceiver<String>),
    /// Opens and closes immediately.
    Drop,
    Fail,
}

/// Connector replaying a script; refuses once the script is exhausted.
#[derive(Default)]
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Step>>,
    attempts: AtomicUsize,
    pub sent: Arc<Mutex<Vec<String>>>,
}

impl ScriptedConnector {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            ..Default::default()
        })
    }

    /// A connector whose first connection stays open. Returns the sender
    /// feeding inbound frames.
    pub fn open() -> (Arc<Self>, mpsc::UnboundedSender<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(vec![Step::Open(rx)]), tx)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

struct ScriptedChannel {
    inbound: Option<mpsc::UnboundedReceiver<String>>,
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Channel for ScriptedChannel {
    async fn send(&mut self, text: String) -> Result<()> {
        self.sent.lock().push(text);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        match self.inbound.as_mut() {
            Some(rx) => rx.recv().await.map(Ok),
            None => None,
        }
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn Channel>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().pop_front().unwrap_or(Step::Fail);
        let inbound = match step {
            Step::Open(rx) => Some(rx),
            Step::Drop => None,
            Step::Fail => return Err(SyncError::Connection("refused".into())),
        };
        Ok(Box::new(ScriptedChannel {
            inbound,
            sent: self.sent.clone(),
        }))
    }
}

pub fn user(id: u64) -> Identity {
    Identity::new(id, format!("user{id}"), Role::User)
}

pub fn admin() -> Identity {
    Identity::new(1, "admin", Role::Admin)
}

/// Route engine logs to the test writer; set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn engine(api: Arc<MockApi>, connector: Arc<ScriptedConnector>) -> SyncEngine {
    init_tracing();
    SyncEngine::with_parts(
        SyncConfig::default(),
        api,
        connector,
        Arc::new(MemorySessionStore::new()),
    )
}

/// Let spawned tasks run and the paused clock advance by `d`.
pub async fn settle(d: Duration) {
    tokio::time::sleep(d).await;
}
