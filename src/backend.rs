//! Service backend abstraction and implementations
//!
//! Provides the [`ServiceBackend`] trait (one backend endpoint the router
//! can execute a capability against) and two in-process implementations:
//! - [`EchoBackend`]: returns the payload it was given (demo / smoke tests)
//! - [`ScriptedBackend`]: replays a scripted sequence of outcomes (tests)
//!
//! Network-backed implementations live with the caller; the router only
//! needs `call` and `ping`.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::routing::Capability;

/// Failure of a single backend call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// The backend could not be reached or refused the call.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend answered with an error.
    #[error("backend returned error: {0}")]
    Failed(String),

    /// The call did not finish within its attempt timeout.
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),

    /// The backend does not implement the requested capability.
    #[error("capability '{0}' not supported")]
    Unsupported(String),
}

/// Trait for backend service endpoints
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// The trait is object-safe to allow dynamic dispatch via `Arc<dyn ServiceBackend>`.
#[async_trait]
pub trait ServiceBackend: Send + Sync {
    /// Execute `capability` with the given payload.
    async fn call(&self, capability: &Capability, payload: &Value) -> Result<Value, BackendError>;

    /// Liveness probe used by the health monitor.
    async fn ping(&self) -> Result<(), BackendError>;
}

// ============================================================================
// Echo Backend
// ============================================================================

/// Echo backend for demos and smoke tests
///
/// Returns `{"capability": ..., "echo": payload}` after a simulated delay.
pub struct EchoBackend {
    /// Simulated call latency
    pub delay_ms: u64,
}

impl EchoBackend {
    /// Echo backend with a 10ms simulated latency.
    pub fn new() -> Self {
        Self { delay_ms: 10 }
    }

    /// Echo backend with a custom simulated latency.
    pub fn with_delay(delay_ms: u64) -> Self {
        Self { delay_ms }
    }
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceBackend for EchoBackend {
    async fn call(&self, capability: &Capability, payload: &Value) -> Result<Value, BackendError> {
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        Ok(serde_json::json!({
            "capability": capability.as_str(),
            "echo": payload,
        }))
    }

    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

// ============================================================================
// Scripted Backend
// ============================================================================

/// Backend that replays scripted outcomes in order.
///
/// Once the script is exhausted every further call returns the fallback
/// outcome (success echoing the payload unless [`ScriptedBackend::failing`]
/// was used). Pings follow their own script and default to healthy.
pub struct ScriptedBackend {
    calls: Mutex<VecDeque<Result<Value, BackendError>>>,
    pings: Mutex<VecDeque<Result<(), BackendError>>>,
    fail_after_script: bool,
    delay: Duration,
    call_count: AtomicU64,
}

impl ScriptedBackend {
    /// Backend that succeeds on every call.
    pub fn healthy() -> Self {
        Self {
            calls: Mutex::new(VecDeque::new()),
            pings: Mutex::new(VecDeque::new()),
            fail_after_script: false,
            delay: Duration::ZERO,
            call_count: AtomicU64::new(0),
        }
    }

    /// Backend that fails every call with [`BackendError::Unavailable`].
    pub fn failing() -> Self {
        Self {
            fail_after_script: true,
            ..Self::healthy()
        }
    }

    /// Queue call outcomes to be returned in order.
    pub fn with_calls(self, outcomes: impl IntoIterator<Item = Result<Value, BackendError>>) -> Self {
        self.calls.lock().extend(outcomes);
        self
    }

    /// Queue ping outcomes to be returned in order.
    pub fn with_pings(self, outcomes: impl IntoIterator<Item = Result<(), BackendError>>) -> Self {
        self.pings.lock().extend(outcomes);
        self
    }

    /// Add a fixed latency to every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of `call` invocations so far.
    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ServiceBackend for ScriptedBackend {
    async fn call(&self, capability: &Capability, payload: &Value) -> Result<Value, BackendError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.calls.lock().pop_front();
        match scripted {
            Some(outcome) => outcome,
            None if self.fail_after_script => Err(BackendError::Unavailable(format!(
                "scripted failure for {capability}"
            ))),
            None => Ok(payload.clone()),
        }
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let scripted = self.pings.lock().pop_front();
        scripted.unwrap_or(Ok(()))
    }
}
