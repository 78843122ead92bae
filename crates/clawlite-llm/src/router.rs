use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use clawlite_core::{ClawLiteError, Result};

use crate::provider::{ChatProvider, ChatRequest, ChatResponse, StreamChunk};

/// Retry attempts for transient errors before walking the fallback chain.
const MAX_RETRIES: u32 = 2;
/// Base delay for exponential backoff (doubles each retry).
const BASE_DELAY_MS: u64 = 250;

/// Consecutive failures before a provider's circuit opens.
const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
/// How long an open circuit blocks before allowing a probe.
const CIRCUIT_OPEN_DURATION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
        }
    }

    fn allow_request(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open { since } => {
                if since.elapsed() >= CIRCUIT_OPEN_DURATION {
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            // A probe is already in flight
            CircuitState::HalfOpen => false,
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = CircuitState::Closed;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= CIRCUIT_FAILURE_THRESHOLD {
            self.state = CircuitState::Open {
                since: Instant::now(),
            };
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.state, CircuitState::Open { .. })
    }
}

/// How a routed request was ultimately served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteMode {
    Online,
    Fallback,
    Offline,
}

impl RouteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteMode::Online => "online",
            RouteMode::Fallback => "fallback",
            RouteMode::Offline => "offline",
        }
    }
}

/// A completed routed request plus where it landed.
#[derive(Debug)]
pub struct RouteOutcome {
    pub response: ChatResponse,
    /// The `vendor/model` that actually answered.
    pub model: String,
    pub mode: RouteMode,
    pub reason: String,
}

/// A routed streaming request.
pub struct StreamOutcome {
    pub chunks: tokio::sync::mpsc::Receiver<StreamChunk>,
    pub model: String,
    pub mode: RouteMode,
    pub reason: String,
}

/// Check if an error is transient and worth retrying on the same provider.
fn is_retryable(err: &ClawLiteError) -> bool {
    match err {
        ClawLiteError::ProviderRateLimited { .. } | ClawLiteError::ProviderTimeout { .. } => true,
        ClawLiteError::ProviderSendFailed(msg) => {
            msg.starts_with("HTTP 500")
                || msg.starts_with("HTTP 502")
                || msg.starts_with("HTTP 503")
                || msg.starts_with("HTTP 529")
                || msg.contains("timed out")
                || msg.contains("connection reset")
                || msg.contains("connection closed")
                || msg.contains("overloaded")
        }
        _ => false,
    }
}

/// Should this error walk the fallback chain instead of surfacing?
fn walks_fallback(err: &ClawLiteError) -> bool {
    err.triggers_fallback()
        || matches!(
            err,
            ClawLiteError::ProviderSendFailed(_)
                | ClawLiteError::AuthInvalid(_)
                | ClawLiteError::ModelNotFound(_)
        )
}

fn retry_after_hint(err: &ClawLiteError) -> Option<u64> {
    if let ClawLiteError::ProviderRateLimited { retry_after_secs } = err {
        Some(*retry_after_secs)
    } else {
        None
    }
}

/// Routes `vendor/model` requests to the right provider, with per-provider
/// retry, circuit breaking, the configured fallback chain and the offline
/// fallback. The route taken is reported back for `AssistantResult.meta`.
#[derive(Clone)]
pub struct ProviderRouter {
    providers: Vec<Arc<dyn ChatProvider>>,
    breakers: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
    fallback: Vec<String>,
    offline_model: Option<String>,
}

impl ProviderRouter {
    pub fn new(fallback: Vec<String>, offline_model: Option<String>) -> Self {
        Self {
            providers: vec![],
            breakers: Arc::new(Mutex::new(HashMap::new())),
            fallback,
            offline_model,
        }
    }

    pub fn add_provider(&mut self, provider: Arc<dyn ChatProvider>) {
        let name = provider.name().to_string();
        info!(provider = %name, "registered chat provider");
        self.breakers
            .lock()
            .entry(name)
            .or_insert_with(CircuitBreaker::new);
        self.providers.push(provider);
    }

    pub fn has_providers(&self) -> bool {
        !self.providers.is_empty()
    }

    pub fn offline_configured(&self) -> bool {
        self.offline_model.is_some()
    }

    /// Candidate models in try-order: primary, fallback chain, offline last.
    fn candidates(&self, primary: &str) -> Vec<(String, RouteMode)> {
        let mut out = vec![(primary.to_string(), RouteMode::Online)];
        for model in &self.fallback {
            if model != primary {
                out.push((model.clone(), RouteMode::Fallback));
            }
        }
        if let Some(ref offline) = self.offline_model {
            out.push((offline.clone(), RouteMode::Offline));
        }
        out
    }

    /// Find the provider serving a `vendor/model` string.
    fn resolve(&self, model: &str) -> Option<(Arc<dyn ChatProvider>, String)> {
        if let Some((vendor, model_name)) = model.split_once('/') {
            for p in &self.providers {
                if p.name().eq_ignore_ascii_case(vendor) {
                    return Some((Arc::clone(p), model_name.to_string()));
                }
            }
        }
        for p in &self.providers {
            if p.models().iter().any(|m| m == model) {
                return Some((Arc::clone(p), model.to_string()));
            }
        }
        None
    }

    fn is_available(&self, provider_name: &str) -> bool {
        let mut breakers = self.breakers.lock();
        breakers
            .get_mut(provider_name)
            .map(|cb| cb.allow_request())
            .unwrap_or(true)
    }

    fn record_success(&self, provider_name: &str) {
        let mut breakers = self.breakers.lock();
        if let Some(cb) = breakers.get_mut(provider_name) {
            cb.record_success();
        }
    }

    fn record_failure(&self, provider_name: &str) {
        let mut breakers = self.breakers.lock();
        if let Some(cb) = breakers.get_mut(provider_name) {
            let was_open = cb.is_open();
            cb.record_failure();
            if !was_open && cb.is_open() {
                warn!(
                    provider = provider_name,
                    failures = cb.consecutive_failures,
                    "provider circuit open for {}s",
                    CIRCUIT_OPEN_DURATION.as_secs()
                );
            }
        }
    }

    /// Complete a request, walking the fallback chain on provider-class
    /// failures.
    pub async fn complete(&self, request: &ChatRequest) -> Result<RouteOutcome> {
        let mut last_err: Option<ClawLiteError> = None;

        for (model, mode) in self.candidates(&request.model) {
            let Some((provider, model_name)) = self.resolve(&model) else {
                last_err = Some(ClawLiteError::ModelNotFound(model.clone()));
                continue;
            };
            if !self.is_available(provider.name()) {
                warn!(provider = provider.name(), "circuit open, skipping to next candidate");
                last_err = Some(ClawLiteError::ProviderCircuitOpen(provider.name().into()));
                continue;
            }

            let mut req = request.clone();
            req.model = model_name;
            match self.complete_with_retry(&*provider, &req).await {
                Ok(response) => {
                    self.record_success(provider.name());
                    let reason = match mode {
                        RouteMode::Online => "primary".to_string(),
                        _ => format!(
                            "previous candidate failed: {}",
                            last_err.as_ref().map(|e| e.kind()).unwrap_or("unknown")
                        ),
                    };
                    return Ok(RouteOutcome {
                        response,
                        model,
                        mode,
                        reason,
                    });
                }
                Err(e) => {
                    self.record_failure(provider.name());
                    if !walks_fallback(&e) {
                        return Err(e);
                    }
                    warn!(model = %model, error = %e, "candidate failed, trying next");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| ClawLiteError::ModelNotFound(request.model.clone())))
    }

    /// Streaming variant of [`Self::complete`].
    pub async fn stream(&self, request: &ChatRequest) -> Result<StreamOutcome> {
        let mut last_err: Option<ClawLiteError> = None;

        for (model, mode) in self.candidates(&request.model) {
            let Some((provider, model_name)) = self.resolve(&model) else {
                last_err = Some(ClawLiteError::ModelNotFound(model.clone()));
                continue;
            };
            if !self.is_available(provider.name()) {
                last_err = Some(ClawLiteError::ProviderCircuitOpen(provider.name().into()));
                continue;
            }

            let mut req = request.clone();
            req.model = model_name;
            match self.stream_with_retry(&*provider, &req).await {
                Ok(chunks) => {
                    self.record_success(provider.name());
                    let reason = match mode {
                        RouteMode::Online => "primary".to_string(),
                        _ => format!(
                            "previous candidate failed: {}",
                            last_err.as_ref().map(|e| e.kind()).unwrap_or("unknown")
                        ),
                    };
                    return Ok(StreamOutcome {
                        chunks,
                        model,
                        mode,
                        reason,
                    });
                }
                Err(e) => {
                    self.record_failure(provider.name());
                    if !walks_fallback(&e) {
                        return Err(e);
                    }
                    warn!(model = %model, error = %e, "candidate stream failed, trying next");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| ClawLiteError::ModelNotFound(request.model.clone())))
    }

    async fn complete_with_retry(
        &self,
        provider: &dyn ChatProvider,
        request: &ChatRequest,
    ) -> Result<ChatResponse> {
        let mut last_err = None;
        for attempt in 0..=MAX_RETRIES {
            match provider.complete(request).await {
                Ok(resp) => return Ok(resp),
                Err(e) if is_retryable(&e) && attempt < MAX_RETRIES => {
                    let delay = retry_after_hint(&e)
                        .map(|s| s * 1000)
                        .unwrap_or(BASE_DELAY_MS * 2u64.pow(attempt));
                    warn!(
                        provider = provider.name(),
                        attempt = attempt + 1,
                        delay_ms = delay,
                        error = %e,
                        "retrying after transient error"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap())
    }

    async fn stream_with_retry(
        &self,
        provider: &dyn ChatProvider,
        request: &ChatRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>> {
        let mut last_err = None;
        for attempt in 0..=MAX_RETRIES {
            match provider.stream(request).await {
                Ok(rx) => return Ok(rx),
                Err(e) if is_retryable(&e) && attempt < MAX_RETRIES => {
                    let delay = retry_after_hint(&e)
                        .map(|s| s * 1000)
                        .unwrap_or(BASE_DELAY_MS * 2u64.pow(attempt));
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap())
    }
}
