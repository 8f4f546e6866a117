//! HTTP transport plumbing shared by the SLM agent and controller.
//!
//! Provides:
//! - [`build_client`] — reqwest client with TLS on by default and explicit
//!   insecure mode for pre-PKI fleets
//! - [`RetryPolicy`] / [`send_with_retry`] — bounded exponential backoff for
//!   idempotent calls; 400/403/404/422 are never retried
//! - [`TraceContext`] / [`Sampler`] — W3C TraceContext + B3 header
//!   propagation with a parent-based probabilistic sampler

#![forbid(unsafe_code)]

use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

// ─── Client construction ─────────────────────────────────────────────────────

/// Timeout classes for outbound calls.
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    /// Accept invalid certificates. Must be opted into explicitly.
    pub insecure: bool,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl ClientOptions {
    /// Heartbeat-class calls: short total budget.
    pub fn heartbeat(insecure: bool) -> Self {
        Self {
            insecure,
            connect_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Event-sync and copy-class calls: long total budget.
    pub fn bulk(insecure: bool) -> Self {
        Self {
            insecure,
            connect_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(300),
        }
    }
}

/// Build a reqwest client for the given options.
pub fn build_client(opts: ClientOptions) -> Result<reqwest::Client, TransportError> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(opts.connect_timeout)
        .timeout(opts.request_timeout);
    if opts.insecure {
        warn!("TLS verification disabled (insecure mode)");
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder.build().map_err(TransportError::Request)
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("request failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("server returned {0}")]
    Status(u16),
}

// ─── Retry policy ────────────────────────────────────────────────────────────

/// Exponential backoff: base 1 s, factor 2, cap 60 s, max 3 attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2,
            cap: Duration::from_secs(60),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (first retry = 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.factor.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(exp).min(self.cap)
    }
}

/// Whether a response status is worth retrying. Client errors that indicate
/// the request itself is wrong (400/403/404/422) never are.
pub fn is_retryable_status(status: u16) -> bool {
    match status {
        400 | 401 | 403 | 404 | 409 | 422 => false,
        408 | 429 => true,
        s => s >= 500,
    }
}

/// Send an idempotent request with bounded retries. The builder is cloned per
/// attempt; transient transport errors and retryable statuses back off per
/// `policy`, everything else returns immediately.
pub async fn send_with_retry(
    builder: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, TransportError> {
    if builder.try_clone().is_none() {
        // Streaming bodies cannot be replayed; single shot.
        return builder.send().await.map_err(TransportError::Request);
    }

    let mut last_error = String::new();
    for attempt in 1..=policy.max_attempts {
        let Some(req) = builder.try_clone() else {
            break;
        };

        match req.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if resp.status().is_success() || !is_retryable_status(status) {
                    return Ok(resp);
                }
                last_error = format!("status {status}");
            }
            Err(e) => {
                last_error = e.to_string();
            }
        }

        if attempt < policy.max_attempts {
            let delay = policy.delay(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, error = %last_error, "retrying request");
            tokio::time::sleep(delay).await;
        }
    }

    Err(TransportError::RetriesExhausted {
        attempts: policy.max_attempts,
        last: last_error,
    })
}

// ─── Trace context ───────────────────────────────────────────────────────────

/// W3C TraceContext identifiers, also emitted as B3 headers for mixed fleets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// 32 lowercase hex chars.
    pub trace_id: String,
    /// 16 lowercase hex chars.
    pub span_id: String,
    pub sampled: bool,
}

fn random_hex(bytes: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..bytes)
        .map(|_| format!("{:02x}", rng.gen::<u8>()))
        .collect()
}

impl TraceContext {
    /// Start a new trace; the sampling decision comes from `sampler`.
    pub fn root(sampler: &Sampler) -> Self {
        Self {
            trace_id: random_hex(16),
            span_id: random_hex(8),
            sampled: sampler.sample(None),
        }
    }

    /// Derive a child span in the same trace, inheriting the decision.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: random_hex(8),
            sampled: self.sampled,
        }
    }

    pub fn traceparent(&self) -> String {
        let flags = if self.sampled { "01" } else { "00" };
        format!("00-{}-{}-{}", self.trace_id, self.span_id, flags)
    }

    /// Headers to stamp on an outbound request (W3C + B3).
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("traceparent", self.traceparent()),
            ("X-B3-TraceId", self.trace_id.clone()),
            ("X-B3-SpanId", self.span_id.clone()),
            (
                "X-B3-Sampled",
                if self.sampled { "1" } else { "0" }.to_string(),
            ),
        ]
    }

    /// Apply the headers to a request builder.
    pub fn inject(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in self.headers() {
            builder = builder.header(name, value);
        }
        builder
    }

    /// Extract a context from inbound headers: `traceparent` wins, B3 is the
    /// fallback. `get` looks up a header by name.
    pub fn extract<'a>(get: impl Fn(&str) -> Option<&'a str>) -> Option<Self> {
        if let Some(tp) = get("traceparent") {
            if let Some(ctx) = Self::parse_traceparent(tp) {
                return Some(ctx);
            }
        }
        let trace_id = get("X-B3-TraceId").or_else(|| get("x-b3-traceid"))?;
        let span_id = get("X-B3-SpanId").or_else(|| get("x-b3-spanid"))?;
        if trace_id.len() != 32 || span_id.len() != 16 {
            return None;
        }
        let sampled = get("X-B3-Sampled")
            .or_else(|| get("x-b3-sampled"))
            .map(|v| v == "1")
            .unwrap_or(true);
        Some(Self {
            trace_id: trace_id.to_ascii_lowercase(),
            span_id: span_id.to_ascii_lowercase(),
            sampled,
        })
    }

    fn parse_traceparent(value: &str) -> Option<Self> {
        let mut parts = value.split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;
        if version != "00" || trace_id.len() != 32 || span_id.len() != 16 || flags.len() != 2 {
            return None;
        }
        if !trace_id.bytes().all(|b| b.is_ascii_hexdigit())
            || !span_id.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return None;
        }
        Some(Self {
            trace_id: trace_id.to_ascii_lowercase(),
            span_id: span_id.to_ascii_lowercase(),
            sampled: flags.ends_with('1'),
        })
    }
}

// ─── Sampler ─────────────────────────────────────────────────────────────────

/// Parent-based probabilistic sampler. A parent decision is always inherited;
/// roots are sampled at `rate` (default 1.0, production typically 0.1).
#[derive(Debug, Clone, Copy)]
pub struct Sampler {
    rate: f64,
}

impl Default for Sampler {
    fn default() -> Self {
        Self { rate: 1.0 }
    }
}

impl Sampler {
    pub fn new(rate: f64) -> Self {
        Self {
            rate: rate.clamp(0.0, 1.0),
        }
    }

    pub fn sample(&self, parent: Option<bool>) -> bool {
        if let Some(decision) = parent {
            return decision;
        }
        if self.rate >= 1.0 {
            true
        } else if self.rate <= 0.0 {
            false
        } else {
            rand::thread_rng().gen::<f64>() < self.rate
        }
    }
}

/// Span for an inbound request, stamped with the fleet namespace and the
/// entity ids every server-side span carries.
pub fn request_span(
    route: &str,
    ctx: &TraceContext,
    node_id: Option<&str>,
    job_id: Option<&str>,
    backup_id: Option<&str>,
) -> tracing::Span {
    tracing::info_span!(
        "request",
        otel.name = %route,
        service.namespace = "fleet",
        trace_id = %ctx.trace_id,
        span_id = %ctx.span_id,
        node_id = node_id.unwrap_or(""),
        job_id = job_id.unwrap_or(""),
        backup_id = backup_id.unwrap_or(""),
    )
}
