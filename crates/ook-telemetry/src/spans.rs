//! RPC trace spans.
//!
//! A thin span factory over `tracing`: each [`RpcSpan`] owns a `tracing::Span`
//! named `rpc` and reports its final status back to the [`Tracer`] that
//! created it, so callers can observe how many spans ended in error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::field::Empty;

/// Final status of a span.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SpanStatus {
    #[default]
    Unset,
    Ok,
    Error,
}

impl SpanStatus {
    fn as_otel(self) -> &'static str {
        match self {
            Self::Unset => "UNSET",
            Self::Ok => "OK",
            Self::Error => "ERROR",
        }
    }
}

/// Span totals observed by a [`Tracer`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpanCounts {
    pub started: u64,
    pub ended_ok: u64,
    pub ended_error: u64,
    pub ended_unset: u64,
}

impl SpanCounts {
    pub fn ended(&self) -> u64 {
        self.ended_ok + self.ended_error + self.ended_unset
    }

    /// Spans started but not yet ended.
    pub fn open(&self) -> u64 {
        self.started.saturating_sub(self.ended())
    }
}

/// Factory for [`RpcSpan`]s.
#[derive(Default)]
pub struct Tracer {
    started: AtomicU64,
    ended_ok: AtomicU64,
    ended_error: AtomicU64,
    ended_unset: AtomicU64,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a span for one RPC exchange.
    pub fn start(self: &Arc<Self>, method: &str, rpc_id: &str) -> RpcSpan {
        self.started.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!(
            "rpc",
            rpc.method = %method,
            rpc.id = %rpc_id,
            otel.status_code = Empty,
            otel.status_message = Empty,
        );
        RpcSpan {
            span,
            tracer: Arc::clone(self),
            method: method.to_owned(),
            status: SpanStatus::Unset,
            status_message: None,
            attributes: Vec::new(),
            started: Instant::now(),
            ended: false,
        }
    }

    pub fn counts(&self) -> SpanCounts {
        SpanCounts {
            started: self.started.load(Ordering::Relaxed),
            ended_ok: self.ended_ok.load(Ordering::Relaxed),
            ended_error: self.ended_error.load(Ordering::Relaxed),
            ended_unset: self.ended_unset.load(Ordering::Relaxed),
        }
    }

    fn record_end(&self, status: SpanStatus) {
        let counter = match status {
            SpanStatus::Ok => &self.ended_ok,
            SpanStatus::Error => &self.ended_error,
            SpanStatus::Unset => &self.ended_unset,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// One in-flight RPC span. Ends exactly once, on [`RpcSpan::end`] or drop.
pub struct RpcSpan {
    span: tracing::Span,
    tracer: Arc<Tracer>,
    method: String,
    status: SpanStatus,
    status_message: Option<String>,
    attributes: Vec<(String, String)>,
    started: Instant,
    ended: bool,
}

impl RpcSpan {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn status(&self) -> SpanStatus {
        self.status
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.push((key.into(), value.into()));
    }

    pub fn set_status(&mut self, status: SpanStatus, message: Option<&str>) {
        self.status = status;
        self.status_message = message.map(str::to_owned);
    }

    /// The underlying `tracing` span, for entering around related events.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn end(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;

        self.span.record("otel.status_code", self.status.as_otel());
        if let Some(message) = &self.status_message {
            self.span.record("otel.status_message", message.as_str());
        }
        let duration_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        self.span.in_scope(|| {
            tracing::debug!(
                duration_ms,
                status = self.status.as_otel(),
                attributes = ?self.attributes,
                "rpc span ended"
            );
        });
        self.tracer.record_end(self.status);
    }
}

impl Drop for RpcSpan {
    fn drop(&mut self) {
        self.finish();
    }
}
