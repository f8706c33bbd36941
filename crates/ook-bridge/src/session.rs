//! Session controller: the single owner of the peer, the agent process and
//! the request correlation table.
//!
//! All session state lives in one task. Socket tasks report in through
//! [`SessionEvent`]s, the agent process through `(ProcessId, ProcessEvent)`
//! pairs, and the controller reacts to each one in turn. Events from a peer
//! or process that is no longer current are ignored.

use std::collections::HashMap;
use std::time::Instant;

use ook_core::{CloseReason, Envelope, PeerId, ProcessId, RequestId};
use ook_telemetry::{names, RpcSpan, SpanStatus, Telemetry};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::{BridgeConfig, ResumePolicy};
use crate::peer::PeerHandle;
use crate::process::{
    ExitInfo, ProcessController, ProcessEvent, ProcessEventReceiver, ProcessEventSender,
};

/// Something that happened on the socket side of the bridge.
#[derive(Debug)]
pub enum SessionEvent {
    /// A WebSocket upgrade completed.
    PeerConnected(PeerHandle),
    /// A text frame from a peer.
    PeerFrame { peer: PeerId, frame: String },
    /// The peer's socket is gone.
    PeerClosed { peer: PeerId },
    /// Close the peer, stop the agent, then reply on `done`.
    Shutdown { done: oneshot::Sender<()> },
}

/// Point-in-time view of the session, published after every event.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub peer_connected: bool,
    pub process_running: bool,
    pub process_pid: Option<u32>,
    pub authenticated: bool,
    pub pending_requests: usize,
}

struct PendingRequest {
    method: String,
    started: Instant,
    span: RpcSpan,
}

#[derive(Default)]
struct Session {
    peer: Option<PeerHandle>,
    process: Option<ProcessController>,
    authenticated: bool,
    pending: HashMap<RequestId, PendingRequest>,
}

impl Session {
    fn is_current_peer(&self, id: &PeerId) -> bool {
        self.peer.as_ref().is_some_and(|p| p.id() == id)
    }

    fn is_current_process(&self, id: &ProcessId) -> bool {
        self.process.as_ref().is_some_and(|p| p.id() == id)
    }

    fn peer_is_open(&self) -> bool {
        self.peer.as_ref().is_some_and(PeerHandle::is_open)
    }

    fn process_is_running(&self) -> bool {
        self.process.as_ref().is_some_and(ProcessController::is_running)
    }
}

pub struct SessionController {
    config: BridgeConfig,
    telemetry: Telemetry,
    session: Session,
    process_tx: ProcessEventSender,
    process_rx: ProcessEventReceiver,
    status: watch::Sender<SessionStatus>,
    shutting_down: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl SessionController {
    pub fn new(config: BridgeConfig, telemetry: Telemetry) -> Self {
        let (process_tx, process_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            config,
            telemetry,
            session: Session::default(),
            process_tx,
            process_rx,
            status,
            shutting_down: false,
            shutdown_waiters: Vec::new(),
        }
    }

    /// Receiver for the published [`SessionStatus`].
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            peer_connected: self.session.peer_is_open(),
            process_running: self.session.process_is_running(),
            process_pid: self.session.process.as_ref().and_then(ProcessController::pid),
            authenticated: self.session.authenticated,
            pending_requests: self.session.pending.len(),
        }
    }

    /// Dispatch loop. Returns once every [`SessionEvent`] sender is gone.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                Some((id, event)) = self.process_rx.recv() => {
                    self.handle_process_event(id, event);
                }
            }
        }
        if let Some(process) = self.session.process.as_mut() {
            process.terminate();
        }
        debug!("session controller stopped");
    }

    pub fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::PeerConnected(peer) => self.on_peer_connected(peer),
            SessionEvent::PeerFrame { peer, frame } => self.on_peer_frame(&peer, frame),
            SessionEvent::PeerClosed { peer } => self.on_peer_closed(&peer),
            SessionEvent::Shutdown { done } => self.on_shutdown(done),
        }
        self.publish();
    }

    pub fn handle_process_event(&mut self, id: ProcessId, event: ProcessEvent) {
        if !self.session.is_current_process(&id) {
            debug!(process_id = %id, "ignoring event from stale process");
            return;
        }
        match event {
            ProcessEvent::Message(line) => self.on_process_line(line),
            ProcessEvent::Error(err) => {
                self.telemetry
                    .metrics
                    .counter_inc(names::BRIDGE_ERRORS_TOTAL, &[("type", "process")], 1);
                warn!(process_id = %id, error = %err, kind = err.error_kind(), "closing peer after process error");
                self.close_peer(CloseReason::ProcessError);
                if !self.session.process_is_running() {
                    self.session.process = None;
                    self.reply_shutdown_waiters();
                }
            }
            ProcessEvent::Exit(exit) => self.on_process_exit(&id, exit),
        }
        self.publish();
    }

    fn on_peer_connected(&mut self, mut peer: PeerHandle) {
        if self.shutting_down {
            info!(peer_id = %peer.id(), "rejecting peer during shutdown");
            peer.close(CloseReason::ShuttingDown);
            return;
        }
        if self.session.peer_is_open() {
            warn!(peer_id = %peer.id(), "rejecting peer, session already has a live peer");
            self.telemetry
                .metrics
                .counter_inc(names::WS_CONNECTIONS_REJECTED_TOTAL, &[], 1);
            peer.close(CloseReason::Busy);
            return;
        }

        if let Some(stale) = self.session.peer.take() {
            debug!(peer_id = %stale.id(), "releasing closed peer");
            self.telemetry
                .metrics
                .gauge_inc(names::WS_CONNECTIONS_ACTIVE, &[], -1.0);
        }

        info!(peer_id = %peer.id(), "peer admitted");
        self.telemetry
            .metrics
            .gauge_inc(names::WS_CONNECTIONS_ACTIVE, &[], 1.0);
        self.telemetry
            .metrics
            .counter_inc(names::WS_CONNECTIONS_TOTAL, &[], 1);
        self.session.peer = Some(peer);
        self.ensure_process();
    }

    fn ensure_process(&mut self) {
        if self.config.resume_policy == ResumePolicy::ResumeAuthenticated
            && self.session.authenticated
            && self.session.process_is_running()
        {
            info!(pid = ?self.session.process.as_ref().and_then(ProcessController::pid), "reattaching peer to authenticated agent process");
            return;
        }

        if let Some(mut old) = self.session.process.take() {
            old.terminate();
        }
        self.fail_pending("agent process replaced");
        self.session.authenticated = false;

        let mut process = ProcessController::new(self.config.agent.clone(), self.process_tx.clone());
        process.spawn();
        self.telemetry
            .metrics
            .counter_inc(names::AGENT_PROCESSES_SPAWNED_TOTAL, &[], 1);
        self.session.process = Some(process);
    }

    fn on_peer_frame(&mut self, peer: &PeerId, frame: String) {
        if !self.session.is_current_peer(peer) {
            debug!(peer_id = %peer, "ignoring frame from stale peer");
            return;
        }

        if let Some(envelope) = Envelope::parse(&frame) {
            if let Some((id, method)) = envelope.request() {
                self.track_request(id.clone(), method.to_owned());
            }
        }

        let sent = self
            .session
            .process
            .as_ref()
            .is_some_and(|process| process.send(&frame));
        if !sent {
            warn!(peer_id = %peer, "agent process not accepting input, dropping frame");
            self.telemetry
                .metrics
                .counter_inc(names::BRIDGE_ERRORS_TOTAL, &[("type", "send_failed")], 1);
        }
    }

    fn track_request(&mut self, id: RequestId, method: String) {
        let rpc_id = id.to_string();
        let mut span = self.telemetry.tracer.start(&method, &rpc_id);
        span.set_attribute("rpc.system", "jsonrpc");
        self.telemetry
            .metrics
            .counter_inc(names::RPC_REQUESTS_TOTAL, &[("method", method.as_str())], 1);
        debug!(method = %method, rpc_id = %rpc_id, "tracking request");

        let pending = PendingRequest {
            method,
            started: Instant::now(),
            span,
        };
        if let Some(mut replaced) = self.session.pending.insert(id, pending) {
            warn!(method = %replaced.method, rpc_id = %rpc_id, "request id reused while in flight");
            replaced
                .span
                .set_status(SpanStatus::Error, Some("superseded by request with the same id"));
            replaced.span.end();
        }
    }

    fn on_process_line(&mut self, line: String) {
        if let Some(envelope) = Envelope::parse(&line) {
            if let Some(id) = &envelope.id {
                if let Some(pending) = self.session.pending.remove(id) {
                    self.resolve(id, pending, envelope.has_error);
                }
            }
        }

        match self.session.peer.as_ref() {
            Some(peer) if peer.is_open() => {
                if !peer.send(line) {
                    warn!(peer_id = %peer.id(), "peer went away, dropping agent output");
                }
            }
            _ => warn!("no open peer, dropping agent output"),
        }
    }

    fn resolve(&mut self, id: &RequestId, pending: PendingRequest, failed: bool) {
        let PendingRequest {
            method,
            started,
            mut span,
        } = pending;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let labels = [("method", method.as_str())];
        self.telemetry
            .metrics
            .histogram_observe(names::RPC_REQUEST_DURATION_MS, &labels, elapsed_ms);

        if failed {
            self.telemetry
                .metrics
                .counter_inc(names::RPC_ERRORS_TOTAL, &labels, 1);
            span.set_status(SpanStatus::Error, Some("agent returned error"));
        } else {
            span.set_status(SpanStatus::Ok, None);
        }
        span.set_attribute("rpc.duration_ms", format!("{elapsed_ms:.3}"));
        span.end();
        debug!(method = %method, rpc_id = %id, elapsed_ms, failed, "request resolved");

        if !failed && !self.session.authenticated && method == self.config.handshake_method {
            info!(rpc_id = %id, "session authenticated");
            self.session.authenticated = true;
        }
    }

    fn on_process_exit(&mut self, id: &ProcessId, exit: ExitInfo) {
        info!(process_id = %id, code = ?exit.code, signal = ?exit.signal, "agent process gone, collapsing session");
        self.telemetry
            .metrics
            .counter_inc(names::AGENT_PROCESS_EXITS_TOTAL, &[], 1);
        self.fail_pending("agent process exited");
        self.session.process = None;
        self.session.authenticated = false;
        self.close_peer(CloseReason::ProcessExited);
        self.reply_shutdown_waiters();
    }

    fn on_peer_closed(&mut self, peer: &PeerId) {
        if !self.session.is_current_peer(peer) {
            debug!(peer_id = %peer, "ignoring close of stale peer");
            return;
        }
        info!(peer_id = %peer, "peer disconnected");
        self.telemetry
            .metrics
            .gauge_inc(names::WS_CONNECTIONS_ACTIVE, &[], -1.0);
        self.session.peer = None;

        if self.shutting_down {
            // the agent is already terminating; its exit answers the waiters
            self.fail_pending("bridge shutting down");
            return;
        }

        let keep = self.config.resume_policy == ResumePolicy::ResumeAuthenticated
            && self.session.authenticated
            && self.session.process_is_running();
        if keep {
            info!("keeping authenticated agent process for the next peer");
            return;
        }

        if let Some(mut process) = self.session.process.take() {
            process.terminate();
        }
        self.fail_pending("peer disconnected");
        self.session.authenticated = false;
    }

    fn on_shutdown(&mut self, done: oneshot::Sender<()>) {
        if !self.shutting_down {
            info!("session shutting down");
            self.shutting_down = true;
        }
        self.close_peer(CloseReason::ShuttingDown);

        match self.session.process.as_mut() {
            Some(process) if process.is_running() => {
                process.terminate();
                self.shutdown_waiters.push(done);
            }
            _ => {
                let _ = done.send(());
            }
        }
    }

    fn reply_shutdown_waiters(&mut self) {
        for done in self.shutdown_waiters.drain(..) {
            let _ = done.send(());
        }
    }

    fn close_peer(&mut self, reason: CloseReason) {
        if let Some(peer) = self.session.peer.as_mut() {
            if peer.is_open() {
                info!(peer_id = %peer.id(), code = reason.code(), reason = reason.reason(), "closing peer");
                peer.close(reason);
            }
        }
    }

    /// End every in-flight span in error and clear the table.
    fn fail_pending(&mut self, message: &str) {
        if self.session.pending.is_empty() {
            return;
        }
        warn!(count = self.session.pending.len(), reason = message, "failing pending requests");
        for (_, mut pending) in self.session.pending.drain() {
            pending.span.set_status(SpanStatus::Error, Some(message));
            pending.span.end();
        }
    }

    fn publish(&self) {
        let status = self.status();
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
