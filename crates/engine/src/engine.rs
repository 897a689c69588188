//! The engine: owns every registry and is driven by one actor task.
//!
//! External callers talk to it through `EngineHandle`, which sends
//! `EngineCommand` messages over an mpsc channel. Published session lists are
//! read lock-free through `ArcSwap`.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use hookbridge_protocol::{new_id, now_millis, HookEvent, SessionSummary, SyncReply};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::command::EngineCommand;
use crate::dedup::{SeenEvents, DEFAULT_DEDUP_CAP, DEFAULT_DEDUP_WINDOW};
use crate::key::Identity;
use crate::pending::{PendingInfo, PendingRegistry, Settlement};
use crate::table::SessionTable;
use crate::transition::Effect;
use crate::visibility::{end_orphans, visible_summaries, Publisher, VisibilityPolicy};
use crate::EngineError;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub visibility: VisibilityPolicy,
    pub dedup_window: Duration,
    pub dedup_cap: usize,
    pub tick_interval: Duration,
    pub command_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            visibility: VisibilityPolicy::default(),
            dedup_window: DEFAULT_DEDUP_WINDOW,
            dedup_cap: DEFAULT_DEDUP_CAP,
            tick_interval: DEFAULT_TICK_INTERVAL,
            command_buffer: 256,
        }
    }
}

/// Result of feeding one event to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Duplicate,
    /// The event carried no session id, transcript path or cwd.
    NoKey,
    /// The session had already ended.
    Ignored { key: String },
    Applied {
        key: String,
        /// Set when a sync responder is now waiting under this id.
        request_id: Option<String>,
    },
}

pub struct Engine {
    config: EngineConfig,
    table: SessionTable,
    seen: SeenEvents,
    pending: PendingRegistry,
    publisher: Publisher,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Engine {
            seen: SeenEvents::new(config.dedup_window, config.dedup_cap),
            table: SessionTable::new(),
            pending: PendingRegistry::new(),
            publisher: Publisher::new(),
            config,
        }
    }

    /// Dedup, resolve, transition and republish.
    ///
    /// A `responder` is always answered or parked: if the event is dropped it
    /// gets a neutral reply straight away.
    pub fn ingest(
        &mut self,
        mut event: HookEvent,
        responder: Option<oneshot::Sender<SyncReply>>,
        now: u64,
    ) -> IngestOutcome {
        if !self.seen.check_and_record(&event.event_id, now) {
            debug!(
                component = "engine",
                event = "engine.ingest.duplicate",
                kind = %event.kind,
                event_id = %event.event_id,
            );
            answer_neutral(responder);
            return IngestOutcome::Duplicate;
        }

        let Some(resolution) = self.table.resolve(&Identity::of(&event)) else {
            debug!(
                component = "engine",
                event = "engine.ingest.no_key",
                kind = %event.kind,
            );
            answer_neutral(responder);
            return IngestOutcome::NoKey;
        };
        let key = resolution.key;
        for (from, to) in &resolution.rekeyed {
            self.pending.rekey(from, to);
        }

        if responder.is_some() && event.request_id.is_none() {
            event.request_id = Some(new_id());
        }

        let effects = self.table.apply(&key, &event);
        let mut request_id = None;
        let mut ignored = false;
        for effect in effects {
            match effect {
                Effect::AutoAllow => {
                    for id in self.pending.auto_resolve_session(&key) {
                        info!(
                            component = "engine",
                            event = "engine.pending.auto_allowed",
                            session_key = %key,
                            request_id = %id,
                            by = %event.kind,
                        );
                    }
                }
                Effect::RegisterPending { request_id: id } => {
                    debug!(
                        component = "engine",
                        event = "engine.pending.requested",
                        session_key = %key,
                        request_id = %id,
                    );
                }
                Effect::Ignored => ignored = true,
            }
        }

        if ignored {
            answer_neutral(responder);
            return IngestOutcome::Ignored { key };
        }

        if let (Some(responder), Some(id)) = (responder, event.request_id.clone()) {
            match self.pending.register(id.clone(), key.clone(), now, responder) {
                Ok(()) => request_id = Some(id),
                Err(responder) => {
                    warn!(
                        component = "engine",
                        event = "engine.pending.duplicate_request",
                        request_id = %id,
                    );
                    answer_neutral(Some(responder));
                }
            }
        }

        self.refresh(now);
        IngestOutcome::Applied { key, request_id }
    }

    pub fn decide(&mut self, request_id: &str, decision: SyncReply, now: u64) -> Settlement {
        let key = self.pending.session_of(request_id).map(str::to_string);
        let settlement = self.pending.decide(request_id, decision);
        if settlement.settled() {
            if let Some(key) = key {
                self.clear_pending_marker(&key, request_id);
            }
            self.refresh(now);
        }
        settlement
    }

    pub fn abandon(&mut self, request_id: &str, now: u64) -> bool {
        let key = self.pending.session_of(request_id).map(str::to_string);
        let removed = self.pending.abandon(request_id);
        if removed {
            debug!(
                component = "engine",
                event = "engine.pending.abandoned",
                request_id = %request_id,
            );
            if let Some(key) = key {
                self.clear_pending_marker(&key, request_id);
            }
            self.refresh(now);
        }
        removed
    }

    /// Periodic maintenance: dedup sweep, orphan ending, pruning, republish.
    pub fn tick(&mut self, now: u64) {
        self.seen.sweep(now);
        let pruned = self.table.prune(now, self.config.visibility.ttl_ms());
        if !pruned.is_empty() {
            debug!(
                component = "engine",
                event = "engine.sessions.pruned",
                count = pruned.len(),
            );
        }
        self.refresh(now);
    }

    /// End orphaned starts and republish if the visible list changed.
    pub fn refresh(&mut self, now: u64) -> bool {
        for key in end_orphans(&mut self.table, &self.config.visibility, now) {
            info!(
                component = "engine",
                event = "engine.session.orphan_ended",
                session_key = %key,
            );
        }
        self.publisher
            .publish(visible_summaries(&self.table, &self.config.visibility, now))
    }

    pub fn all_summaries(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self.table.iter().map(|s| s.summary()).collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.key.cmp(&b.key)));
        out
    }

    pub fn pending(&self) -> Vec<PendingInfo> {
        self.pending.list()
    }

    pub fn published(&self) -> Arc<Vec<SessionSummary>> {
        self.publisher.snapshot_arc().load_full()
    }

    fn clear_pending_marker(&mut self, key: &str, request_id: &str) {
        if let Some(session) = self.table.get_mut(key) {
            if session.pending_request_id.as_deref() == Some(request_id) {
                session.pending_request_id = None;
            }
        }
    }

    /// Move the engine onto its own task and return a handle to it.
    pub fn spawn(config: EngineConfig) -> EngineHandle {
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let engine = Engine::new(config);
        let snapshot = engine.publisher.snapshot_arc();
        let revision = engine.publisher.subscribe();

        tokio::spawn(engine_loop(engine, command_rx));

        EngineHandle {
            command_tx,
            snapshot,
            revision,
        }
    }

    fn handle_command(&mut self, cmd: EngineCommand) {
        let now = now_millis();
        match cmd {
            EngineCommand::Ingest {
                event,
                responder,
                reply,
            } => {
                let outcome = self.ingest(*event, responder, now);
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            EngineCommand::Decide {
                request_id,
                decision,
                reply,
            } => {
                let _ = reply.send(self.decide(&request_id, decision, now));
            }
            EngineCommand::Abandon { request_id, reply } => {
                let removed = self.abandon(&request_id, now);
                if let Some(reply) = reply {
                    let _ = reply.send(removed);
                }
            }
            EngineCommand::Tick => self.tick(now),
            EngineCommand::Snapshot { reply } => {
                let _ = reply.send(self.all_summaries());
            }
            EngineCommand::ListPending { reply } => {
                let _ = reply.send(self.pending());
            }
        }
    }
}

fn answer_neutral(responder: Option<oneshot::Sender<SyncReply>>) {
    if let Some(responder) = responder {
        let _ = responder.send(SyncReply::neutral());
    }
}

async fn engine_loop(mut engine: Engine, mut command_rx: mpsc::Receiver<EngineCommand>) {
    let mut ticker = tokio::time::interval(engine.config.tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = command_rx.recv() => match cmd {
                Some(cmd) => engine.handle_command(cmd),
                None => break,
            },
            _ = ticker.tick() => engine.tick(now_millis()),
        }
    }

    debug!(
        component = "engine",
        event = "engine.stopped",
        pending = engine.pending.len(),
    );
}

/// Handle to a running engine (cheap to Clone).
#[derive(Clone)]
pub struct EngineHandle {
    command_tx: mpsc::Sender<EngineCommand>,
    snapshot: Arc<ArcSwap<Vec<SessionSummary>>>,
    revision: watch::Receiver<u64>,
}

impl EngineHandle {
    /// Feed an async event and wait until it has been applied.
    pub async fn ingest(&self, event: HookEvent) -> Result<IngestOutcome, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::Ingest {
            event: Box::new(event),
            responder: None,
            reply: Some(tx),
        })
        .await?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// Feed a sync event. The returned receiver yields the eventual answer.
    pub async fn ingest_sync(
        &self,
        event: HookEvent,
    ) -> Result<(IngestOutcome, oneshot::Receiver<SyncReply>), EngineError> {
        let (responder, answer) = oneshot::channel();
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::Ingest {
            event: Box::new(event),
            responder: Some(responder),
            reply: Some(tx),
        })
        .await?;
        let outcome = rx.await.map_err(|_| EngineError::Closed)?;
        Ok((outcome, answer))
    }

    pub async fn decide(
        &self,
        request_id: impl Into<String>,
        decision: SyncReply,
    ) -> Result<Settlement, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::Decide {
            request_id: request_id.into(),
            decision,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    pub async fn abandon(&self, request_id: impl Into<String>) -> Result<bool, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::Abandon {
            request_id: request_id.into(),
            reply: Some(tx),
        })
        .await?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    pub async fn tick(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Tick).await
    }

    /// Every record, including hidden and ended ones.
    pub async fn snapshot(&self) -> Result<Vec<SessionSummary>, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::Snapshot { reply: tx }).await?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    pub async fn pending(&self) -> Result<Vec<PendingInfo>, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::ListPending { reply: tx }).await?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// Lock-free read of the published list.
    pub fn sessions(&self) -> Arc<Vec<SessionSummary>> {
        self.snapshot.load_full()
    }

    /// Revision counter that changes whenever the published list does.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.clone()
    }

    async fn send(&self, cmd: EngineCommand) -> Result<(), EngineError> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::Closed)
    }
}
