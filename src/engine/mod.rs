//! Processing orchestrator.
//!
//! Drives a message through parse → validate → dispatch → respond,
//! committing each state transition before the next stage begins. A
//! crash mid-pipeline leaves the message in a well-defined state and
//! `process_message` resumes from wherever it stopped, so delivery can
//! be at-least-once: the RECEIVED→PROCESSING compare-and-set is the
//! idempotency guard.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alert::{AlertKind, AlertSink, OperationalAlert};
use crate::config::EngineConfig;
use crate::dispatch::ActionDispatcher;
use crate::error::{Error, StoreError};
use crate::guarantee::GuaranteeStore;
use crate::message::{Message, MessageKind, MessageStatus};
use crate::parser::ParserRegistry;
use crate::refs::ReferenceGenerator;
use crate::respond::ResponseGenerator;
use crate::retry::{RetryCoordinator, RetryPolicy};
use crate::store::MessageStore;
use crate::validate::FieldValidator;

/// The message-processing engine.
///
/// Construction wires the default parser and handler registries;
/// `receive` is the synchronous ingestion entry point and the spawn_*
/// methods start the asynchronous machinery.
pub struct ProcessingEngine {
    store: Arc<dyn MessageStore>,
    parsers: ParserRegistry,
    validator: FieldValidator,
    dispatcher: ActionDispatcher,
    responder: ResponseGenerator,
    retries: RetryCoordinator,
    alerts: Arc<dyn AlertSink>,
    refs: Arc<dyn ReferenceGenerator>,
    config: EngineConfig,
    queue_tx: mpsc::Sender<Uuid>,
    queue_rx: Arc<Mutex<mpsc::Receiver<Uuid>>>,
}

impl ProcessingEngine {
    pub fn new(
        store: Arc<dyn MessageStore>,
        guarantees: Arc<dyn GuaranteeStore>,
        refs: Arc<dyn ReferenceGenerator>,
        alerts: Arc<dyn AlertSink>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        let dispatcher = ActionDispatcher::with_defaults(guarantees, refs.clone());
        let responder = ResponseGenerator::new(store.clone(), refs.clone());
        let retries = RetryCoordinator::new(
            store.clone(),
            alerts.clone(),
            RetryPolicy::from_config(&config),
        );

        Arc::new(Self {
            store,
            parsers: ParserRegistry::with_defaults(),
            validator: FieldValidator::new(),
            dispatcher,
            responder,
            retries,
            alerts,
            refs,
            config,
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
        })
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Ingestion entry point: persist at RECEIVED and enqueue.
    ///
    /// Returns as soon as the message is durable; processing happens on
    /// the worker pool.
    pub async fn receive(&self, raw: &str, kind: MessageKind) -> Result<Message, Error> {
        let now = Utc::now();
        let reference = self.refs.next("MSG");
        let message = Message::inbound(reference, kind, raw, self.config.max_retries, now);
        self.store.insert(message.clone()).await?;
        info!(
            message_id = %message.id,
            reference = %message.reference,
            kind = %kind,
            "Message received"
        );
        self.enqueue(message.id).await;
        Ok(message)
    }

    /// RECEIVED messages plus retry-eligible error messages due at `now`.
    pub async fn messages_for_processing(
        &self,
        now: chrono::DateTime<Utc>,
    ) -> Result<Vec<Message>, Error> {
        self.retries.due(now).await
    }

    /// Manual retry: reset an error message into RECEIVED with a fresh
    /// budget and queue it.
    pub async fn retry(&self, id: Uuid) -> Result<Message, Error> {
        let message = self.retries.manual_retry(id, Utc::now()).await?;
        self.enqueue(id).await;
        Ok(message)
    }

    /// Explicit business-policy rejection. Terminal.
    pub async fn reject(&self, id: Uuid, reason: &str) -> Result<Message, Error> {
        let now = Utc::now();
        let message = self
            .store
            .get(id)
            .await?
            .ok_or(StoreError::NotFound { id })?;
        let rejected = self
            .store
            .transition(id, message.status, MessageStatus::Rejected, now)
            .await?;
        self.store
            .append_note(id, &format!("rejected by policy: {reason}"), now)
            .await?;
        warn!(message_id = %id, reference = %message.reference, reason, "Message rejected");
        Ok(rejected)
    }

    /// Housekeeping: archive a completed or terminal message in place.
    pub async fn archive(&self, id: Uuid) -> Result<Message, Error> {
        let now = Utc::now();
        let message = self
            .store
            .get(id)
            .await?
            .ok_or(StoreError::NotFound { id })?;
        let archived = self
            .store
            .transition(id, message.status, MessageStatus::Archived, now)
            .await?;
        debug!(message_id = %id, "Message archived");
        Ok(archived)
    }

    /// Queue a message id for the worker pool. Losing the send is fine:
    /// the retry scan re-discovers RECEIVED messages.
    async fn enqueue(&self, id: Uuid) {
        if self.queue_tx.send(id).await.is_err() {
            warn!(message_id = %id, "Processing queue closed, scan will pick the message up");
        }
    }

    // ── Pipeline ────────────────────────────────────────────────────

    /// Drive a message through the pipeline from whatever stage it is
    /// currently in. Safe to call repeatedly and concurrently: every
    /// stage transition is a compare-and-set, and a lost race simply
    /// means another worker owns the message.
    pub async fn process_message(&self, id: Uuid) -> Result<(), Error> {
        loop {
            let Some(message) = self.store.get(id).await? else {
                warn!(message_id = %id, "Queued message no longer in store");
                return Ok(());
            };

            match message.status {
                MessageStatus::Received => {
                    match self
                        .store
                        .transition(id, MessageStatus::Received, MessageStatus::Processing, Utc::now())
                        .await
                    {
                        Ok(_) => {}
                        Err(StoreError::StatusConflict { .. }) => {
                            debug!(message_id = %id, "Lost claim race, skipping");
                            return Ok(());
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                MessageStatus::Processing => self.parse_stage(&message).await?,
                MessageStatus::Parsed => self.validate_stage(&message).await?,
                MessageStatus::Validated => self.dispatch_stage(&message).await?,
                MessageStatus::Processed => {
                    if !message.kind.requires_response() {
                        return Ok(());
                    }
                    self.respond_stage(&message).await?;
                }
                // Terminal for this pipeline run
                MessageStatus::Responded
                | MessageStatus::ParseError
                | MessageStatus::ValidationError
                | MessageStatus::ProcessingError
                | MessageStatus::Rejected
                | MessageStatus::Archived => return Ok(()),
            }
        }
    }

    async fn parse_stage(&self, message: &Message) -> Result<(), Error> {
        let now = Utc::now();
        let Some(parser) = self.parsers.get(message.kind) else {
            return self
                .fail(
                    message,
                    MessageStatus::Processing,
                    MessageStatus::ParseError,
                    &format!("no parser registered for kind {}", message.kind),
                    false,
                )
                .await;
        };

        match parser.parse(&message.raw) {
            Ok(parsed) => {
                self.store
                    .set_parsed(message.id, &parsed.fields, &parsed.envelope, now)
                    .await?;
                self.store
                    .transition(message.id, MessageStatus::Processing, MessageStatus::Parsed, now)
                    .await?;
                debug!(message_id = %message.id, "Parsed");
                Ok(())
            }
            Err(e) => {
                self.fail(
                    message,
                    MessageStatus::Processing,
                    MessageStatus::ParseError,
                    &format!("parse failed: {e}"),
                    false,
                )
                .await
            }
        }
    }

    async fn validate_stage(&self, message: &Message) -> Result<(), Error> {
        let now = Utc::now();
        let Some(fields) = &message.fields else {
            return self
                .fail(
                    message,
                    MessageStatus::Parsed,
                    MessageStatus::ValidationError,
                    "parsed fields missing from store",
                    false,
                )
                .await;
        };

        let violations = self.validator.validate(fields);
        if violations.is_empty() {
            self.store
                .transition(message.id, MessageStatus::Parsed, MessageStatus::Validated, now)
                .await?;
            debug!(message_id = %message.id, "Validated");
            Ok(())
        } else {
            let joined = violations
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            self.fail(
                message,
                MessageStatus::Parsed,
                MessageStatus::ValidationError,
                &format!("validation failed: {joined}"),
                false,
            )
            .await
        }
    }

    async fn dispatch_stage(&self, message: &Message) -> Result<(), Error> {
        let now = Utc::now();
        let Some(handler) = self.dispatcher.get(message.kind) else {
            return self
                .fail(
                    message,
                    MessageStatus::Validated,
                    MessageStatus::ProcessingError,
                    &format!("no handler registered for kind {}", message.kind),
                    false,
                )
                .await;
        };
        let Some(fields) = &message.fields else {
            return self
                .fail(
                    message,
                    MessageStatus::Validated,
                    MessageStatus::ProcessingError,
                    "parsed fields missing from store",
                    false,
                )
                .await;
        };

        match handler.process(message, fields).await {
            Ok(outcome) => {
                if let Some(guarantee_id) = outcome.guarantee_id {
                    self.store.link_guarantee(message.id, guarantee_id, now).await?;
                }
                if let Some(amendment_id) = outcome.amendment_id {
                    self.store.link_amendment(message.id, amendment_id, now).await?;
                }
                if let Some(note) = outcome.note {
                    self.store.append_note(message.id, &note, now).await?;
                }
                self.store
                    .transition(message.id, MessageStatus::Validated, MessageStatus::Processed, now)
                    .await?;
                debug!(message_id = %message.id, "Business action applied");
                Ok(())
            }
            Err(e) => {
                let permanent = e.is_permanent();
                self.fail(
                    message,
                    MessageStatus::Validated,
                    MessageStatus::ProcessingError,
                    &format!("dispatch failed: {e}"),
                    permanent,
                )
                .await
            }
        }
    }

    async fn respond_stage(&self, message: &Message) -> Result<(), Error> {
        let now = Utc::now();
        self.responder.generate(message, now).await?;
        match self
            .store
            .transition(message.id, MessageStatus::Processed, MessageStatus::Responded, now)
            .await
        {
            Ok(_) => Ok(()),
            // Another worker already moved it on
            Err(StoreError::StatusConflict { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Record a stage failure: diagnostic, error transition, retry
    /// bookkeeping. The error never propagates past the orchestrator —
    /// it lives on the message.
    async fn fail(
        &self,
        message: &Message,
        from: MessageStatus,
        to: MessageStatus,
        diagnostic: &str,
        permanent: bool,
    ) -> Result<(), Error> {
        let now = Utc::now();
        warn!(
            message_id = %message.id,
            reference = %message.reference,
            status = %to,
            permanent,
            diagnostic,
            "Stage failed"
        );
        self.store.set_error(message.id, diagnostic, now).await?;
        let failed = match self.store.transition(message.id, from, to, now).await {
            Ok(m) => m,
            Err(StoreError::StatusConflict { .. }) => {
                debug!(message_id = %message.id, "Failure already recorded elsewhere");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        self.retries.record_failure(&failed, permanent, now).await
    }

    // ── Background machinery ────────────────────────────────────────

    /// Start the worker pool draining the processing queue.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|worker| {
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    debug!(worker, "Processing worker started");
                    loop {
                        let id = { engine.queue_rx.lock().await.recv().await };
                        let Some(id) = id else {
                            debug!(worker, "Processing queue closed, worker exiting");
                            break;
                        };
                        if let Err(e) = engine.process_message(id).await {
                            error!(worker, message_id = %id, error = %e, "Processing failed");
                        }
                    }
                })
            })
            .collect()
    }

    /// Start the periodic retry scan: resubmits due error messages and
    /// re-queues anything sitting in RECEIVED (crash recovery).
    pub fn spawn_retry_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_secs = engine.config.retry_scan_interval.as_secs(),
                "Retry scan loop started"
            );
            let mut tick = tokio::time::interval(engine.config.retry_scan_interval);
            loop {
                tick.tick().await;
                engine.run_retry_scan(Utc::now()).await;
            }
        })
    }

    /// One retry-scan cycle at an explicit `now`, so tests control the
    /// clock instead of sleeping through the fixed delay.
    pub async fn run_retry_scan(&self, now: chrono::DateTime<Utc>) {
        let due = match self.retries.due(now).await {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "Retry scan query failed");
                return;
            }
        };
        for message in due {
            if message.status.is_error() {
                if let Err(e) = self.retries.resubmit(&message, now).await {
                    warn!(message_id = %message.id, error = %e, "Resubmit failed");
                    continue;
                }
            }
            self.enqueue(message.id).await;
        }
    }

    /// Start the stuck-message sweep: anything in PROCESSING past the
    /// timeout is flagged for manual review, never auto-retried —
    /// partial aggregate mutation may already have occurred.
    pub fn spawn_stuck_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_secs = engine.config.stuck_sweep_interval.as_secs(),
                "Stuck-message sweep started"
            );
            let mut tick = tokio::time::interval(engine.config.stuck_sweep_interval);
            loop {
                tick.tick().await;
                engine.run_stuck_sweep(Utc::now()).await;
            }
        })
    }

    /// One stuck-sweep cycle at an explicit `now`.
    pub async fn run_stuck_sweep(&self, now: chrono::DateTime<Utc>) {
        let cutoff = now
            - chrono::Duration::from_std(self.config.processing_timeout).unwrap_or_default();
        let stuck = match self.store.stuck_in_processing(cutoff).await {
            Ok(stuck) => stuck,
            Err(e) => {
                warn!(error = %e, "Stuck-message query failed");
                return;
            }
        };
        for message in stuck {
            self.alerts
                .alert(OperationalAlert {
                    kind: AlertKind::StuckMessage,
                    message_id: message.id,
                    reference: message.reference.clone(),
                    message_kind: message.kind,
                    detail: format!(
                        "in processing since {:?}; flagged for manual review",
                        message.processing_started_at
                    ),
                })
                .await;
        }
    }
}
