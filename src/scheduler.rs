//! Reconciliation scheduling against the remote ledger client.
//!
//! The scheduler cycles Syncing -> Idle(delay) -> Reconciling -> Idle(...)
//! for the lifetime of the process. It never invents its own backoff: every
//! delay comes from the client. A transport error simply stalls the cycle
//! until something else kicks a sync.

use crate::engine::EngineEvent;
use crate::remote::{
    AlphaState, ClientFactory, ClientState, LedgerClient, LogEntry, SyncResponse,
};
use crate::synopsis::{trim_expired, Synopsis, RETENTION_MS};
use crate::writer::{DurableWriter, WriteMode};
use crate::EngineConfig;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub struct Scheduler {
    factory: Option<Arc<dyn ClientFactory>>,
    client: Option<Arc<dyn LedgerClient>>,

    /// Remote-reported activity, bounded to the retention window.
    logs: Vec<LogEntry>,

    pub(crate) reconcile_stamp: Option<i64>,
    pub(crate) status_text: Option<String>,
    pub(crate) button_label: Option<String>,
    pub(crate) button_url: Option<String>,

    /// Set on the first successful exchange with the remote client.
    pub(crate) enabled: bool,

    payment_notice: bool,
    notice_armed: bool,
    notice_interval: Duration,

    top_count: usize,
    state_path: PathBuf,
    alpha_path: PathBuf,
    log_path: PathBuf,
}

impl Scheduler {
    pub fn new(config: &EngineConfig, factory: Option<Arc<dyn ClientFactory>>) -> Self {
        Self {
            factory,
            client: None,
            logs: Vec::new(),
            reconcile_stamp: None,
            status_text: None,
            button_label: None,
            button_url: None,
            enabled: false,
            payment_notice: false,
            notice_armed: false,
            notice_interval: config.payment_notice_interval,
            top_count: config.top_publishers,
            state_path: config.state_path(),
            alpha_path: config.alpha_path(),
            log_path: config.log_path(),
        }
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    /// Remote activity entries currently inside the retention window.
    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    /// Load persisted client state and construct the remote client handle.
    ///
    /// Prefers the canonical state file; a missing state file falls back to
    /// the legacy alpha file. Read and parse failures are logged cold
    /// starts, never fatal: the engine keeps tracking visits without a
    /// client.
    pub async fn init(&mut self) {
        let Some(factory) = self.factory.clone() else {
            debug!("no client factory configured, running tracking-only");
            return;
        };

        match fs::read(&self.state_path).await {
            Ok(bytes) => {
                match serde_json::from_slice::<ClientState>(&bytes) {
                    Ok(state) => {
                        info!(path = %self.state_path.display(), "found client state");
                        self.reconcile_stamp = state.reconcile_stamp;
                        let persona_id = state.persona_id.clone();
                        let options = state.options.clone();
                        self.client =
                            Some(factory.create(persona_id.as_deref(), &options, Some(state)));
                    }
                    Err(e) => {
                        warn!(path = %self.state_path.display(), error = %e,
                              "client state parse error, starting cold");
                    }
                }
                return;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.state_path.display(), error = %e, "client state read error");
            }
        }

        match fs::read(&self.alpha_path).await {
            Ok(bytes) => match serde_json::from_slice::<AlphaState>(&bytes) {
                Ok(alpha) => {
                    info!(path = %self.alpha_path.display(), "found alpha bootstrap");
                    self.client = Some(factory.create(
                        alpha.client.persona_id.as_deref(),
                        &alpha.client.options,
                        None,
                    ));
                }
                Err(e) => {
                    warn!(path = %self.alpha_path.display(), error = %e, "alpha parse error");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.alpha_path.display(), error = %e, "alpha read error");
            }
        }
    }

    /// Kick a sync; the outcome re-enters the loop as `SyncDone`.
    pub(crate) fn start_sync(&self, tx: &mpsc::Sender<EngineEvent>) {
        let Some(client) = self.client.clone() else {
            return;
        };
        debug!("starting ledger sync");
        let tx = tx.clone();
        tokio::spawn(async move {
            let outcome = client.sync().await;
            let _ = tx.send(EngineEvent::SyncDone(outcome)).await;
        });
    }

    /// Process a completed sync or reconcile call.
    pub(crate) fn on_sync_done(
        &mut self,
        outcome: crate::Result<SyncResponse>,
        synopsis: &Synopsis,
        writer: &DurableWriter,
        tx: &mpsc::Sender<EngineEvent>,
        now_ms: i64,
    ) {
        let Some(client) = self.client.clone() else {
            return;
        };
        let entries = client.report();

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                // Stall: the client dictates retry pacing, not us.
                warn!(error = %e, "ledger client error");
                return;
            }
        };
        debug!(
            result = response.state.is_some(),
            delay_ms = response.delay_ms,
            "ledger client callback"
        );

        self.enabled = true;

        if !entries.is_empty() {
            let mut fresh = entries.clone();
            self.logs.extend(entries);
            let cutoff = now_ms - RETENTION_MS;
            trim_expired(&mut self.logs, |entry| entry.when > cutoff);
            if let Some(state) = &response.state {
                fresh.push(LogEntry {
                    who: "callback".to_string(),
                    what: serde_json::to_value(state).unwrap_or(Value::Null),
                    when: now_ms,
                });
            }
            writer.write(&self.log_path, &fresh, WriteMode::Append);
        }

        match response.state {
            None => self.run(response.delay_ms, synopsis, tx),
            Some(state) => {
                self.button_label = None;
                self.button_url = None;
                self.reconcile_stamp = state.reconcile_stamp;

                if state.wallet.is_some() {
                    if let Some(payment) = &state.this_payment {
                        self.button_label = Some("Reconcile".to_string());
                        self.button_url = Some(payment.payment_url.clone());
                        self.arm_payment_notice(tx);
                    }
                } else if state.persona.is_some() {
                    let verb = if state.properties.is_some() {
                        if state.options.wallet { "registered" } else { "created" }
                    } else if state.options.wallet {
                        "register"
                    } else {
                        "create"
                    };
                    self.status_text = Some(if state.properties.is_some() {
                        format!("Anonymously {} wallet", verb)
                    } else {
                        format!("Preparing to anonymously {} wallet", verb)
                    });
                } else {
                    self.status_text = Some("Initializing".to_string());
                }

                // The next cycle is scheduled only once the state write
                // lands; a dropped (in-flight) write skips this cycle.
                let delay_ms = response.delay_ms;
                if let Some(done) = writer.write(&self.state_path, &state, WriteMode::Replace) {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let _ = done.await;
                        let _ = tx.send(EngineEvent::ScheduleRun(delay_ms)).await;
                    });
                }
            }
        }

        if response.more_available {
            self.run(0, synopsis, tx);
        }
    }

    /// Wait out `delay_ms` before the next sync, or reconcile right now
    /// when the client is ready.
    pub(crate) fn run(&self, delay_ms: u64, synopsis: &Synopsis, tx: &mpsc::Sender<EngineEvent>) {
        debug!(delay_ms, "scheduler run");
        let Some(client) = self.client.clone() else {
            return;
        };

        if delay_ms > 0 {
            let tx = tx.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(delay_ms)).await;
                let _ = tx.send(EngineEvent::SyncDue).await;
            });
            return;
        }

        if client.is_ready_to_reconcile() {
            let top = synopsis.top_n(self.top_count);
            let tx = tx.clone();
            tokio::spawn(async move {
                let outcome = client.reconcile(top).await;
                let _ = tx.send(EngineEvent::SyncDone(outcome)).await;
            });
        } else if let Some(ms) = client.time_until_reconcile() {
            debug!(ms, "not ready to reconcile");
        }
    }

    /// Arm the recurring payment notice timer the first time payment info
    /// shows up. Each tick re-raises the flag until a status query consumes
    /// it.
    fn arm_payment_notice(&mut self, tx: &mpsc::Sender<EngineEvent>) {
        if self.notice_armed {
            return;
        }
        self.notice_armed = true;
        let interval = self.notice_interval;
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                sleep(interval).await;
                if tx.send(EngineEvent::PaymentNotice).await.is_err() {
                    return;
                }
            }
        });
    }

    pub(crate) fn raise_payment_notice(&mut self) {
        self.payment_notice = true;
    }

    /// Consume-on-read: the flag clears once a status query observes it.
    pub(crate) fn take_payment_notice(&mut self) -> bool {
        std::mem::take(&mut self.payment_notice)
    }
}
