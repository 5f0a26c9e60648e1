//! Remote ledger client seam.
//!
//! The engine only ever uses five operations of the payment backend: sync,
//! readiness, reconcile, time-until-reconcile, and the activity report. The
//! client's state is an opaque blob from the engine's point of view: known
//! fields are typed for the scheduler's benefit, everything else rides in a
//! flattened remainder so persisted state round-trips losslessly.

use crate::synopsis::TopPublisher;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

/// State blob owned by the remote client. Write-through: whatever a
/// sync/reconcile call returns fully replaces the persisted copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_id: Option<String>,

    #[serde(default)]
    pub options: ClientOptions,

    /// Epoch milliseconds of the next scheduled reconciliation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconcile_stamp: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub this_payment: Option<PaymentInfo>,

    /// Everything the engine does not interpret.
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

/// Options the client was created with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientOptions {
    /// True when attaching to an existing wallet rather than creating one.
    #[serde(default)]
    pub wallet: bool,

    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

/// Pending payment info surfaced by the client once a wallet is funded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentInfo {
    #[serde(rename = "paymentURL")]
    pub payment_url: String,

    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

/// Shape of the legacy bootstrap file: `{ "client": { ... } }`.
#[derive(Debug, Clone, Deserialize)]
pub struct AlphaState {
    pub client: ClientState,
}

/// One entry of the client's activity report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub who: String,
    pub what: Value,
    /// Epoch milliseconds.
    pub when: i64,
}

/// Outcome of a sync or reconcile call.
#[derive(Debug, Clone, Default)]
pub struct SyncResponse {
    /// Replacement client state, absent when the call carried no result.
    pub state: Option<ClientState>,

    /// How long the client wants us to wait before the next sync.
    pub delay_ms: u64,

    /// More work is immediately available; chase it without waiting out
    /// the delay.
    pub more_available: bool,
}

/// The remote ledger client operations the engine relies on.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn sync(&self) -> crate::Result<SyncResponse>;

    fn is_ready_to_reconcile(&self) -> bool;

    async fn reconcile(&self, top: Vec<TopPublisher>) -> crate::Result<SyncResponse>;

    /// Milliseconds until the client will be ready, `None` when unknown.
    fn time_until_reconcile(&self) -> Option<u64>;

    /// Activity entries accumulated since the last call.
    fn report(&self) -> Vec<LogEntry>;
}

/// Builds client handles from persisted identity and state.
pub trait ClientFactory: Send + Sync {
    fn create(
        &self,
        persona_id: Option<&str>,
        options: &ClientOptions,
        prior: Option<ClientState>,
    ) -> std::sync::Arc<dyn LedgerClient>;
}

// ─── Test double ─────────────────────────────────────────────────────

/// Scriptable ledger client for tests and offline embedders.
///
/// Queue responses with [`push_sync`](Self::push_sync) /
/// [`push_reconcile`](Self::push_reconcile); each call pops one. An empty
/// queue yields an empty-handed success with a large delay so schedulers
/// under test go quiet instead of spinning.
#[derive(Default)]
pub struct MockLedgerClient {
    sync_responses: Mutex<VecDeque<crate::Result<SyncResponse>>>,
    reconcile_responses: Mutex<VecDeque<crate::Result<SyncResponse>>>,
    report_entries: Mutex<Vec<LogEntry>>,
    ready: Mutex<bool>,
    time_until: Mutex<Option<u64>>,
    reconcile_calls: Mutex<Vec<Vec<TopPublisher>>>,
}

impl MockLedgerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_sync(&self, response: crate::Result<SyncResponse>) {
        lock(&self.sync_responses).push_back(response);
    }

    pub fn push_reconcile(&self, response: crate::Result<SyncResponse>) {
        lock(&self.reconcile_responses).push_back(response);
    }

    pub fn set_ready(&self, ready: bool) {
        *lock(&self.ready) = ready;
    }

    pub fn set_time_until_reconcile(&self, ms: Option<u64>) {
        *lock(&self.time_until) = ms;
    }

    pub fn set_report(&self, entries: Vec<LogEntry>) {
        *lock(&self.report_entries) = entries;
    }

    /// Top-N lists passed to `reconcile`, in call order.
    pub fn reconcile_calls(&self) -> Vec<Vec<TopPublisher>> {
        lock(&self.reconcile_calls).clone()
    }

    fn pop(queue: &Mutex<VecDeque<crate::Result<SyncResponse>>>) -> crate::Result<SyncResponse> {
        lock(queue).pop_front().unwrap_or_else(|| {
            Ok(SyncResponse {
                state: None,
                delay_ms: 24 * 60 * 60 * 1000,
                more_available: false,
            })
        })
    }
}

#[async_trait]
impl LedgerClient for MockLedgerClient {
    async fn sync(&self) -> crate::Result<SyncResponse> {
        Self::pop(&self.sync_responses)
    }

    fn is_ready_to_reconcile(&self) -> bool {
        *lock(&self.ready)
    }

    async fn reconcile(&self, top: Vec<TopPublisher>) -> crate::Result<SyncResponse> {
        lock(&self.reconcile_calls).push(top);
        Self::pop(&self.reconcile_responses)
    }

    fn time_until_reconcile(&self) -> Option<u64> {
        *lock(&self.time_until)
    }

    fn report(&self) -> Vec<LogEntry> {
        std::mem::take(&mut lock(&self.report_entries))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_client_state_round_trip_is_lossless() {
        let raw = json!({
            "personaId": "persona-123",
            "options": { "wallet": true, "server": "https://ledger.example" },
            "reconcileStamp": 1_700_000_000_000i64,
            "wallet": { "address": "abc" },
            "thisPayment": { "paymentURL": "https://pay.example/x", "amount": "5.0" },
            "ruleset": [ { "condition": "x", "consequent": "y" } ],
        });

        let state: ClientState = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(state.persona_id.as_deref(), Some("persona-123"));
        assert!(state.options.wallet);
        assert_eq!(state.reconcile_stamp, Some(1_700_000_000_000));
        assert_eq!(
            state.this_payment.as_ref().unwrap().payment_url,
            "https://pay.example/x"
        );
        // Unknown fields survive the round trip.
        let back = serde_json::to_value(&state).unwrap();
        assert_eq!(back.get("ruleset"), raw.get("ruleset"));
        assert_eq!(
            back.get("options").and_then(|o| o.get("server")),
            raw.get("options").and_then(|o| o.get("server"))
        );
    }

    #[test]
    fn test_alpha_state_shape() {
        let raw = json!({ "client": { "personaId": "p", "options": { "wallet": false } } });
        let alpha: AlphaState = serde_json::from_value(raw).unwrap();
        assert_eq!(alpha.client.persona_id.as_deref(), Some("p"));
        assert!(!alpha.client.options.wallet);
    }

    #[tokio::test]
    async fn test_mock_pops_in_order_and_records_reconciles() {
        let mock = MockLedgerClient::new();
        mock.push_sync(Ok(SyncResponse {
            state: None,
            delay_ms: 100,
            more_available: true,
        }));
        mock.push_sync(Err(crate::DwellError::Remote("offline".to_string())));

        let first = mock.sync().await.unwrap();
        assert_eq!(first.delay_ms, 100);
        assert!(first.more_available);
        assert!(mock.sync().await.is_err());
        // Drained queue falls back to a quiet response.
        assert!(mock.sync().await.unwrap().state.is_none());

        mock.reconcile(Vec::new()).await.unwrap();
        assert_eq!(mock.reconcile_calls().len(), 1);
    }

    #[test]
    fn test_report_drains() {
        let mock = MockLedgerClient::new();
        mock.set_report(vec![LogEntry {
            who: "sync".to_string(),
            what: json!("ok"),
            when: 1,
        }]);
        assert_eq!(mock.report().len(), 1);
        assert!(mock.report().is_empty());
    }
}
