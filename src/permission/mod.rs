//! Permission gate
//!
//! Tools that mutate external state ask the gate before acting. The gate
//! first consults the session's auto-approval set (and the configured
//! allow-lists); a match grants silently, with no UI prompt. Otherwise it
//! publishes a permission request on the bus and parks the caller on a
//! single-slot rendezvous until the UI resolves it. The decision travels
//! back through the rendezvous, never through the bus.

use crate::bus::{Bus, EventKind};
use crate::db::Store;
use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A pending request for user approval of one tool action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    pub tool: String,
    pub action: String,
    pub params: Value,
    pub path: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    AllowOnce,
    AllowSession,
    Deny,
}

impl Decision {
    pub fn allowed(self) -> bool {
        !matches!(self, Decision::Deny)
    }
}

struct PendingRequest {
    session_id: String,
    tx: oneshot::Sender<Decision>,
}

/// Request/response rendezvous between tools and the UI.
pub struct PermissionGate {
    store: Arc<Store>,
    bus: Arc<Bus>,
    /// Configured allow-list: tool name to path prefixes granted without
    /// prompting, loaded once from config.
    config_allow: HashMap<String, Vec<String>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl PermissionGate {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<Bus>,
        config_allow: HashMap<String, Vec<String>>,
    ) -> Self {
        Self {
            store,
            bus,
            config_allow,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Ask for permission. Suspends until the UI resolves the request,
    /// unless the session allow-list or the configured allow-list already
    /// covers it. Cancellation while waiting resolves to deny.
    pub async fn request(
        &self,
        session_id: &str,
        tool: &str,
        action: &str,
        params: Value,
        path: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Decision> {
        if let Some(p) = path.as_deref() {
            if self.config_allows(tool, p) {
                return Ok(Decision::AllowOnce);
            }
            if self.store.has_approval(session_id, tool, p).await? {
                return Ok(Decision::AllowOnce);
            }
        }

        let request = PermissionRequest {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            tool: tool.to_string(),
            action: action.to_string(),
            params,
            path: path.clone(),
            created_at: Utc::now(),
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            request.id.clone(),
            PendingRequest {
                session_id: session_id.to_string(),
                tx,
            },
        );
        self.bus
            .permissions
            .publish(EventKind::Created, request.clone());
        tracing::debug!(
            session_id,
            tool,
            action,
            path = path.as_deref().unwrap_or(""),
            "Permission requested"
        );

        let decision = tokio::select! {
            _ = cancel.cancelled() => {
                self.pending.lock().remove(&request.id);
                Decision::Deny
            }
            resolved = rx => resolved.unwrap_or(Decision::Deny),
        };

        if decision == Decision::AllowSession {
            if let Some(p) = path.as_deref() {
                self.store.add_approval(session_id, tool, p).await?;
            }
        }
        self.bus.permissions.publish(EventKind::Deleted, request);
        Ok(decision)
    }

    /// Resolve a pending request. Returns false when the request is
    /// unknown (already resolved or cancelled).
    pub fn resolve(&self, request_id: &str, decision: Decision) -> bool {
        match self.pending.lock().remove(request_id) {
            Some(pending) => pending.tx.send(decision).is_ok(),
            None => false,
        }
    }

    /// Deny every request still pending for a session. Used when the
    /// session's run is torn down.
    pub fn deny_session(&self, session_id: &str) {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        for p in drained {
            let _ = p.tx.send(Decision::Deny);
        }
    }

    fn config_allows(&self, tool: &str, path: &str) -> bool {
        self.config_allow
            .get(tool)
            .map(|prefixes| prefixes.iter().any(|pre| path.starts_with(pre.as_str())))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn gate() -> (Arc<PermissionGate>, Arc<Bus>, Arc<Store>) {
        let bus = Arc::new(Bus::new());
        let store = Arc::new(Store::in_memory(bus.clone()).await.unwrap());
        let gate = Arc::new(PermissionGate::new(
            store.clone(),
            bus.clone(),
            HashMap::new(),
        ));
        (gate, bus, store)
    }

    #[tokio::test]
    async fn allow_once_resolves_waiting_caller() {
        let (gate, bus, store) = gate().await;
        let session = store.create_session(None).await.unwrap();
        let mut prompts = bus.permissions.subscribe();
        let cancel = CancellationToken::new();

        let waiter = {
            let gate = gate.clone();
            let sid = session.id.clone();
            tokio::spawn(async move {
                gate.request(&sid, "write", "write file", json!({}), Some("src/a.rs".into()), &cancel)
                    .await
                    .unwrap()
            })
        };

        let prompt = prompts.recv().await.unwrap();
        assert!(gate.resolve(&prompt.payload.id, Decision::AllowOnce));
        assert_eq!(waiter.await.unwrap(), Decision::AllowOnce);
    }

    #[tokio::test]
    async fn allow_session_skips_future_prompts() {
        let (gate, bus, store) = gate().await;
        let session = store.create_session(None).await.unwrap();
        let mut prompts = bus.permissions.subscribe();
        let cancel = CancellationToken::new();

        let waiter = {
            let gate = gate.clone();
            let sid = session.id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                gate.request(&sid, "write", "write file", json!({}), Some("src/a.rs".into()), &cancel)
                    .await
                    .unwrap()
            })
        };
        let prompt = prompts.recv().await.unwrap();
        gate.resolve(&prompt.payload.id, Decision::AllowSession);
        assert_eq!(waiter.await.unwrap(), Decision::AllowSession);

        // Matching request auto-grants with no further bus prompt.
        let decision = gate
            .request(&session.id, "write", "write file", json!({}), Some("src/a.rs".into()), &cancel)
            .await
            .unwrap();
        assert_eq!(decision, Decision::AllowOnce);
        // Only the Deleted event of the first request remains queued.
        let next = prompts.try_recv().unwrap();
        assert_eq!(next.kind, EventKind::Deleted);
        assert!(prompts.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancellation_unblocks_with_deny() {
        let (gate, _bus, store) = gate().await;
        let session = store.create_session(None).await.unwrap();
        let cancel = CancellationToken::new();

        let waiter = {
            let gate = gate.clone();
            let sid = session.id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                gate.request(&sid, "shell", "run command", json!({}), Some(".".into()), &cancel)
                    .await
                    .unwrap()
            })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), Decision::Deny);
    }

    #[tokio::test]
    async fn config_allow_list_grants_without_prompt() {
        let bus = Arc::new(Bus::new());
        let store = Arc::new(Store::in_memory(bus.clone()).await.unwrap());
        let mut allow = HashMap::new();
        allow.insert("write".to_string(), vec!["build/".to_string()]);
        let gate = PermissionGate::new(store.clone(), bus.clone(), allow);
        let session = store.create_session(None).await.unwrap();
        let cancel = CancellationToken::new();

        let decision = gate
            .request(&session.id, "write", "write file", json!({}), Some("build/out.txt".into()), &cancel)
            .await
            .unwrap();
        assert_eq!(decision, Decision::AllowOnce);
    }
}
