//! Downstream session table.
//!
//! Every streaming connection (MCP Streamable HTTP or legacy SSE) owns a
//! [`SessionLease`]. The lease holds the table entry; dropping it, which
//! happens when the transport closes, removes the entry in the same call.
//! A message addressed to an id without an entry is answered with
//! "session not found" and does not affect any other session.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Wire protocol a downstream session arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    StreamableHttp,
    Sse,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::StreamableHttp => "streamable_http",
            TransportKind::Sse => "sse",
        })
    }
}

/// Open sessions per transport, as reported by `/health`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCounts {
    pub streamable_http: usize,
    pub sse: usize,
}

impl SessionCounts {
    pub fn total(&self) -> usize {
        self.streamable_http + self.sse
    }
}

struct SessionEntry {
    kind: TransportKind,
    /// Inbound message queue, for transports that route by session id.
    inbox: Option<mpsc::UnboundedSender<Value>>,
}

type Entries = RwLock<HashMap<String, SessionEntry>>;

/// Shared table of live downstream sessions.
#[derive(Clone, Default)]
pub struct SessionTable {
    entries: Arc<Entries>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session under a fresh UUID v4 id.
    pub fn open(
        &self,
        kind: TransportKind,
        inbox: Option<mpsc::UnboundedSender<Value>>,
    ) -> SessionLease {
        let id = uuid::Uuid::new_v4().to_string();
        self.entries
            .write()
            .insert(id.clone(), SessionEntry { kind, inbox });
        debug!(session_id = %id, transport = %kind, "session opened");
        SessionLease {
            entries: Arc::clone(&self.entries),
            id,
            kind,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    /// Inbound queue of session `id`, or `None` if it is unknown or closed.
    pub fn inbox(&self, id: &str) -> Option<mpsc::UnboundedSender<Value>> {
        self.entries.read().get(id).and_then(|e| e.inbox.clone())
    }

    pub fn counts(&self) -> SessionCounts {
        let entries = self.entries.read();
        let mut counts = SessionCounts::default();
        for entry in entries.values() {
            match entry.kind {
                TransportKind::StreamableHttp => counts.streamable_http += 1,
                TransportKind::Sse => counts.sse += 1,
            }
        }
        counts
    }
}

/// Ownership of one session table entry.
pub struct SessionLease {
    entries: Arc<Entries>,
    id: String,
    kind: TransportKind,
}

impl SessionLease {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.entries.write().remove(&self.id);
        debug!(session_id = %self.id, transport = %self.kind, "session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_closed_session_is_not_found() {
        let table = SessionTable::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let lease = table.open(TransportKind::Sse, Some(tx));
        let id = lease.id().to_string();

        let inbox = table.inbox(&id).unwrap();
        inbox.send(json!({"method": "ping"})).unwrap();
        assert_eq!(rx.try_recv().unwrap()["method"], "ping");

        drop(lease);
        assert!(!table.contains(&id));
        assert!(table.inbox(&id).is_none());
    }

    #[test]
    fn test_counts_per_transport() {
        let table = SessionTable::new();
        let a = table.open(TransportKind::StreamableHttp, None);
        let _b = table.open(TransportKind::StreamableHttp, None);
        let _c = table.open(TransportKind::Sse, None);
        assert_eq!(
            table.counts(),
            SessionCounts {
                streamable_http: 2,
                sse: 1
            }
        );

        drop(a);
        assert_eq!(table.counts().streamable_http, 1);
        assert_eq!(table.counts().total(), 2);
    }

    #[test]
    fn test_ids_are_unique_uuids() {
        let table = SessionTable::new();
        let a = table.open(TransportKind::Sse, None);
        let b = table.open(TransportKind::Sse, None);
        assert_ne!(a.id(), b.id());
        assert!(uuid::Uuid::parse_str(a.id()).is_ok());
        assert!(table.inbox(a.id()).is_none());
    }

    #[test]
    fn test_unknown_id_leaves_others_intact() {
        let table = SessionTable::new();
        let lease = table.open(TransportKind::Sse, None);
        assert!(!table.contains("not-a-session"));
        assert!(table.contains(lease.id()));
    }

    #[test]
    fn test_counts_serialize_camel_case() {
        let v = serde_json::to_value(SessionCounts {
            streamable_http: 1,
            sse: 0,
        })
        .unwrap();
        assert_eq!(v, json!({"streamableHttp": 1, "sse": 0}));
    }
}
