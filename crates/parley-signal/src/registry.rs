//! Participant registry.
//!
//! Tracks which names are joined, which connection owns each name and whether
//! the participant is in a call. One `RwLock` guards both indexes and every
//! session's call flag:
//! - multi-step checks (`begin_call`, `end_call`, `join`) run under a single
//!   write guard
//! - reads (`snapshot`, `signaler_for`) take the read guard
//! - nothing here sends on a socket; callers get cloned [`Signaler`]s and send
//!   after the guard is dropped

use std::collections::HashMap;
use std::fmt;

use parley_common::ActiveUser;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::signal::Signaler;

/// Identity of one transport connection, minted by the gateway on upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Transport attachment of a session.
#[derive(Debug, Clone)]
pub enum Link {
    /// Session record exists but no transport was ever attached.
    Unbound,
    /// Attached to a connection whose outbox is still open.
    Live(Signaler),
    /// The connection's writer failed; waiting for the gateway to evict it.
    Stale,
}

impl Link {
    pub fn state(&self) -> LinkState {
        match self {
            Link::Unbound => LinkState::Unbound,
            Link::Live(_) => LinkState::Live,
            Link::Stale => LinkState::Stale,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Link::Live(_))
    }

    pub fn signaler(&self) -> Option<&Signaler> {
        match self {
            Link::Live(signaler) => Some(signaler),
            Link::Unbound | Link::Stale => None,
        }
    }
}

/// [`Link`] without the handle, for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Unbound,
    Live,
    Stale,
}

/// Per-participant state.
#[derive(Debug)]
pub struct Session {
    pub name: String,
    pub link: Link,
    pub in_call: bool,
    pub connection: Option<ConnectionId>,
}

impl Session {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            link: Link::Unbound,
            in_call: false,
            connection: None,
        }
    }

    fn bind(&mut self, connection: ConnectionId, signaler: Signaler) {
        self.link = Link::Live(signaler);
        self.connection = Some(connection);
        self.in_call = false;
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            name: self.name.clone(),
            in_call: self.in_call,
            link: self.link.state(),
            connection: self.connection,
        }
    }
}

/// Read-only copy of a [`Session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub name: String,
    pub in_call: bool,
    pub link: LinkState,
    pub connection: Option<ConnectionId>,
}

/// Why a registry operation refused to change state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("message has no {0}")]
    MissingField(&'static str),
    #[error("name {0} is already bound to a live connection")]
    NameInUse(String),
    #[error("connection already joined as {0}")]
    AlreadyJoined(String),
    #[error("sender {0} is not joined")]
    UnknownSender(String),
    #[error("receiver {0} is not joined")]
    UnknownReceiver(String),
    #[error("{0} is already in a call")]
    Busy(String),
}

#[derive(Debug, Default)]
struct Inner {
    by_name: HashMap<String, Session>,
    by_connection: HashMap<ConnectionId, String>,
}

impl Inner {
    fn set_in_call(&mut self, names: [&str; 2], in_call: bool) {
        for name in names {
            if let Some(session) = self.by_name.get_mut(name) {
                session.in_call = in_call;
            }
        }
    }

    fn live_signaler(&self, name: &str) -> Option<Signaler> {
        self.by_name
            .get(name)
            .and_then(|session| session.link.signaler().cloned())
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `connection`.
    ///
    /// Succeeds when the name is free or its previous session is no longer
    /// live; the previous session and its reverse-index entry are replaced.
    pub async fn join(
        &self,
        name: &str,
        connection: ConnectionId,
        signaler: Signaler,
    ) -> Result<(), Rejection> {
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.by_connection.get(&connection) {
            if existing != name {
                return Err(Rejection::AlreadyJoined(existing.clone()));
            }
        }

        if let Some(session) = inner.by_name.get(name) {
            if session.link.is_live() {
                return Err(Rejection::NameInUse(name.to_string()));
            }
        }

        if let Some(previous) = inner.by_name.remove(name) {
            debug!(
                "replacing {:?} session for {} to allow rejoin",
                previous.link.state(),
                name
            );
            if let Some(old_connection) = previous.connection {
                inner.by_connection.remove(&old_connection);
            }
        }

        let mut session = Session::new(name);
        session.bind(connection, signaler);
        inner.by_name.insert(name.to_string(), session);
        inner.by_connection.insert(connection, name.to_string());
        Ok(())
    }

    pub async fn lookup(&self, name: &str) -> Option<SessionView> {
        self.inner.read().await.by_name.get(name).map(Session::view)
    }

    /// Name currently owned by `connection`.
    pub async fn name_of(&self, connection: ConnectionId) -> Option<String> {
        self.inner.read().await.by_connection.get(&connection).cloned()
    }

    /// Handle for delivering to `name`, if its session is live.
    pub async fn signaler_for(&self, name: &str) -> Option<Signaler> {
        self.inner.read().await.live_signaler(name)
    }

    /// Current roster, sorted by name.
    pub async fn snapshot(&self) -> Vec<ActiveUser> {
        let inner = self.inner.read().await;
        roster(&inner)
    }

    /// Roster plus the live handles it should be delivered to, taken under one
    /// read guard so both describe the same instant.
    pub async fn roster_with_recipients(&self) -> (Vec<ActiveUser>, Vec<(String, Signaler)>) {
        let inner = self.inner.read().await;
        let recipients = inner
            .by_name
            .values()
            .filter_map(|session| {
                session
                    .link
                    .signaler()
                    .map(|signaler| (session.name.clone(), signaler.clone()))
            })
            .collect();
        (roster(&inner), recipients)
    }

    pub async fn set_busy(&self, name: &str, in_call: bool) {
        if let Some(session) = self.inner.write().await.by_name.get_mut(name) {
            session.in_call = in_call;
        }
    }

    /// Mark both parties busy if both exist and neither is already in a call.
    ///
    /// Returns the receiver's handle (if live) for delivering the `call`.
    pub async fn begin_call(
        &self,
        sender: &str,
        receiver: &str,
    ) -> Result<Option<Signaler>, Rejection> {
        let mut inner = self.inner.write().await;

        let caller = inner
            .by_name
            .get(sender)
            .ok_or_else(|| Rejection::UnknownSender(sender.to_string()))?;
        let callee = inner
            .by_name
            .get(receiver)
            .ok_or_else(|| Rejection::UnknownReceiver(receiver.to_string()))?;
        if caller.in_call {
            return Err(Rejection::Busy(sender.to_string()));
        }
        if callee.in_call {
            return Err(Rejection::Busy(receiver.to_string()));
        }

        inner.set_in_call([sender, receiver], true);
        Ok(inner.live_signaler(receiver))
    }

    /// Clear the busy flag on both parties if both exist.
    ///
    /// Used by `cancelCall` and `hangUp`.
    pub async fn end_call(
        &self,
        sender: &str,
        receiver: &str,
    ) -> Result<Option<Signaler>, Rejection> {
        let mut inner = self.inner.write().await;

        if !inner.by_name.contains_key(sender) {
            return Err(Rejection::UnknownSender(sender.to_string()));
        }
        if !inner.by_name.contains_key(receiver) {
            return Err(Rejection::UnknownReceiver(receiver.to_string()));
        }

        inner.set_in_call([sender, receiver], false);
        Ok(inner.live_signaler(receiver))
    }

    /// Flag the session owned by `connection` as stale. The reverse-index
    /// entry is kept so a later [`Registry::leave`] still evicts it.
    pub async fn mark_stale(&self, connection: ConnectionId) -> bool {
        let mut inner = self.inner.write().await;
        let Some(name) = inner.by_connection.get(&connection).cloned() else {
            return false;
        };
        match inner.by_name.get_mut(&name) {
            Some(session) => {
                session.link = Link::Stale;
                true
            }
            None => false,
        }
    }

    /// Evict whatever session `connection` owns. Returns the evicted name;
    /// `None` if the connection never joined or already left.
    pub async fn leave(&self, connection: ConnectionId) -> Option<String> {
        let mut inner = self.inner.write().await;
        let name = inner.by_connection.remove(&connection)?;
        let owned = inner
            .by_name
            .get(&name)
            .is_some_and(|session| session.connection == Some(connection));
        if owned {
            inner.by_name.remove(&name);
        }
        Some(name)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_name.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.by_name.is_empty()
    }
}

fn roster(inner: &Inner) -> Vec<ActiveUser> {
    let mut users: Vec<ActiveUser> = inner
        .by_name
        .values()
        .map(|session| ActiveUser {
            name: session.name.clone(),
            in_call: session.in_call,
        })
        .collect();
    users.sort_by(|a, b| a.name.cmp(&b.name));
    users
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn signaler() -> Signaler {
        // Receiver is dropped: fine for tests that never deliver.
        Signaler::channel(8).0
    }

    #[tokio::test]
    async fn test_join_and_lookup() {
        let registry = Registry::new();
        let conn = ConnectionId::new();
        registry.join("alice", conn, signaler()).await.unwrap();

        let view = registry.lookup("alice").await.unwrap();
        assert_eq!(view.link, LinkState::Live);
        assert!(!view.in_call);
        assert_eq!(view.connection, Some(conn));
        assert_eq!(registry.name_of(conn).await.as_deref(), Some("alice"));
        assert!(registry.lookup("bob").await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_live_join_rejected() {
        let registry = Registry::new();
        let first = ConnectionId::new();
        let second = ConnectionId::new();
        registry.join("alice", first, signaler()).await.unwrap();

        let err = registry.join("alice", second, signaler()).await.unwrap_err();
        assert_eq!(err, Rejection::NameInUse("alice".into()));
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.name_of(second).await, None);
        assert_eq!(
            registry.lookup("alice").await.unwrap().connection,
            Some(first)
        );
    }

    #[tokio::test]
    async fn test_rejoin_after_stale() {
        let registry = Registry::new();
        let first = ConnectionId::new();
        let second = ConnectionId::new();
        registry.join("alice", first, signaler()).await.unwrap();
        registry.set_busy("alice", true).await;
        assert!(registry.mark_stale(first).await);
        assert_eq!(
            registry.lookup("alice").await.unwrap().link,
            LinkState::Stale
        );

        registry.join("alice", second, signaler()).await.unwrap();
        let view = registry.lookup("alice").await.unwrap();
        assert_eq!(view.connection, Some(second));
        assert_eq!(view.link, LinkState::Live);
        assert!(!view.in_call);

        // Old connection's reverse entry is gone, so its late close is a no-op.
        assert_eq!(registry.name_of(first).await, None);
        assert_eq!(registry.leave(first).await, None);
        assert!(registry.lookup("alice").await.is_some());
    }

    #[tokio::test]
    async fn test_connection_keeps_single_name() {
        let registry = Registry::new();
        let conn = ConnectionId::new();
        registry.join("alice", conn, signaler()).await.unwrap();
        let err = registry.join("bob", conn, signaler()).await.unwrap_err();
        assert_eq!(err, Rejection::AlreadyJoined("alice".into()));
        assert!(registry.lookup("bob").await.is_none());
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let registry = Registry::new();
        let conn = ConnectionId::new();
        registry.join("alice", conn, signaler()).await.unwrap();

        assert_eq!(registry.leave(conn).await.as_deref(), Some("alice"));
        assert_eq!(registry.leave(conn).await, None);
        assert!(registry.is_empty().await);
        assert_eq!(registry.leave(ConnectionId::new()).await, None);
    }

    #[tokio::test]
    async fn test_call_symmetry() {
        let registry = Registry::new();
        registry
            .join("alice", ConnectionId::new(), signaler())
            .await
            .unwrap();
        registry
            .join("bob", ConnectionId::new(), signaler())
            .await
            .unwrap();

        let target = registry.begin_call("alice", "bob").await.unwrap();
        assert!(target.is_some());
        assert!(registry.lookup("alice").await.unwrap().in_call);
        assert!(registry.lookup("bob").await.unwrap().in_call);

        registry.end_call("bob", "alice").await.unwrap();
        assert!(!registry.lookup("alice").await.unwrap().in_call);
        assert!(!registry.lookup("bob").await.unwrap().in_call);
    }

    #[tokio::test]
    async fn test_busy_rejection_leaves_state_untouched() {
        let registry = Registry::new();
        for name in ["alice", "bob", "carol"] {
            registry
                .join(name, ConnectionId::new(), signaler())
                .await
                .unwrap();
        }
        registry.begin_call("bob", "carol").await.unwrap();

        let err = registry.begin_call("alice", "bob").await.unwrap_err();
        assert_eq!(err, Rejection::Busy("bob".into()));
        assert!(!registry.lookup("alice").await.unwrap().in_call);

        let err = registry.begin_call("alice", "dave").await.unwrap_err();
        assert_eq!(err, Rejection::UnknownReceiver("dave".into()));
        assert!(!registry.lookup("alice").await.unwrap().in_call);
    }

    #[tokio::test]
    async fn test_end_call_requires_both() {
        let registry = Registry::new();
        registry
            .join("alice", ConnectionId::new(), signaler())
            .await
            .unwrap();
        registry.set_busy("alice", true).await;

        let err = registry.end_call("alice", "ghost").await.unwrap_err();
        assert_eq!(err, Rejection::UnknownReceiver("ghost".into()));
        assert!(registry.lookup("alice").await.unwrap().in_call);
    }

    #[tokio::test]
    async fn test_snapshot_sorted_and_accurate() {
        let registry = Registry::new();
        for name in ["carol", "alice", "bob"] {
            registry
                .join(name, ConnectionId::new(), signaler())
                .await
                .unwrap();
        }
        registry.begin_call("alice", "carol").await.unwrap();

        let names: Vec<(String, bool)> = registry
            .snapshot()
            .await
            .into_iter()
            .map(|user| (user.name, user.in_call))
            .collect();
        assert_eq!(
            names,
            vec![
                ("alice".to_string(), true),
                ("bob".to_string(), false),
                ("carol".to_string(), true),
            ]
        );
    }

    #[tokio::test]
    async fn test_stale_sessions_get_no_deliveries() {
        let registry = Registry::new();
        let alice = ConnectionId::new();
        registry.join("alice", alice, signaler()).await.unwrap();
        registry
            .join("bob", ConnectionId::new(), signaler())
            .await
            .unwrap();
        registry.mark_stale(alice).await;

        assert!(registry.signaler_for("alice").await.is_none());
        let (users, recipients) = registry.roster_with_recipients().await;
        assert_eq!(users.len(), 2);
        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].0, "bob");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_single_winner() {
        let registry = Arc::new(Registry::new());
        registry
            .join("target", ConnectionId::new(), signaler())
            .await
            .unwrap();
        for i in 0..16 {
            registry
                .join(&format!("caller-{i}"), ConnectionId::new(), signaler())
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .begin_call(&format!("caller-{i}"), "target")
                    .await
                    .is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        let busy = registry
            .snapshot()
            .await
            .into_iter()
            .filter(|user| user.in_call)
            .count();
        assert_eq!(busy, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_same_name() {
        let registry = Arc::new(Registry::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .join("alice", ConnectionId::new(), Signaler::channel(1).0)
                    .await
                    .is_ok()
            }));
        }
        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(registry.len().await, 1);
    }
}
