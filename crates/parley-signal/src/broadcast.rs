//! Roster fan-out.

use std::sync::Arc;

use parley_common::SignalMessage;
use tracing::{debug, warn};

use crate::registry::Registry;

/// Pushes the current roster to every live session.
#[derive(Debug, Clone)]
pub struct Notifier {
    registry: Arc<Registry>,
}

impl Notifier {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Snapshot under the registry read lock, then queue one `activeUsers`
    /// message per recipient with the lock released. A recipient whose outbox
    /// is full or closed is skipped. Returns how many were queued.
    pub async fn broadcast_roster(&self) -> usize {
        let (users, recipients) = self.registry.roster_with_recipients().await;
        let message = match SignalMessage::active_users(users) {
            Ok(message) => message,
            Err(err) => {
                warn!("failed to build roster message: {}", err);
                return 0;
            }
        };

        let total = recipients.len();
        let mut delivered = 0;
        for (name, signaler) in recipients {
            if signaler.try_send(message.clone()) {
                delivered += 1;
            } else {
                warn!("failed to queue roster update for {}", name);
            }
        }
        debug!("roster broadcast delivered to {}/{} sessions", delivered, total);
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionId;
    use crate::signal::Signaler;
    use parley_common::{ActiveUsers, MessageKind};

    #[tokio::test]
    async fn test_broadcast_reaches_every_live_session() {
        let registry = Arc::new(Registry::new());
        let (alice, mut alice_rx) = Signaler::channel(4);
        let (bob, mut bob_rx) = Signaler::channel(4);
        registry.join("alice", ConnectionId::new(), alice).await.unwrap();
        registry.join("bob", ConnectionId::new(), bob).await.unwrap();

        let notifier = Notifier::new(registry.clone());
        assert_eq!(notifier.broadcast_roster().await, 2);

        for rx in [&mut alice_rx, &mut bob_rx] {
            let msg = rx.try_recv().unwrap();
            assert_eq!(msg.kind, MessageKind::ActiveUsers);
            let roster: ActiveUsers = msg.data_as().unwrap();
            let names: Vec<_> = roster.users.iter().map(|u| u.name.as_str()).collect();
            assert_eq!(names, vec!["alice", "bob"]);
        }
    }

    #[tokio::test]
    async fn test_failed_recipient_does_not_block_others() {
        let registry = Arc::new(Registry::new());
        let (alice, alice_rx) = Signaler::channel(4);
        let (bob, mut bob_rx) = Signaler::channel(1);
        let (carol, mut carol_rx) = Signaler::channel(4);
        registry.join("alice", ConnectionId::new(), alice).await.unwrap();
        registry.join("bob", ConnectionId::new(), bob).await.unwrap();
        registry.join("carol", ConnectionId::new(), carol).await.unwrap();

        // alice's writer is gone; bob's outbox holds a single message.
        drop(alice_rx);
        let notifier = Notifier::new(registry.clone());
        assert_eq!(notifier.broadcast_roster().await, 2);
        assert_eq!(notifier.broadcast_roster().await, 1);

        assert!(bob_rx.try_recv().is_ok());
        assert!(bob_rx.try_recv().is_err());
        assert!(carol_rx.try_recv().is_ok());
        assert!(carol_rx.try_recv().is_ok());
    }
}
