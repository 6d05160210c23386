//! Message router: one state transition per inbound signaling frame.
//!
//! | type        | precondition                      | effect                      |
//! |-------------|-----------------------------------|-----------------------------|
//! | join        | name not bound to a live session  | bind, reply, broadcast      |
//! | activeUsers | none                              | reply with roster           |
//! | call        | both joined, neither in a call    | both busy, forward, broadcast |
//! | cancelCall  | both joined                       | both idle, forward, broadcast |
//! | hangUp      | both joined                       | both idle, forward, broadcast |
//! | acceptCall  | receiver joined                   | forward                     |
//! | offer       | receiver joined                   | forward `data` verbatim     |
//! | answer      | receiver joined                   | forward `data` verbatim     |
//! | candidate   | receiver joined                   | forward `data` verbatim     |
//! | leave       | connection owns a session         | evict, broadcast, close     |
//!
//! Names are not validated beyond uniqueness; an empty string joins like any
//! other name. Only a missing `sender` fails a join.
//!
//! Failed preconditions produce no reply unless error replies are enabled.
//!
//! Delivery is a non-blocking push onto the receiver's bounded outbox. If the
//! outbox is full that one message is dropped with a warning, the receiver
//! stays live and call flags already changed are kept. Only a failed socket
//! write (seen by the gateway's writer task) marks a session stale.
//! `acceptCall` is sent by the callee with the original caller as `receiver`;
//! the roles are forwarded as sent.

use std::sync::Arc;

use parley_common::{MessageKind, SignalMessage};
use tracing::{debug, info, warn};

use crate::broadcast::Notifier;
use crate::registry::{ConnectionId, Registry, Rejection};
use crate::signal::Signaler;

/// What the gateway should do with the connection after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RouterOptions {
    /// Reply `{type:"error"}` to the requester when a message is dropped.
    pub error_replies: bool,
}

#[derive(Debug, Clone)]
pub struct MessageRouter {
    registry: Arc<Registry>,
    notifier: Notifier,
    options: RouterOptions,
}

impl MessageRouter {
    pub fn new(registry: Arc<Registry>, options: RouterOptions) -> Self {
        Self {
            notifier: Notifier::new(registry.clone()),
            registry,
            options,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handle one decoded frame from `connection`. `reply` is that
    /// connection's own outbox.
    pub async fn dispatch(
        &self,
        connection: ConnectionId,
        reply: &Signaler,
        msg: SignalMessage,
    ) -> Flow {
        debug!(
            "received {} from {:?} to {:?}",
            msg.kind,
            msg.sender_name(),
            msg.receiver_name()
        );

        match msg.kind {
            MessageKind::Join => self.handle_join(connection, reply, &msg).await,
            MessageKind::ActiveUsers => self.handle_active_users(reply).await,
            MessageKind::Call => self.handle_call(reply, &msg).await,
            MessageKind::CancelCall | MessageKind::HangUp => {
                self.handle_end_call(reply, &msg).await
            }
            MessageKind::AcceptCall => {
                self.forward(reply, &msg, call_control(&msg)).await;
            }
            MessageKind::Offer | MessageKind::Answer | MessageKind::Candidate => {
                self.forward(reply, &msg, msg.clone()).await;
            }
            MessageKind::Leave => {
                self.disconnect(connection).await;
                return Flow::Close;
            }
            MessageKind::Error | MessageKind::Unknown(_) => {
                warn!(
                    "unknown message type {} from {:?} to {:?}",
                    msg.kind,
                    msg.sender_name(),
                    msg.receiver_name()
                );
            }
        }
        Flow::Continue
    }

    /// Evict whatever `connection` owns and announce the new roster.
    /// Safe to call more than once.
    pub async fn disconnect(&self, connection: ConnectionId) -> Option<String> {
        let name = self.registry.leave(connection).await?;
        info!("user {} disconnected", name);
        self.notifier.broadcast_roster().await;
        Some(name)
    }

    async fn handle_join(&self, connection: ConnectionId, reply: &Signaler, msg: &SignalMessage) {
        let Some(name) = msg.sender_name() else {
            debug!("join without a name on {}", connection);
            self.send_join_result(reply, None, false);
            return;
        };

        match self.registry.join(name, connection, reply.clone()).await {
            Ok(()) => {
                info!("user {} joined", name);
                self.send_join_result(reply, Some(name), true);
                self.notifier.broadcast_roster().await;
            }
            Err(rejection) => {
                info!("rejecting join for {}: {}", name, rejection);
                self.send_join_result(reply, Some(name), false);
            }
        }
    }

    fn send_join_result(&self, reply: &Signaler, name: Option<&str>, accepted: bool) {
        match SignalMessage::join_result(name.unwrap_or_default(), accepted) {
            Ok(mut result) => {
                if name.is_none() {
                    result.receiver = None;
                }
                if !reply.try_send(result) {
                    warn!("failed to queue join result for {:?}", name);
                }
            }
            Err(err) => warn!("failed to build join result: {}", err),
        }
    }

    async fn handle_active_users(&self, reply: &Signaler) {
        let users = self.registry.snapshot().await;
        match SignalMessage::active_users(users) {
            Ok(roster) => {
                if !reply.try_send(roster) {
                    warn!("failed to queue roster reply");
                }
            }
            Err(err) => warn!("failed to build roster reply: {}", err),
        }
    }

    async fn handle_call(&self, reply: &Signaler, msg: &SignalMessage) {
        let (sender, receiver) = match call_parties(msg) {
            Ok(parties) => parties,
            Err(rejection) => return self.reject(reply, msg, rejection),
        };

        match self.registry.begin_call(sender, receiver).await {
            Ok(target) => {
                info!("call from {} to {}", sender, receiver);
                deliver(target.as_ref(), receiver, call_control(msg));
                self.notifier.broadcast_roster().await;
            }
            Err(rejection) => self.reject(reply, msg, rejection),
        }
    }

    async fn handle_end_call(&self, reply: &Signaler, msg: &SignalMessage) {
        let (sender, receiver) = match call_parties(msg) {
            Ok(parties) => parties,
            Err(rejection) => return self.reject(reply, msg, rejection),
        };

        match self.registry.end_call(sender, receiver).await {
            Ok(target) => {
                info!("{} from {} to {}", msg.kind, sender, receiver);
                deliver(target.as_ref(), receiver, call_control(msg));
                self.notifier.broadcast_roster().await;
            }
            Err(rejection) => self.reject(reply, msg, rejection),
        }
    }

    /// Relay `forwarded` to the session named in `msg.receiver`.
    async fn forward(&self, reply: &Signaler, msg: &SignalMessage, forwarded: SignalMessage) {
        let Some(receiver) = msg.receiver_name() else {
            return self.reject(reply, msg, Rejection::MissingField("receiver"));
        };

        match self.registry.signaler_for(receiver).await {
            Some(target) => {
                if deliver(Some(&target), receiver, forwarded) {
                    debug!(
                        "{} forwarded from {:?} to {}",
                        msg.kind,
                        msg.sender_name(),
                        receiver
                    );
                }
            }
            None => {
                warn!(
                    "receiver {} not found for {} from {:?}",
                    receiver,
                    msg.kind,
                    msg.sender_name()
                );
                self.reject(reply, msg, Rejection::UnknownReceiver(receiver.to_string()));
            }
        }
    }

    fn reject(&self, reply: &Signaler, msg: &SignalMessage, rejection: Rejection) {
        debug!(
            "dropping {} from {:?}: {}",
            msg.kind,
            msg.sender_name(),
            rejection
        );
        if !self.options.error_replies {
            return;
        }
        let reason = format!("{} rejected: {}", msg.kind, rejection);
        match SignalMessage::error_reply(msg.sender_name(), reason) {
            Ok(error) => {
                if !reply.try_send(error) {
                    warn!("failed to queue error reply");
                }
            }
            Err(err) => warn!("failed to build error reply: {}", err),
        }
    }
}

fn call_parties(msg: &SignalMessage) -> Result<(&str, &str), Rejection> {
    let sender = msg
        .sender_name()
        .ok_or(Rejection::MissingField("sender"))?;
    let receiver = msg
        .receiver_name()
        .ok_or(Rejection::MissingField("receiver"))?;
    Ok((sender, receiver))
}

/// Call control messages travel without `data`.
fn call_control(msg: &SignalMessage) -> SignalMessage {
    SignalMessage {
        kind: msg.kind.clone(),
        sender: msg.sender.clone(),
        receiver: msg.receiver.clone(),
        data: None,
    }
}

/// Queue `msg` on `target`. Busy flags already set are not rolled back on
/// failure.
fn deliver(target: Option<&Signaler>, receiver: &str, msg: SignalMessage) -> bool {
    let kind = msg.kind.clone();
    match target {
        Some(signaler) if signaler.try_send(msg) => true,
        Some(_) => {
            warn!("failed to queue {} for {}", kind, receiver);
            false
        }
        None => {
            warn!("{} has no live connection, dropping {}", receiver, kind);
            false
        }
    }
}
