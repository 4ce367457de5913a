//! Passive side of a link: authorized topic subscriptions.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::envelope::{Envelope, JOIN_EVENT, LEAVE_EVENT, Payload, ReplyPayload};
use crate::link::{Handlers, Link, LinkConfig};
use crate::transport::Transport;
use crate::LinkResult;

/// Decides whether a bearer token may join a topic.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, token: &str, topic: &str) -> bool;
}

impl<F> Authorizer for F
where
    F: Fn(&str, &str) -> bool + Send + Sync,
{
    fn authorize(&self, token: &str, topic: &str) -> bool {
        self(token, topic)
    }
}

/// Subscription changes observed on a server link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Joined { topic: String, token: String },
    Left { topic: String },
}

pub struct LinkServer {
    link: Link,
    topics: Arc<Mutex<HashSet<String>>>,
}

impl LinkServer {
    /// Open a link over an accepted connection.
    ///
    /// `handlers` are installed alongside the join/leave handlers and only
    /// see envelopes on topics the peer has joined; anything else is answered
    /// with an error. Accepted joins and leaves are reported on the returned
    /// channel.
    pub fn accept(
        transport: Transport,
        config: LinkConfig,
        authorizer: Arc<dyn Authorizer>,
        handlers: Handlers,
    ) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let topics = Arc::new(Mutex::new(HashSet::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let gate_topics = topics.clone();
        let handlers = handlers.gated(move |envelope: &Envelope| {
            if gate_topics.lock().contains(&envelope.topic) {
                return None;
            }
            warn!(topic = %envelope.topic, event = %envelope.event_name(), "Event on unjoined topic");
            Some(ReplyPayload::error("not subscribed"))
        });

        let join_topics = topics.clone();
        let join_events = events_tx.clone();
        let leave_topics = topics.clone();
        let protocol = Handlers::new()
            .on(JOIN_EVENT, move |envelope: &Envelope| {
                Some(subscribe(
                    envelope,
                    authorizer.as_ref(),
                    &join_topics,
                    &join_events,
                ))
            })
            .on(LEAVE_EVENT, move |envelope: &Envelope| {
                Some(unsubscribe(envelope, &leave_topics, &events_tx))
            });

        let link = Link::open(transport, config, handlers.merge(protocol));
        (Self { link, topics }, events_rx)
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.lock().contains(topic)
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.lock().iter().cloned().collect();
        topics.sort();
        topics
    }

    /// Push an application event on a topic the peer has joined.
    pub fn push(&self, topic: &str, event: &str, body: Value) -> LinkResult<u64> {
        self.link.push(Envelope::event(topic, event, body))
    }

    pub fn close(&self) {
        self.link.close();
    }
}

/// Strip an optional `Bearer ` scheme from a join token.
fn bearer_token(raw: &str) -> &str {
    let raw = raw.trim();
    raw.strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .unwrap_or(raw)
        .trim()
}

fn subscribe(
    envelope: &Envelope,
    authorizer: &dyn Authorizer,
    topics: &Mutex<HashSet<String>>,
    events: &mpsc::UnboundedSender<ServerEvent>,
) -> ReplyPayload {
    let Payload::Join(join) = &envelope.payload else {
        return ReplyPayload::error("malformed join");
    };
    let token = bearer_token(&join.token);

    if !authorizer.authorize(token, &envelope.topic) {
        warn!(topic = %envelope.topic, "Join rejected");
        return ReplyPayload::error("access denied");
    }

    topics.lock().insert(envelope.topic.clone());
    let _ = events.send(ServerEvent::Joined {
        topic: envelope.topic.clone(),
        token: token.to_string(),
    });
    info!(topic = %envelope.topic, "Peer joined");
    ReplyPayload::ok()
}

fn unsubscribe(
    envelope: &Envelope,
    topics: &Mutex<HashSet<String>>,
    events: &mpsc::UnboundedSender<ServerEvent>,
) -> ReplyPayload {
    if topics.lock().remove(&envelope.topic) {
        let _ = events.send(ServerEvent::Left {
            topic: envelope.topic.clone(),
        });
        info!(topic = %envelope.topic, "Peer left");
    }
    ReplyPayload::ok()
}
