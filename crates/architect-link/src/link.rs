//! Reliable duplex message link.
//!
//! A [`Link`] runs three tasks over one [`Transport`]:
//!
//! - the reader decodes frames, dispatches them to registered handlers and
//!   completes pending sends when their reply arrives;
//! - the writer drains the outbound queue every `write_interval`;
//! - the heartbeat task (optional) probes the peer every
//!   `heartbeat_interval` and closes the link if the previous probe went
//!   unanswered.
//!
//! Every sent envelope carries a ref that is unique for the lifetime of the
//! link. Non-answer envelopes stay in the pending table until the peer
//! replies; each confirmed heartbeat re-queues those sent more than
//! `retry_after` ago, once per cycle.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::envelope::{Envelope, Payload, ReplyPayload};
use crate::transport::{FrameReader, FrameWriter, Transport};
use crate::{LinkError, LinkResult};

/// Timing knobs for a link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Probe period; `None` disables liveness monitoring.
    pub heartbeat_interval: Option<Duration>,
    /// How often the writer drains the outbound queue.
    pub write_interval: Duration,
    /// Age after which an unacknowledged send is re-queued.
    pub retry_after: Duration,
    /// Upper bound on [`Link::request`]; `None` waits until the link closes.
    pub reply_timeout: Option<Duration>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Some(Duration::from_secs(5)),
            write_interval: Duration::from_millis(10),
            retry_after: Duration::from_secs(5),
            reply_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Callback for an application event. Returning a payload answers the
/// envelope with a `phx_reply` carrying the same ref and topic.
pub type Handler = Arc<dyn Fn(&Envelope) -> Option<ReplyPayload> + Send + Sync>;

/// Event handlers to install on a link before its reader starts.
#[derive(Clone, Default)]
pub struct Handlers {
    map: HashMap<String, Handler>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, event: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Envelope) -> Option<ReplyPayload> + Send + Sync + 'static,
    {
        self.map.insert(event.into(), Arc::new(handler));
        self
    }

    /// Consult `gate` before every handler; a payload it returns is sent
    /// as the answer and the handler is skipped.
    pub fn gated<G>(self, gate: G) -> Self
    where
        G: Fn(&Envelope) -> Option<ReplyPayload> + Send + Sync + 'static,
    {
        let gate = Arc::new(gate);
        let map = self
            .map
            .into_iter()
            .map(|(event, handler)| {
                let gate = gate.clone();
                let gated: Handler = Arc::new(move |envelope: &Envelope| {
                    gate(envelope).or_else(|| handler(envelope))
                });
                (event, gated)
            })
            .collect();
        Self { map }
    }

    pub fn merge(mut self, other: Handlers) -> Self {
        self.map.extend(other.map);
        self
    }
}

struct PendingSend {
    /// Unset while the envelope only sits in the queue.
    sent_at: Option<Instant>,
    message: Envelope,
    completion: Option<oneshot::Sender<ReplyPayload>>,
}

struct Outbound {
    /// Replies to the peer, written ahead of `queue` in arrival order.
    answers: VecDeque<Envelope>,
    queue: VecDeque<Envelope>,
    pending: HashMap<u64, PendingSend>,
    /// Ref of the heartbeat still awaiting its reply.
    last_heartbeat: Option<u64>,
    healthy: bool,
}

struct Shared {
    peer: String,
    config: LinkConfig,
    outbound: Mutex<Outbound>,
    next_ref: AtomicU64,
    handlers: RwLock<HashMap<String, Handler>>,
    connected: watch::Sender<bool>,
}

/// Handle to a running link. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Link {
    shared: Arc<Shared>,
}

impl Link {
    /// Start the reader, writer and heartbeat tasks over `transport`.
    pub fn open(transport: Transport, config: LinkConfig, handlers: Handlers) -> Self {
        let Transport {
            peer,
            reader,
            writer,
        } = transport;
        let (connected, _) = watch::channel(true);
        let heartbeat_interval = config.heartbeat_interval;

        let shared = Arc::new(Shared {
            peer,
            config,
            outbound: Mutex::new(Outbound {
                answers: VecDeque::new(),
                queue: VecDeque::new(),
                pending: HashMap::new(),
                last_heartbeat: None,
                healthy: true,
            }),
            next_ref: AtomicU64::new(1),
            handlers: RwLock::new(handlers.map),
            connected,
        });

        info!(peer = %shared.peer, "Link opened");
        tokio::spawn(read_loop(shared.clone(), reader));
        tokio::spawn(write_loop(shared.clone(), writer));
        if let Some(interval) = heartbeat_interval {
            tokio::spawn(heartbeat_loop(shared.clone(), interval));
        }

        Self { shared }
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    /// Register or replace the handler for an application event.
    pub fn on<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(&Envelope) -> Option<ReplyPayload> + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .write()
            .insert(event.into(), Arc::new(handler));
    }

    /// Queue an envelope without waiting for its acknowledgement.
    ///
    /// Returns the ref the envelope was sent with.
    pub fn push(&self, envelope: Envelope) -> LinkResult<u64> {
        self.shared.enqueue(envelope, None)
    }

    /// Queue an envelope and wait for the peer's reply to it.
    pub async fn request(&self, envelope: Envelope) -> LinkResult<ReplyPayload> {
        let (tx, rx) = oneshot::channel();
        let reference = self.shared.enqueue(envelope, Some(tx))?;

        let reply = match self.shared.config.reply_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.shared.outbound.lock().pending.remove(&reference);
                    return Err(LinkError::Timeout(limit));
                }
            },
            None => rx.await,
        };
        reply.map_err(|_| LinkError::Closed)
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    pub fn is_healthy(&self) -> bool {
        self.shared.outbound.lock().healthy
    }

    /// Number of sends still awaiting acknowledgement.
    pub fn pending_count(&self) -> usize {
        self.shared.outbound.lock().pending.len()
    }

    /// Tear down the connection. Safe to call any number of times.
    pub fn close(&self) {
        self.shared.disconnect();
    }

    /// Resolves once the link has disconnected for any reason.
    pub async fn closed(&self) {
        let mut rx = self.shared.connected.subscribe();
        let _ = rx.wait_for(|connected| !*connected).await;
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("peer", &self.shared.peer)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Shared {
    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn allocate_ref(&self) -> u64 {
        self.next_ref.fetch_add(1, Ordering::SeqCst)
    }

    fn enqueue(
        &self,
        envelope: Envelope,
        completion: Option<oneshot::Sender<ReplyPayload>>,
    ) -> LinkResult<u64> {
        let mut out = self.outbound.lock();
        self.enqueue_locked(&mut out, envelope, completion)
    }

    fn enqueue_locked(
        &self,
        out: &mut Outbound,
        mut envelope: Envelope,
        completion: Option<oneshot::Sender<ReplyPayload>>,
    ) -> LinkResult<u64> {
        if !self.is_connected() {
            return Err(LinkError::Closed);
        }

        let reference = match envelope.reference {
            Some(explicit) => {
                if out.pending.contains_key(&explicit) {
                    return Err(LinkError::DuplicateRef(explicit));
                }
                // Later allocations must never hand out a ref a caller chose.
                self.next_ref.fetch_max(explicit + 1, Ordering::SeqCst);
                explicit
            }
            None => {
                let allocated = self.allocate_ref();
                envelope.reference = Some(allocated);
                allocated
            }
        };

        if !envelope.is_answer() {
            out.pending.insert(
                reference,
                PendingSend {
                    sent_at: None,
                    message: envelope.clone(),
                    completion,
                },
            );
        }
        out.queue.push_back(envelope);
        Ok(reference)
    }

    /// Queue a heartbeat unless the previous one is still unanswered.
    ///
    /// Returns the outstanding ref when liveness has failed.
    fn probe(&self) -> std::result::Result<(), u64> {
        let mut out = self.outbound.lock();
        if let Some(outstanding) = out.last_heartbeat {
            return Err(outstanding);
        }
        if let Ok(reference) = self.enqueue_locked(&mut out, Envelope::heartbeat(), None) {
            out.last_heartbeat = Some(reference);
        }
        Ok(())
    }

    /// Answers jump the queue so the peer's waits stay short.
    fn enqueue_answer(&self, envelope: Envelope) {
        if self.is_connected() {
            self.outbound.lock().answers.push_back(envelope);
        }
    }

    fn dispatch(&self, envelope: Envelope) {
        let handler = self.handlers.read().get(envelope.event_name()).cloned();
        if let Some(handler) = handler {
            if let Some(reply) = handler(&envelope) {
                self.enqueue_answer(Envelope::reply(
                    envelope.topic.clone(),
                    envelope.reference,
                    reply,
                ));
            }
            return;
        }

        match envelope.payload {
            Payload::Reply(reply) => match envelope.reference {
                Some(reference) => self.complete(reference, reply),
                None => debug!(peer = %self.peer, "Dropping reply without ref"),
            },
            Payload::Error(body) => {
                warn!(peer = %self.peer, topic = %envelope.topic, ?body, "Peer reported channel error");
                if let Some(reference) = envelope.reference {
                    let message = body
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("channel error");
                    self.complete(reference, ReplyPayload::error(message));
                }
            }
            Payload::Heartbeat => {
                self.enqueue_answer(Envelope::reply(
                    envelope.topic,
                    envelope.reference,
                    ReplyPayload::ok(),
                ));
            }
            other => {
                debug!(peer = %self.peer, event = %other.event(), "No handler for event");
            }
        }
    }

    fn complete(&self, reference: u64, reply: ReplyPayload) {
        let completion = {
            let mut out = self.outbound.lock();
            let completion = out
                .pending
                .remove(&reference)
                .and_then(|pending| pending.completion);

            if out.last_heartbeat == Some(reference) {
                out.last_heartbeat = None;
                out.healthy = true;
                self.requeue_stale(&mut out);
            }
            completion
        };

        if let Some(tx) = completion {
            let _ = tx.send(reply);
        }
    }

    /// Re-queue sends that have waited longer than `retry_after`.
    ///
    /// Clearing `sent_at` keeps an entry from being queued twice before the
    /// writer has sent it again.
    fn requeue_stale(&self, out: &mut Outbound) {
        let now = Instant::now();
        let retry_after = self.config.retry_after;
        let mut stale: Vec<(u64, Envelope)> = Vec::new();

        for (reference, pending) in out.pending.iter_mut() {
            let Some(sent_at) = pending.sent_at else {
                continue;
            };
            if now.duration_since(sent_at) >= retry_after {
                pending.sent_at = None;
                stale.push((*reference, pending.message.clone()));
            }
        }

        stale.sort_by_key(|(reference, _)| *reference);
        for (reference, message) in stale {
            debug!(peer = %self.peer, reference, "Retrying unacknowledged send");
            out.queue.push_back(message);
        }
    }

    /// Take everything the writer may send now.
    fn take_writable(&self) -> Vec<Envelope> {
        let mut out = self.outbound.lock();
        if !out.healthy {
            return Vec::new();
        }
        let Outbound { answers, queue, .. } = &mut *out;
        answers.drain(..).chain(queue.drain(..)).collect()
    }

    fn mark_sent(&self, envelope: &Envelope) {
        if envelope.is_answer() {
            return;
        }
        let Some(reference) = envelope.reference else {
            return;
        };
        if let Some(pending) = self.outbound.lock().pending.get_mut(&reference) {
            pending.sent_at = Some(Instant::now());
        }
    }

    fn disconnect(&self) {
        if !self.connected.send_replace(false) {
            return;
        }
        let mut out = self.outbound.lock();
        out.healthy = false;
        out.answers.clear();
        out.queue.clear();
        // Dropping the completion senders wakes every waiting request.
        out.pending.clear();
        out.last_heartbeat = None;
        info!(peer = %self.peer, "Link closed");
    }
}

async fn wait_disconnected(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|connected| !*connected).await;
}

async fn read_loop(shared: Arc<Shared>, mut reader: Box<dyn FrameReader>) {
    let mut closed = shared.connected.subscribe();
    loop {
        let frame = tokio::select! {
            _ = wait_disconnected(&mut closed) => break,
            frame = reader.read_frame() => frame,
        };

        match frame {
            Ok(Some(frame)) => match Envelope::decode(&frame) {
                Ok(envelope) => shared.dispatch(envelope),
                Err(e) => warn!(peer = %shared.peer, error = %e, "Discarding undecodable frame"),
            },
            Ok(None) => {
                debug!(peer = %shared.peer, "Peer closed connection");
                break;
            }
            Err(e) => {
                warn!(peer = %shared.peer, error = %e, "Read failed");
                break;
            }
        }
    }
    shared.disconnect();
}

async fn write_loop(shared: Arc<Shared>, mut writer: Box<dyn FrameWriter>) {
    let mut closed = shared.connected.subscribe();
    let mut ticker = tokio::time::interval(shared.config.write_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    'outer: loop {
        tokio::select! {
            _ = wait_disconnected(&mut closed) => break,
            _ = ticker.tick() => {}
        }

        for envelope in shared.take_writable() {
            let frame = match envelope.encode() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(peer = %shared.peer, error = %e, "Dropping unencodable envelope");
                    continue;
                }
            };
            if let Err(e) = writer.write_frame(&frame).await {
                warn!(peer = %shared.peer, error = %e, "Write failed");
                break 'outer;
            }
            shared.mark_sent(&envelope);
        }
    }

    shared.disconnect();
    if let Err(e) = writer.close().await {
        debug!(peer = %shared.peer, error = %e, "Transport shutdown failed");
    }
}

async fn heartbeat_loop(shared: Arc<Shared>, interval: Duration) {
    let mut closed = shared.connected.subscribe();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = wait_disconnected(&mut closed) => return,
            _ = ticker.tick() => {}
        }

        if let Err(reference) = shared.probe() {
            warn!(peer = %shared.peer, reference, "Heartbeat unanswered, closing link");
            shared.disconnect();
            return;
        }
    }
}
