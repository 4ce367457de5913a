//! Active side of a link: dial, subscribe, and reconnect.
//!
//! A [`LinkClient`] remembers every topic it joined together with the token
//! it joined with. When its link drops, a supervisor task redials up to
//! `max_retries` times and, once connected, joins every remembered topic
//! again. A failed re-join is logged and does not affect the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::envelope::{Envelope, ReplyPayload};
use crate::link::{Handlers, Link, LinkConfig};
use crate::transport::Transport;
use crate::{LinkError, LinkResult};

/// Produces fresh transports to the same remote endpoint.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> LinkResult<Transport>;
}

/// Dials a TCP address.
pub struct TcpDialer {
    addr: String,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> LinkResult<Transport> {
        Transport::connect_tcp(&self.addr).await
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub link: LinkConfig,
    /// Redial attempts per disconnection before giving up.
    pub max_retries: u32,
    /// Pause before each redial attempt.
    pub retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            max_retries: 10,
            retry_delay: Duration::from_secs(1),
        }
    }
}

pub struct LinkClient {
    dialer: Arc<dyn Dialer>,
    config: ClientConfig,
    handlers: Handlers,
    link: RwLock<Link>,
    /// topic -> token it was joined with
    topics: Mutex<HashMap<String, String>>,
    shutdown: watch::Sender<bool>,
}

impl LinkClient {
    /// Dial once and start supervising the connection.
    pub async fn connect(
        dialer: Arc<dyn Dialer>,
        config: ClientConfig,
        handlers: Handlers,
    ) -> LinkResult<Arc<Self>> {
        let transport = dialer.dial().await?;
        let link = Link::open(transport, config.link.clone(), handlers.clone());
        let (shutdown, _) = watch::channel(false);

        let client = Arc::new(Self {
            dialer,
            config,
            handlers,
            link: RwLock::new(link),
            topics: Mutex::new(HashMap::new()),
            shutdown,
        });
        tokio::spawn(client.clone().supervise());
        Ok(client)
    }

    /// The link currently in use.
    pub fn link(&self) -> Link {
        self.link.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.link().is_connected()
    }

    /// Join `topic`, remembering the token for later reconnects.
    pub async fn subscribe(&self, topic: &str, token: &str) -> LinkResult<Value> {
        let response = self
            .link()
            .request(Envelope::join(topic, token))
            .await?
            .into_result()?;
        self.topics
            .lock()
            .insert(topic.to_string(), token.to_string());
        info!(topic, "Subscribed");
        Ok(response)
    }

    /// Leave `topic` and stop replaying it on reconnect.
    pub async fn unsubscribe(&self, topic: &str) -> LinkResult<()> {
        self.topics.lock().remove(topic);
        self.link()
            .request(Envelope::leave(topic))
            .await?
            .into_result()?;
        Ok(())
    }

    /// Topics currently held, with the tokens they were joined with.
    pub fn subscriptions(&self) -> HashMap<String, String> {
        self.topics.lock().clone()
    }

    pub fn push(&self, topic: &str, event: &str, body: Value) -> LinkResult<u64> {
        self.link().push(Envelope::event(topic, event, body))
    }

    pub async fn request(&self, topic: &str, event: &str, body: Value) -> LinkResult<ReplyPayload> {
        self.link().request(Envelope::event(topic, event, body)).await
    }

    /// Stop reconnecting and close the current link.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
        self.link().close();
    }

    async fn supervise(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let link = self.link();
            tokio::select! {
                _ = stopped(&mut shutdown) => return,
                _ = link.closed() => {}
            }
            if *shutdown.borrow() {
                return;
            }

            warn!(peer = %link.peer(), "Link lost, reconnecting");
            match self.reconnect(&mut shutdown).await {
                Ok(()) => self.resubscribe().await,
                Err(LinkError::Closed) => return,
                Err(e) => {
                    error!(error = %e, "Giving up on link");
                    return;
                }
            }
        }
    }

    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> LinkResult<()> {
        for attempt in 1..=self.config.max_retries {
            tokio::select! {
                _ = stopped(shutdown) => return Err(LinkError::Closed),
                _ = tokio::time::sleep(self.config.retry_delay) => {}
            }

            match self.dialer.dial().await {
                Ok(transport) => {
                    let link = Link::open(transport, self.config.link.clone(), self.handlers.clone());
                    *self.link.write() = link;
                    info!(attempt, "Reconnected");
                    return Ok(());
                }
                Err(e) => warn!(attempt, error = %e, "Redial failed"),
            }
        }
        Err(LinkError::RetriesExhausted(self.config.max_retries))
    }

    async fn resubscribe(&self) {
        let topics = self.subscriptions();
        for (topic, token) in topics {
            if let Err(e) = self.subscribe(&topic, &token).await {
                warn!(topic = %topic, error = %e, "Resubscribe failed");
            }
        }
    }
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
