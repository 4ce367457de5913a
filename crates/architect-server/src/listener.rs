//! Builder connection listener.
//!
//! Each accepted connection becomes a server link. Builders authenticate by
//! joining the pool topic with their token; a successful join registers the
//! builder and starts its monitor.

use std::sync::Arc;

use architect_config::{ArchitectConfig, LinkSettings};
use architect_link::{Authorizer, LinkConfig, LinkServer, ServerEvent, Transport};
use architect_scheduler::{BuildMonitor, BuilderRegistry, POOL_TOPIC, report_handlers};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub fn link_config(settings: &LinkSettings) -> LinkConfig {
    LinkConfig {
        heartbeat_interval: settings.heartbeat,
        write_interval: settings.write_interval,
        retry_after: settings.retry_after,
        reply_timeout: settings.reply_timeout,
    }
}

/// Only configured builder tokens may join, and only the pool topic.
pub fn pool_authorizer(config: Arc<ArchitectConfig>) -> Arc<dyn Authorizer> {
    Arc::new(move |token: &str, topic: &str| {
        topic == POOL_TOPIC && config.accepts_token(token)
    })
}

/// Accept builder connections until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<BuilderRegistry>,
    config: Arc<ArchitectConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    let link_config = link_config(&config.link);
    let authorizer = pool_authorizer(config);

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "Builder connection accepted");
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(peer = %peer, error = %e, "Failed to disable Nagle on builder socket");
                }
                let transport = Transport::lines(peer.to_string(), stream);
                tokio::spawn(handle_connection(
                    transport,
                    registry.clone(),
                    link_config.clone(),
                    authorizer.clone(),
                ));
            }
            Err(e) => warn!(error = %e, "Failed to accept builder connection"),
        }
    }

    info!("Builder listener stopped");
}

/// Drive one builder connection until its link closes.
pub async fn handle_connection(
    transport: Transport,
    registry: Arc<BuilderRegistry>,
    config: LinkConfig,
    authorizer: Arc<dyn Authorizer>,
) {
    let (handlers, reports) = report_handlers();
    let (server, mut events) = LinkServer::accept(transport, config, authorizer, handlers);
    let mut reports = Some(reports);

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = server.link().closed() => None,
        };

        match event {
            Some(ServerEvent::Joined { topic, token }) if topic == POOL_TOPIC => {
                let Some(reports) = reports.take() else {
                    debug!(peer = %server.link().peer(), "Builder joined the pool twice");
                    continue;
                };
                let builder = registry.register(server.link().clone(), token).await;
                BuildMonitor::new(&builder, registry.clone(), reports).spawn();
            }
            Some(ServerEvent::Left { topic }) if topic == POOL_TOPIC => {
                info!(peer = %server.link().peer(), "Builder left the pool");
                server.close();
                break;
            }
            Some(other) => debug!(?other, "Ignoring subscription change"),
            None => break,
        }
    }
}
