//! Polling scheduler matching waiting builds to ready builders.

use std::sync::Arc;
use std::time::Duration;

use architect_config::SchedulerSettings;
use architect_core::{BuildStore, BuilderState, ResourceId, Result, Status};
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::registry::BuilderRegistry;

pub struct BuildScheduler {
    registry: Arc<BuilderRegistry>,
    builds: Arc<dyn BuildStore>,
    tick: Duration,
}

impl BuildScheduler {
    pub fn new(registry: Arc<BuilderRegistry>, settings: &SchedulerSettings) -> Self {
        let builds = registry.stores().builds.clone();
        Self {
            registry,
            builds,
            tick: settings.tick,
        }
    }

    /// Put builds left running by a previous process back in the queue.
    ///
    /// No builder survives a restart, so nothing can still be executing them.
    pub async fn recover(&self) -> Result<usize> {
        let running = self.builds.get_running().await?;
        for build in &running {
            let mut build = build.clone();
            build.status = Status::Waiting;
            build.started_at = None;
            self.builds.update(&build).await?;
            info!(build_id = %build.id, "Requeued interrupted build");
        }
        Ok(running.len())
    }

    /// Hand each waiting build to the first ready builder that accepts it.
    ///
    /// A build that fails while the builder stays ready (its work could not be
    /// assembled or stored) is skipped for this tick and the same builder is
    /// offered to the next build. Returns the number of builds dispatched.
    pub async fn tick(&self) -> Result<usize> {
        let waiting = self.builds.get_waiting().await?;
        if waiting.is_empty() {
            return Ok(0);
        }

        let mut ready = self
            .registry
            .snapshot(Some(BuilderState::Ready))
            .into_iter()
            .peekable();
        let mut assigned = 0;

        'builds: for build in waiting {
            while let Some(builder) = ready.peek() {
                let builder_id = builder.id;
                match self.registry.start_build(builder_id, build.clone()).await {
                    Ok(()) => {
                        ready.next();
                        assigned += 1;
                        continue 'builds;
                    }
                    Err(e) if self.is_ready(builder_id) => {
                        warn!(build_id = %build.id, error = %e, "Skipping build this tick");
                        continue 'builds;
                    }
                    Err(e) => {
                        warn!(builder_id = %builder_id, build_id = %build.id, error = %e, "Could not start build");
                        ready.next();
                    }
                }
            }
            debug!("No ready builders left");
            break;
        }

        Ok(assigned)
    }

    fn is_ready(&self, builder_id: ResourceId) -> bool {
        self.registry.get(builder_id).map(|b| b.state) == Some(BuilderState::Ready)
    }

    /// Run until `shutdown` flips to true.
    ///
    /// Recovery runs on the first tick and is retried on later ticks until it
    /// succeeds; nothing is dispatched before it has.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(tick = ?self.tick, "Starting build scheduler");
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut recovered = false;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if !recovered {
                        match self.recover().await {
                            Ok(count) => {
                                recovered = true;
                                if count > 0 {
                                    info!(count, "Recovered interrupted builds");
                                }
                            }
                            Err(e) => {
                                error!(error = %e, "Build recovery failed");
                                continue;
                            }
                        }
                    }
                    match self.tick().await {
                        Ok(0) => {}
                        Ok(count) => debug!(count, "Dispatched builds"),
                        Err(e) => error!(error = %e, "Scheduler tick failed"),
                    }
                }
            }
        }

        info!("Build scheduler stopped");
    }
}
