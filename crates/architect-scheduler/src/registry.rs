//! Directory of connected builders.
//!
//! The registry is the only owner of builder state. Every transition happens
//! under one lock so the scheduler, monitors and new registrations never see
//! a half-updated builder; the lock is never held across an await.

use std::collections::HashMap;
use std::sync::Arc;

use architect_core::{
    Build, BuilderState, BuilderSummary, ChangeBroker, Error, ResourceId, Result, Status, Stores,
};
use architect_link::{Envelope, Link};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::messages::{
    BuildDispatch, COMMAND_EVENT, Dispatch, KnownHostsDispatch, POOL_TOPIC,
};

/// Broker topic for builder changes.
pub const BUILDERS_TOPIC: &str = "builders";

/// Broker topic for build and step changes.
pub const BUILDS_TOPIC: &str = "builds";

/// A connected builder and the link it is reachable over.
#[derive(Debug, Clone)]
pub struct Builder {
    pub id: ResourceId,
    pub token: String,
    pub state: BuilderState,
    pub build_id: Option<ResourceId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub link: Link,
}

impl Builder {
    pub fn new(link: Link, token: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ResourceId::new(),
            token: token.into(),
            state: BuilderState::Ready,
            build_id: None,
            created_at: now,
            updated_at: now,
            link,
        }
    }

    pub fn summary(&self) -> BuilderSummary {
        BuilderSummary {
            id: self.id,
            state: self.state,
            build_id: self.build_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// A 1-based page of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub number: usize,
    pub size: usize,
}

impl Page {
    pub fn new(number: usize, size: usize) -> Self {
        Self { number, size }
    }

    fn offset(&self) -> usize {
        self.number.saturating_sub(1).saturating_mul(self.size)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(1, 25)
    }
}

pub struct BuilderRegistry {
    builders: Mutex<HashMap<ResourceId, Builder>>,
    stores: Stores,
    brokers: Vec<Arc<dyn ChangeBroker>>,
}

impl BuilderRegistry {
    pub fn new(stores: Stores) -> Self {
        Self {
            builders: Mutex::new(HashMap::new()),
            stores,
            brokers: Vec::new(),
        }
    }

    /// Add a broker that receives every change notification.
    pub fn with_broker(mut self, broker: Arc<dyn ChangeBroker>) -> Self {
        self.brokers.push(broker);
        self
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Register a freshly connected builder in the ready state.
    pub async fn register(&self, link: Link, token: impl Into<String>) -> Builder {
        let builder = Builder::new(link, token);
        self.builders.lock().insert(builder.id, builder.clone());

        info!(builder_id = %builder.id, peer = %builder.link.peer(), "Builder registered");
        self.notify("create", &builder).await;
        builder
    }

    /// Store the given builder, replacing any previous record with its id.
    pub async fn save(&self, builder: &Builder) {
        let mut builder = builder.clone();
        builder.updated_at = Utc::now();
        let existed = self
            .builders
            .lock()
            .insert(builder.id, builder.clone())
            .is_some();

        let event = if existed { "update" } else { "create" };
        self.notify(event, &builder).await;
    }

    pub fn get(&self, id: ResourceId) -> Option<Builder> {
        self.builders.lock().get(&id).cloned()
    }

    pub fn count(&self) -> usize {
        self.builders.lock().len()
    }

    /// Forget a builder and close its link.
    ///
    /// A build still bound to a busy builder is marked failed.
    pub async fn remove(&self, id: ResourceId) -> Result<Option<Builder>> {
        let Some(builder) = self.builders.lock().remove(&id) else {
            return Ok(None);
        };
        builder.link.close();
        info!(builder_id = %id, state = %builder.state, "Builder removed");

        let result = match (builder.state, builder.build_id) {
            (BuilderState::Busy, Some(build_id)) => self.fail_build(build_id).await,
            _ => Ok(()),
        };

        self.notify("delete", &builder).await;
        result.map(|_| Some(builder))
    }

    pub fn list_ready(&self, page: Page) -> Vec<Builder> {
        self.list(Some(BuilderState::Ready), page)
    }

    pub fn list_busy(&self, page: Page) -> Vec<Builder> {
        self.list(Some(BuilderState::Busy), page)
    }

    pub fn list_all(&self, page: Page) -> Vec<Builder> {
        self.list(None, page)
    }

    /// State-filtered builders in registration order.
    pub fn list(&self, state: Option<BuilderState>, page: Page) -> Vec<Builder> {
        self.snapshot(state)
            .into_iter()
            .skip(page.offset())
            .take(page.size)
            .collect()
    }

    /// Every builder in the given state, in registration order.
    pub fn snapshot(&self, state: Option<BuilderState>) -> Vec<Builder> {
        let mut builders: Vec<Builder> = self
            .builders
            .lock()
            .values()
            .filter(|b| state.is_none_or(|s| b.state == s))
            .cloned()
            .collect();
        builders.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        builders
    }

    /// Bind `build` to a ready builder and send it the work.
    ///
    /// The builder is claimed before anything is sent, so two callers can
    /// never hand the same builder two builds. The build is stored as
    /// running before the dispatch goes out, so the builder's first reports
    /// always see it. If the work cannot be assembled or stored the claim is
    /// released and the builder is ready again; if it cannot be sent the
    /// build goes back to waiting and the builder is put in the error state.
    pub async fn start_build(&self, builder_id: ResourceId, mut build: Build) -> Result<()> {
        let builder = self.claim(builder_id, build.id)?;
        self.notify("update", &builder).await;

        let (known_hosts, work) = match self.assemble(&build).await {
            Ok(assembled) => assembled,
            Err(e) => {
                self.release(builder_id).await;
                return Err(e);
            }
        };

        let queued = build.status;
        build.status = Status::Running;
        if let Err(e) = self.stores.builds.update(&build).await {
            self.release(builder_id).await;
            return Err(e);
        }

        let sent = send(&builder.link, &known_hosts).and_then(|_| send(&builder.link, &work));
        if let Err(e) = sent {
            error!(builder_id = %builder_id, build_id = %build.id, error = %e, "Dispatch failed");
            build.status = queued;
            if let Err(requeue) = self.stores.builds.update(&build).await {
                error!(build_id = %build.id, error = %requeue, "Failed to requeue build");
            }
            self.transition(builder_id, BuilderState::Error, None).await;
            return Err(e);
        }

        self.publish(BUILDS_TOPIC, "update", &build).await;
        info!(builder_id = %builder_id, build_id = %build.id, "Build dispatched");
        Ok(())
    }

    /// Return a busy builder to the ready state once its build is done.
    pub async fn finish_build(&self, builder_id: ResourceId) -> Result<()> {
        let builder = {
            let mut builders = self.builders.lock();
            let builder = builders
                .get_mut(&builder_id)
                .ok_or_else(|| Error::NotFound(format!("builder {builder_id}")))?;
            if builder.state != BuilderState::Busy {
                return Err(Error::Conflict(format!(
                    "builder {builder_id} is {}, not Busy",
                    builder.state
                )));
            }
            builder.state = BuilderState::Ready;
            builder.build_id = None;
            builder.updated_at = Utc::now();
            builder.clone()
        };

        debug!(builder_id = %builder_id, "Builder ready");
        self.notify("update", &builder).await;
        Ok(())
    }

    /// Send a change notification to every broker. Broker failures are logged.
    pub async fn publish<T: Serialize>(&self, topic: &str, event: &str, record: &T) {
        if self.brokers.is_empty() {
            return;
        }
        let payload = match serde_json::to_value(record) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic, event, error = %e, "Failed to serialize change");
                return;
            }
        };
        for broker in &self.brokers {
            if let Err(e) = broker.publish(topic, event, payload.clone()).await {
                warn!(topic, event, error = %e, "Failed to publish change");
            }
        }
    }

    async fn notify(&self, event: &str, builder: &Builder) {
        self.publish(BUILDERS_TOPIC, event, &builder.summary()).await;
    }

    fn claim(&self, builder_id: ResourceId, build_id: ResourceId) -> Result<Builder> {
        let mut builders = self.builders.lock();
        let builder = builders
            .get_mut(&builder_id)
            .ok_or_else(|| Error::NotFound(format!("builder {builder_id}")))?;
        if builder.state != BuilderState::Ready {
            return Err(Error::Conflict(format!(
                "builder {builder_id} is {}, not Ready",
                builder.state
            )));
        }
        builder.state = BuilderState::Busy;
        builder.build_id = Some(build_id);
        builder.updated_at = Utc::now();
        Ok(builder.clone())
    }

    async fn release(&self, builder_id: ResourceId) {
        self.transition(builder_id, BuilderState::Ready, None).await;
    }

    async fn transition(
        &self,
        builder_id: ResourceId,
        state: BuilderState,
        build_id: Option<ResourceId>,
    ) {
        let builder = {
            let mut builders = self.builders.lock();
            let Some(builder) = builders.get_mut(&builder_id) else {
                return;
            };
            builder.state = state;
            builder.build_id = build_id;
            builder.updated_at = Utc::now();
            builder.clone()
        };
        self.notify("update", &builder).await;
    }

    async fn assemble(&self, build: &Build) -> Result<(Dispatch, Dispatch)> {
        let known_hosts = self.stores.known_hosts.get_all().await?;
        let steps = self.stores.steps.get_for_build(build.id).await?;
        let mut streams = Vec::new();
        for step in &steps {
            streams.extend(self.stores.streams.get_for_step(step.id).await?);
        }

        let mut running = build.clone();
        running.status = Status::Running;
        Ok((
            Dispatch::KnownHosts(KnownHostsDispatch { known_hosts }),
            Dispatch::Build(BuildDispatch {
                build: running,
                steps,
                streams,
            }),
        ))
    }

    async fn fail_build(&self, build_id: ResourceId) -> Result<()> {
        let mut build = self.stores.builds.get_by_id(build_id).await?;
        if build.status.is_terminal() {
            return Ok(());
        }
        build.status = Status::Failed;
        build.finished_at = Some(Utc::now());
        self.stores.builds.update(&build).await?;

        warn!(build_id = %build_id, "Build failed, builder went away");
        self.publish(BUILDS_TOPIC, "update", &build).await;
        Ok(())
    }
}

fn send(link: &Link, dispatch: &Dispatch) -> Result<()> {
    let body = serde_json::to_value(dispatch)?;
    link.push(Envelope::event(POOL_TOPIC, COMMAND_EVENT, body))
        .map(|_| ())
        .map_err(|e| Error::Dispatch(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{BuildMonitor, report_handlers};
    use crate::testing::{
        RecordingBroker, fake_builder, fake_builder_with, log_line, seed_build, wait_until,
    };
    use architect_core::{BuildStore, MemoryStore, StepStore, StreamStore};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn registry(store: &Arc<MemoryStore>) -> (BuilderRegistry, Arc<RecordingBroker>) {
        let broker = Arc::new(RecordingBroker::default());
        let registry =
            BuilderRegistry::new(Stores::memory(store.clone())).with_broker(broker.clone());
        (registry, broker)
    }

    #[tokio::test]
    async fn register_starts_ready_and_notifies() {
        let store = Arc::new(MemoryStore::new());
        let (registry, broker) = registry(&store);
        let (link, _peer) = fake_builder();

        let builder = registry.register(link, "token").await;

        assert_eq!(builder.state, BuilderState::Ready);
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get(builder.id).unwrap().token, "token");
        assert_eq!(broker.events(), vec![(BUILDERS_TOPIC.to_string(), "create".to_string())]);
    }

    #[tokio::test]
    async fn save_notifies_update_for_known_builder() {
        let store = Arc::new(MemoryStore::new());
        let (registry, broker) = registry(&store);
        let (link, _peer) = fake_builder();

        let mut builder = registry.register(link, "token").await;
        builder.state = BuilderState::Error;
        registry.save(&builder).await;

        assert_eq!(registry.get(builder.id).unwrap().state, BuilderState::Error);
        assert_eq!(broker.events().last().unwrap().1, "update");
    }

    #[tokio::test]
    async fn paging_skips_to_the_requested_page() {
        let store = Arc::new(MemoryStore::new());
        let (registry, _broker) = registry(&store);

        let mut ids = Vec::new();
        let mut peers = Vec::new();
        for _ in 0..5 {
            let (link, peer) = fake_builder();
            peers.push(peer);
            ids.push(registry.register(link, "token").await.id);
        }

        let page: Vec<ResourceId> = registry
            .list_all(Page::new(2, 2))
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(page, ids[2..4].to_vec());

        let last: Vec<ResourceId> = registry
            .list_ready(Page::new(3, 2))
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(last, ids[4..].to_vec());

        assert!(registry.list_all(Page::new(4, 2)).is_empty());
        assert!(registry.list_busy(Page::default()).is_empty());
    }

    #[tokio::test]
    async fn start_build_dispatches_known_hosts_then_build() {
        let store = Arc::new(MemoryStore::new());
        store.add_known_host("github.com ssh-ed25519 AAAA");
        let (registry, _broker) = registry(&store);
        let (link, mut peer) = fake_builder();
        let builder = registry.register(link, "token").await;
        let build = seed_build(&store, 2);

        registry.start_build(builder.id, build.clone()).await.unwrap();

        let bound = registry.get(builder.id).unwrap();
        assert_eq!(bound.state, BuilderState::Busy);
        assert_eq!(bound.build_id, Some(build.id));
        assert_eq!(
            BuildStore::get_by_id(store.as_ref(), build.id).await.unwrap().status,
            Status::Running
        );

        let first = peer.next_dispatch().await;
        let second = peer.next_dispatch().await;
        assert!(matches!(first, Dispatch::KnownHosts(ref hosts) if hosts.known_hosts.len() == 1));
        let Dispatch::Build(work) = second else {
            panic!("expected a build dispatch, got {second:?}");
        };
        assert_eq!(work.build.id, build.id);
        assert_eq!(work.steps.len(), 2);
        assert_eq!(work.streams.len(), 2);
    }

    #[tokio::test]
    async fn busy_builder_cannot_take_second_build() {
        let store = Arc::new(MemoryStore::new());
        let (registry, _broker) = registry(&store);
        let (link, _peer) = fake_builder();
        let builder = registry.register(link, "token").await;

        registry
            .start_build(builder.id, seed_build(&store, 1))
            .await
            .unwrap();
        let err = registry
            .start_build(builder.id, seed_build(&store, 1))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn dispatch_over_closed_link_puts_builder_in_error() {
        let store = Arc::new(MemoryStore::new());
        let (registry, _broker) = registry(&store);
        let (link, _peer) = fake_builder();
        link.close();
        let builder = registry.register(link, "token").await;
        let build = seed_build(&store, 1);

        let err = registry.start_build(builder.id, build.clone()).await.unwrap_err();

        assert!(matches!(err, Error::Dispatch(_)));
        assert_eq!(registry.get(builder.id).unwrap().state, BuilderState::Error);
        assert_eq!(
            BuildStore::get_by_id(store.as_ref(), build.id).await.unwrap().status,
            Status::Waiting
        );
    }

    #[tokio::test]
    async fn removing_busy_builder_fails_its_build() {
        let store = Arc::new(MemoryStore::new());
        let (registry, broker) = registry(&store);
        let (link, _peer) = fake_builder();
        let builder = registry.register(link, "token").await;
        let build = seed_build(&store, 1);
        registry.start_build(builder.id, build.clone()).await.unwrap();

        let removed = registry.remove(builder.id).await.unwrap().unwrap();

        assert_eq!(removed.id, builder.id);
        assert!(!removed.link.is_connected());
        assert_eq!(registry.count(), 0);
        let failed = BuildStore::get_by_id(store.as_ref(), build.id).await.unwrap();
        assert_eq!(failed.status, Status::Failed);
        assert!(failed.finished_at.is_some());
        assert!(broker
            .events()
            .contains(&(BUILDERS_TOPIC.to_string(), "delete".to_string())));
    }

    #[tokio::test]
    async fn removing_unknown_builder_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let (registry, broker) = registry(&store);

        assert!(registry.remove(ResourceId::new()).await.unwrap().is_none());
        assert!(broker.events().is_empty());
    }

    #[tokio::test]
    async fn finish_build_requires_busy_builder() {
        let store = Arc::new(MemoryStore::new());
        let (registry, _broker) = registry(&store);
        let (link, _peer) = fake_builder();
        let builder = registry.register(link, "token").await;

        assert!(matches!(
            registry.finish_build(builder.id).await,
            Err(Error::Conflict(_))
        ));

        registry
            .start_build(builder.id, seed_build(&store, 1))
            .await
            .unwrap();
        registry.finish_build(builder.id).await.unwrap();

        let ready = registry.get(builder.id).unwrap();
        assert_eq!(ready.state, BuilderState::Ready);
        assert_eq!(ready.build_id, None);
    }

    /// Build store whose first update stalls, like a slow database write.
    struct SlowFirstUpdate {
        inner: Arc<MemoryStore>,
        stalled: AtomicBool,
    }

    #[async_trait::async_trait]
    impl BuildStore for SlowFirstUpdate {
        async fn get_by_id(&self, id: ResourceId) -> Result<Build> {
            BuildStore::get_by_id(self.inner.as_ref(), id).await
        }

        async fn get_waiting(&self) -> Result<Vec<Build>> {
            self.inner.get_waiting().await
        }

        async fn get_running(&self) -> Result<Vec<Build>> {
            self.inner.get_running().await
        }

        async fn update(&self, build: &Build) -> Result<()> {
            if !self.stalled.swap(true, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(150)).await;
            }
            BuildStore::update(self.inner.as_ref(), build).await
        }
    }

    #[tokio::test]
    async fn slow_running_write_never_overwrites_completion() {
        let store = Arc::new(MemoryStore::new());
        let mut stores = Stores::memory(store.clone());
        stores.builds = Arc::new(SlowFirstUpdate {
            inner: store.clone(),
            stalled: AtomicBool::new(false),
        });
        let registry = Arc::new(BuilderRegistry::new(stores));
        let (handlers, reports) = report_handlers();
        let (link, mut peer) = fake_builder_with(handlers);
        let builder = registry.register(link, "token").await;
        BuildMonitor::new(&builder, registry.clone(), reports).spawn();
        let build = seed_build(&store, 1);
        let step = StepStore::get_for_build(store.as_ref(), build.id).await.unwrap()[0].clone();
        let stream = StreamStore::get_for_step(store.as_ref(), step.id).await.unwrap()[0].id;

        let builder_id = builder.id;
        let starter = registry.clone();
        let started = tokio::spawn({
            let build = build.clone();
            async move { starter.start_build(builder_id, build).await }
        });

        peer.next_dispatch().await;
        peer.next_dispatch().await;
        assert!(peer
            .report(log_line(build.id, step.id, stream, 1, Status::Success))
            .await
            .is_ok());
        wait_until(|| registry.get(builder_id).map(|b| b.state) == Some(BuilderState::Ready))
            .await;
        started.await.unwrap().unwrap();

        let done = BuildStore::get_by_id(store.as_ref(), build.id).await.unwrap();
        assert_eq!(done.status, Status::Success);
        assert!(done.finished_at.is_some());
    }
}
