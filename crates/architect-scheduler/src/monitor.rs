//! Per-builder monitor turning log reports into build progress.
//!
//! Reports arrive through a handler installed on the builder's link (see
//! [`report_handlers`]) and are applied one at a time, in arrival order, by
//! the builder's [`BuildMonitor`]. When the link dies the monitor removes
//! the builder, which fails whatever build it was running.

use std::sync::Arc;

use architect_core::{Result, ResourceId, Status, Step};
use architect_link::{Envelope, Handlers, Link, ReplyPayload};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::messages::{BuilderReport, LogLineReport, POOL_TOPIC, REPORT_EVENT};
use crate::registry::{BUILDS_TOPIC, Builder, BuilderRegistry};

pub type ReportReceiver = mpsc::UnboundedReceiver<LogLineReport>;

/// Link handlers that acknowledge builder reports and queue them for a monitor.
///
/// Install the handlers when opening the builder's link and hand the
/// receiver to [`BuildMonitor::new`] once the builder is registered.
pub fn report_handlers() -> (Handlers, ReportReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handlers = Handlers::new().on(REPORT_EVENT, move |envelope: &Envelope| {
        if envelope.topic != POOL_TOPIC {
            warn!(topic = %envelope.topic, "Report outside the builder pool");
            return Some(ReplyPayload::error("reports belong on the builder pool"));
        }
        let report = envelope
            .payload
            .body()
            .map(|body| serde_json::from_value::<BuilderReport>(body.clone()));

        Some(match report {
            Some(Ok(BuilderReport::Log(line))) => match tx.send(line) {
                Ok(()) => ReplyPayload::ok(),
                Err(_) => ReplyPayload::error("builder is not monitored"),
            },
            Some(Err(e)) => {
                warn!(error = %e, "Malformed builder report");
                ReplyPayload::error("malformed report")
            }
            None => ReplyPayload::error("malformed report"),
        })
    });
    (handlers, rx)
}

pub struct BuildMonitor {
    builder_id: ResourceId,
    link: Link,
    registry: Arc<BuilderRegistry>,
    reports: ReportReceiver,
}

impl BuildMonitor {
    pub fn new(builder: &Builder, registry: Arc<BuilderRegistry>, reports: ReportReceiver) -> Self {
        Self {
            builder_id: builder.id,
            link: builder.link.clone(),
            registry,
            reports,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Apply reports until the builder's link goes away, then remove it.
    pub async fn run(mut self) {
        info!(builder_id = %self.builder_id, "Monitoring builder");

        loop {
            let report = tokio::select! {
                report = self.reports.recv() => report,
                _ = self.link.closed() => None,
            };
            let Some(report) = report else {
                break;
            };
            self.process(report).await;
        }

        // Reports acknowledged before the link went down still count.
        while let Ok(report) = self.reports.try_recv() {
            self.process(report).await;
        }

        if let Err(e) = self.registry.remove(self.builder_id).await {
            error!(builder_id = %self.builder_id, error = %e, "Failed to remove builder");
        }
        info!(builder_id = %self.builder_id, "Builder monitor stopped");
    }

    async fn process(&self, report: LogLineReport) {
        let build_id = report.build_id;
        let step_id = report.step_id;
        if let Err(e) = self.apply(report).await {
            error!(
                builder_id = %self.builder_id,
                build_id = %build_id,
                step_id = %step_id,
                error = %e,
                "Failed to apply report"
            );
        }
    }

    async fn apply(&self, report: LogLineReport) -> Result<()> {
        let stores = self.registry.stores();
        let now = Utc::now();

        let stream = stores.streams.get_by_id(report.stream_id).await?;
        stores
            .streams
            .append_line(&stream, report.line_number, now, &report.output)
            .await?;

        let mut step = stores.steps.get_by_id(report.step_id).await?;
        if advance_step(&mut step, report.status, now) {
            stores.steps.update(&step).await?;
            self.registry.publish(BUILDS_TOPIC, "update", &step).await;
        }

        let mut build = stores.builds.get_by_id(report.build_id).await?;
        let last_index = stores
            .steps
            .get_for_build(build.id)
            .await?
            .iter()
            .map(|s| s.index)
            .max();
        let finished = report.status.is_terminal() && last_index == Some(step.index);

        let mut changed = false;
        if build.started_at.is_none() {
            build.started_at = Some(now);
            if build.status == Status::Waiting {
                build.status = report.status;
            }
            changed = true;
        }
        if finished && build.finished_at.is_none() {
            build.status = report.status;
            build.finished_at = Some(now);
            changed = true;
        }
        if changed {
            stores.builds.update(&build).await?;
            self.registry.publish(BUILDS_TOPIC, "update", &build).await;
        }

        if finished {
            info!(build_id = %build.id, status = %build.status, "Build finished");
            let bound = self
                .registry
                .get(self.builder_id)
                .and_then(|b| b.build_id)
                == Some(build.id);
            if bound {
                self.registry.finish_build(self.builder_id).await?;
            } else {
                debug!(builder_id = %self.builder_id, build_id = %build.id, "Builder no longer bound to build");
            }
        }

        Ok(())
    }
}

/// Move a step along with a reported status. Returns whether it changed.
///
/// A started step never goes back to waiting and a terminal step never moves.
fn advance_step(step: &mut Step, status: Status, now: DateTime<Utc>) -> bool {
    let mut changed = false;
    if step.status == Status::Waiting {
        step.status = status;
        step.started_at = Some(now);
        changed = true;
    } else if !step.status.is_terminal() && status != Status::Waiting && step.status != status {
        step.status = status;
        changed = true;
    }
    if status.is_terminal() && step.finished_at.is_none() {
        step.finished_at = Some(now);
        changed = true;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        FakePeer, RecordingBroker, fake_builder_with, log_line, seed_build, wait_until,
    };
    use architect_core::{
        Build, BuildStore, BuilderState, MemoryStore, StepStore, Stores, StreamStore,
    };
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: Arc<BuilderRegistry>,
        broker: Arc<RecordingBroker>,
        builder: Builder,
        peer: FakePeer,
    }

    async fn monitored_builder() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(RecordingBroker::default());
        let registry = Arc::new(
            BuilderRegistry::new(Stores::memory(store.clone())).with_broker(broker.clone()),
        );
        let (handlers, reports) = report_handlers();
        let (link, peer) = fake_builder_with(handlers);
        let builder = registry.register(link, "token").await;
        BuildMonitor::new(&builder, registry.clone(), reports).spawn();
        Fixture {
            store,
            registry,
            broker,
            builder,
            peer,
        }
    }

    /// (step, stream) ids of a seeded build, in step order.
    async fn layout(store: &MemoryStore, build: &Build) -> Vec<(ResourceId, ResourceId)> {
        let mut ids = Vec::new();
        for step in StepStore::get_for_build(store, build.id).await.unwrap() {
            let stream = StreamStore::get_for_step(store, step.id).await.unwrap()[0].id;
            ids.push((step.id, stream));
        }
        ids
    }

    #[tokio::test]
    async fn completes_build_after_last_step() {
        let f = monitored_builder().await;
        let build = seed_build(&f.store, 3);
        f.registry.start_build(f.builder.id, build.clone()).await.unwrap();
        let ids = layout(&f.store, &build).await;

        let (step0, stream0) = ids[0];
        assert!(f.peer.report(log_line(build.id, step0, stream0, 1, Status::Running)).await.is_ok());
        wait_until(|| f.store.lines(stream0).len() == 1).await;

        let step = StepStore::get_by_id(f.store.as_ref(), step0).await.unwrap();
        assert_eq!(step.status, Status::Running);
        assert!(step.started_at.is_some());
        assert!(step.finished_at.is_none());
        let running = BuildStore::get_by_id(f.store.as_ref(), build.id).await.unwrap();
        assert_eq!(running.status, Status::Running);
        assert!(running.started_at.is_some());

        f.peer.report(log_line(build.id, step0, stream0, 2, Status::Success)).await;
        for &(step, stream) in &ids[1..] {
            f.peer.report(log_line(build.id, step, stream, 1, Status::Success)).await;
        }
        wait_until(|| {
            f.registry.get(f.builder.id).map(|b| b.state) == Some(BuilderState::Ready)
        })
        .await;

        let done = BuildStore::get_by_id(f.store.as_ref(), build.id).await.unwrap();
        assert_eq!(done.status, Status::Success);
        assert!(done.finished_at.is_some());
        for step in StepStore::get_for_build(f.store.as_ref(), build.id).await.unwrap() {
            assert_eq!(step.status, Status::Success);
            assert!(step.finished_at.is_some());
        }
        assert_eq!(f.store.lines(stream0).len(), 2);
        assert_eq!(f.registry.get(f.builder.id).unwrap().build_id, None);
        assert!(f
            .broker
            .events()
            .contains(&(BUILDS_TOPIC.to_string(), "update".to_string())));
    }

    #[tokio::test]
    async fn failed_last_step_fails_build() {
        let f = monitored_builder().await;
        let build = seed_build(&f.store, 2);
        f.registry.start_build(f.builder.id, build.clone()).await.unwrap();
        let ids = layout(&f.store, &build).await;

        f.peer.report(log_line(build.id, ids[0].0, ids[0].1, 1, Status::Success)).await;
        f.peer.report(log_line(build.id, ids[1].0, ids[1].1, 1, Status::Failed)).await;
        wait_until(|| {
            f.registry.get(f.builder.id).map(|b| b.state) == Some(BuilderState::Ready)
        })
        .await;

        let done = BuildStore::get_by_id(f.store.as_ref(), build.id).await.unwrap();
        assert_eq!(done.status, Status::Failed);
    }

    #[tokio::test]
    async fn terminal_intermediate_step_keeps_build_running() {
        let f = monitored_builder().await;
        let build = seed_build(&f.store, 2);
        f.registry.start_build(f.builder.id, build.clone()).await.unwrap();
        let (step0, stream0) = layout(&f.store, &build).await[0];

        f.peer.report(log_line(build.id, step0, stream0, 1, Status::Success)).await;
        wait_until(|| f.store.lines(stream0).len() == 1).await;

        let step = StepStore::get_by_id(f.store.as_ref(), step0).await.unwrap();
        assert_eq!(step.status, Status::Success);
        let build = BuildStore::get_by_id(f.store.as_ref(), build.id).await.unwrap();
        assert_eq!(build.status, Status::Running);
        assert!(build.finished_at.is_none());
        assert_eq!(
            f.registry.get(f.builder.id).unwrap().state,
            BuilderState::Busy
        );
    }

    #[tokio::test]
    async fn first_report_starts_waiting_build() {
        let f = monitored_builder().await;
        let build = seed_build(&f.store, 2);
        let (step0, stream0) = layout(&f.store, &build).await[0];

        f.peer.report(log_line(build.id, step0, stream0, 1, Status::Running)).await;
        wait_until(|| f.store.lines(stream0).len() == 1).await;

        let started = BuildStore::get_by_id(f.store.as_ref(), build.id).await.unwrap();
        assert_eq!(started.status, Status::Running);
        assert!(started.started_at.is_some());
    }

    #[tokio::test]
    async fn lost_link_removes_builder_and_fails_build() {
        let f = monitored_builder().await;
        let build = seed_build(&f.store, 2);
        f.registry.start_build(f.builder.id, build.clone()).await.unwrap();

        f.peer.link.close();
        wait_until(|| f.registry.count() == 0).await;

        let failed = BuildStore::get_by_id(f.store.as_ref(), build.id).await.unwrap();
        assert_eq!(failed.status, Status::Failed);
        assert!(failed.finished_at.is_some());
    }

    #[tokio::test]
    async fn malformed_report_is_rejected() {
        let f = monitored_builder().await;

        let reply = f
            .peer
            .link
            .request(Envelope::event(POOL_TOPIC, REPORT_EVENT, json!({"type": "bogus"})))
            .await
            .unwrap();

        assert_eq!(reply, ReplyPayload::error("malformed report"));
        assert_eq!(f.registry.count(), 1);
    }

    #[tokio::test]
    async fn report_outside_pool_is_rejected_and_not_applied() {
        let f = monitored_builder().await;
        let build = seed_build(&f.store, 1);
        let (step0, stream0) = layout(&f.store, &build).await[0];
        let body = serde_json::to_value(BuilderReport::Log(log_line(
            build.id,
            step0,
            stream0,
            1,
            Status::Success,
        )))
        .unwrap();

        let reply = f
            .peer
            .link
            .request(Envelope::event("any:topic", REPORT_EVENT, body))
            .await
            .unwrap();
        assert!(!reply.is_ok());

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(f.store.lines(stream0).is_empty());
        let untouched = BuildStore::get_by_id(f.store.as_ref(), build.id).await.unwrap();
        assert_eq!(untouched.status, Status::Waiting);
    }

    #[test]
    fn step_advances_from_waiting_and_records_completion() {
        let mut step = Step::new(ResourceId::new(), 0, "build");
        let now = Utc::now();

        assert!(advance_step(&mut step, Status::Running, now));
        assert_eq!(step.started_at, Some(now));
        assert!(!advance_step(&mut step, Status::Running, now));

        assert!(advance_step(&mut step, Status::Failed, now));
        assert_eq!(step.status, Status::Failed);
        assert_eq!(step.finished_at, Some(now));

        // A finished step stays finished.
        assert!(!advance_step(&mut step, Status::Running, now));
        assert_eq!(step.status, Status::Failed);
    }

    #[test]
    fn running_step_ignores_waiting_report() {
        let mut step = Step::new(ResourceId::new(), 0, "build");
        let started = Utc::now();
        assert!(advance_step(&mut step, Status::Running, started));

        let later = started + chrono::Duration::seconds(5);
        assert!(!advance_step(&mut step, Status::Waiting, later));
        assert_eq!(step.status, Status::Running);

        assert!(!advance_step(&mut step, Status::Running, later));
        assert_eq!(step.started_at, Some(started));
    }
}
