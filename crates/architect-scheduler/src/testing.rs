//! Fixtures shared by the registry, scheduler and monitor tests.

use std::time::Duration;

use architect_core::{
    Build, ChangeBroker, MemoryStore, ResourceId, Result, Status, Step, Stream,
};
use architect_link::{Envelope, Handlers, Link, LinkConfig, ReplyPayload, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::messages::{
    BuilderReport, COMMAND_EVENT, Dispatch, LogLineReport, POOL_TOPIC, REPORT_EVENT,
};

/// Broker remembering every (topic, event) it was asked to publish.
#[derive(Default)]
pub struct RecordingBroker {
    published: Mutex<Vec<(String, String, Value)>>,
}

impl RecordingBroker {
    pub fn events(&self) -> Vec<(String, String)> {
        self.published
            .lock()
            .iter()
            .map(|(topic, event, _)| (topic.clone(), event.clone()))
            .collect()
    }
}

#[async_trait]
impl ChangeBroker for RecordingBroker {
    async fn publish(&self, topic: &str, event: &str, payload: Value) -> Result<()> {
        self.published
            .lock()
            .push((topic.to_string(), event.to_string(), payload));
        Ok(())
    }
}

pub fn quiet_config() -> LinkConfig {
    LinkConfig {
        heartbeat_interval: None,
        write_interval: Duration::from_millis(1),
        retry_after: Duration::from_secs(5),
        reply_timeout: Some(Duration::from_secs(2)),
    }
}

/// The builder process on the far side of a link.
pub struct FakePeer {
    pub link: Link,
    dispatches: mpsc::UnboundedReceiver<Dispatch>,
}

impl FakePeer {
    pub async fn next_dispatch(&mut self) -> Dispatch {
        tokio::time::timeout(Duration::from_secs(2), self.dispatches.recv())
            .await
            .expect("no dispatch within 2s")
            .expect("peer link closed")
    }

    /// Send a log report and wait for the architect's acknowledgement.
    pub async fn report(&self, line: LogLineReport) -> ReplyPayload {
        let body = serde_json::to_value(BuilderReport::Log(line)).unwrap();
        self.link
            .request(Envelope::event(POOL_TOPIC, REPORT_EVENT, body))
            .await
            .unwrap()
    }
}

/// A link to a builder whose commands are captured by the returned peer.
pub fn fake_builder() -> (Link, FakePeer) {
    fake_builder_with(Handlers::new())
}

/// Like [`fake_builder`], installing `handlers` on the architect side.
pub fn fake_builder_with(handlers: Handlers) -> (Link, FakePeer) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let link = Link::open(Transport::lines("builder", a), quiet_config(), handlers);

    let (tx, dispatches) = mpsc::unbounded_channel();
    let peer_handlers = Handlers::new().on(COMMAND_EVENT, move |envelope: &Envelope| {
        let dispatch = envelope
            .payload
            .body()
            .and_then(|body| serde_json::from_value(body.clone()).ok());
        match dispatch {
            Some(dispatch) => {
                let _ = tx.send(dispatch);
                Some(ReplyPayload::ok())
            }
            None => Some(ReplyPayload::error("malformed command")),
        }
    });
    let peer = Link::open(Transport::lines("architect", b), quiet_config(), peer_handlers);

    (
        link,
        FakePeer {
            link: peer,
            dispatches,
        },
    )
}

/// Insert a waiting build with `steps` steps, one stream each.
pub fn seed_build(store: &MemoryStore, steps: i32) -> Build {
    let build = Build::new(ResourceId::new(), 1);
    store.insert_build(build.clone());
    for index in 0..steps {
        let step = Step::new(build.id, index, format!("step-{index}"));
        store.insert_stream(Stream::new(step.id, 0, "stdout"));
        store.insert_step(step);
    }
    build
}

pub fn log_line(
    build: ResourceId,
    step: ResourceId,
    stream: ResourceId,
    number: i64,
    status: Status,
) -> LogLineReport {
    LogLineReport {
        build_id: build,
        step_id: step,
        stream_id: stream,
        line_number: number,
        status,
        output: format!("line {number}"),
    }
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met within 2s");
}
