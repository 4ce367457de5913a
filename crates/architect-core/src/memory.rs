//! In-memory store implementations.
//!
//! Used by tests and by single-process setups that do not need builds to
//! survive a restart.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::build::{Build, KnownHost, Status, Step, Stream, StreamLine};
use crate::store::{BuildStore, KnownHostStore, StepStore, StreamStore};
use crate::{Error, ResourceId, Result};

#[derive(Default)]
struct Tables {
    builds: HashMap<ResourceId, Build>,
    steps: HashMap<ResourceId, Step>,
    streams: HashMap<ResourceId, Stream>,
    lines: HashMap<ResourceId, Vec<StreamLine>>,
    known_hosts: Vec<KnownHost>,
}

/// A single store backing every collaborator trait.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_build(&self, build: Build) {
        self.tables.lock().builds.insert(build.id, build);
    }

    pub fn insert_step(&self, step: Step) {
        self.tables.lock().steps.insert(step.id, step);
    }

    pub fn insert_stream(&self, stream: Stream) {
        self.tables.lock().streams.insert(stream.id, stream);
    }

    pub fn add_known_host(&self, entry: impl Into<String>) {
        self.tables.lock().known_hosts.push(KnownHost {
            entry: entry.into(),
        });
    }

    /// Lines appended to a stream so far, in append order.
    pub fn lines(&self, stream_id: ResourceId) -> Vec<StreamLine> {
        self.tables
            .lock()
            .lines
            .get(&stream_id)
            .cloned()
            .unwrap_or_default()
    }

    fn builds_with_status(&self, status: Status) -> Vec<Build> {
        let mut builds: Vec<Build> = self
            .tables
            .lock()
            .builds
            .values()
            .filter(|b| b.status == status)
            .cloned()
            .collect();
        builds.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        builds
    }
}

#[async_trait]
impl BuildStore for MemoryStore {
    async fn get_by_id(&self, id: ResourceId) -> Result<Build> {
        self.tables
            .lock()
            .builds
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("build {id}")))
    }

    async fn get_waiting(&self) -> Result<Vec<Build>> {
        Ok(self.builds_with_status(Status::Waiting))
    }

    async fn get_running(&self) -> Result<Vec<Build>> {
        Ok(self.builds_with_status(Status::Running))
    }

    async fn update(&self, build: &Build) -> Result<()> {
        let mut tables = self.tables.lock();
        match tables.builds.get_mut(&build.id) {
            Some(existing) => {
                *existing = build.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("build {}", build.id))),
        }
    }
}

#[async_trait]
impl StepStore for MemoryStore {
    async fn get_by_id(&self, id: ResourceId) -> Result<Step> {
        self.tables
            .lock()
            .steps
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("step {id}")))
    }

    async fn get_for_build(&self, build_id: ResourceId) -> Result<Vec<Step>> {
        let mut steps: Vec<Step> = self
            .tables
            .lock()
            .steps
            .values()
            .filter(|s| s.build_id == build_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.index);
        Ok(steps)
    }

    async fn update(&self, step: &Step) -> Result<()> {
        let mut tables = self.tables.lock();
        match tables.steps.get_mut(&step.id) {
            Some(existing) => {
                *existing = step.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("step {}", step.id))),
        }
    }
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn get_by_id(&self, id: ResourceId) -> Result<Stream> {
        self.tables
            .lock()
            .streams
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("stream {id}")))
    }

    async fn get_for_step(&self, step_id: ResourceId) -> Result<Vec<Stream>> {
        let mut streams: Vec<Stream> = self
            .tables
            .lock()
            .streams
            .values()
            .filter(|s| s.step_id == step_id)
            .cloned()
            .collect();
        streams.sort_by_key(|s| s.index);
        Ok(streams)
    }

    async fn append_line(
        &self,
        stream: &Stream,
        number: i64,
        timestamp: DateTime<Utc>,
        output: &str,
    ) -> Result<()> {
        let mut tables = self.tables.lock();
        if !tables.streams.contains_key(&stream.id) {
            return Err(Error::NotFound(format!("stream {}", stream.id)));
        }
        let lines = tables.lines.entry(stream.id).or_default();
        // A retried report carries a line number that is already stored.
        if lines.iter().any(|line| line.number == number) {
            return Ok(());
        }
        lines.push(StreamLine {
            stream_id: stream.id,
            number,
            timestamp,
            output: output.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl KnownHostStore for MemoryStore {
    async fn get_all(&self) -> Result<Vec<KnownHost>> {
        Ok(self.tables.lock().known_hosts.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn filters_builds_by_status() {
        let store = MemoryStore::new();
        let project = ResourceId::new();
        let waiting = Build::new(project, 1);
        let mut running = Build::new(project, 2);
        running.status = Status::Running;
        store.insert_build(waiting.clone());
        store.insert_build(running.clone());

        let found = store.get_waiting().await.unwrap();
        assert_eq!(found, vec![waiting]);
        let found = store.get_running().await.unwrap();
        assert_eq!(found, vec![running]);
    }

    #[tokio::test]
    async fn steps_come_back_in_index_order() {
        let store = MemoryStore::new();
        let build = ResourceId::new();
        store.insert_step(Step::new(build, 2, "deploy"));
        store.insert_step(Step::new(build, 0, "clone"));
        store.insert_step(Step::new(build, 1, "test"));

        let steps = store.get_for_build(build).await.unwrap();
        let names: Vec<_> = steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["clone", "test", "deploy"]);
    }

    #[tokio::test]
    async fn appending_to_unknown_stream_fails() {
        let store = MemoryStore::new();
        let stream = Stream::new(ResourceId::new(), 0, "stdout");
        let err = store
            .append_line(&stream, 1, Utc::now(), "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        store.insert_stream(stream.clone());
        store.append_line(&stream, 1, Utc::now(), "hello").await.unwrap();
        assert_eq!(store.lines(stream.id).len(), 1);
    }

    #[tokio::test]
    async fn repeated_line_number_is_stored_once() {
        let store = MemoryStore::new();
        let stream = Stream::new(ResourceId::new(), 0, "stdout");
        store.insert_stream(stream.clone());

        store.append_line(&stream, 1, Utc::now(), "compiling").await.unwrap();
        store.append_line(&stream, 1, Utc::now(), "compiling").await.unwrap();
        store.append_line(&stream, 2, Utc::now(), "done").await.unwrap();

        let lines = store.lines(stream.id);
        let numbers: Vec<i64> = lines.iter().map(|l| l.number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[tokio::test]
    async fn updating_missing_build_is_not_found() {
        let store = MemoryStore::new();
        let build = Build::new(ResourceId::new(), 1);
        assert!(BuildStore::update(&store, &build).await.is_err());
    }
}
