//! Persistence collaborators.
//!
//! The coordinator never talks to a database directly; it reads and writes
//! build records through these traits. `architect-db` provides PostgreSQL
//! implementations and [`crate::memory`] an in-process one.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::build::{Build, KnownHost, Step, Stream};
use crate::memory::MemoryStore;
use crate::{ResourceId, Result};

#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn get_by_id(&self, id: ResourceId) -> Result<Build>;

    /// Builds queued for a builder, oldest first.
    async fn get_waiting(&self) -> Result<Vec<Build>>;

    /// Builds currently marked running.
    async fn get_running(&self) -> Result<Vec<Build>>;

    async fn update(&self, build: &Build) -> Result<()>;
}

#[async_trait]
pub trait StepStore: Send + Sync {
    async fn get_by_id(&self, id: ResourceId) -> Result<Step>;

    /// Steps of a build ordered by index.
    async fn get_for_build(&self, build_id: ResourceId) -> Result<Vec<Step>>;

    async fn update(&self, step: &Step) -> Result<()>;
}

#[async_trait]
pub trait StreamStore: Send + Sync {
    async fn get_by_id(&self, id: ResourceId) -> Result<Stream>;

    /// Streams of a step ordered by index.
    async fn get_for_step(&self, step_id: ResourceId) -> Result<Vec<Stream>>;

    /// Append one line of output to a stream.
    async fn append_line(
        &self,
        stream: &Stream,
        number: i64,
        timestamp: DateTime<Utc>,
        output: &str,
    ) -> Result<()>;
}

#[async_trait]
pub trait KnownHostStore: Send + Sync {
    async fn get_all(&self) -> Result<Vec<KnownHost>>;
}

/// The full set of collaborators, shared by the registry and monitors.
#[derive(Clone)]
pub struct Stores {
    pub builds: Arc<dyn BuildStore>,
    pub steps: Arc<dyn StepStore>,
    pub streams: Arc<dyn StreamStore>,
    pub known_hosts: Arc<dyn KnownHostStore>,
}

impl Stores {
    /// Back every collaborator with one in-memory store.
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            builds: store.clone(),
            steps: store.clone(),
            streams: store.clone(),
            known_hosts: store,
        }
    }
}
