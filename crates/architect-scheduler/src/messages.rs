//! Application messages exchanged with builders over the pool topic.

use architect_core::{Build, KnownHost, ResourceId, Status, Step, Stream};
use serde::{Deserialize, Serialize};

/// Topic every builder joins.
pub const POOL_TOPIC: &str = "builders:pool";

/// Event carrying a [`Dispatch`] to a builder.
pub const COMMAND_EVENT: &str = "command";

/// Event carrying a [`BuilderReport`] from a builder.
pub const REPORT_EVENT: &str = "report";

/// Work sent to a builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "payload", rename_all = "lowercase")]
pub enum Dispatch {
    /// SSH host keys the builder needs before cloning.
    KnownHosts(KnownHostsDispatch),
    /// A build with everything needed to run it.
    Build(BuildDispatch),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownHostsDispatch {
    pub known_hosts: Vec<KnownHost>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildDispatch {
    pub build: Build,
    pub steps: Vec<Step>,
    pub streams: Vec<Stream>,
}

/// Progress sent back by a builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum BuilderReport {
    Log(LogLineReport),
}

/// One line of output plus the status of the step that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLineReport {
    pub build_id: ResourceId,
    pub step_id: ResourceId,
    pub stream_id: ResourceId,
    pub line_number: i64,
    pub status: Status,
    pub output: String,
}
