//! Build, step and stream records.
//!
//! These are the records the coordinator reads and mutates through the
//! store traits in [`crate::store`]. A build is an ordered pipeline of
//! steps; each step owns one or more output streams.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// Execution status shared by builds and steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Queued, not yet picked up by a builder.
    Waiting,
    /// Currently executing.
    Running,
    /// Completed successfully.
    Success,
    /// Completed unsuccessfully, or abandoned by its builder.
    Failed,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Success | Status::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Waiting => "waiting",
            Status::Running => "running",
            Status::Success => "success",
            Status::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "waiting" => Ok(Status::Waiting),
            "running" => Ok(Status::Running),
            "success" => Ok(Status::Success),
            "failed" => Ok(Status::Failed),
            other => Err(crate::Error::InvalidInput(format!("unknown status '{other}'"))),
        }
    }
}

/// A queued or executing build job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    pub id: ResourceId,
    /// Project the build belongs to.
    pub project_id: ResourceId,
    /// Incrementing number within the project.
    pub number: i64,
    pub status: Status,
    /// Repository to clone, if the blueprint uses one.
    pub repository: Option<String>,
    /// Commit to check out.
    pub commit: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Build {
    /// Create a waiting build with the given number.
    pub fn new(project_id: ResourceId, number: i64) -> Self {
        Self {
            id: ResourceId::new(),
            project_id,
            number,
            status: Status::Waiting,
            repository: None,
            commit: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// One containerized step of a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: ResourceId,
    pub build_id: ResourceId,
    /// Position in the build's pipeline, starting at 0.
    pub index: i32,
    pub name: String,
    pub status: Status,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(build_id: ResourceId, index: i32, name: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(),
            build_id,
            index,
            name: name.into(),
            status: Status::Waiting,
            started_at: None,
            finished_at: None,
        }
    }
}

/// A named output stream of a step (e.g. a container's stdout).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    pub id: ResourceId,
    pub step_id: ResourceId,
    pub index: i32,
    pub name: String,
}

impl Stream {
    pub fn new(step_id: ResourceId, index: i32, name: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(),
            step_id,
            index,
            name: name.into(),
        }
    }
}

/// A persisted line of stream output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamLine {
    pub stream_id: ResourceId,
    pub number: i64,
    pub timestamp: DateTime<Utc>,
    pub output: String,
}

/// An SSH host-key entry distributed to builders before cloning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownHost {
    pub entry: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_names() {
        assert_eq!(serde_json::to_string(&Status::Running).unwrap(), "\"running\"");
        let parsed: Status = serde_json::from_str("\"success\"").unwrap();
        assert_eq!(parsed, Status::Success);
        assert_eq!("failed".parse::<Status>().unwrap(), Status::Failed);
        assert!("done".parse::<Status>().is_err());
    }

    #[test]
    fn only_success_and_failed_are_terminal() {
        assert!(!Status::Waiting.is_terminal());
        assert!(!Status::Running.is_terminal());
        assert!(Status::Success.is_terminal());
        assert!(Status::Failed.is_terminal());
    }

    #[test]
    fn build_serializes_camel_case() {
        let build = Build::new(ResourceId::new(), 3);
        let value = serde_json::to_value(&build).unwrap();
        assert_eq!(value["status"], "waiting");
        assert!(value.get("projectId").is_some());
        assert!(value["startedAt"].is_null());
    }
}
