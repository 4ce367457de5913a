//! Builder agent state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// Lifecycle state of a connected builder.
///
/// `Ready -> Busy` happens only on scheduler assignment and `Busy -> Ready`
/// only once the build's last step reports a terminal status. A builder
/// whose link dies is removed outright rather than transitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuilderState {
    Ready,
    Busy,
    Error,
}

impl BuilderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuilderState::Ready => "Ready",
            BuilderState::Busy => "Busy",
            BuilderState::Error => "Error",
        }
    }
}

impl std::fmt::Display for BuilderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuilderState {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ready" => Ok(BuilderState::Ready),
            "busy" => Ok(BuilderState::Busy),
            "error" => Ok(BuilderState::Error),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown builder state '{other}'"
            ))),
        }
    }
}

/// Link-free view of a builder, used for change notifications and listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuilderSummary {
    pub id: ResourceId,
    pub state: BuilderState,
    pub build_id: Option<ResourceId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
