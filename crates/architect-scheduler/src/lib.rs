//! Builder fleet coordination for Architect.
//!
//! - [`BuilderRegistry`]: connected builders and their state
//! - [`BuildScheduler`]: matches waiting builds to ready builders
//! - [`BuildMonitor`]: applies builder reports to build records

pub mod messages;
pub mod monitor;
pub mod registry;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use messages::{
    BuildDispatch, BuilderReport, COMMAND_EVENT, Dispatch, KnownHostsDispatch, LogLineReport,
    POOL_TOPIC, REPORT_EVENT,
};
pub use monitor::{BuildMonitor, ReportReceiver, report_handlers};
pub use registry::{BUILDERS_TOPIC, BUILDS_TOPIC, Builder, BuilderRegistry, Page};
pub use scheduler::BuildScheduler;
