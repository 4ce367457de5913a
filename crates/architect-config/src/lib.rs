//! KDL configuration parsing for the Architect build coordinator.
//!
//! This crate handles parsing of:
//! - Listener and database settings
//! - Link, scheduler and registry timings
//! - Accepted builder token digests

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    ArchitectConfig, LinkSettings, RegistrySettings, SchedulerSettings, TokenDigest, load_config,
    parse_config,
};
