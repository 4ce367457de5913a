//! Core domain types and collaborator traits for the Architect build coordinator.
//!
//! This crate contains:
//! - Resource identifiers and the shared error type
//! - Build, step, stream and known-host records
//! - Builder lifecycle state
//! - Store and change-broker traits consumed by the scheduler
//! - In-memory implementations of those traits

pub mod broker;
pub mod build;
pub mod builder;
pub mod error;
pub mod id;
pub mod memory;
pub mod store;

pub use broker::{BroadcastBroker, ChangeBroker, ChangeEvent};
pub use build::{Build, KnownHost, Status, Step, Stream, StreamLine};
pub use builder::{BuilderState, BuilderSummary};
pub use error::{Error, Result};
pub use id::ResourceId;
pub use memory::MemoryStore;
pub use store::{BuildStore, KnownHostStore, StepStore, Stores, StreamStore};
