//! Reliable pub/sub message link for the Architect build coordinator.
//!
//! One long-lived duplex connection carries newline-delimited JSON
//! envelopes in both directions. On top of it:
//! - [`Link`]: acknowledged delivery, heartbeats, retry of stale sends
//! - [`LinkClient`]: dialing side, re-joins its topics after reconnecting
//! - [`LinkServer`]: accepting side, authorizes topic joins

pub mod client;
pub mod envelope;
pub mod error;
pub mod link;
pub mod server;
pub mod transport;

pub use client::{ClientConfig, Dialer, LinkClient, TcpDialer};
pub use envelope::{Envelope, JoinPayload, Payload, ReplyPayload, ReplyStatus};
pub use error::{LinkError, LinkResult};
pub use link::{Handler, Handlers, Link, LinkConfig};
pub use server::{Authorizer, LinkServer, ServerEvent};
pub use transport::{FrameReader, FrameWriter, MAX_FRAME_LEN, Transport};
