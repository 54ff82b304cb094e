//! # cmb-node
//!
//! The CMB server and client: UDP socket drivers around the sans-I/O state
//! machines in `cmb-proto`, plus the CLI front-end and output sinks.
//!
//! Each connection runs as one tokio task owning its state machine
//! exclusively; tasks communicate only through the UDP socket and in-process
//! channels, so no connection ever reads another's state.

use std::time::Instant;

pub mod cli;
pub mod client;
pub mod server;
pub mod sink;

/// Sleeps until the machine's next deadline, or forever if it has none.
pub(crate) async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending::<()>().await,
    }
}
