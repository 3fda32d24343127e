//! Async Nanometrics NMXP client for seismic data.
//!
//! [`PdsClient`] subscribes to a NaqsServer Private Data Stream and yields
//! records in real time; [`ReconnectingPdsClient`] keeps that subscription
//! alive across dropped connections. [`DapClient`] retrieves archived time
//! windows from a DataServer, once or following real time. Records can be
//! fanned out to any number of [`RecordSink`]s through a [`RecordPipeline`].

pub mod config;
pub mod connection;
pub mod continuity;
pub mod dap;
pub mod error;
pub mod pds;
pub mod raw_stream;
pub mod reconnect;
pub mod retry;
pub mod sink;
pub mod state;
pub mod stream;

#[cfg(test)]
mod mock;

pub use config::{Backoff, ClientConfig, Completion, Credentials, DapMode, DapRequest, PdsRequest, TimeWindow};
pub use continuity::{Continuity, ContinuityTracker};
pub use dap::DapClient;
pub use error::{ClientError, Result};
pub use pds::PdsClient;
pub use reconnect::ReconnectingPdsClient;
pub use retry::{StopHandle, StopSignal};
pub use sink::{RecordPipeline, RecordSink, SinkError};
pub use state::{DapState, PdsState};
