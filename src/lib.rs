//! nwshare: serverless peer-to-peer file sharing.
//!
//! [`core`] holds the transfer engine: connection lifecycle, backpressure,
//! chunk production and reassembly, and the coordinator that ties them
//! together. [`utils`] holds small shared helpers.

pub mod core;
pub mod utils;
