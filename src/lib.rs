//! Idlegate - A UDP proxy that keeps its backend asleep while nobody plays
//!
//! This library provides a datagram relay that:
//! - Forwards UDP traffic from many clients to a single backend address
//! - Tracks each client as a connection and forgets it after a quiet period
//! - Wakes (unpauses or starts) the backend containers on the first new client
//! - Pauses or stops the backend once no client has been seen for a while
//! - Exposes an authenticated HTTP control surface for inspection and manual actions

pub mod admin;
pub mod backend;
pub mod config;
pub mod docker;
pub mod error;
pub mod lifecycle;
pub mod monitor;
pub mod relay;
pub mod table;
