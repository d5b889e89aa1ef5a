//! Tracks how long the browser spends on each website. A browser extension feeds tab and window
//! events to the daemon through native messaging, the daemon keeps encrypted per-day totals and
//! optionally syncs them with other devices. The cli reads the same data from a terminal.
//!

pub mod api;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod daemon;
pub mod fs;
pub mod sync;
pub mod utils;
