//! Turning browser notifications into tracked time.
//!  - [browser]: host event types and the [browser::TabRegistry] used for lookups.
//!  - [domain]: url classification, normalization and exclusions.
//!  - [monitor::ActivityMonitor]: the active session state machine.

pub mod browser;
pub mod domain;
pub mod monitor;
