//! Multi-device sync. Each device uploads a sealed snapshot of its own usage into one document
//! and merges every device's document on pull. Local buckets never absorb remote data; the
//! merged view is cached separately.

pub mod coordinator;
pub mod queue;
pub mod remote;
pub mod snapshot;
