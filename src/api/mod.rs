//! Message API shared by the extension host and the CLI. Requests are tagged JSON objects,
//! every request gets exactly one [messages::Response].

pub mod facade;
pub mod messages;
pub mod port;
