pub mod instance;
pub mod operations;
