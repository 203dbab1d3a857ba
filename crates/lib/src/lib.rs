//! Funil core library — funnel domain, envelope protocol, consultant
//! controller, stores, and the gateway used by the CLI.

pub mod config;
pub mod consultant;
pub mod envelope;
pub mod funnel;
pub mod gateway;
pub mod init;
pub mod lead;
pub mod llm;
pub mod persona;
pub mod session;
pub mod store;
