pub mod agent;
pub mod config;
pub mod error;
pub mod llm;
pub mod sandbox;
pub mod server;
pub mod shutdown;
pub mod workflow;
