pub mod cli;
pub mod client;
pub mod cluster;
pub mod config;
pub mod runtime;
