//! Sync Agent: scheduled tasks, live remote config and leased commands.

pub mod commands;
pub mod config;
pub mod error;
pub mod remote;
pub mod scheduler;
pub mod tasks;
