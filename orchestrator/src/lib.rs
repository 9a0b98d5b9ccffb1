//! shipyard library
//!
//! Core modules for the single-host deployment orchestrator.

pub mod app;
pub mod bootstrap;
pub mod cli;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod http;
pub mod logs;
pub mod models;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod secrets;
pub mod server;
pub mod storage;
pub mod utils;
