//! snippet-runner library
//!
//! This crate provides the code-execution core behind snippet-runner:
//! - Configuration of per-language toolchains and the remote API
//! - Local process, remote API and embedded-engine backends
//! - The coordinator that picks a strategy and reports one terminal status
//! - MCP server implementation using rmcp

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod language;
pub mod mcp;
pub mod scratch;
pub mod sink;
