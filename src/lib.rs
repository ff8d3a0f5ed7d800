//! ZeptoClaw: control plane for a self-hosted personal AI agent.
//!
//! A token-authenticated HTTP/WebSocket gateway in front of the agent, an
//! autonomous social-platform scheduler, durable JSON state, and a
//! separately deployed edge watchdog with circuit-breaker backoff.

pub mod agent;
pub mod auth;
pub mod autonomous;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod logs;
pub mod ratelimit;
pub mod server;
pub mod sessions;
pub mod social;
pub mod state;
pub mod types;
pub mod watchdog;
