//! MCP server exposing a Home Assistant instance as agent tools.
//!
//! Tool calls are translated into Home Assistant REST requests by
//! [`client::HomeAssistantClient`], dispatched through [`tools::ToolRegistry`]
//! and served over stdio ([`server::SmartHomeServer`]) or streamable HTTP
//! ([`session`]).

pub mod client;
pub mod config;
pub mod error;
pub mod server;
pub mod session;
pub mod template;
pub mod tools;
