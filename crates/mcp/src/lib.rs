//! Huddle MCP tool provider registry
//!
//! Connects to remote MCP servers over streamable HTTP, discovers their tools
//! and exposes them to the agent as [`huddle_agent::tools::Tool`] adapters.
//!
//! ## Architecture
//!
//! - `McpRegistry`: the set of configured servers, add/remove/reconnect at runtime
//! - `McpConnection`: one client session plus its cached tool list
//! - `McpToolAdapter`: proxies `Tool::invoke` to `tools/call` on the owning server

mod registry;
mod tool;

pub use registry::{
    McpConnection, McpConnectionState, McpRegistry, PollSettings, ServerSpec, ServerStatus,
};
pub use tool::McpToolAdapter;

use thiserror::Error;

/// Errors raised by registry and connection operations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum McpError {
    #[error("mcp server `{0}` is not configured")]
    UnknownServer(String),

    #[error("mcp server `{0}` is already registered")]
    DuplicateServer(String),

    #[error("invalid header `{header}` for mcp server `{server}`")]
    InvalidHeader { server: String, header: String },

    #[error("failed to initialize mcp server `{server}`: {detail}")]
    Connect { server: String, detail: String },

    #[error("mcp server `{server}` request failed: {detail}")]
    Service { server: String, detail: String },

    #[error("mcp server `{0}` is not connected")]
    NotConnected(String),

    #[error("mcp tool arguments must be a JSON object or null")]
    InvalidArguments,

    #[error("no tools discovered on mcp server `{server}` after {attempts} attempts")]
    NoTools { server: String, attempts: u32 },
}
