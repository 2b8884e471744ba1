//! MCP Transport & Tenancy Router: the SSE/JSON-RPC server that fronts
//! `mem-core`, `mem-embed`, and `mem-session` for remote agent clients
//! (§4.10, §4.11).

pub mod auth;
pub mod config;
pub mod error;
pub mod mcp;
pub mod pool;
pub mod rpc;
pub mod schema;
pub mod state;
pub mod tools;
pub mod workers;

pub use config::ServerConfig;
pub use error::{ApiError, Result};
pub use pool::TenantPool;
pub use state::{AppState, RouterDb};
