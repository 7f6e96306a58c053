mod mcp;
mod server;

pub use mcp::*;
pub use server::*;
