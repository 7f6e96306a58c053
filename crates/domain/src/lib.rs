//! `mf-domain`: shared data model for the McpFleet workspace.
//!
//! Holds everything that can be described without doing I/O: the server
//! configuration record, the on-disk `mcp.json` document shape, tool risk
//! and approval policy, the model-facing tool definition, and the error
//! types shared by the other crates.

pub mod config;
pub mod error;
pub mod policy;
pub mod tool;
