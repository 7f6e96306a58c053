//! Tool risk levels and approval processes.
//!
//! Both enums are consumed by the tool bridge: servers carry a maximum risk
//! level and an approval process in their configuration, and the host's
//! risk policy supplies the ceiling for the current context.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Risk of executing a tool. Ordered from harmless to most dangerous.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who decides whether a tool call may run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalProcess {
    /// Ask the user every time.
    #[default]
    User,
    AllowAll,
    DenyAll,
    /// A secondary assistant evaluates the call; its verdict is final.
    Assistant,
    /// Ask the assistant first and fall back to the user when it declines.
    UserWhenAssistantDenies,
}
