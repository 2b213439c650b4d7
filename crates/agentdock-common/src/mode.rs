use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Tool-execution policy applied to an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    Plan,
    BypassPermissions,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::Plan => "plan",
            PermissionMode::BypassPermissions => "bypassPermissions",
        }
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(PermissionMode::Default),
            "acceptEdits" => Ok(PermissionMode::AcceptEdits),
            "plan" => Ok(PermissionMode::Plan),
            "bypassPermissions" => Ok(PermissionMode::BypassPermissions),
            _ => Err(format!(
                "Invalid permission mode '{}'. Valid values: default, acceptEdits, plan, bypassPermissions",
                s
            )),
        }
    }
}

/// Tools available while a session is planning. Anything that edits files or
/// runs commands is left out.
pub const PLAN_MODE_TOOLS: &[&str] = &[
    "Read",
    "Glob",
    "Grep",
    "LS",
    "WebFetch",
    "WebSearch",
    "Task",
    "TodoWrite",
    "AskUserQuestion",
    "ExitPlanMode",
];

/// What the user asked the session to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Plan,
    #[default]
    Build,
}

impl SessionMode {
    pub fn permission_mode(&self) -> PermissionMode {
        match self {
            SessionMode::Plan => PermissionMode::Plan,
            SessionMode::Build => PermissionMode::BypassPermissions,
        }
    }

    /// Restricted tool allow-list, `None` meaning every tool.
    pub fn allowed_tools(&self) -> Option<Vec<String>> {
        match self {
            SessionMode::Plan => Some(PLAN_MODE_TOOLS.iter().map(|t| t.to_string()).collect()),
            SessionMode::Build => None,
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Plan => write!(f, "plan"),
            SessionMode::Build => write!(f, "build"),
        }
    }
}

impl FromStr for SessionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plan" => Ok(SessionMode::Plan),
            "build" => Ok(SessionMode::Build),
            _ => Err(format!("Invalid session mode '{}'. Valid values: plan, build", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_map_to_permission_modes() {
        assert_eq!(SessionMode::Plan.permission_mode(), PermissionMode::Plan);
        assert_eq!(
            SessionMode::Build.permission_mode(),
            PermissionMode::BypassPermissions
        );
        assert!(SessionMode::Build.allowed_tools().is_none());
        let plan_tools = SessionMode::Plan.allowed_tools().unwrap();
        assert!(plan_tools.contains(&"ExitPlanMode".to_string()));
        assert!(!plan_tools.contains(&"Bash".to_string()));
    }

    #[test]
    fn permission_mode_serde_uses_wire_names() {
        let json = serde_json::to_string(&PermissionMode::AcceptEdits).unwrap();
        assert_eq!(json, "\"acceptEdits\"");
        let parsed: PermissionMode = serde_json::from_str("\"bypassPermissions\"").unwrap();
        assert_eq!(parsed, PermissionMode::BypassPermissions);
        assert_eq!("plan".parse::<PermissionMode>().unwrap(), PermissionMode::Plan);
        assert!("yolo".parse::<PermissionMode>().is_err());
    }

    #[test]
    fn session_mode_parse_is_case_insensitive() {
        assert_eq!("Build".parse::<SessionMode>().unwrap(), SessionMode::Build);
        assert_eq!(SessionMode::Plan.to_string(), "plan");
    }
}
