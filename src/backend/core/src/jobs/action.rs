//! Marketplaces, action codes and the shared action definition table.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::job::JobPriority;
use crate::error::{ErrorCode, RelistError, Result};

/// A supported resale marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Marketplace {
    Vinted,
    Ebay,
    Etsy,
}

impl Marketplace {
    pub const ALL: [Marketplace; 3] = [Self::Vinted, Self::Ebay, Self::Etsy];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vinted => "vinted",
            Self::Ebay => "ebay",
            Self::Etsy => "etsy",
        }
    }
}

impl fmt::Display for Marketplace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Marketplace {
    type Err = RelistError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| RelistError::validation(format!("Unknown marketplace: {}", s)))
    }
}

/// What a job does on its marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCode {
    Publish,
    Update,
    Delete,
    Sync,
    CheckConnection,
    Upload,
}

impl ActionCode {
    pub const ALL: [ActionCode; 6] = [
        Self::Publish,
        Self::Update,
        Self::Delete,
        Self::Sync,
        Self::CheckConnection,
        Self::Upload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Sync => "sync",
            Self::CheckConnection => "check_connection",
            Self::Upload => "upload",
        }
    }
}

impl fmt::Display for ActionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionCode {
    type Err = RelistError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| RelistError::validation(format!("Unknown action: {}", s)))
    }
}

/// A (marketplace, action) pair; the key handlers are registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionKind {
    pub marketplace: Marketplace,
    pub action: ActionCode,
}

impl ActionKind {
    pub const fn new(marketplace: Marketplace, action: ActionCode) -> Self {
        Self { marketplace, action }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.marketplace, self.action)
    }
}

/// Timeout class of the executor calls an action makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcClass {
    Ping,
    Read,
    Write,
    Upload,
}

impl RpcClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Read => "read",
            Self::Write => "write",
            Self::Upload => "upload",
        }
    }
}

/// One row of the shared action reference table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub code: ActionCode,
    pub name: String,
    /// Mutating actions take the exclusive product lock at claim time.
    pub mutating: bool,
    pub default_priority: JobPriority,
    pub default_max_retries: u32,
    pub rpc_class: RpcClass,
}

/// Lookup table of action definitions, built once at startup.
#[derive(Debug, Clone)]
pub struct ActionRegistry {
    definitions: HashMap<ActionCode, ActionDefinition>,
}

impl ActionRegistry {
    /// The built-in action set.
    pub fn builtin() -> Self {
        let def = |code, name: &str, mutating, priority, retries, rpc_class| ActionDefinition {
            code,
            name: name.to_string(),
            mutating,
            default_priority: priority,
            default_max_retries: retries,
            rpc_class,
        };

        Self::from_definitions([
            def(ActionCode::Publish, "Publish listing", true, JobPriority::Normal, 3, RpcClass::Write),
            def(ActionCode::Update, "Update listing", true, JobPriority::Normal, 3, RpcClass::Write),
            def(ActionCode::Delete, "Delete listing", true, JobPriority::High, 3, RpcClass::Write),
            def(ActionCode::Sync, "Sync inventory", false, JobPriority::Low, 2, RpcClass::Read),
            def(
                ActionCode::CheckConnection,
                "Check connection",
                false,
                JobPriority::High,
                1,
                RpcClass::Ping,
            ),
            def(ActionCode::Upload, "Upload media", true, JobPriority::Normal, 3, RpcClass::Upload),
        ])
    }

    pub fn from_definitions(definitions: impl IntoIterator<Item = ActionDefinition>) -> Self {
        Self {
            definitions: definitions.into_iter().map(|d| (d.code, d)).collect(),
        }
    }

    pub fn get(&self, code: ActionCode) -> Result<&ActionDefinition> {
        self.definitions.get(&code).ok_or_else(|| {
            RelistError::new(
                ErrorCode::HandlerNotFound,
                format!("No action definition for {}", code),
            )
        })
    }

    /// Whether jobs for this action lock their product. Unknown actions are
    /// treated as mutating.
    pub fn is_mutating(&self, code: ActionCode) -> bool {
        self.definitions.get(&code).map_or(true, |d| d.mutating)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &ActionDefinition> {
        self.definitions.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_only_actions() {
        let registry = ActionRegistry::builtin();
        assert!(!registry.is_mutating(ActionCode::Sync));
        assert!(!registry.is_mutating(ActionCode::CheckConnection));
        assert!(registry.is_mutating(ActionCode::Publish));
        assert!(registry.is_mutating(ActionCode::Delete));
    }

    #[test]
    fn test_every_action_is_defined() {
        let registry = ActionRegistry::builtin();
        for code in ActionCode::ALL {
            assert!(registry.get(code).is_ok(), "{} missing", code);
        }
    }

    #[test]
    fn test_parse_round_trip() {
        assert_eq!("EBAY".parse::<Marketplace>().unwrap(), Marketplace::Ebay);
        assert_eq!(
            "check_connection".parse::<ActionCode>().unwrap(),
            ActionCode::CheckConnection
        );
        assert!("relist".parse::<ActionCode>().is_err());
    }

    #[test]
    fn test_kind_display() {
        let kind = ActionKind::new(Marketplace::Vinted, ActionCode::Sync);
        assert_eq!(kind.to_string(), "vinted/sync");
    }
}
