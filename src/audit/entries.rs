//! Log entry types for the two audit streams.

use crate::ledger::models::Module;
use crate::KeywardenError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Administrative action recorded in the activity stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityAction {
    /// A key was added.
    CreateKey,
    /// A key was edited.
    UpdateKey,
    /// A key was removed.
    DeleteKey,
    /// Old activity entries were purged.
    CleanupActivityLog,
}

impl ActivityAction {
    /// Stored tag.
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityAction::CreateKey => "CREATE_KEY",
            ActivityAction::UpdateKey => "UPDATE_KEY",
            ActivityAction::DeleteKey => "DELETE_KEY",
            ActivityAction::CleanupActivityLog => "CLEANUP_ACTIVITY_LOG",
        }
    }
}

impl fmt::Display for ActivityAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityAction {
    type Err = KeywardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREATE_KEY" => Ok(ActivityAction::CreateKey),
            "UPDATE_KEY" => Ok(ActivityAction::UpdateKey),
            "DELETE_KEY" => Ok(ActivityAction::DeleteKey),
            "CLEANUP_ACTIVITY_LOG" => Ok(ActivityAction::CleanupActivityLog),
            other => Err(KeywardenError::UnknownAction(other.to_string())),
        }
    }
}

/// Who performed an administrative change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdminContext {
    /// Actor IP address.
    pub ip: Option<String>,
    /// Actor user agent.
    pub user_agent: Option<String>,
}

/// Transport details of a gateway request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Endpoint name, e.g. `"generate"`.
    pub endpoint: Option<String>,
    /// Caller IP address.
    pub ip: Option<String>,
    /// Caller user agent.
    pub user_agent: Option<String>,
    /// Request parameters worth keeping, already stripped of payloads.
    pub request_data: Option<Value>,
}

/// A decision entry about to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDecisionEntry {
    /// Key as sent by the caller, or `"unknown"`.
    pub key: String,
    /// Module the request targeted.
    pub module: Module,
    /// Device as sent by the caller, or `"unknown"`.
    pub device_id: Option<String>,
    /// Transport details.
    pub context: RequestContext,
    /// Status code returned to the caller.
    pub response_status: u16,
    /// Message returned to the caller.
    pub response_message: String,
}

/// One stored authorization or usage attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionLogEntry {
    /// Row id.
    pub id: i64,
    /// Key as sent by the caller.
    pub key: String,
    /// Module.
    pub module: Module,
    /// Device as sent by the caller.
    pub device_id: Option<String>,
    /// Endpoint name.
    pub endpoint: Option<String>,
    /// Caller IP.
    pub user_ip: Option<String>,
    /// Caller user agent.
    pub user_agent: Option<String>,
    /// Request parameters.
    pub request_data: Option<Value>,
    /// Status code returned.
    pub response_status: Option<u16>,
    /// Message returned.
    pub response_message: Option<String>,
    /// When the request was decided.
    pub created_at: DateTime<Utc>,
}

/// An activity entry about to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewActivityEntry {
    /// What happened.
    pub action: ActivityAction,
    /// Affected key, if any.
    pub key: Option<String>,
    /// Affected module, if any.
    pub module: Option<Module>,
    /// Snapshot before the change.
    pub old_values: Option<Value>,
    /// Snapshot after the change.
    pub new_values: Option<Value>,
    /// Actor.
    pub actor: AdminContext,
}

impl NewActivityEntry {
    /// An entry with no key, module or snapshots.
    pub fn new(action: ActivityAction, actor: AdminContext) -> Self {
        Self {
            action,
            key: None,
            module: None,
            old_values: None,
            new_values: None,
            actor,
        }
    }

    /// Attach the affected row.
    pub fn row(mut self, key: impl Into<String>, module: Module) -> Self {
        self.key = Some(key.into());
        self.module = Some(module);
        self
    }

    /// Attach the before snapshot.
    pub fn old_values(mut self, values: Value) -> Self {
        self.old_values = Some(values);
        self
    }

    /// Attach the after snapshot.
    pub fn new_values(mut self, values: Value) -> Self {
        self.new_values = Some(values);
        self
    }
}

/// One stored administrative change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityLogEntry {
    /// Row id.
    pub id: i64,
    /// What happened.
    pub action: ActivityAction,
    /// Affected key.
    pub key: Option<String>,
    /// Affected module.
    pub module: Option<Module>,
    /// Snapshot before the change.
    pub old_values: Option<Value>,
    /// Snapshot after the change.
    pub new_values: Option<Value>,
    /// Actor IP.
    pub user_ip: Option<String>,
    /// Actor user agent.
    pub user_agent: Option<String>,
    /// When it happened.
    pub created_at: DateTime<Utc>,
}

/// An entry of the merged activity and decision feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedItem {
    /// Administrative change.
    Activity(ActivityLogEntry),
    /// Gateway decision.
    #[serde(rename = "api_usage")]
    Decision(DecisionLogEntry),
}

impl FeedItem {
    /// Feed-unique id, `activity_<n>` or `usage_<n>`.
    pub fn feed_id(&self) -> String {
        match self {
            FeedItem::Activity(entry) => format!("activity_{}", entry.id),
            FeedItem::Decision(entry) => format!("usage_{}", entry.id),
        }
    }

    /// When the entry was written.
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            FeedItem::Activity(entry) => entry.created_at,
            FeedItem::Decision(entry) => entry.created_at,
        }
    }

    /// Action label: the activity tag, or `API_<endpoint>` for decisions.
    pub fn action_label(&self) -> String {
        match self {
            FeedItem::Activity(entry) => entry.action.to_string(),
            FeedItem::Decision(entry) => match &entry.endpoint {
                Some(endpoint) => format!("API_{}", endpoint),
                None => "API_CALL".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn action_tags_round_trip() {
        for action in [
            ActivityAction::CreateKey,
            ActivityAction::UpdateKey,
            ActivityAction::DeleteKey,
            ActivityAction::CleanupActivityLog,
        ] {
            assert_eq!(action.as_str().parse::<ActivityAction>().unwrap(), action);
        }
        assert_eq!("create_key".parse::<ActivityAction>().unwrap(), ActivityAction::CreateKey);
        assert!("LOGIN".parse::<ActivityAction>().is_err());
    }

    #[test]
    fn feed_item_labels() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();
        let decision = FeedItem::Decision(DecisionLogEntry {
            id: 7,
            key: "K".into(),
            module: Module::Voice,
            device_id: None,
            endpoint: Some("generate".into()),
            user_ip: None,
            user_agent: None,
            request_data: None,
            response_status: Some(200),
            response_message: Some("OK".into()),
            created_at: ts,
        });
        assert_eq!(decision.feed_id(), "usage_7");
        assert_eq!(decision.action_label(), "API_generate");

        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["type"], "api_usage");
        assert_eq!(json["module"], "voice");
    }
}
