//! Key ledger records and the typed values that flow through the core.

use crate::ledger::expiry::{parse_expiry, ExpiryError};
use crate::KeywardenError;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A generation capability with its own key namespace and quota pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Module {
    /// Text-to-speech.
    Voice,
    /// Image generation.
    Image,
    /// Voice cloning.
    CloneVoice,
    /// Music generation.
    Music,
    /// AI video creation.
    MakeVideoAi,
    /// AI video merging.
    MergerVideoAi,
}

impl Module {
    /// Every module, in display order.
    pub const ALL: [Module; 6] = [
        Module::Voice,
        Module::Image,
        Module::CloneVoice,
        Module::Music,
        Module::MakeVideoAi,
        Module::MergerVideoAi,
    ];

    /// The tag stored in the ledger and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Module::Voice => "voice",
            Module::Image => "image",
            Module::CloneVoice => "clone_voice",
            Module::Music => "music",
            Module::MakeVideoAi => "make_video_ai",
            Module::MergerVideoAi => "merger_video_ai",
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Module {
    type Err = KeywardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim();
        Module::ALL
            .into_iter()
            .find(|m| m.as_str() == tag)
            .ok_or_else(|| KeywardenError::UnknownModule(tag.to_string()))
    }
}

/// Whether a key may be used at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// Usable, subject to expiry, binding and quota.
    Active,
    /// Blocked by an administrator.
    Locked,
}

impl KeyStatus {
    /// The tag stored in the ledger.
    pub fn as_str(self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Locked => "locked",
        }
    }

    /// Interpret a stored status. Anything other than `active` (in any
    /// case) blocks use.
    pub fn from_stored(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("active") {
            KeyStatus::Active
        } else {
            KeyStatus::Locked
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyStatus {
    type Err = KeywardenError;

    /// Strict parse for administrative input.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(KeyStatus::Active),
            "locked" => Ok(KeyStatus::Locked),
            other => Err(KeywardenError::UnknownStatus(other.to_string())),
        }
    }
}

/// Units left on a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    /// No quota is set.
    Unlimited,
    /// Units left before the quota is exhausted.
    Units(u64),
}

impl Remaining {
    /// Remaining balance for a quota and a usage count.
    pub fn compute(max_usage: Option<u64>, usage_count: u64) -> Self {
        match max_usage {
            Some(max) => Remaining::Units(max.saturating_sub(usage_count)),
            None => Remaining::Unlimited,
        }
    }

    /// Units left, `None` when unlimited.
    pub fn units(self) -> Option<u64> {
        match self {
            Remaining::Units(n) => Some(n),
            Remaining::Unlimited => None,
        }
    }
}

impl fmt::Display for Remaining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Remaining::Unlimited => f.write_str("unlimited"),
            Remaining::Units(n) => write!(f, "{}", n),
        }
    }
}

impl Serialize for Remaining {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Remaining::Unlimited => serializer.serialize_str("unlimited"),
            Remaining::Units(n) => serializer.serialize_u64(*n),
        }
    }
}

/// One row of the key ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Opaque license key, unique within its module.
    pub key: String,

    /// Module the key is scoped to.
    pub module: Module,

    /// Device the key is bound to, once bound.
    pub device_id: Option<String>,

    /// Administrative status.
    pub status: KeyStatus,

    /// Expiry as entered by the administrator. Parsed at check time.
    pub expires: Option<String>,

    /// Quota; `None` means unlimited.
    pub max_usage: Option<u64>,

    /// Units consumed so far.
    pub usage_count: u64,

    /// Free text.
    pub note: String,

    /// When the row was created.
    pub created_at: DateTime<Utc>,

    /// When the row last changed.
    pub updated_at: DateTime<Utc>,
}

impl KeyRecord {
    /// The bound device, treating an empty string as unbound.
    pub fn bound_device(&self) -> Option<&str> {
        self.device_id.as_deref().filter(|d| !d.is_empty())
    }

    /// Remaining balance on this key.
    pub fn remaining(&self) -> Remaining {
        Remaining::compute(self.max_usage, self.usage_count)
    }

    /// Parse the stored expiry.
    pub fn expiry(&self) -> Result<NaiveDateTime, ExpiryError> {
        parse_expiry(self.expires.as_deref())
    }

    /// Whether the quota is set and fully consumed.
    pub fn is_used_up(&self) -> bool {
        self.max_usage
            .is_some_and(|max| self.usage_count >= max)
    }

    /// Whether the expiry parses and lies before `now`.
    pub fn is_expired_at(&self, now: NaiveDateTime) -> bool {
        self.expiry().map(|expires| expires < now).unwrap_or(false)
    }
}

/// Input for creating a key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewKey {
    /// License key.
    pub key: String,
    /// Module the key is scoped to.
    pub module: Module,
    /// Pre-bound device, normally left unset.
    #[serde(default)]
    pub device_id: Option<String>,
    /// Initial status.
    #[serde(default = "default_status")]
    pub status: KeyStatus,
    /// Expiry in one of the accepted date formats.
    #[serde(default)]
    pub expires: Option<String>,
    /// Quota; `None` means unlimited.
    #[serde(default)]
    pub max_usage: Option<u64>,
    /// Initial usage count.
    #[serde(default)]
    pub usage_count: u64,
    /// Free text.
    #[serde(default)]
    pub note: String,
}

fn default_status() -> KeyStatus {
    KeyStatus::Active
}

impl NewKey {
    /// An active, unbound, unlimited key with no expiry.
    pub fn new(key: impl Into<String>, module: Module) -> Self {
        Self {
            key: key.into(),
            module,
            device_id: None,
            status: KeyStatus::Active,
            expires: None,
            max_usage: None,
            usage_count: 0,
            note: String::new(),
        }
    }

    /// Set the expiry.
    pub fn expires(mut self, expires: impl Into<String>) -> Self {
        self.expires = Some(expires.into());
        self
    }

    /// Set the quota.
    pub fn max_usage(mut self, max_usage: u64) -> Self {
        self.max_usage = Some(max_usage);
        self
    }

    /// Set the starting usage count.
    pub fn usage_count(mut self, usage_count: u64) -> Self {
        self.usage_count = usage_count;
        self
    }

    /// Set the status.
    pub fn status(mut self, status: KeyStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the note.
    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }

    /// Trim text fields and check quota sanity.
    pub fn normalized(mut self) -> Result<Self, KeywardenError> {
        self.key = self.key.trim().to_string();
        if self.key.is_empty() {
            return Err(KeywardenError::InvalidKey("key cannot be empty".into()));
        }
        self.device_id = normalize_optional(self.device_id);
        self.expires = normalize_optional(self.expires);
        self.note = self.note.trim().to_string();
        check_quota(self.max_usage, self.usage_count)?;
        Ok(self)
    }
}

/// Administrative edit of an existing key.
///
/// Each field is optional; `None` leaves the stored value unchanged. For
/// nullable columns the inner `Option` distinguishes "clear" from "set".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPatch {
    /// Rebind or unbind the device.
    pub device_id: Option<Option<String>>,
    /// Lock or unlock.
    pub status: Option<KeyStatus>,
    /// Change or clear the expiry.
    pub expires: Option<Option<String>>,
    /// Change or clear the quota.
    pub max_usage: Option<Option<u64>>,
    /// Overwrite the usage count.
    pub usage_count: Option<u64>,
    /// Replace the note.
    pub note: Option<String>,
}

impl KeyPatch {
    /// Field names a patch may carry.
    pub const FIELDS: [&'static str; 6] = [
        "device_id",
        "status",
        "expires",
        "max_usage",
        "usage_count",
        "note",
    ];

    /// Whether the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self == &KeyPatch::default()
    }

    /// Build a patch from a JSON object, rejecting unknown fields.
    ///
    /// `null` or an empty string clears a nullable field.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, KeywardenError> {
        let object = value
            .as_object()
            .ok_or_else(|| KeywardenError::InvalidKey("patch must be a JSON object".into()))?;

        let mut patch = KeyPatch::default();
        for (field, value) in object {
            match field.as_str() {
                "device_id" => patch.device_id = Some(optional_string(field, value)?),
                "expires" => patch.expires = Some(optional_string(field, value)?),
                "status" => {
                    let raw = required_string(field, value)?;
                    patch.status = Some(raw.parse()?);
                }
                "note" => patch.note = Some(optional_string(field, value)?.unwrap_or_default()),
                "max_usage" => {
                    patch.max_usage = Some(match value {
                        serde_json::Value::Null => None,
                        serde_json::Value::String(s) if s.trim().is_empty() => None,
                        other => Some(non_negative(field, other)?),
                    })
                }
                "usage_count" => patch.usage_count = Some(non_negative(field, value)?),
                other => return Err(KeywardenError::UnknownField(other.to_string())),
            }
        }
        Ok(patch)
    }

    /// Apply the patch to a copy of `record`, validating the result.
    pub fn apply_to(&self, record: &KeyRecord) -> Result<KeyRecord, KeywardenError> {
        let mut next = record.clone();
        if let Some(device_id) = &self.device_id {
            next.device_id = normalize_optional(device_id.clone());
        }
        if let Some(status) = self.status {
            next.status = status;
        }
        if let Some(expires) = &self.expires {
            next.expires = normalize_optional(expires.clone());
        }
        if let Some(max_usage) = self.max_usage {
            next.max_usage = max_usage;
        }
        if let Some(usage_count) = self.usage_count {
            next.usage_count = usage_count;
        }
        if let Some(note) = &self.note {
            next.note = note.trim().to_string();
        }
        check_quota(next.max_usage, next.usage_count)?;
        Ok(next)
    }
}

fn check_quota(max_usage: Option<u64>, usage_count: u64) -> Result<(), KeywardenError> {
    match max_usage {
        Some(0) => Err(KeywardenError::InvalidKey(
            "max_usage must be positive".into(),
        )),
        Some(max) if usage_count > max => Err(KeywardenError::QuotaBelowUsage {
            usage_count,
            max_usage: max,
        }),
        _ => Ok(()),
    }
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn optional_string(field: &str, value: &serde_json::Value) -> Result<Option<String>, KeywardenError> {
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(normalize_optional(Some(s.clone()))),
        _ => Err(KeywardenError::InvalidKey(format!("{} must be a string", field))),
    }
}

fn required_string<'a>(field: &str, value: &'a serde_json::Value) -> Result<&'a str, KeywardenError> {
    value
        .as_str()
        .ok_or_else(|| KeywardenError::InvalidKey(format!("{} must be a string", field)))
}

fn non_negative(field: &str, value: &serde_json::Value) -> Result<u64, KeywardenError> {
    let parsed = match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        KeywardenError::InvalidKey(format!("{} must be a non-negative integer", field))
    })
}
