//! Datapoint events pushed by the DMS for active subscriptions.

use std::{fmt, ops::BitOr};

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// What happened to a monitored datapoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
pub enum EventCode {
    #[serde(rename = "onChange")]
    OnChange,
    #[serde(rename = "onSet")]
    OnSet,
    #[serde(rename = "onCreate")]
    OnCreate,
    #[serde(rename = "onRename")]
    OnRename,
    #[serde(rename = "onDelete")]
    OnDelete,
    /// A code this client does not know about.
    #[serde(other)]
    Unknown,
}

impl EventCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OnChange => "onChange",
            Self::OnSet => "onSet",
            Self::OnCreate => "onCreate",
            Self::OnRename => "onRename",
            Self::OnDelete => "onDelete",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event delivered to a subscription handler.
///
/// `tag` is the tag of the subscribe command that created the subscription.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DmsEvent {
    pub code: EventCode,
    #[serde(default)]
    pub path: String,
    /// New path of a renamed datapoint.
    pub new_path: Option<String>,
    /// Datapoint that triggered the event.
    pub trigger: Option<String>,
    #[serde(default)]
    pub value: Value,
    #[serde(rename = "type")]
    pub value_type: Option<String>,
    /// ISO 8601 timestamp, absent after a DMS restart.
    pub stamp: Option<String>,
    pub tag: String,
}

/// Set of event codes a subscription listens to.
///
/// Serialized as `"*"` when every code is selected, otherwise as a
/// comma-separated list such as `"onChange,onSet"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventMask(u8);

impl EventMask {
    pub const ON_CHANGE: EventMask = EventMask(1);
    pub const ON_SET: EventMask = EventMask(1 << 1);
    pub const ON_CREATE: EventMask = EventMask(1 << 2);
    pub const ON_RENAME: EventMask = EventMask(1 << 3);
    pub const ON_DELETE: EventMask = EventMask(1 << 4);
    pub const ALL: EventMask = EventMask(0b1_1111);

    const CODES: [(EventMask, EventCode); 5] = [
        (Self::ON_CHANGE, EventCode::OnChange),
        (Self::ON_SET, EventCode::OnSet),
        (Self::ON_CREATE, EventCode::OnCreate),
        (Self::ON_RENAME, EventCode::OnRename),
        (Self::ON_DELETE, EventCode::OnDelete),
    ];

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// The wire representation of this mask.
    pub fn to_wire(self) -> String {
        if self.contains(Self::ALL) {
            return "*".to_string();
        }
        Self::CODES
            .iter()
            .filter(|(mask, _)| self.contains(*mask))
            .map(|(_, code)| code.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Default for EventMask {
    fn default() -> Self {
        Self::ALL
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: Self) -> Self::Output {
        EventMask(self.0 | rhs.0)
    }
}

impl Serialize for EventMask {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_wire())
    }
}
