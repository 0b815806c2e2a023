//! Typed commands sent to the DMS.
//!
//! Commands serialize to the camelCase objects of the JSON Data Exchange
//! protocol. The codec adds the correlation tag and wraps them into a frame.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{event::EventMask, kind::CommandKind};
use crate::error::{DmsError, DmsResult};

/// Selection of datapoints for a `get` or `subscribe` command.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reg_ex_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reg_ex_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reg_ex_stamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_hist_data: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_changelog: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_alarm_data: Option<bool>,
    /// Tree depth below the path; `-1` means unlimited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<i32>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn reg_ex_path(mut self, pattern: impl Into<String>) -> Self {
        self.reg_ex_path = Some(pattern.into());
        self
    }

    #[must_use]
    pub fn reg_ex_value(mut self, pattern: impl Into<String>) -> Self {
        self.reg_ex_value = Some(pattern.into());
        self
    }

    #[must_use]
    pub fn reg_ex_stamp(mut self, pattern: impl Into<String>) -> Self {
        self.reg_ex_stamp = Some(pattern.into());
        self
    }

    #[must_use]
    pub fn is_type(mut self, value_type: impl Into<String>) -> Self {
        self.is_type = Some(value_type.into());
        self
    }

    #[must_use]
    pub fn has_hist_data(mut self, flag: bool) -> Self {
        self.has_hist_data = Some(flag);
        self
    }

    #[must_use]
    pub fn has_changelog(mut self, flag: bool) -> Self {
        self.has_changelog = Some(flag);
        self
    }

    #[must_use]
    pub fn has_alarm_data(mut self, flag: bool) -> Self {
        self.has_alarm_data = Some(flag);
        self
    }

    #[must_use]
    pub fn max_depth(mut self, depth: i32) -> Self {
        self.max_depth = Some(depth);
        self
    }
}

/// Layout of returned trend data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HistFormat {
    /// `{stamp: value}` pairs; the DMS default.
    Compact,
    /// Objects with `stamp`, `value`, `state` and `rec`.
    Detail,
}

/// Trend data request attached to a `get`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistData {
    /// ISO 8601 start of the range.
    pub start: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    /// Aggregation interval in seconds, `0` returns raw samples.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<HistFormat>,
}

impl HistData {
    pub fn new(start: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: None,
            interval: None,
            format: None,
        }
    }

    #[must_use]
    pub fn end(mut self, end: impl Into<String>) -> Self {
        self.end = Some(end.into());
        self
    }

    #[must_use]
    pub fn interval(mut self, seconds: u32) -> Self {
        self.interval = Some(seconds);
        self
    }

    #[must_use]
    pub fn format(mut self, format: HistFormat) -> Self {
        self.format = Some(format);
        self
    }
}

/// Time range of alarm or protocol log entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChangelogRange {
    pub start: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
}

impl ChangelogRange {
    pub fn new(start: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: None,
        }
    }

    #[must_use]
    pub fn end(mut self, end: impl Into<String>) -> Self {
        self.end = Some(end.into());
        self
    }
}

/// Extended information the DMS can attach to a `get` response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ExtInfo {
    State,
    AccType,
    Name,
    Template,
    Unit,
    Comment,
    ChangelogGroup,
}

impl ExtInfo {
    pub const ALL: [ExtInfo; 7] = [
        ExtInfo::State,
        ExtInfo::AccType,
        ExtInfo::Name,
        ExtInfo::Template,
        ExtInfo::Unit,
        ExtInfo::Comment,
        ExtInfo::ChangelogGroup,
    ];
}

/// Value type forced by a `set`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Int,
    Double,
    String,
    Bool,
}

/// Read one datapoint, a subtree (with `query`), trend data or its log.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCommand {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_ext_infos: Option<Vec<ExtInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<Query>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hist_data: Option<HistData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changelog: Option<ChangelogRange>,
}

impl GetCommand {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            show_ext_infos: None,
            query: None,
            hist_data: None,
            changelog: None,
        }
    }

    #[must_use]
    pub fn show_ext_infos(mut self, infos: impl IntoIterator<Item = ExtInfo>) -> Self {
        self.show_ext_infos = Some(infos.into_iter().collect());
        self
    }

    #[must_use]
    pub fn query(mut self, query: Query) -> Self {
        self.query = Some(query);
        self
    }

    #[must_use]
    pub fn hist_data(mut self, hist_data: HistData) -> Self {
        self.hist_data = Some(hist_data);
        self
    }

    #[must_use]
    pub fn changelog(mut self, range: ChangelogRange) -> Self {
        self.changelog = Some(range);
        self
    }
}

/// Write a scalar value, optionally creating the datapoint.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SetCommand {
    pub path: String,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create: Option<bool>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub value_type: Option<ValueType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stamp: Option<String>,
}

impl SetCommand {
    pub fn new(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            path: path.into(),
            value: value.into(),
            create: None,
            value_type: None,
            stamp: None,
        }
    }

    #[must_use]
    pub fn create(mut self, create: bool) -> Self {
        self.create = Some(create);
        self
    }

    #[must_use]
    pub fn value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = Some(value_type);
        self
    }

    #[must_use]
    pub fn stamp(mut self, stamp: impl Into<String>) -> Self {
        self.stamp = Some(stamp.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameCommand {
    pub path: String,
    pub new_path: String,
}

impl RenameCommand {
    pub fn new(path: impl Into<String>, new_path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            new_path: new_path.into(),
        }
    }
}

/// Delete a datapoint. `recursive` is sent even when `false`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeleteCommand {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recursive: Option<bool>,
}

impl DeleteCommand {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            recursive: None,
        }
    }

    #[must_use]
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = Some(recursive);
        self
    }
}

/// Start (or, with an existing tag, update) a subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SubscribeCommand {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<Query>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<EventMask>,
}

impl SubscribeCommand {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: None,
            event: None,
        }
    }

    #[must_use]
    pub fn query(mut self, query: Query) -> Self {
        self.query = Some(query);
        self
    }

    #[must_use]
    pub fn event(mut self, mask: EventMask) -> Self {
        self.event = Some(mask);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnsubscribeCommand {
    pub path: String,
}

impl UnsubscribeCommand {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Read protocol entries of a changelog group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChangelogReadCommand {
    pub group: String,
    pub start: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
}

impl ChangelogReadCommand {
    pub fn new(group: impl Into<String>, start: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            start: start.into(),
            end: None,
        }
    }

    #[must_use]
    pub fn end(mut self, end: impl Into<String>) -> Self {
        self.end = Some(end.into());
        self
    }
}

/// A request to the DMS, one variant per command kind.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Get(GetCommand),
    Set(SetCommand),
    Rename(RenameCommand),
    Delete(DeleteCommand),
    Subscribe(SubscribeCommand),
    Unsubscribe(UnsubscribeCommand),
    ChangelogGetGroups,
    ChangelogRead(ChangelogReadCommand),
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Get(_) => CommandKind::Get,
            Self::Set(_) => CommandKind::Set,
            Self::Rename(_) => CommandKind::Rename,
            Self::Delete(_) => CommandKind::Delete,
            Self::Subscribe(_) => CommandKind::Subscribe,
            Self::Unsubscribe(_) => CommandKind::Unsubscribe,
            Self::ChangelogGetGroups => CommandKind::ChangelogGetGroups,
            Self::ChangelogRead(_) => CommandKind::ChangelogRead,
        }
    }

    /// The datapoint path this command addresses, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Get(cmd) => Some(&cmd.path),
            Self::Set(cmd) => Some(&cmd.path),
            Self::Rename(cmd) => Some(&cmd.path),
            Self::Delete(cmd) => Some(&cmd.path),
            Self::Subscribe(cmd) => Some(&cmd.path),
            Self::Unsubscribe(cmd) => Some(&cmd.path),
            Self::ChangelogGetGroups | Self::ChangelogRead(_) => None,
        }
    }

    /// Reject commands the DMS would refuse or misinterpret.
    pub fn validate(&self) -> DmsResult<()> {
        if let Some(path) = self.path()
            && path.trim().is_empty()
        {
            return Err(DmsError::encoding(format!(
                "{} command requires a non-empty path",
                self.kind()
            )));
        }
        match self {
            Self::Set(cmd) if !is_scalar(&cmd.value) => Err(DmsError::encoding(format!(
                "set value for {} must be a bool, number or string",
                cmd.path
            ))),
            Self::Rename(cmd) if cmd.new_path.trim().is_empty() => Err(DmsError::encoding(
                "rename command requires a non-empty new path",
            )),
            Self::Get(GetCommand {
                hist_data: Some(hist),
                ..
            }) if hist.start.is_empty() => {
                Err(DmsError::encoding("histData requires a start timestamp"))
            }
            Self::Get(GetCommand {
                changelog: Some(range),
                ..
            }) if range.start.is_empty() => {
                Err(DmsError::encoding("changelog requires a start timestamp"))
            }
            Self::Subscribe(SubscribeCommand {
                event: Some(mask), ..
            }) if mask.is_empty() => Err(DmsError::encoding(
                "subscribe event filter must select at least one event",
            )),
            Self::ChangelogRead(cmd) if cmd.group.trim().is_empty() => Err(DmsError::encoding(
                "changelogRead command requires a non-empty group",
            )),
            Self::ChangelogRead(cmd) if cmd.start.is_empty() => Err(DmsError::encoding(
                "changelogRead command requires a start timestamp",
            )),
            _ => Ok(()),
        }
    }

    /// The command object without its tag.
    pub(crate) fn to_body(&self) -> DmsResult<Map<String, Value>> {
        let value = match self {
            Self::Get(cmd) => serde_json::to_value(cmd),
            Self::Set(cmd) => serde_json::to_value(cmd),
            Self::Rename(cmd) => serde_json::to_value(cmd),
            Self::Delete(cmd) => serde_json::to_value(cmd),
            Self::Subscribe(cmd) => serde_json::to_value(cmd),
            Self::Unsubscribe(cmd) => serde_json::to_value(cmd),
            Self::ChangelogGetGroups => {
                let mut body = Map::new();
                body.insert(
                    CommandKind::ChangelogGetGroups.wire_name().to_string(),
                    Value::Array(Vec::new()),
                );
                return Ok(body);
            }
            Self::ChangelogRead(cmd) => serde_json::to_value(cmd),
        }
        .map_err(|e| DmsError::encoding(e.to_string()))?;

        match value {
            Value::Object(body) => Ok(body),
            other => Err(DmsError::encoding(format!(
                "{} command serialized to a non-object: {other}",
                self.kind()
            ))),
        }
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::Bool(_) | Value::Number(_) | Value::String(_))
}

impl From<GetCommand> for Command {
    fn from(cmd: GetCommand) -> Self {
        Self::Get(cmd)
    }
}

impl From<SetCommand> for Command {
    fn from(cmd: SetCommand) -> Self {
        Self::Set(cmd)
    }
}

impl From<RenameCommand> for Command {
    fn from(cmd: RenameCommand) -> Self {
        Self::Rename(cmd)
    }
}

impl From<DeleteCommand> for Command {
    fn from(cmd: DeleteCommand) -> Self {
        Self::Delete(cmd)
    }
}

impl From<SubscribeCommand> for Command {
    fn from(cmd: SubscribeCommand) -> Self {
        Self::Subscribe(cmd)
    }
}

impl From<UnsubscribeCommand> for Command {
    fn from(cmd: UnsubscribeCommand) -> Self {
        Self::Unsubscribe(cmd)
    }
}

impl From<ChangelogReadCommand> for Command {
    fn from(cmd: ChangelogReadCommand) -> Self {
        Self::ChangelogRead(cmd)
    }
}
