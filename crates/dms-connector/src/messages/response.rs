//! Responses returned by the DMS.
//!
//! A [`ResponsePayload`] holds the raw response objects of one tag. Typed
//! views are decoded on demand, either for a known type with
//! [`ResponsePayload::decode_items`] or through the kind-keyed table behind
//! [`ResponsePayload::decode`].

use std::fmt;

use serde::{Deserialize, Deserializer, de::DeserializeOwned};
use serde_json::{Map, Value};

use super::{command::Query, kind::CommandKind};
use crate::{
    error::{DmsError, DmsResult},
    websocket::Tag,
};

/// Result code of a single response object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
pub enum ResponseCode {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "no perm")]
    NoPerm,
    #[serde(rename = "not found")]
    NotFound,
    #[serde(rename = "error")]
    Error,
    /// A code this client does not know about.
    #[serde(other)]
    Unknown,
}

impl ResponseCode {
    /// Code assumed when a response object carries none.
    pub fn missing() -> Self {
        Self::Error
    }

    /// Read the `code` field of a response object.
    pub fn of(object: &Map<String, Value>) -> Self {
        match object.get("code") {
            Some(Value::String(code)) => Self::from_wire(code),
            _ => Self::missing(),
        }
    }

    pub fn from_wire(code: &str) -> Self {
        match code {
            "ok" => Self::Ok,
            "no perm" => Self::NoPerm,
            "not found" => Self::NotFound,
            "error" => Self::Error,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::NoPerm => "no perm",
            Self::NotFound => "not found",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All response objects the DMS returned for one tag, in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponsePayload {
    pub kind: CommandKind,
    pub tag: Tag,
    pub items: Vec<Value>,
}

impl ResponsePayload {
    pub fn new(kind: CommandKind, tag: Tag, items: Vec<Value>) -> Self {
        Self { kind, tag, items }
    }

    /// Decode every item as `T`.
    pub fn decode_items<T: DeserializeOwned>(&self) -> DmsResult<Vec<T>> {
        self.items
            .iter()
            .map(|item| {
                T::deserialize(item).map_err(|e| {
                    DmsError::decoding(format!("{} response {}: {e}", self.kind, self.tag))
                })
            })
            .collect()
    }

    /// Decode the first item as `T`.
    pub fn decode_first<T: DeserializeOwned>(&self) -> DmsResult<T> {
        let item = self.items.first().ok_or_else(|| {
            DmsError::decoding(format!("{} response {} is empty", self.kind, self.tag))
        })?;
        T::deserialize(item)
            .map_err(|e| DmsError::decoding(format!("{} response {}: {e}", self.kind, self.tag)))
    }

    /// Decode into the typed body matching this payload's kind.
    pub fn decode(&self) -> DmsResult<ResponseBody> {
        let decoder = DECODERS
            .iter()
            .find(|(kind, _)| *kind == self.kind)
            .map(|(_, decoder)| *decoder)
            .ok_or_else(|| DmsError::decoding(format!("no decoder for {}", self.kind)))?;
        decoder(self)
    }
}

type Decoder = fn(&ResponsePayload) -> DmsResult<ResponseBody>;

const DECODERS: [(CommandKind, Decoder); 8] = [
    (CommandKind::Get, decode_get),
    (CommandKind::Set, decode_set),
    (CommandKind::Rename, decode_rename),
    (CommandKind::Delete, decode_delete),
    (CommandKind::Subscribe, decode_subscribe),
    (CommandKind::Unsubscribe, decode_unsubscribe),
    (CommandKind::ChangelogGetGroups, decode_changelog_groups),
    (CommandKind::ChangelogRead, decode_changelog_read),
];

fn decode_get(p: &ResponsePayload) -> DmsResult<ResponseBody> {
    p.decode_items().map(ResponseBody::Get)
}

fn decode_set(p: &ResponsePayload) -> DmsResult<ResponseBody> {
    p.decode_items().map(ResponseBody::Set)
}

fn decode_rename(p: &ResponsePayload) -> DmsResult<ResponseBody> {
    p.decode_items().map(ResponseBody::Rename)
}

fn decode_delete(p: &ResponsePayload) -> DmsResult<ResponseBody> {
    p.decode_items().map(ResponseBody::Delete)
}

fn decode_subscribe(p: &ResponsePayload) -> DmsResult<ResponseBody> {
    p.decode_items().map(ResponseBody::Subscribe)
}

fn decode_unsubscribe(p: &ResponsePayload) -> DmsResult<ResponseBody> {
    p.decode_items().map(ResponseBody::Unsubscribe)
}

fn decode_changelog_groups(p: &ResponsePayload) -> DmsResult<ResponseBody> {
    p.decode_items().map(ResponseBody::ChangelogGetGroups)
}

fn decode_changelog_read(p: &ResponsePayload) -> DmsResult<ResponseBody> {
    p.decode_items().map(ResponseBody::ChangelogRead)
}

/// Typed response objects, one variant per command kind.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseBody {
    Get(Vec<GetResponse>),
    Set(Vec<SetResponse>),
    Rename(Vec<RenameResponse>),
    Delete(Vec<DeleteResponse>),
    Subscribe(Vec<SubscriptionResponse>),
    Unsubscribe(Vec<SubscriptionResponse>),
    ChangelogGetGroups(Vec<ChangelogGroupsResponse>),
    ChangelogRead(Vec<ChangelogReadResponse>),
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetResponse {
    #[serde(default = "ResponseCode::missing")]
    pub code: ResponseCode,
    pub path: Option<String>,
    #[serde(default)]
    pub value: Value,
    #[serde(rename = "type")]
    pub value_type: Option<String>,
    pub has_child: Option<bool>,
    pub stamp: Option<String>,
    pub ext_infos: Option<ExtInfos>,
    pub message: Option<String>,
    pub hist_data: Option<HistDataSeries>,
    pub changelog: Option<ChangelogEntries>,
    pub tag: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetResponse {
    #[serde(default = "ResponseCode::missing")]
    pub code: ResponseCode,
    pub path: Option<String>,
    #[serde(default)]
    pub value: Value,
    #[serde(rename = "type")]
    pub value_type: Option<String>,
    pub stamp: Option<String>,
    pub message: Option<String>,
    pub tag: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameResponse {
    #[serde(default = "ResponseCode::missing")]
    pub code: ResponseCode,
    pub path: Option<String>,
    pub new_path: Option<String>,
    pub message: Option<String>,
    pub tag: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct DeleteResponse {
    #[serde(default = "ResponseCode::missing")]
    pub code: ResponseCode,
    pub path: Option<String>,
    pub message: Option<String>,
    pub tag: Option<String>,
}

/// Response to `subscribe` and `unsubscribe`; carries the current value.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct SubscriptionResponse {
    #[serde(default = "ResponseCode::missing")]
    pub code: ResponseCode,
    pub path: Option<String>,
    pub query: Option<Query>,
    #[serde(default)]
    pub value: Value,
    #[serde(rename = "type")]
    pub value_type: Option<String>,
    pub stamp: Option<String>,
    pub message: Option<String>,
    pub tag: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ChangelogGroupsResponse {
    #[serde(default = "ResponseCode::missing")]
    pub code: ResponseCode,
    #[serde(default)]
    pub groups: Vec<String>,
    pub tag: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ChangelogReadResponse {
    #[serde(default = "ResponseCode::missing")]
    pub code: ResponseCode,
    pub group: Option<String>,
    #[serde(default)]
    pub changelog: Vec<ProtocolEntry>,
    pub message: Option<String>,
    pub tag: Option<String>,
}

/// Extended infos of a datapoint, present when requested with `showExtInfos`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtInfos {
    pub state: Option<String>,
    pub acc_type: Option<String>,
    pub name: Option<String>,
    pub template: Option<String>,
    pub unit: Option<String>,
    pub comment: Option<String>,
    pub changelog_group: Option<String>,
}

/// Trend samples in one of the two layouts the DMS returns.
///
/// The layout is detected from the first sample: detailed samples carry a
/// `stamp` key, compact ones are single-entry `{stamp: value}` objects.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "Vec<Map<String, Value>>")]
pub enum HistDataSeries {
    Compact(Vec<CompactSample>),
    Detail(Vec<TrendSample>),
}

impl HistDataSeries {
    pub fn len(&self) -> usize {
        match self {
            Self::Compact(samples) => samples.len(),
            Self::Detail(samples) => samples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TryFrom<Vec<Map<String, Value>>> for HistDataSeries {
    type Error = String;

    fn try_from(objects: Vec<Map<String, Value>>) -> Result<Self, Self::Error> {
        let detailed = objects.first().is_some_and(|first| first.contains_key("stamp"));
        if detailed {
            return objects
                .into_iter()
                .map(|object| {
                    TrendSample::deserialize(Value::Object(object)).map_err(|e| e.to_string())
                })
                .collect::<Result<_, _>>()
                .map(Self::Detail);
        }

        objects
            .into_iter()
            .map(|object| {
                let mut entries = object.into_iter();
                match (entries.next(), entries.next()) {
                    (Some((stamp, value)), None) => Ok(CompactSample { stamp, value }),
                    _ => Err("compact histData sample must hold exactly one entry".to_string()),
                }
            })
            .collect::<Result<_, _>>()
            .map(Self::Compact)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompactSample {
    pub stamp: String,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct TrendSample {
    pub stamp: Option<String>,
    #[serde(default)]
    pub value: Value,
    pub state: Option<Value>,
    pub rec: Option<Value>,
}

/// Log entries of a datapoint: plain protocol entries, or alarm entries
/// when the first entry carries a `state`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "Vec<Map<String, Value>>")]
pub enum ChangelogEntries {
    Protocol(Vec<ProtocolEntry>),
    Alarm(Vec<AlarmEntry>),
}

impl ChangelogEntries {
    pub fn len(&self) -> usize {
        match self {
            Self::Protocol(entries) => entries.len(),
            Self::Alarm(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TryFrom<Vec<Map<String, Value>>> for ChangelogEntries {
    type Error = String;

    fn try_from(objects: Vec<Map<String, Value>>) -> Result<Self, Self::Error> {
        let alarm = objects.first().is_some_and(|first| first.contains_key("state"));
        if alarm {
            decode_all(objects).map(Self::Alarm)
        } else {
            decode_all(objects).map(Self::Protocol)
        }
    }
}

fn decode_all<T: DeserializeOwned>(objects: Vec<Map<String, Value>>) -> Result<Vec<T>, String> {
    objects
        .into_iter()
        .map(|object| T::deserialize(Value::Object(object)).map_err(|e| e.to_string()))
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ProtocolEntry {
    /// Only present when more than one datapoint was requested.
    pub path: Option<String>,
    pub stamp: Option<String>,
    pub text: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmEntry {
    pub path: Option<String>,
    pub stamp: Option<String>,
    pub text: Option<String>,
    pub state: Option<String>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub priority: Option<i64>,
    #[serde(default, rename = "priorityBACnet", deserialize_with = "lenient_int")]
    pub priority_bacnet: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub alarm_group: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub alarm_collect_group: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub site_group: Option<i64>,
    pub screen: Option<String>,
}

/// Accept integers sent either as JSON numbers or as numeric strings.
fn lenient_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    use serde::de::Error;

    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("expected an integer, got {n}"))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("expected an integer, got {s:?}"))),
        Some(other) => Err(D::Error::custom(format!(
            "expected an integer, got {other}"
        ))),
    }
}
