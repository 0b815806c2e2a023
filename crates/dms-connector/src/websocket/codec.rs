//! Frame codec for the DMS JSON Data Exchange protocol.
//!
//! Outbound frames look like
//! `{"whois": .., "user": .., "<kind>": [{<fields>, "tag": ..}]}`; inbound
//! frames carry response lists keyed by kind and/or an `event` list.

use serde_json::{Map, Value};
use tracing::warn;

use super::types::Tag;
use crate::{
    error::{DmsError, DmsResult},
    messages::{Command, CommandKind, DmsEvent, ResponseCode, ResponsePayload},
};

const EVENT_KEY: &str = "event";
const META_KEYS: [&str; 5] = ["whois", "user", "tag", "code", "message"];

/// A decoded inbound message.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// Responses to one command, grouped by tag.
    Response(ResponsePayload),
    /// The DMS rejected a command, or the whole frame.
    ProtocolError { tag: Option<Tag>, error: DmsError },
    /// A datapoint event for a subscription.
    Event(DmsEvent),
}

/// Encodes commands and decodes frames for one client identity.
#[derive(Clone, Debug)]
pub struct DmsCodec {
    whois: String,
    user: String,
}

impl DmsCodec {
    pub fn new(whois: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            whois: whois.into(),
            user: user.into(),
        }
    }

    /// Encode `command` under `tag` into a text frame.
    pub fn encode(&self, command: &Command, tag: &Tag) -> DmsResult<String> {
        if tag.is_empty() {
            return Err(DmsError::encoding("tag must not be empty"));
        }
        command.validate()?;

        let kind = command.kind();
        let mut body = command.to_body()?;
        let mut frame = Map::new();
        frame.insert("whois".to_string(), Value::String(self.whois.clone()));
        frame.insert("user".to_string(), Value::String(self.user.clone()));

        if kind.has_command_tag() {
            body.insert("tag".to_string(), Value::String(tag.to_string()));
        } else {
            let mut tags = Map::new();
            tags.insert(
                kind.wire_name().to_string(),
                Value::Array(vec![Value::String(tag.to_string())]),
            );
            frame.insert("tag".to_string(), Value::Object(tags));
        }
        frame.insert(
            kind.wire_name().to_string(),
            Value::Array(vec![Value::Object(body)]),
        );

        serde_json::to_string(&Value::Object(frame)).map_err(|e| DmsError::encoding(e.to_string()))
    }

    /// Decode a text frame into its messages.
    ///
    /// Responses come first, then events, so a subscription confirmed in a
    /// frame is routable for the events that follow in the same frame.
    /// Elements without a usable tag are logged and skipped; only a frame
    /// that is unusable as a whole is an error.
    pub fn decode(&self, text: &str) -> DmsResult<Vec<Inbound>> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| DmsError::decoding(format!("malformed JSON: {e}")))?;
        let Value::Object(mut frame) = value else {
            return Err(DmsError::decoding("frame is not a JSON object"));
        };

        let mut out = Vec::new();
        if let Some(error) = frame_error(&frame) {
            out.push(error);
        }

        let mut kinds = Vec::new();
        let mut has_events = false;
        for key in frame.keys() {
            if key == EVENT_KEY {
                has_events = true;
            } else if let Some(kind) = CommandKind::from_wire(key) {
                kinds.push(kind);
            } else if !META_KEYS.contains(&key.as_str()) {
                return Err(DmsError::decoding(format!("unknown kind key {key:?}")));
            }
        }

        if kinds.is_empty() && !has_events {
            if out.is_empty() {
                return Err(DmsError::decoding("frame holds no known kind"));
            }
            return Ok(out);
        }

        for kind in kinds {
            let Some(list) = frame.remove(kind.wire_name()) else {
                continue;
            };
            let elements = list_of(kind.wire_name(), list)?;
            let tags = if kind.has_command_tag() {
                None
            } else {
                Some(frame_tags(&frame, kind))
            };

            let mut tagged = Vec::with_capacity(elements.len());
            for (idx, element) in elements.into_iter().enumerate() {
                let Value::Object(item) = element else {
                    warn!(kind = %kind, "Ignoring response element that is not an object");
                    continue;
                };
                let tag = match &tags {
                    None => item.get("tag").and_then(non_empty_tag),
                    Some(tags) => tags.get(idx).cloned().flatten(),
                };
                match tag {
                    Some(tag) => tagged.push((tag, item)),
                    None => warn!(kind = %kind, path = ?item.get("path"), "Ignoring untagged response"),
                }
            }
            out.extend(group_by_tag(kind, tagged));
        }

        if let Some(events) = frame.remove(EVENT_KEY) {
            for element in list_of(EVENT_KEY, events)? {
                if element.get("tag").and_then(non_empty_tag).is_none() {
                    warn!(path = ?element.get("path"), "Ignoring untagged event");
                    continue;
                }
                match serde_json::from_value::<DmsEvent>(element) {
                    Ok(event) => out.push(Inbound::Event(event)),
                    Err(e) => warn!(error = %e, "Ignoring malformed event"),
                }
            }
        }

        Ok(out)
    }
}

/// A frame-level non-ok `code`, correlated when a string `tag` is present.
fn frame_error(frame: &Map<String, Value>) -> Option<Inbound> {
    frame.get("code")?;
    let code = ResponseCode::of(frame);
    if code.is_ok() {
        return None;
    }
    let tag = match frame.get("tag") {
        Some(Value::String(tag)) => Some(Tag::from(tag.as_str())),
        _ => None,
    };
    let message = frame
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(Inbound::ProtocolError {
        error: DmsError::Protocol {
            code,
            message,
            tag: tag.as_ref().map(Tag::to_string).unwrap_or_default(),
        },
        tag,
    })
}

fn list_of(key: &str, list: Value) -> DmsResult<Vec<Value>> {
    match list {
        Value::Array(elements) => Ok(elements),
        _ => Err(DmsError::decoding(format!("{key} is not a list"))),
    }
}

fn non_empty_tag(value: &Value) -> Option<Tag> {
    match value {
        Value::String(tag) if !tag.is_empty() => Some(Tag::from(tag.as_str())),
        _ => None,
    }
}

/// Tags of a tagless kind, by position in the frame-level list.
fn frame_tags(frame: &Map<String, Value>, kind: CommandKind) -> Vec<Option<Tag>> {
    frame
        .get("tag")
        .and_then(|tag| tag.get(kind.wire_name()))
        .and_then(Value::as_array)
        .map(|list| list.iter().map(non_empty_tag).collect())
        .unwrap_or_default()
}

/// Group response objects per tag, in order of first appearance.
///
/// A group in which every object carries a non-ok code becomes a
/// protocol error for that tag.
fn group_by_tag(kind: CommandKind, tagged: Vec<(Tag, Map<String, Value>)>) -> Vec<Inbound> {
    let mut groups: Vec<(Tag, Vec<Map<String, Value>>)> = Vec::new();
    for (tag, item) in tagged {
        match groups.iter_mut().find(|(t, _)| *t == tag) {
            Some((_, group)) => group.push(item),
            None => groups.push((tag, vec![item])),
        }
    }

    groups
        .into_iter()
        .map(|(tag, group)| {
            if let Some(first) = group.first()
                && group.iter().all(|item| !ResponseCode::of(item).is_ok())
            {
                let error = DmsError::Protocol {
                    code: ResponseCode::of(first),
                    message: first
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    tag: tag.to_string(),
                };
                return Inbound::ProtocolError {
                    tag: Some(tag),
                    error,
                };
            }
            let items = group.into_iter().map(Value::Object).collect();
            Inbound::Response(ResponsePayload::new(kind, tag, items))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::messages::{
        ChangelogReadCommand, DeleteCommand, EventCode, GetCommand, SubscribeCommand,
    };

    fn codec() -> DmsCodec {
        DmsCodec::new("unit-test", "tester")
    }

    fn encoded(command: impl Into<Command>, tag: &str) -> Value {
        let text = codec().encode(&command.into(), &Tag::from(tag)).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn encode_wraps_command_in_frame() {
        let frame = encoded(GetCommand::new("System:Temp"), "t1");
        assert_eq!(
            frame,
            json!({
                "whois": "unit-test",
                "user": "tester",
                "get": [{"path": "System:Temp", "tag": "t1"}]
            })
        );
    }

    #[test]
    fn encode_changelog_groups_tags_the_frame() {
        let frame = encoded(Command::ChangelogGetGroups, "g1");
        assert_eq!(
            frame,
            json!({
                "whois": "unit-test",
                "user": "tester",
                "tag": {"changelogGetGroups": ["g1"]},
                "changelogGetGroups": [{"changelogGetGroups": []}]
            })
        );
    }

    #[test]
    fn encode_rejects_invalid_input() {
        let result = codec().encode(&DeleteCommand::new("").into(), &Tag::from("t"));
        assert!(matches!(result, Err(DmsError::Encoding { .. })));

        let result = codec().encode(
            &ChangelogReadCommand::new("Alarms", "2024-01-01").into(),
            &Tag::from(""),
        );
        assert!(matches!(result, Err(DmsError::Encoding { .. })));
    }

    #[test]
    fn decode_groups_multi_element_responses() {
        let frame = json!({
            "get": [
                {"path": "A:1", "value": 1, "code": "ok", "tag": "q"},
                {"path": "B", "value": 2, "code": "ok", "tag": "other"},
                {"path": "A:2", "value": 3, "code": "ok", "tag": "q"}
            ]
        });
        let inbound = codec().decode(&frame.to_string()).unwrap();
        assert_eq!(inbound.len(), 2);

        match &inbound[0] {
            Inbound::Response(payload) => {
                assert_eq!(payload.kind, CommandKind::Get);
                assert_eq!(payload.tag.as_str(), "q");
                assert_eq!(payload.items.len(), 2);
                assert_eq!(payload.items[1]["path"], "A:2");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&inbound[1], Inbound::Response(p) if p.tag.as_str() == "other"));
    }

    #[test]
    fn decode_all_failed_group_is_protocol_error() {
        let frame = json!({
            "set": [{"path": "A", "code": "no perm", "message": "read only", "tag": "s1"}],
            "delete": [
                {"path": "B", "code": "not found", "tag": "d1"},
                {"path": "B:1", "code": "ok", "tag": "d1"}
            ]
        });
        let inbound = codec().decode(&frame.to_string()).unwrap();

        let set_error = inbound
            .iter()
            .find_map(|m| match m {
                Inbound::ProtocolError { tag: Some(tag), error } if tag.as_str() == "s1" => {
                    Some(error.clone())
                }
                _ => None,
            })
            .expect("protocol error for s1");
        assert_eq!(
            set_error,
            DmsError::Protocol {
                code: ResponseCode::NoPerm,
                message: Some("read only".to_string()),
                tag: "s1".to_string(),
            }
        );

        assert!(
            inbound
                .iter()
                .any(|m| matches!(m, Inbound::Response(p) if p.tag.as_str() == "d1")),
            "partially ok group stays a response"
        );
    }

    #[test]
    fn decode_missing_code_counts_as_error() {
        let frame = json!({"rename": [{"path": "A", "tag": "r1"}]});
        let inbound = codec().decode(&frame.to_string()).unwrap();
        assert!(matches!(
            &inbound[0],
            Inbound::ProtocolError {
                error: DmsError::Protocol { code: ResponseCode::Error, .. },
                ..
            }
        ));
    }

    #[test]
    fn decode_changelog_groups_takes_frame_tags() {
        let frame = json!({
            "tag": {"changelogGetGroups": ["g1"]},
            "changelogGetGroups": [{"code": "ok", "groups": ["Alarms"]}]
        });
        let inbound = codec().decode(&frame.to_string()).unwrap();
        assert!(matches!(
            &inbound[0],
            Inbound::Response(p) if p.tag.as_str() == "g1" && p.kind == CommandKind::ChangelogGetGroups
        ));
    }

    #[test]
    fn decode_orders_responses_before_events() {
        let frame = json!({
            "event": [{"code": "onChange", "path": "A", "value": 2, "tag": "sub"}],
            "subscribe": [{"path": "A", "value": 1, "code": "ok", "tag": "sub"}]
        });
        let inbound = codec().decode(&frame.to_string()).unwrap();
        assert!(matches!(&inbound[0], Inbound::Response(p) if p.kind == CommandKind::Subscribe));
        match &inbound[1] {
            Inbound::Event(event) => {
                assert_eq!(event.code, EventCode::OnChange);
                assert_eq!(event.value, json!(2));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decode_frame_level_error() {
        let frame = json!({"code": "error", "message": "bad request", "tag": "x"});
        let inbound = codec().decode(&frame.to_string()).unwrap();
        assert!(matches!(
            &inbound[..],
            [Inbound::ProtocolError { tag: Some(tag), .. }] if tag.as_str() == "x"
        ));
    }

    #[test]
    fn decode_rejects_malformed_frames() {
        let cases = [
            "not json",
            "[1, 2]",
            "{}",
            r#"{"whois": "dms"}"#,
            r#"{"frobnicate": []}"#,
            r#"{"get": {"path": "A"}}"#,
            r#"{"get": [], "event": {"tag": "e"}}"#,
        ];
        for case in cases {
            assert!(
                matches!(codec().decode(case), Err(DmsError::Decoding { .. })),
                "expected decoding error for {case}"
            );
        }
    }

    #[test]
    fn decode_skips_unusable_elements() {
        let cases = [
            r#"{"get": [1]}"#,
            r#"{"get": [{"path": "A", "code": "ok"}]}"#,
            r#"{"get": [{"path": "A", "code": "ok", "tag": ""}]}"#,
            r#"{"event": [{"code": "onSet", "path": "A", "value": 1}]}"#,
            r#"{"event": [{"code": "onSet", "path": 5, "tag": "e"}]}"#,
            r#"{"changelogGetGroups": [{"code": "ok", "groups": []}]}"#,
        ];
        for case in cases {
            assert_eq!(codec().decode(case).unwrap(), vec![], "for {case}");
        }
    }

    #[test]
    fn decode_keeps_good_response_beside_untagged_element() {
        let frame = json!({
            "get": [
                {"code": "ok", "path": "A", "value": 1, "tag": "t"},
                {"code": "ok", "path": "B", "value": 2}
            ]
        });
        let inbound = codec().decode(&frame.to_string()).unwrap();
        match &inbound[..] {
            [Inbound::Response(payload)] => {
                assert_eq!(payload.tag.as_str(), "t");
                assert_eq!(payload.items.len(), 1);
                assert_eq!(payload.items[0]["path"], "A");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decode_keeps_good_response_beside_untagged_event() {
        let frame = json!({
            "get": [{"code": "ok", "path": "A", "value": 1, "tag": "t"}],
            "event": [
                {"code": "onChange", "path": "X"},
                {"code": "onChange", "path": "Y", "value": 3, "tag": "sub"}
            ]
        });
        let inbound = codec().decode(&frame.to_string()).unwrap();
        assert_eq!(inbound.len(), 2);
        assert!(matches!(&inbound[0], Inbound::Response(p) if p.tag.as_str() == "t"));
        assert!(matches!(&inbound[1], Inbound::Event(e) if e.path == "Y"));
    }

    #[test]
    fn decode_changelog_groups_skips_elements_beyond_frame_tags() {
        let frame = json!({
            "tag": {"changelogGetGroups": ["g1"]},
            "changelogGetGroups": [
                {"code": "ok", "groups": ["Alarms"]},
                {"code": "ok", "groups": ["Orphan"]}
            ]
        });
        let inbound = codec().decode(&frame.to_string()).unwrap();
        match &inbound[..] {
            [Inbound::Response(payload)] => {
                assert_eq!(payload.tag.as_str(), "g1");
                assert_eq!(payload.items.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn encoded_subscribe_decodes_as_subscribe_kind_on_echo() {
        let text = codec()
            .encode(&SubscribeCommand::new("A").into(), &Tag::from("sub-1"))
            .unwrap();
        let mut frame: Value = serde_json::from_str(&text).unwrap();
        frame["subscribe"][0]["code"] = json!("ok");

        let inbound = codec().decode(&frame.to_string()).unwrap();
        assert!(matches!(
            &inbound[0],
            Inbound::Response(p) if p.kind == CommandKind::Subscribe && p.tag.as_str() == "sub-1"
        ));
    }
}
