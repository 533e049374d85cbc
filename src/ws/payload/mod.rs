//! Gateway payload envelope `{op, d, s, t}` and its JSON codec.

pub(crate) mod inflate;
pub(crate) mod stream;
mod types;

pub use inflate::{DecompressError, ZlibStream};
pub use stream::{PayloadStream, PayloadStreamError};
pub use types::{
    Activity, Heartbeat, Hello, Identify, IdentifyProperties, InvalidSession, PresenceUpdate,
    Ready, RequestGuildMembers, Resume, VoiceStateUpdate,
};

use std::{borrow::Cow, fmt::Display};

use enum_as_inner::EnumAsInner;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use snafu::prelude::*;

/// Name of the dispatch that opens a new session
pub const READY: &str = "READY";
/// Name of the dispatch that confirms a resumed session
pub const RESUMED: &str = "RESUMED";

/// Error when parse bytes as payload
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum ParsePayloadError {
    /// data is invalid json, or not an envelope object
    #[snafu(display("parse json failed: {source}"))]
    ParseJSONFailed {
        /// source error
        source: serde_json::Error,
    },

    /// envelope has an opcode we don't know
    #[snafu(display("payload has unknown opcode {op}"))]
    UnknownOpcode {
        /// raw opcode
        op: i64,
    },

    /// envelope data is absent but the opcode requires it
    #[snafu(display("{opcode} payload has no data"))]
    MissingData {
        /// opcode
        opcode: Opcode,
    },

    /// envelope data is not valid for the opcode
    #[snafu(display("parse data of {opcode} payload failed: {source}"))]
    ParseJSONToTypedPayloadFailed {
        /// opcode
        opcode: Opcode,
        /// source error
        source: serde_json::Error,
    },
}

/// Error when encode a payload to bytes
#[derive(Debug, Snafu)]
#[snafu(
    display("encode {opcode} payload failed: {source}"),
    visibility(pub(crate)),
    module(encode_error),
    context(suffix(false))
)]
pub struct EncodePayloadError {
    /// opcode
    pub opcode: Opcode,
    /// source error
    pub source: serde_json::Error,
}

/// Gateway opcodes
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Dispatch, server -> client
    Dispatch,
    /// Heartbeat, both direction
    Heartbeat,
    /// Identify, client -> server
    Identify,
    /// Presence update, client -> server
    PresenceUpdate,
    /// Voice state update, client -> server
    VoiceStateUpdate,
    /// Resume, client -> server
    Resume,
    /// Reconnect, server -> client
    Reconnect,
    /// Request guild members, client -> server
    RequestGuildMembers,
    /// Invalid session, server -> client
    InvalidSession,
    /// Hello, server -> client
    Hello,
    /// Heartbeat ACK, server -> client
    HeartbeatAck,
}

impl Opcode {
    /// Get opcode from raw number
    pub fn from_raw(op: i64) -> Option<Self> {
        match op {
            0 => Some(Self::Dispatch),
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Identify),
            3 => Some(Self::PresenceUpdate),
            4 => Some(Self::VoiceStateUpdate),
            6 => Some(Self::Resume),
            7 => Some(Self::Reconnect),
            8 => Some(Self::RequestGuildMembers),
            9 => Some(Self::InvalidSession),
            10 => Some(Self::Hello),
            11 => Some(Self::HeartbeatAck),
            _ => None,
        }
    }

    /// raw opcode number
    pub fn raw(self) -> i64 {
        match self {
            Self::Dispatch => 0,
            Self::Heartbeat => 1,
            Self::Identify => 2,
            Self::PresenceUpdate => 3,
            Self::VoiceStateUpdate => 4,
            Self::Resume => 6,
            Self::Reconnect => 7,
            Self::RequestGuildMembers => 8,
            Self::InvalidSession => 9,
            Self::Hello => 10,
            Self::HeartbeatAck => 11,
        }
    }

    /// opcode name
    pub fn name(self) -> &'static str {
        match self {
            Self::Dispatch => "Dispatch",
            Self::Heartbeat => "Heartbeat",
            Self::Identify => "Identify",
            Self::PresenceUpdate => "PresenceUpdate",
            Self::VoiceStateUpdate => "VoiceStateUpdate",
            Self::Resume => "Resume",
            Self::Reconnect => "Reconnect",
            Self::RequestGuildMembers => "RequestGuildMembers",
            Self::InvalidSession => "InvalidSession",
            Self::Hello => "Hello",
            Self::HeartbeatAck => "HeartbeatAck",
        }
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.raw())
    }
}

/// Typed payload data, one variant per opcode
#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum PayloadData {
    /// application event body, see [Payload::event_name]
    Dispatch(serde_json::Value),
    /// heartbeat request (in) or heartbeat (out)
    Heartbeat(Heartbeat),
    /// identify
    Identify(Identify),
    /// presence update
    PresenceUpdate(PresenceUpdate),
    /// voice state update
    VoiceStateUpdate(VoiceStateUpdate),
    /// resume
    Resume(Resume),
    /// reconnect request
    Reconnect,
    /// request guild members
    RequestGuildMembers(RequestGuildMembers),
    /// invalid session
    InvalidSession(InvalidSession),
    /// hello
    Hello(Hello),
    /// heartbeat ack
    HeartbeatAck,
}

impl PayloadData {
    /// opcode of this data
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Dispatch(_) => Opcode::Dispatch,
            Self::Heartbeat(_) => Opcode::Heartbeat,
            Self::Identify(_) => Opcode::Identify,
            Self::PresenceUpdate(_) => Opcode::PresenceUpdate,
            Self::VoiceStateUpdate(_) => Opcode::VoiceStateUpdate,
            Self::Resume(_) => Opcode::Resume,
            Self::Reconnect => Opcode::Reconnect,
            Self::RequestGuildMembers(_) => Opcode::RequestGuildMembers,
            Self::InvalidSession(_) => Opcode::InvalidSession,
            Self::Hello(_) => Opcode::Hello,
            Self::HeartbeatAck => Opcode::HeartbeatAck,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RawPayload {
    op: i64,
    #[serde(default)]
    d: Option<serde_json::Value>,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

/// Gateway payload envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    /// sequence number, only for dispatch
    pub sequence: Option<u64>,
    /// event name, only for dispatch
    pub event_name: Option<String>,
    /// typed data
    pub data: PayloadData,
}

impl From<PayloadData> for Payload {
    fn from(data: PayloadData) -> Self {
        Self {
            sequence: None,
            event_name: None,
            data,
        }
    }
}

fn typed<T: DeserializeOwned>(
    opcode: Opcode,
    d: Option<serde_json::Value>,
) -> Result<T, ParsePayloadError> {
    let d = d.context(error::MissingData { opcode })?;
    serde_json::from_value(d).context(error::ParseJSONToTypedPayloadFailed { opcode })
}

impl Payload {
    /// Build a dispatch payload
    pub fn dispatch<S: Into<String>>(name: S, sequence: u64, data: serde_json::Value) -> Self {
        Self {
            sequence: Some(sequence),
            event_name: Some(name.into()),
            data: PayloadData::Dispatch(data),
        }
    }

    /// Build a heartbeat payload carrying last sequence number
    pub fn heartbeat(sequence: Option<u64>) -> Self {
        PayloadData::Heartbeat(Heartbeat(sequence)).into()
    }

    /// Build an identify payload
    pub fn identify(identify: Identify) -> Self {
        PayloadData::Identify(identify).into()
    }

    /// Build a resume payload
    pub fn resume(resume: Resume) -> Self {
        PayloadData::Resume(resume).into()
    }

    /// Build a presence update payload
    pub fn presence_update(presence: PresenceUpdate) -> Self {
        PayloadData::PresenceUpdate(presence).into()
    }

    /// Build a voice state update payload
    pub fn voice_state_update(voice_state: VoiceStateUpdate) -> Self {
        PayloadData::VoiceStateUpdate(voice_state).into()
    }

    /// Build a request guild members payload
    pub fn request_guild_members(request: RequestGuildMembers) -> Self {
        PayloadData::RequestGuildMembers(request).into()
    }

    /// opcode of this payload
    pub fn opcode(&self) -> Opcode {
        self.data.opcode()
    }

    /// true for IDENTIFY and RESUME, which open a session on a fresh connection
    pub fn is_startup(&self) -> bool {
        matches!(self.opcode(), Opcode::Identify | Opcode::Resume)
    }

    /// Parse READY dispatch data, None if this payload is not a READY dispatch
    pub fn ready(&self) -> Option<Result<Ready, ParsePayloadError>> {
        if self.event_name.as_deref() != Some(READY) {
            return None;
        }
        let data = self.data.as_dispatch()?;
        Some(
            serde_json::from_value(data.clone()).context(error::ParseJSONToTypedPayloadFailed {
                opcode: Opcode::Dispatch,
            }),
        )
    }

    /// Decode json bytes to a payload
    pub fn decode(buff: &[u8]) -> Result<Self, ParsePayloadError> {
        let raw: RawPayload = serde_json::from_slice(buff).context(error::ParseJSONFailed)?;

        let opcode = Opcode::from_raw(raw.op).context(error::UnknownOpcode { op: raw.op })?;

        let data = match opcode {
            // dispatch with null data is still a valid event
            Opcode::Dispatch => PayloadData::Dispatch(raw.d.unwrap_or(serde_json::Value::Null)),
            Opcode::Heartbeat => PayloadData::Heartbeat(Heartbeat(
                raw.d.and_then(|d| d.as_u64()),
            )),
            Opcode::Identify => PayloadData::Identify(typed(opcode, raw.d)?),
            Opcode::PresenceUpdate => PayloadData::PresenceUpdate(typed(opcode, raw.d)?),
            Opcode::VoiceStateUpdate => PayloadData::VoiceStateUpdate(typed(opcode, raw.d)?),
            Opcode::Resume => PayloadData::Resume(typed(opcode, raw.d)?),
            Opcode::Reconnect => PayloadData::Reconnect,
            Opcode::RequestGuildMembers => {
                PayloadData::RequestGuildMembers(typed(opcode, raw.d)?)
            }
            // some servers omit the flag, treat it as not resumable
            Opcode::InvalidSession => PayloadData::InvalidSession(InvalidSession(
                raw.d.and_then(|d| d.as_bool()).unwrap_or(false),
            )),
            Opcode::Hello => PayloadData::Hello(typed(opcode, raw.d)?),
            Opcode::HeartbeatAck => PayloadData::HeartbeatAck,
        };

        let (sequence, event_name) = if opcode == Opcode::Dispatch {
            (raw.s, raw.t)
        } else {
            (None, None)
        };

        Ok(Self {
            sequence,
            event_name,
            data,
        })
    }

    /// Encode payload to json bytes
    pub fn encode(&self) -> Result<Vec<u8>, EncodePayloadError> {
        self.to_json().map(String::into_bytes)
    }

    /// Encode payload to a json string
    pub fn to_json(&self) -> Result<String, EncodePayloadError> {
        let opcode = self.opcode();

        fn value<T: Serialize>(
            opcode: Opcode,
            data: &T,
        ) -> Result<Option<serde_json::Value>, EncodePayloadError> {
            serde_json::to_value(data)
                .map(Some)
                .context(encode_error::EncodePayload { opcode })
        }

        let d = match &self.data {
            PayloadData::Dispatch(v) => Some(v.clone()),
            PayloadData::Heartbeat(v) => value(opcode, v)?,
            PayloadData::Identify(v) => value(opcode, v)?,
            PayloadData::PresenceUpdate(v) => value(opcode, v)?,
            PayloadData::VoiceStateUpdate(v) => value(opcode, v)?,
            PayloadData::Resume(v) => value(opcode, v)?,
            PayloadData::RequestGuildMembers(v) => value(opcode, v)?,
            PayloadData::InvalidSession(v) => value(opcode, v)?,
            PayloadData::Hello(v) => value(opcode, v)?,
            PayloadData::Reconnect | PayloadData::HeartbeatAck => None,
        };

        let raw = RawPayload {
            op: opcode.raw(),
            d,
            s: self.sequence,
            t: self.event_name.clone(),
        };

        serde_json::to_string(&raw).context(encode_error::EncodePayload { opcode })
    }
}

/// Replace the value of every `"token"` field so payloads can be logged.
pub(crate) fn redact_token(json: &str) -> Cow<'_, str> {
    const KEY: &str = "\"token\":\"";

    if !json.contains(KEY) {
        return Cow::Borrowed(json);
    }

    let mut out = String::with_capacity(json.len());
    let mut rest = json;
    while let Some(start) = rest.find(KEY) {
        let value_start = start + KEY.len();
        out.push_str(&rest[..value_start]);
        out.push_str("hunter2");
        rest = &rest[value_start..];
        let end = rest.find('"').unwrap_or(rest.len());
        rest = &rest[end..];
    }
    out.push_str(rest);

    Cow::Owned(out)
}

#[cfg(test)]
mod test {
    mod decode {
        use super::super::*;
        use serde_json::json;

        fn bytes(value: serde_json::Value) -> Vec<u8> {
            serde_json::to_vec(&value).unwrap()
        }

        #[test]
        fn test_payload_decode_hello() {
            let data = bytes(json!({
                "op": 10,
                "d": { "heartbeat_interval": 41250 },
                "s": null,
                "t": null,
            }));

            let payload = Payload::decode(&data).unwrap();

            assert_eq!(payload.opcode(), Opcode::Hello);
            assert_eq!(
                payload.data.into_hello().unwrap().heartbeat_interval,
                41250
            );
        }

        #[test]
        fn test_payload_decode_dispatch_keeps_sequence_and_name() {
            let data = bytes(json!({
                "op": 0,
                "d": { "content": "hi" },
                "s": 42,
                "t": "MESSAGE_CREATE",
            }));

            let payload = Payload::decode(&data).unwrap();

            assert_eq!(payload.sequence, Some(42));
            assert_eq!(payload.event_name.as_deref(), Some("MESSAGE_CREATE"));
            assert_eq!(
                payload.data.as_dispatch().unwrap(),
                &json!({ "content": "hi" })
            );
        }

        #[test]
        fn test_payload_decode_ignores_sequence_outside_dispatch() {
            let data = bytes(json!({ "op": 11, "s": 7 }));

            let payload = Payload::decode(&data).unwrap();

            assert_eq!(payload.opcode(), Opcode::HeartbeatAck);
            assert_eq!(payload.sequence, None);
        }

        #[test]
        fn test_payload_decode_ready() {
            let data = bytes(json!({
                "op": 0,
                "d": { "v": 10, "session_id": "abc", "user": { "id": "1" } },
                "s": 1,
                "t": "READY",
            }));

            let payload = Payload::decode(&data).unwrap();
            let ready = payload.ready().unwrap().unwrap();

            assert_eq!(ready.session_id, "abc");
            assert_eq!(ready.v, 10);
        }

        #[test]
        fn test_payload_ready_is_none_for_other_dispatch() {
            let payload = Payload::dispatch("RESUMED", 3, serde_json::Value::Null);
            assert!(payload.ready().is_none());
        }

        #[test]
        fn test_payload_decode_invalid_session() {
            let resumable = Payload::decode(&bytes(json!({ "op": 9, "d": true }))).unwrap();
            assert_eq!(
                resumable.data.into_invalid_session().unwrap(),
                InvalidSession(true)
            );

            let not_resumable = Payload::decode(&bytes(json!({ "op": 9, "d": false }))).unwrap();
            assert_eq!(
                not_resumable.data.into_invalid_session().unwrap(),
                InvalidSession(false)
            );
        }

        #[test]
        fn test_payload_decode_heartbeat_request() {
            let payload = Payload::decode(&bytes(json!({ "op": 1, "d": null }))).unwrap();
            assert_eq!(payload.data, PayloadData::Heartbeat(Heartbeat(None)));
        }

        #[test]
        fn test_payload_decode_unknown_opcode() {
            let err = Payload::decode(&bytes(json!({ "op": 42, "d": null }))).unwrap_err();
            assert!(matches!(err, ParsePayloadError::UnknownOpcode { op: 42 }));
        }

        #[test]
        fn test_payload_decode_hello_without_data() {
            let err = Payload::decode(&bytes(json!({ "op": 10 }))).unwrap_err();
            assert!(matches!(
                err,
                ParsePayloadError::MissingData {
                    opcode: Opcode::Hello
                }
            ));
        }

        #[test]
        fn test_payload_decode_not_json() {
            let err = Payload::decode(b"not json").unwrap_err();
            assert!(matches!(err, ParsePayloadError::ParseJSONFailed { .. }));
        }
    }

    mod encode {
        use super::super::*;
        use crate::shard::ShardInfo;
        use serde_json::json;

        fn value(payload: &Payload) -> serde_json::Value {
            serde_json::from_slice(&payload.encode().unwrap()).unwrap()
        }

        #[test]
        fn test_payload_encode_heartbeat() {
            assert_eq!(
                value(&Payload::heartbeat(Some(5))),
                json!({ "op": 1, "d": 5, "s": null, "t": null })
            );
            assert_eq!(
                value(&Payload::heartbeat(None)),
                json!({ "op": 1, "d": null, "s": null, "t": null })
            );
        }

        #[test]
        fn test_payload_encode_resume() {
            let payload = Payload::resume(Resume {
                token: "t0k".to_string(),
                session_id: "abc".to_string(),
                seq: 2,
            });

            assert_eq!(
                value(&payload),
                json!({
                    "op": 6,
                    "d": { "token": "t0k", "session_id": "abc", "seq": 2 },
                    "s": null,
                    "t": null,
                })
            );
        }

        #[test]
        fn test_payload_encode_identify() {
            let payload = Payload::identify(Identify {
                token: "t0k".to_string(),
                properties: IdentifyProperties {
                    os: "linux".to_string(),
                    browser: "shardline".to_string(),
                    device: "shardline".to_string(),
                },
                compress: false,
                large_threshold: 250,
                shard: ShardInfo::new(1, 2).unwrap(),
                presence: None,
                intents: Some(crate::intent::Intents::GUILDS),
            });

            let v = value(&payload);

            assert_eq!(v["op"], json!(2));
            assert_eq!(v["d"]["shard"], json!([1, 2]));
            assert_eq!(v["d"]["intents"], json!(1));
            assert_eq!(v["d"]["large_threshold"], json!(250));
            assert!(v["d"].get("presence").is_none());
        }

        #[test]
        fn test_payload_encode_presence_update() {
            let payload = Payload::presence_update(PresenceUpdate::online());

            let v = value(&payload);

            assert_eq!(v["op"], json!(3));
            assert_eq!(v["d"]["status"], json!("online"));
        }

        #[test]
        fn test_redact_token() {
            let json = r#"{"op":2,"d":{"token":"secret.value","shard":[0,1]}}"#;
            assert_eq!(
                redact_token(json),
                r#"{"op":2,"d":{"token":"hunter2","shard":[0,1]}}"#
            );

            let plain = r#"{"op":1,"d":3}"#;
            assert!(matches!(redact_token(plain), Cow::Borrowed(_)));
        }
    }
}
