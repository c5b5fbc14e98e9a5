//! Wire envelopes.
//!
//! Every frame on the socket is a UTF-8 JSON object with exactly three
//! fields:
//!
//! ```text
//! { "seq": <integer | null>, "type": <string>, "data": <payload> }
//! ```
//!
//! Handshake, heartbeat and disconnect frames carry `seq: null`. Routable
//! frames (`request`, `response`, `responseError`, `event`) carry the
//! sender's per-connection sequence number plus source and destination
//! addresses inside `data`.
//!
//! Parsing is strict: unknown fields, missing fields and a `seq` of the
//! wrong kind are rejected before any state transition is taken on a frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::address::Address;
use crate::error::{LinkError, Result};

/// Wire type names
pub mod kind {
    /// Peer greeting
    pub const HELLO: &str = "hello";
    /// Host registration
    pub const REGISTER_HOST: &str = "registerHost";
    /// Control client registration
    pub const REGISTER_CONTROL: &str = "registerControl";
    /// Fresh session established
    pub const READY: &str = "ready";
    /// Resume request
    pub const RESUME: &str = "resume";
    /// Session resumed
    pub const CONTINUE: &str = "continue";
    /// Session rejected
    pub const INVALIDATE: &str = "invalidate";
    /// Keepalive and acknowledgment
    pub const HEARTBEAT: &str = "heartbeat";
    /// Routable request
    pub const REQUEST: &str = "request";
    /// Routable successful response
    pub const RESPONSE: &str = "response";
    /// Routable failed response
    pub const RESPONSE_ERROR: &str = "responseError";
    /// Routable event
    pub const EVENT: &str = "event";
    /// Graceful shutdown signal
    pub const DISCONNECT: &str = "disconnect";
}

/// Raw wire frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Frame {
    /// Sequence number, `None` for handshake/heartbeat/disconnect frames
    pub seq: Option<u64>,
    /// Envelope type name
    #[serde(rename = "type")]
    pub kind: String,
    /// Type specific payload
    pub data: Value,
}

impl Frame {
    /// Parse a text frame
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidMessage` if the text is not a JSON object
    /// with exactly the fields `seq`, `type` and `data`.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| LinkError::InvalidMessage(Cow::Owned(format!("malformed frame: {e}"))))
    }

    /// Build a frame from an untyped JSON value
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidMessage` on a shape mismatch.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| LinkError::InvalidMessage(Cow::Owned(format!("malformed frame: {e}"))))
    }

    /// Encode as text
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Serialization` if the payload cannot be encoded.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Returns true if the frame type is one of the routable kinds
    #[must_use]
    pub fn is_routable(&self) -> bool {
        matches!(
            self.kind.as_str(),
            kind::REQUEST | kind::RESPONSE | kind::RESPONSE_ERROR | kind::EVENT
        )
    }

    /// Returns true if this frame looks like a request that expects an answer
    #[must_use]
    pub fn is_request_shaped(&self) -> bool {
        self.kind == kind::REQUEST && self.seq.is_some()
    }
}

/// `hello` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Hello {
    /// Peer protocol/software version
    pub version: String,
    /// Loaded plugins and their versions
    pub plugins: BTreeMap<String, String>,
}

/// `registerHost` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RegisterHost {
    /// Authentication token
    pub token: String,
    /// Client software name
    pub agent: String,
    /// Client software version
    pub version: String,
    /// Host display name
    pub name: String,
    /// Host id
    pub id: u32,
    /// Address other peers can reach this host at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
    /// Loaded plugins and their versions
    pub plugins: BTreeMap<String, String>,
}

/// `registerControl` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterControl {
    /// Authentication token
    pub token: String,
    /// Client software name
    pub agent: String,
    /// Client software version
    pub version: String,
}

/// Registration sent after `hello` when no session is held
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    /// Register as a host
    Host(RegisterHost),
    /// Register as a control client
    Control(RegisterControl),
}

impl Registration {
    /// Token presented by the registering peer
    #[must_use]
    pub fn token(&self) -> &str {
        match self {
            Registration::Host(r) => &r.token,
            Registration::Control(r) => &r.token,
        }
    }

    /// Wrap as an envelope
    #[must_use]
    pub fn into_envelope(self) -> Envelope {
        match self {
            Registration::Host(r) => Envelope::RegisterHost(r),
            Registration::Control(r) => Envelope::RegisterControl(r),
        }
    }
}

/// `resume` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Resume {
    /// Token issued in `ready`
    pub session_token: String,
    /// Last sequence number received from the peer
    #[serde(default)]
    pub last_seq: Option<u64>,
}

/// `ready` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Ready {
    /// Address assigned to the registering peer
    pub src: Address,
    /// Token for resuming this session
    pub session_token: String,
    /// Seconds a detached session is kept for resumption
    pub session_timeout: u64,
    /// Seconds between heartbeats
    pub heartbeat_interval: f64,
    /// Account details for control clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<Value>,
}

/// `continue` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Continue {
    /// Seconds a detached session is kept for resumption
    pub session_timeout: u64,
    /// Seconds between heartbeats
    pub heartbeat_interval: f64,
    /// Last sequence number the peer received from us
    #[serde(default)]
    pub last_seq: Option<u64>,
}

/// `invalidate` payload (always empty)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Invalidate {}

/// `heartbeat` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Heartbeat {
    /// Last sequence number received from the peer
    pub seq: Option<u64>,
}

/// `disconnect` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectPhase {
    /// Sender intends to close, peer should drain in-flight requests
    Prepare,
    /// Peer drained and is ready to be closed
    Ready,
}

/// Body of a `request` or `event`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NamedBody {
    /// Sender address (requests carry the request id here)
    pub src: Address,
    /// Destination address
    pub dst: Address,
    /// Message name
    pub name: String,
    /// Message payload, validated per name
    pub data: Value,
}

/// Body of a `response`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseBody {
    /// Responder address
    pub src: Address,
    /// Original request source, including its request id
    pub dst: Address,
    /// Response payload
    pub data: Value,
}

/// Failure details of a `responseError`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorData {
    /// Error message
    pub message: String,
    /// Machine readable error code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Remote stack / backtrace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl From<ErrorData> for LinkError {
    fn from(data: ErrorData) -> Self {
        LinkError::Request {
            message: data.message,
            code: data.code,
            stack: data.stack,
        }
    }
}

impl From<&LinkError> for ErrorData {
    fn from(err: &LinkError) -> Self {
        match err {
            LinkError::Request {
                message,
                code,
                stack,
            } => ErrorData {
                message: message.clone(),
                code: code.clone(),
                stack: stack.clone(),
            },
            other => ErrorData {
                message: other.to_string(),
                code: other.code().map(str::to_string),
                stack: None,
            },
        }
    }
}

/// Body of a `responseError`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseErrorBody {
    /// Responder address
    pub src: Address,
    /// Original request source, including its request id
    pub dst: Address,
    /// Failure details
    pub data: ErrorData,
}

/// Every envelope type that can appear on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// `hello`
    Hello(Hello),
    /// `registerHost`
    RegisterHost(RegisterHost),
    /// `registerControl`
    RegisterControl(RegisterControl),
    /// `ready`
    Ready(Ready),
    /// `resume`
    Resume(Resume),
    /// `continue`
    Continue(Continue),
    /// `invalidate`
    Invalidate,
    /// `heartbeat`
    Heartbeat(Heartbeat),
    /// `request`
    Request(NamedBody),
    /// `response`
    Response(ResponseBody),
    /// `responseError`
    ResponseError(ResponseErrorBody),
    /// `event`
    Event(NamedBody),
    /// `disconnect`
    Disconnect(DisconnectPhase),
}

fn payload<T: serde::de::DeserializeOwned>(frame: &Frame) -> Result<T> {
    serde_json::from_value(frame.data.clone()).map_err(|e| {
        LinkError::InvalidMessage(Cow::Owned(format!("invalid {} payload: {e}", frame.kind)))
    })
}

impl Envelope {
    /// Wire type name
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Hello(_) => kind::HELLO,
            Envelope::RegisterHost(_) => kind::REGISTER_HOST,
            Envelope::RegisterControl(_) => kind::REGISTER_CONTROL,
            Envelope::Ready(_) => kind::READY,
            Envelope::Resume(_) => kind::RESUME,
            Envelope::Continue(_) => kind::CONTINUE,
            Envelope::Invalidate => kind::INVALIDATE,
            Envelope::Heartbeat(_) => kind::HEARTBEAT,
            Envelope::Request(_) => kind::REQUEST,
            Envelope::Response(_) => kind::RESPONSE,
            Envelope::ResponseError(_) => kind::RESPONSE_ERROR,
            Envelope::Event(_) => kind::EVENT,
            Envelope::Disconnect(_) => kind::DISCONNECT,
        }
    }

    /// Returns true for `request`, `response`, `responseError` and `event`
    #[must_use]
    pub fn is_routable(&self) -> bool {
        matches!(
            self,
            Envelope::Request(_)
                | Envelope::Response(_)
                | Envelope::ResponseError(_)
                | Envelope::Event(_)
        )
    }

    /// Validate and decode a frame
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidMessage` if the type is unknown, the
    /// payload does not match the type's shape, or `seq` is present on a
    /// non-routable frame / missing on a routable one.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let envelope = match frame.kind.as_str() {
            kind::HELLO => Envelope::Hello(payload(frame)?),
            kind::REGISTER_HOST => Envelope::RegisterHost(payload(frame)?),
            kind::REGISTER_CONTROL => Envelope::RegisterControl(payload(frame)?),
            kind::READY => Envelope::Ready(payload(frame)?),
            kind::RESUME => Envelope::Resume(payload(frame)?),
            kind::CONTINUE => Envelope::Continue(payload(frame)?),
            kind::INVALIDATE => {
                let _: Invalidate = payload(frame)?;
                Envelope::Invalidate
            }
            kind::HEARTBEAT => Envelope::Heartbeat(payload(frame)?),
            kind::REQUEST => Envelope::Request(payload(frame)?),
            kind::RESPONSE => Envelope::Response(payload(frame)?),
            kind::RESPONSE_ERROR => Envelope::ResponseError(payload(frame)?),
            kind::EVENT => Envelope::Event(payload(frame)?),
            kind::DISCONNECT => Envelope::Disconnect(payload(frame)?),
            other => {
                return Err(LinkError::InvalidMessage(Cow::Owned(format!(
                    "unknown envelope type {other}"
                ))));
            }
        };

        match (envelope.is_routable(), frame.seq) {
            (true, None) => Err(LinkError::InvalidMessage(Cow::Owned(format!(
                "{} without seq",
                frame.kind
            )))),
            (false, Some(_)) => Err(LinkError::InvalidMessage(Cow::Owned(format!(
                "{} must not carry seq",
                frame.kind
            )))),
            _ => Ok(envelope),
        }
    }

    /// Encode into a frame with the given sequence number
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Serialization` if the payload cannot be encoded.
    pub fn to_frame(&self, seq: Option<u64>) -> Result<Frame> {
        let data = match self {
            Envelope::Hello(p) => serde_json::to_value(p)?,
            Envelope::RegisterHost(p) => serde_json::to_value(p)?,
            Envelope::RegisterControl(p) => serde_json::to_value(p)?,
            Envelope::Ready(p) => serde_json::to_value(p)?,
            Envelope::Resume(p) => serde_json::to_value(p)?,
            Envelope::Continue(p) => serde_json::to_value(p)?,
            Envelope::Invalidate => serde_json::to_value(Invalidate {})?,
            Envelope::Heartbeat(p) => serde_json::to_value(p)?,
            Envelope::Request(p) | Envelope::Event(p) => serde_json::to_value(p)?,
            Envelope::Response(p) => serde_json::to_value(p)?,
            Envelope::ResponseError(p) => serde_json::to_value(p)?,
            Envelope::Disconnect(p) => serde_json::to_value(p)?,
        };
        Ok(Frame {
            seq,
            kind: self.kind().to_string(),
            data,
        })
    }
}

/// Sequence-numbered routable envelope handed to a link
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Sender assigned sequence number
    pub seq: u64,
    /// Decoded routable envelope
    pub envelope: Envelope,
}

/// Dispatch key shared by `response` and `responseError`
pub const RESPONSE_KEY: &str = "response";

impl Message {
    /// Decode a routable frame
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidMessage` if the frame is not a valid
    /// routable envelope.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let envelope = Envelope::from_frame(frame)?;
        match (envelope.is_routable(), frame.seq) {
            (true, Some(seq)) => Ok(Self { seq, envelope }),
            _ => Err(LinkError::InvalidMessage(Cow::Owned(format!(
                "{} is not a routable envelope",
                frame.kind
            )))),
        }
    }

    /// Source address
    #[must_use]
    pub fn src(&self) -> Address {
        match &self.envelope {
            Envelope::Request(b) | Envelope::Event(b) => b.src,
            Envelope::Response(b) => b.src,
            Envelope::ResponseError(b) => b.src,
            _ => Address::controller(),
        }
    }

    /// Destination address
    #[must_use]
    pub fn dst(&self) -> Address {
        match &self.envelope {
            Envelope::Request(b) | Envelope::Event(b) => b.dst,
            Envelope::Response(b) => b.dst,
            Envelope::ResponseError(b) => b.dst,
            _ => Address::controller(),
        }
    }

    /// Request or event name
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match &self.envelope {
            Envelope::Request(b) | Envelope::Event(b) => Some(&b.name),
            _ => None,
        }
    }

    /// Key handlers, validators and waiters are registered under
    ///
    /// `request:<name>`, `event:<name>`, or [`RESPONSE_KEY`] for both
    /// response kinds.
    #[must_use]
    pub fn dispatch_key(&self) -> Cow<'static, str> {
        match &self.envelope {
            Envelope::Request(b) => Cow::Owned(request_key(&b.name)),
            Envelope::Event(b) => Cow::Owned(event_key(&b.name)),
            _ => Cow::Borrowed(RESPONSE_KEY),
        }
    }

    /// The envelope body as JSON, used for waiter matching
    #[must_use]
    pub fn body_value(&self) -> Value {
        let frame = self.envelope.to_frame(Some(self.seq));
        frame.map(|f| f.data).unwrap_or(Value::Null)
    }
}

/// Dispatch key for a request name
#[must_use]
pub fn request_key(name: &str) -> String {
    format!("{}:{name}", kind::REQUEST)
}

/// Dispatch key for an event name
#[must_use]
pub fn event_key(name: &str) -> String {
    format!("{}:{name}", kind::EVENT)
}

/// Longest heartbeat or reconnect interval accepted from a peer or a config
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Convert protocol seconds into a `Duration`, rejecting nonsense values
///
/// # Errors
///
/// Returns `LinkError::InvalidMessage` for negative, zero, non-finite or
/// out-of-range intervals (longer than [`MAX_INTERVAL`]).
pub fn interval_from_secs(secs: f64) -> Result<Duration> {
    match Duration::try_from_secs_f64(secs) {
        Ok(interval) if !interval.is_zero() && interval <= MAX_INTERVAL => Ok(interval),
        _ => Err(LinkError::InvalidMessage(Cow::Owned(format!(
            "heartbeat interval must be positive and at most {}s, got {secs}",
            MAX_INTERVAL.as_secs()
        )))),
    }
}
