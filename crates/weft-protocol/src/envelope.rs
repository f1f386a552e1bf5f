// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The generic, self-describing message exchanged with the proxy.
//!
//! Every message on the wire is an [`Envelope`]: a message-kind tag, a
//! correlation `request_id` (0 for fire-and-forget notifications), an
//! ordered bag of typed properties, and an optional raw payload. The
//! roughly 150 concrete message shapes of the proxy protocol are all
//! expressed as property conventions over this one structure; the kinds
//! the bridge core needs are enumerated in [`MessageKind`], grouped by
//! category into tag ranges.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::frame::ProtocolError;

/// Well-known property keys.
pub mod keys {
    pub const LIBRARY_VERSION: &str = "LibraryVersion";
    pub const LISTEN_ADDRESS: &str = "ListenAddress";
    pub const TIMESTAMP_MS: &str = "TimestampMs";
    pub const ERROR: &str = "Error";

    pub const DOMAIN: &str = "Domain";
    pub const TASK_QUEUE: &str = "TaskQueue";
    pub const WORKER_MODE: &str = "WorkerMode";
    pub const WORKER_ID: &str = "WorkerId";
    pub const IDENTITY: &str = "Identity";
    pub const MAX_CONCURRENT_TASKS: &str = "MaxConcurrentTasks";

    pub const WORKFLOW_NAME: &str = "WorkflowName";
    pub const WORKFLOW_ID: &str = "WorkflowId";
    pub const RUN_ID: &str = "RunId";
    pub const SIGNAL_NAME: &str = "SignalName";
    pub const QUERY_NAME: &str = "QueryName";
    pub const REPLAYING: &str = "Replaying";
    pub const REPLAY_HISTORY: &str = "ReplayHistory";

    pub const CONTEXT_ID: &str = "ContextId";
    pub const CHILD_ID: &str = "ChildId";
    pub const QUEUE_ID: &str = "QueueId";
    pub const CAPACITY: &str = "Capacity";

    pub const ACTIVITY_NAME: &str = "ActivityName";
    pub const ACTIVITY_ID: &str = "ActivityId";
}

/// Message kinds carried in the frame header, grouped into tag ranges by
/// category: client/session 1-99, worker 100-199, workflow 200-299,
/// activity 300-399.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    // Client/session messages
    Initialize = 1,
    InitializeReply = 2,
    Heartbeat = 3,
    HeartbeatReply = 4,
    Terminate = 5,
    TerminateReply = 6,

    // Worker lifecycle messages
    WorkerRegister = 100,
    WorkerRegisterReply = 101,
    WorkerDeregister = 102,
    WorkerDeregisterReply = 103,

    // Workflow messages
    WorkflowRegister = 200,
    WorkflowRegisterReply = 201,
    WorkflowExecute = 202,
    WorkflowExecuteReply = 203,
    WorkflowInvoke = 204,
    WorkflowInvokeReply = 205,
    WorkflowSignal = 206,
    WorkflowSignalReply = 207,
    WorkflowQuery = 208,
    WorkflowQueryReply = 209,
    WorkflowCancel = 210,
    WorkflowCancelReply = 211,
    ChildWorkflowStart = 212,
    ChildWorkflowStartReply = 213,
    ChildWorkflowCompleted = 214,
    SignalReceived = 215,
    QueueNew = 216,
    QueueNewReply = 217,
    QueueWrite = 218,
    QueueWriteReply = 219,

    // Activity messages
    ActivityRegister = 300,
    ActivityRegisterReply = 301,
    ActivityExecute = 302,
    ActivityExecuteReply = 303,
    ActivityInvoke = 304,
    ActivityInvokeReply = 305,
    ActivityRecordHeartbeat = 306,
    ActivityRecordHeartbeatReply = 307,
    ActivityCompleted = 308,
}

/// Logical message category, derived from the tag range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCategory {
    Client,
    Worker,
    Workflow,
    Activity,
}

impl MessageKind {
    pub fn category(self) -> MessageCategory {
        match self as u32 {
            1..=99 => MessageCategory::Client,
            100..=199 => MessageCategory::Worker,
            200..=299 => MessageCategory::Workflow,
            _ => MessageCategory::Activity,
        }
    }

    /// Whether this kind is a reply that resolves a pending request.
    ///
    /// Server-push notifications (`ChildWorkflowCompleted`,
    /// `SignalReceived`, `ActivityCompleted`) and proxy-initiated
    /// requests are not replies even when they carry a `request_id`.
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            MessageKind::InitializeReply
                | MessageKind::HeartbeatReply
                | MessageKind::TerminateReply
                | MessageKind::WorkerRegisterReply
                | MessageKind::WorkerDeregisterReply
                | MessageKind::WorkflowRegisterReply
                | MessageKind::WorkflowExecuteReply
                | MessageKind::WorkflowInvokeReply
                | MessageKind::WorkflowSignalReply
                | MessageKind::WorkflowQueryReply
                | MessageKind::WorkflowCancelReply
                | MessageKind::ChildWorkflowStartReply
                | MessageKind::QueueNewReply
                | MessageKind::QueueWriteReply
                | MessageKind::ActivityRegisterReply
                | MessageKind::ActivityExecuteReply
                | MessageKind::ActivityInvokeReply
                | MessageKind::ActivityRecordHeartbeatReply
        )
    }

    /// The reply kind paired with this request kind, if any.
    pub fn reply_kind(self) -> Option<MessageKind> {
        let reply = match self {
            MessageKind::Initialize => MessageKind::InitializeReply,
            MessageKind::Heartbeat => MessageKind::HeartbeatReply,
            MessageKind::Terminate => MessageKind::TerminateReply,
            MessageKind::WorkerRegister => MessageKind::WorkerRegisterReply,
            MessageKind::WorkerDeregister => MessageKind::WorkerDeregisterReply,
            MessageKind::WorkflowRegister => MessageKind::WorkflowRegisterReply,
            MessageKind::WorkflowExecute => MessageKind::WorkflowExecuteReply,
            MessageKind::WorkflowInvoke => MessageKind::WorkflowInvokeReply,
            MessageKind::WorkflowSignal => MessageKind::WorkflowSignalReply,
            MessageKind::WorkflowQuery => MessageKind::WorkflowQueryReply,
            MessageKind::WorkflowCancel => MessageKind::WorkflowCancelReply,
            MessageKind::ChildWorkflowStart => MessageKind::ChildWorkflowStartReply,
            MessageKind::QueueNew => MessageKind::QueueNewReply,
            MessageKind::QueueWrite => MessageKind::QueueWriteReply,
            MessageKind::ActivityRegister => MessageKind::ActivityRegisterReply,
            MessageKind::ActivityExecute => MessageKind::ActivityExecuteReply,
            MessageKind::ActivityInvoke => MessageKind::ActivityInvokeReply,
            MessageKind::ActivityRecordHeartbeat => MessageKind::ActivityRecordHeartbeatReply,
            _ => return None,
        };
        Some(reply)
    }
}

impl TryFrom<u32> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, ProtocolError> {
        let kind = match value {
            1 => MessageKind::Initialize,
            2 => MessageKind::InitializeReply,
            3 => MessageKind::Heartbeat,
            4 => MessageKind::HeartbeatReply,
            5 => MessageKind::Terminate,
            6 => MessageKind::TerminateReply,
            100 => MessageKind::WorkerRegister,
            101 => MessageKind::WorkerRegisterReply,
            102 => MessageKind::WorkerDeregister,
            103 => MessageKind::WorkerDeregisterReply,
            200 => MessageKind::WorkflowRegister,
            201 => MessageKind::WorkflowRegisterReply,
            202 => MessageKind::WorkflowExecute,
            203 => MessageKind::WorkflowExecuteReply,
            204 => MessageKind::WorkflowInvoke,
            205 => MessageKind::WorkflowInvokeReply,
            206 => MessageKind::WorkflowSignal,
            207 => MessageKind::WorkflowSignalReply,
            208 => MessageKind::WorkflowQuery,
            209 => MessageKind::WorkflowQueryReply,
            210 => MessageKind::WorkflowCancel,
            211 => MessageKind::WorkflowCancelReply,
            212 => MessageKind::ChildWorkflowStart,
            213 => MessageKind::ChildWorkflowStartReply,
            214 => MessageKind::ChildWorkflowCompleted,
            215 => MessageKind::SignalReceived,
            216 => MessageKind::QueueNew,
            217 => MessageKind::QueueNewReply,
            218 => MessageKind::QueueWrite,
            219 => MessageKind::QueueWriteReply,
            300 => MessageKind::ActivityRegister,
            301 => MessageKind::ActivityRegisterReply,
            302 => MessageKind::ActivityExecute,
            303 => MessageKind::ActivityExecuteReply,
            304 => MessageKind::ActivityInvoke,
            305 => MessageKind::ActivityInvokeReply,
            306 => MessageKind::ActivityRecordHeartbeat,
            307 => MessageKind::ActivityRecordHeartbeatReply,
            308 => MessageKind::ActivityCompleted,
            other => return Err(ProtocolError::UnknownMessageKind(other)),
        };
        Ok(kind)
    }
}

/// A typed property value. Wire tags 1-5.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Str(String),
    Bool(bool),
    Int64(i64),
    Bytes(Bytes),
    Json(serde_json::Value),
}

impl PropertyValue {
    pub const TAG_STR: u8 = 1;
    pub const TAG_BOOL: u8 = 2;
    pub const TAG_INT64: u8 = 3;
    pub const TAG_BYTES: u8 = 4;
    pub const TAG_JSON: u8 = 5;

    pub fn tag(&self) -> u8 {
        match self {
            PropertyValue::Str(_) => Self::TAG_STR,
            PropertyValue::Bool(_) => Self::TAG_BOOL,
            PropertyValue::Int64(_) => Self::TAG_INT64,
            PropertyValue::Bytes(_) => Self::TAG_BYTES,
            PropertyValue::Json(_) => Self::TAG_JSON,
        }
    }
}

/// A single key/value entry in an envelope's property bag.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub key: String,
    pub value: PropertyValue,
}

/// The wire message: kind tag, correlation ID, ordered property bag and
/// optional raw payload.
///
/// `request_id == 0` marks a fire-and-forget notification. The property
/// bag preserves insertion order; `set` replaces an existing key in
/// place. The payload is length-prefixed separately on the wire and a
/// zero-length section decodes as `None` (absent and empty payloads are
/// indistinguishable on the wire).
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: MessageKind,
    pub request_id: u64,
    properties: Vec<Property>,
    pub payload: Option<Bytes>,
}

impl Envelope {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            request_id: 0,
            properties: Vec::new(),
            payload: None,
        }
    }

    /// Build an empty reply envelope for this request: paired reply kind,
    /// same `request_id`. Returns `None` for kinds with no reply pair.
    pub fn reply(&self) -> Option<Envelope> {
        self.kind.reply_kind().map(|kind| Envelope {
            kind,
            request_id: self.request_id,
            properties: Vec::new(),
            payload: None,
        })
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.properties
            .iter()
            .find(|p| p.key == key)
            .map(|p| &p.value)
    }

    /// Insert or replace a property, preserving the position of an
    /// existing key.
    pub fn set(&mut self, key: impl Into<String>, value: PropertyValue) {
        let key = key.into();
        match self.properties.iter_mut().find(|p| p.key == key) {
            Some(existing) => existing.value = value,
            None => self.properties.push(Property { key, value }),
        }
    }

    /// Insert a property, rejecting duplicate keys. Used by the decoder,
    /// where a duplicate key is a protocol error rather than an update.
    pub(crate) fn push_unique(&mut self, prop: Property) -> Result<(), ProtocolError> {
        if self.get(&prop.key).is_some() {
            return Err(ProtocolError::DuplicateProperty(prop.key));
        }
        self.properties.push(prop);
        Ok(())
    }

    // ---- typed accessors ----

    pub fn str_prop(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn bool_prop(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn i64_prop(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            PropertyValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn bytes_prop(&self, key: &str) -> Option<&Bytes> {
        match self.get(key)? {
            PropertyValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Deserialize a JSON-valued property. A missing key, a property of
    /// the wrong type, or a blob that does not deserialize all yield
    /// `None` (matching the tolerant reader the proxy protocol expects).
    pub fn json_prop<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.get(key)? {
            PropertyValue::Json(v) => serde_json::from_value(v.clone()).ok(),
            PropertyValue::Str(s) => serde_json::from_str(s).ok(),
            PropertyValue::Bytes(b) => serde_json::from_slice(b).ok(),
            _ => None,
        }
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.set(key, PropertyValue::Str(value.into()));
    }

    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) {
        self.set(key, PropertyValue::Bool(value));
    }

    pub fn set_i64(&mut self, key: impl Into<String>, value: i64) {
        self.set(key, PropertyValue::Int64(value));
    }

    pub fn set_bytes(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.set(key, PropertyValue::Bytes(value.into()));
    }

    pub fn set_json<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), ProtocolError> {
        let value = serde_json::to_value(value)?;
        self.set(key, PropertyValue::Json(value));
        Ok(())
    }

    // ---- builder-style helpers ----

    pub fn with_request_id(mut self, request_id: u64) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_str(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_str(key, value);
        self
    }

    pub fn with_bool(mut self, key: impl Into<String>, value: bool) -> Self {
        self.set_bool(key, value);
        self
    }

    pub fn with_i64(mut self, key: impl Into<String>, value: i64) -> Self {
        self.set_i64(key, value);
        self
    }

    pub fn with_bytes(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.set_bytes(key, value);
        self
    }

    pub fn with_json_value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.set(key, PropertyValue::Json(value));
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        self.payload = if payload.is_empty() {
            None
        } else {
            Some(payload)
        };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for tag in 0u32..=400 {
            if let Ok(kind) = MessageKind::try_from(tag) {
                assert_eq!(kind as u32, tag);
            }
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(MessageKind::try_from(0).is_err());
        assert!(MessageKind::try_from(99).is_err());
        assert!(MessageKind::try_from(9999).is_err());
    }

    #[test]
    fn test_categories_follow_tag_ranges() {
        assert_eq!(MessageKind::Heartbeat.category(), MessageCategory::Client);
        assert_eq!(
            MessageKind::WorkerRegister.category(),
            MessageCategory::Worker
        );
        assert_eq!(
            MessageKind::WorkflowInvoke.category(),
            MessageCategory::Workflow
        );
        assert_eq!(
            MessageKind::ActivityExecute.category(),
            MessageCategory::Activity
        );
    }

    #[test]
    fn test_reply_pairing() {
        assert_eq!(
            MessageKind::WorkflowExecute.reply_kind(),
            Some(MessageKind::WorkflowExecuteReply)
        );
        assert!(MessageKind::WorkflowExecuteReply.is_reply());
        assert!(!MessageKind::WorkflowExecute.is_reply());

        // Pushes have no reply pair and are not replies themselves.
        assert_eq!(MessageKind::ActivityCompleted.reply_kind(), None);
        assert!(!MessageKind::ActivityCompleted.is_reply());
        assert!(!MessageKind::SignalReceived.is_reply());
    }

    #[test]
    fn test_reply_builder_preserves_request_id() {
        let request = Envelope::new(MessageKind::WorkflowQuery).with_request_id(42);
        let reply = request.reply().unwrap();
        assert_eq!(reply.kind, MessageKind::WorkflowQueryReply);
        assert_eq!(reply.request_id, 42);
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut env = Envelope::new(MessageKind::Heartbeat);
        env.set_str("a", "1");
        env.set_str("b", "2");
        env.set_str("a", "3");

        assert_eq!(env.property_count(), 2);
        assert_eq!(env.str_prop("a"), Some("3"));
        // "a" keeps its original position.
        assert_eq!(env.properties()[0].key, "a");
    }

    #[test]
    fn test_typed_accessors_reject_wrong_variant() {
        let mut env = Envelope::new(MessageKind::Heartbeat);
        env.set_i64("n", 7);
        assert_eq!(env.i64_prop("n"), Some(7));
        assert_eq!(env.str_prop("n"), None);
        assert_eq!(env.bool_prop("n"), None);
        assert_eq!(env.bytes_prop("n"), None);
    }

    #[test]
    fn test_json_prop_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Blob {
            name: String,
            count: u32,
        }

        let blob = Blob {
            name: "x".into(),
            count: 3,
        };
        let mut env = Envelope::new(MessageKind::Heartbeat);
        env.set_json("blob", &blob).unwrap();

        assert_eq!(env.json_prop::<Blob>("blob"), Some(blob));
        assert_eq!(env.json_prop::<Blob>("missing"), None);
    }

    #[test]
    fn test_empty_payload_is_absent() {
        let env = Envelope::new(MessageKind::Heartbeat).with_payload(Bytes::new());
        assert!(env.payload.is_none());

        let env = Envelope::new(MessageKind::Heartbeat).with_payload(&b"data"[..]);
        assert_eq!(env.payload.as_deref(), Some(&b"data"[..]));
    }

    #[test]
    fn test_duplicate_key_rejected_by_decoder_path() {
        let mut env = Envelope::new(MessageKind::Heartbeat);
        env.push_unique(Property {
            key: "k".into(),
            value: PropertyValue::Bool(true),
        })
        .unwrap();
        let err = env
            .push_unique(Property {
                key: "k".into(),
                value: PropertyValue::Bool(false),
            })
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DuplicateProperty(k) if k == "k"));
    }
}
