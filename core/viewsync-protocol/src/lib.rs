//! Wire types for the viewsync event channel.
//!
//! This crate is shared by servers and clients to prevent schema drift.
//! Transports only ever move [`RawFrame`]s; [`decode_frame`] turns a frame
//! into a typed [`ServerEvent`] exactly once, at the transport boundary, and
//! everything downstream matches on the enum.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

pub const MAX_FRAME_BYTES: usize = 1024 * 1024; // 1MB

/// Liveness frames sent by servers; transports swallow them.
pub const HEARTBEAT_EVENT: &str = "ping";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    ResourceUpsert,
    ResourceUpsertBatch,
    ResourceRemove,
    ResourceRemoveBatch,
    NotificationNew,
    NotificationUpdated,
    NotificationDeleted,
    NotificationsSync,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::ResourceUpsert,
        EventKind::ResourceUpsertBatch,
        EventKind::ResourceRemove,
        EventKind::ResourceRemoveBatch,
        EventKind::NotificationNew,
        EventKind::NotificationUpdated,
        EventKind::NotificationDeleted,
        EventKind::NotificationsSync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ResourceUpsert => "resource:upsert",
            EventKind::ResourceUpsertBatch => "resource:upsert:batch",
            EventKind::ResourceRemove => "resource:remove",
            EventKind::ResourceRemoveBatch => "resource:remove:batch",
            EventKind::NotificationNew => "notification:new",
            EventKind::NotificationUpdated => "notification:updated",
            EventKind::NotificationDeleted => "notification:deleted",
            EventKind::NotificationsSync => "notifications:sync",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        EventKind::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An opaque record keyed by a stable `id` field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(Map<String, Value>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Row(fields)
    }

    /// Returns `None` unless `value` is a JSON object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Row(fields)),
            _ => None,
        }
    }

    /// The row id, if present and usable. Integer ids are stringified.
    pub fn id(&self) -> Option<String> {
        self.0.get("id").and_then(id_from_value)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value.into());
        self
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

pub fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.trim().is_empty() => Some(id.clone()),
        Value::Number(number) if number.is_i64() || number.is_u64() => Some(number.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: String,
    pub recipient_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub payload: Value,
}

impl NotificationRecord {
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.id.trim().is_empty() {
            return Err(DecodeError::new("missing_field", "notification id is required"));
        }
        if self.recipient_id.trim().is_empty() {
            return Err(DecodeError::new(
                "missing_field",
                "notification recipientId is required",
            ));
        }
        Ok(())
    }
}

/// Server → client events, decoded once from a [`RawFrame`].
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ResourceUpsert {
        resource_type: String,
        row: Row,
    },
    /// `rejected` counts members that were not JSON objects.
    ResourceUpsertBatch {
        resource_type: String,
        rows: Vec<Row>,
        rejected: usize,
    },
    ResourceRemove {
        resource_type: String,
        id: String,
    },
    /// `rejected` counts ids that were neither strings nor integers.
    ResourceRemoveBatch {
        resource_type: String,
        ids: Vec<String>,
        rejected: usize,
    },
    NotificationNew(NotificationRecord),
    NotificationUpdated(NotificationRecord),
    NotificationDeleted {
        id: String,
    },
    NotificationsSync(Vec<NotificationRecord>),
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::ResourceUpsert { .. } => EventKind::ResourceUpsert,
            ServerEvent::ResourceUpsertBatch { .. } => EventKind::ResourceUpsertBatch,
            ServerEvent::ResourceRemove { .. } => EventKind::ResourceRemove,
            ServerEvent::ResourceRemoveBatch { .. } => EventKind::ResourceRemoveBatch,
            ServerEvent::NotificationNew(_) => EventKind::NotificationNew,
            ServerEvent::NotificationUpdated(_) => EventKind::NotificationUpdated,
            ServerEvent::NotificationDeleted { .. } => EventKind::NotificationDeleted,
            ServerEvent::NotificationsSync(_) => EventKind::NotificationsSync,
        }
    }

    pub fn resource_type(&self) -> Option<&str> {
        match self {
            ServerEvent::ResourceUpsert { resource_type, .. }
            | ServerEvent::ResourceUpsertBatch { resource_type, .. }
            | ServerEvent::ResourceRemove { resource_type, .. }
            | ServerEvent::ResourceRemoveBatch { resource_type, .. } => Some(resource_type),
            ServerEvent::NotificationNew(_)
            | ServerEvent::NotificationUpdated(_)
            | ServerEvent::NotificationDeleted { .. }
            | ServerEvent::NotificationsSync(_) => None,
        }
    }
}

/// Untyped `{event, payload}` envelope as carried by a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFrame {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl RawFrame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    pub fn parse_line(line: &[u8]) -> Result<Self, DecodeError> {
        if line.len() > MAX_FRAME_BYTES {
            return Err(DecodeError::new(
                "invalid_payload",
                format!("frame exceeds {} bytes", MAX_FRAME_BYTES),
            ));
        }
        serde_json::from_slice(line).map_err(|err| {
            DecodeError::new("invalid_payload", format!("frame is invalid JSON: {}", err))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewScope {
    pub resource_type: String,
    pub view_key: String,
}

impl ViewScope {
    pub fn new(resource_type: impl Into<String>, view_key: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            view_key: view_key.into(),
        }
    }
}

/// Client → server subscription scoping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ClientFrame {
    #[serde(rename = "join-view")]
    JoinView(ViewScope),
    #[serde(rename = "leave-view")]
    LeaveView(ViewScope),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub code: String,
    pub message: String,
}

impl DecodeError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for DecodeError {}

pub fn decode_frame(frame: &RawFrame) -> Result<ServerEvent, DecodeError> {
    let kind = EventKind::from_name(&frame.event).ok_or_else(|| {
        DecodeError::new("unknown_event", format!("unknown event '{}'", frame.event))
    })?;
    let payload = &frame.payload;

    match kind {
        EventKind::ResourceUpsert => {
            let resource_type = require_resource_type(payload)?;
            let row = payload
                .get("row")
                .cloned()
                .and_then(Row::from_value)
                .ok_or_else(|| DecodeError::new("invalid_payload", "row must be an object"))?;
            Ok(ServerEvent::ResourceUpsert { resource_type, row })
        }
        EventKind::ResourceUpsertBatch => {
            let resource_type = require_resource_type(payload)?;
            let members = require_array(payload, "rows")?;
            let rows: Vec<Row> = members.iter().cloned().filter_map(Row::from_value).collect();
            let rejected = members.len() - rows.len();
            Ok(ServerEvent::ResourceUpsertBatch {
                resource_type,
                rows,
                rejected,
            })
        }
        EventKind::ResourceRemove => {
            let resource_type = require_resource_type(payload)?;
            let id = require_id(payload)?;
            Ok(ServerEvent::ResourceRemove { resource_type, id })
        }
        EventKind::ResourceRemoveBatch => {
            let resource_type = require_resource_type(payload)?;
            let members = require_array(payload, "ids")?;
            let ids: Vec<String> = members.iter().filter_map(id_from_value).collect();
            let rejected = members.len() - ids.len();
            Ok(ServerEvent::ResourceRemoveBatch {
                resource_type,
                ids,
                rejected,
            })
        }
        EventKind::NotificationNew => Ok(ServerEvent::NotificationNew(parse_notification(
            payload.clone(),
        )?)),
        EventKind::NotificationUpdated => Ok(ServerEvent::NotificationUpdated(
            parse_notification(payload.clone())?,
        )),
        EventKind::NotificationDeleted => Ok(ServerEvent::NotificationDeleted {
            id: require_id(payload)?,
        }),
        EventKind::NotificationsSync => {
            // A sync is a full replace, so one bad record rejects the frame
            // rather than silently shrinking the recipient's cache.
            let members = payload.as_array().ok_or_else(|| {
                DecodeError::new("invalid_payload", "notifications:sync expects an array")
            })?;
            let records = members
                .iter()
                .cloned()
                .map(parse_notification)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ServerEvent::NotificationsSync(records))
        }
    }
}

pub fn encode_frame(event: &ServerEvent) -> RawFrame {
    let payload = match event {
        ServerEvent::ResourceUpsert { resource_type, row } => {
            json!({ "resourceType": resource_type, "row": row })
        }
        ServerEvent::ResourceUpsertBatch {
            resource_type,
            rows,
            ..
        } => json!({ "resourceType": resource_type, "rows": rows }),
        ServerEvent::ResourceRemove { resource_type, id } => {
            json!({ "resourceType": resource_type, "id": id })
        }
        ServerEvent::ResourceRemoveBatch {
            resource_type,
            ids,
            ..
        } => json!({ "resourceType": resource_type, "ids": ids }),
        ServerEvent::NotificationNew(record) | ServerEvent::NotificationUpdated(record) => {
            serde_json::to_value(record).unwrap_or(Value::Null)
        }
        ServerEvent::NotificationDeleted { id } => json!({ "id": id }),
        ServerEvent::NotificationsSync(records) => {
            serde_json::to_value(records).unwrap_or(Value::Null)
        }
    };
    RawFrame::new(event.kind().as_str(), payload)
}

fn parse_notification(value: Value) -> Result<NotificationRecord, DecodeError> {
    let record: NotificationRecord = serde_json::from_value(value).map_err(|err| {
        DecodeError::new(
            "invalid_payload",
            format!("notification payload is invalid: {}", err),
        )
    })?;
    record.validate()?;
    Ok(record)
}

fn require_resource_type(payload: &Value) -> Result<String, DecodeError> {
    match payload.get("resourceType").and_then(Value::as_str) {
        Some(value) if !value.trim().is_empty() => Ok(value.to_string()),
        _ => Err(DecodeError::new("missing_field", "resourceType is required")),
    }
}

fn require_id(payload: &Value) -> Result<String, DecodeError> {
    payload
        .get("id")
        .and_then(id_from_value)
        .ok_or_else(|| DecodeError::new("missing_field", "id is required"))
}

fn require_array<'a>(payload: &'a Value, field: &str) -> Result<&'a Vec<Value>, DecodeError> {
    payload
        .get(field)
        .and_then(Value::as_array)
        .ok_or_else(|| DecodeError::new("invalid_payload", format!("{} must be an array", field)))
}
