//! Telemetry packets
//!
//! A packet arrives as `{type, timestamp, deviceId, data}`. It is first parsed
//! into [`RawPacket`] and then converted into [`Packet`], whose body shape is
//! fixed by the type tag.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tracing::warn;

use crate::error::{BridgeError, Result};

pub const TYPE_SESSION_START: &str = "session_start";
pub const TYPE_SESSION_END: &str = "session_end";
pub const TYPE_FRAME: &str = "frame";
pub const TYPE_SNAPSHOT: &str = "snapshot";
pub const TYPE_BATCH_UPLOAD: &str = "batch_upload";

/// Untyped packet as it appears on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPacket {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: i64,
    /// Batch items may omit this and inherit the batch's device id
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub data: Value,
}

/// Per-frame measurement
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameData {
    pub fps: f64,
    pub frame_time: f64,
    #[serde(default)]
    pub jank: bool,
}

/// Aggregate metrics over a short window
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotData {
    pub fps: f64,
    pub avg_fps: f64,
    pub min_fps: f64,
    pub max_fps: f64,
    pub cpu_usage: f64,
    pub gpu_usage: f64,
    pub memory_usage: f64,
    pub temperature: f64,
    pub power: f64,
    pub jank_count: i64,
    pub jank_rate: f64,
}

/// Body of `session_start` and `session_end`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Human readable label; older probes send it as `gameName`
    #[serde(default, alias = "gameName", skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
}

/// Body of `batch_upload`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchData {
    pub count: usize,
    pub items: Vec<RawPacket>,
}

/// Typed packet body
#[derive(Debug, Clone, PartialEq)]
pub enum PacketBody {
    SessionStart(SessionInfo),
    SessionEnd(SessionInfo),
    Frame(FrameData),
    Snapshot(SnapshotData),
    /// Items are already typed and never contain a nested batch. Items that
    /// failed to parse are skipped and only counted in `rejected`.
    BatchUpload { items: Vec<Packet>, rejected: usize },
}

/// Telemetry packet decoded once at the transport boundary
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub timestamp: i64,
    pub device_id: String,
    pub body: PacketBody,
}

impl PacketBody {
    /// Wire type tag of this body
    pub fn kind(&self) -> &'static str {
        match self {
            PacketBody::SessionStart(_) => TYPE_SESSION_START,
            PacketBody::SessionEnd(_) => TYPE_SESSION_END,
            PacketBody::Frame(_) => TYPE_FRAME,
            PacketBody::Snapshot(_) => TYPE_SNAPSHOT,
            PacketBody::BatchUpload { .. } => TYPE_BATCH_UPLOAD,
        }
    }
}

fn data_of<T: serde::de::DeserializeOwned>(kind: &str, data: Value) -> Result<T> {
    serde_json::from_value(data)
        .map_err(|e| BridgeError::Protocol(format!("invalid {} data: {}", kind, e)))
}

impl Packet {
    /// Parse a JSON text message into a typed packet
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Protocol` if the JSON is malformed, the type is
    /// unknown, or `data` does not fit the type
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: RawPacket = serde_json::from_str(text)
            .map_err(|e| BridgeError::Protocol(format!("malformed packet: {}", e)))?;
        Packet::try_from(raw)
    }

    /// Convert back to the untyped wire shape
    pub fn into_raw(self) -> Result<RawPacket> {
        let kind = self.body.kind().to_string();
        let data = match self.body {
            PacketBody::SessionStart(info) | PacketBody::SessionEnd(info) => serde_json::to_value(info)?,
            PacketBody::Frame(frame) => serde_json::to_value(frame)?,
            PacketBody::Snapshot(snapshot) => serde_json::to_value(snapshot)?,
            PacketBody::BatchUpload { items, .. } => {
                let items = items
                    .into_iter()
                    .map(Packet::into_raw)
                    .collect::<Result<Vec<_>>>()?;
                serde_json::to_value(BatchData { count: items.len(), items })?
            }
        };

        Ok(RawPacket {
            kind,
            timestamp: self.timestamp,
            device_id: self.device_id,
            data,
        })
    }

    /// Serialize to the JSON text sent on the wire
    pub fn to_json(self) -> Result<String> {
        Ok(serde_json::to_string(&self.into_raw()?)?)
    }

    fn from_raw(raw: RawPacket, allow_batch: bool) -> Result<Self> {
        let RawPacket { kind, timestamp, device_id, data } = raw;

        let body = match kind.as_str() {
            TYPE_SESSION_START => PacketBody::SessionStart(data_of(&kind, null_to_object(data))?),
            TYPE_SESSION_END => PacketBody::SessionEnd(data_of(&kind, null_to_object(data))?),
            TYPE_FRAME => PacketBody::Frame(data_of(&kind, data)?),
            TYPE_SNAPSHOT => PacketBody::Snapshot(data_of(&kind, data)?),
            TYPE_BATCH_UPLOAD if allow_batch => {
                let batch: BatchData = data_of(&kind, data)?;
                let mut items = Vec::with_capacity(batch.items.len());
                let mut rejected = 0;
                for (index, mut item) in batch.items.into_iter().enumerate() {
                    if item.device_id.is_empty() {
                        item.device_id = device_id.clone();
                    }
                    match Packet::from_raw(item, false) {
                        Ok(packet) => items.push(packet),
                        Err(e) => {
                            warn!("Skipping batch item {}: {}", index, e);
                            rejected += 1;
                        }
                    }
                }
                PacketBody::BatchUpload { items, rejected }
            }
            TYPE_BATCH_UPLOAD => {
                return Err(BridgeError::Protocol("nested batch_upload".to_string()));
            }
            other => {
                return Err(BridgeError::Protocol(format!("unknown packet type '{}'", other)));
            }
        };

        Ok(Packet { timestamp, device_id, body })
    }
}

/// Session packets may legitimately carry no data at all
fn null_to_object(data: Value) -> Value {
    if data.is_null() {
        Value::Object(Default::default())
    } else {
        data
    }
}

impl TryFrom<RawPacket> for Packet {
    type Error = BridgeError;

    fn try_from(raw: RawPacket) -> Result<Self> {
        Packet::from_raw(raw, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_frame_packet() {
        let text = r#"{"type":"frame","timestamp":1000,"deviceId":"dev-1","data":{"fps":59.5,"frameTime":16.8,"jank":true}}"#;
        let packet = Packet::from_json(text).unwrap();

        assert_eq!(packet.timestamp, 1000);
        assert_eq!(packet.device_id, "dev-1");
        assert_eq!(
            packet.body,
            PacketBody::Frame(FrameData { fps: 59.5, frame_time: 16.8, jank: true })
        );
    }

    #[test]
    fn test_parse_snapshot_packet() {
        let text = json!({
            "type": "snapshot",
            "timestamp": 2000,
            "deviceId": "dev-1",
            "data": {
                "fps": 60.0, "avgFps": 58.0, "minFps": 40.0, "maxFps": 61.0,
                "cpuUsage": 35.5, "gpuUsage": 50.0, "memoryUsage": 2048.0,
                "temperature": 41.2, "power": 3.4, "jankCount": 2, "jankRate": 0.5
            }
        })
        .to_string();

        match Packet::from_json(&text).unwrap().body {
            PacketBody::Snapshot(snapshot) => {
                assert_eq!(snapshot.avg_fps, 58.0);
                assert_eq!(snapshot.jank_count, 2);
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_session_start_accepts_game_name_alias() {
        let text = r#"{"type":"session_start","timestamp":5,"deviceId":"d","data":{"sessionId":"S1","gameName":"Racer"}}"#;
        match Packet::from_json(text).unwrap().body {
            PacketBody::SessionStart(info) => {
                assert_eq!(info.session_id.as_deref(), Some("S1"));
                assert_eq!(info.label.as_deref(), Some("Racer"));
            }
            other => panic!("expected session_start, got {:?}", other),
        }
    }

    #[test]
    fn test_session_end_without_data() {
        let text = r#"{"type":"session_end","timestamp":5,"deviceId":"d"}"#;
        let packet = Packet::from_json(text).unwrap();
        assert_eq!(packet.body, PacketBody::SessionEnd(SessionInfo::default()));
    }

    #[test]
    fn test_batch_items_inherit_device_id() {
        let text = json!({
            "type": "batch_upload",
            "timestamp": 10,
            "deviceId": "dev-9",
            "data": {
                "count": 2,
                "items": [
                    {"type": "frame", "timestamp": 1, "data": {"fps": 30.0, "frameTime": 33.3}},
                    {"type": "frame", "timestamp": 2, "deviceId": "other", "data": {"fps": 31.0, "frameTime": 32.2}}
                ]
            }
        })
        .to_string();

        match Packet::from_json(&text).unwrap().body {
            PacketBody::BatchUpload { items, rejected } => {
                assert_eq!(rejected, 0);
                assert_eq!(items.len(), 2);
                assert_eq!(items[0].device_id, "dev-9");
                assert_eq!(items[1].device_id, "other");
                assert_eq!(items[0].timestamp, 1);
            }
            other => panic!("expected batch, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_batch_item_skipped() {
        let text = json!({
            "type": "batch_upload", "timestamp": 1, "deviceId": "d",
            "data": {"count": 1, "items": [
                {"type": "batch_upload", "timestamp": 1, "data": {"count": 0, "items": []}}
            ]}
        })
        .to_string();
        match Packet::from_json(&text).unwrap().body {
            PacketBody::BatchUpload { items, rejected } => {
                assert!(items.is_empty());
                assert_eq!(rejected, 1);
            }
            other => panic!("expected batch, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_batch_items_do_not_discard_good_ones() {
        let text = json!({
            "type": "batch_upload", "timestamp": 10, "deviceId": "dev-1",
            "data": {"count": 4, "items": [
                {"type": "session_start", "timestamp": 1, "data": {"sessionId": "S1"}},
                {"type": "bogus", "timestamp": 2, "data": {}},
                {"type": "frame", "timestamp": 3, "data": {"fps": "fast"}},
                {"type": "frame", "timestamp": 4, "data": {"fps": 60.0, "frameTime": 16.6}}
            ]}
        })
        .to_string();

        match Packet::from_json(&text).unwrap().body {
            PacketBody::BatchUpload { items, rejected } => {
                assert_eq!(rejected, 2);
                let timestamps: Vec<i64> = items.iter().map(|p| p.timestamp).collect();
                assert_eq!(timestamps, vec![1, 4]);
            }
            other => panic!("expected batch, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let text = r#"{"type":"heartbeat","timestamp":1,"deviceId":"d","data":{}}"#;
        assert!(matches!(Packet::from_json(text), Err(BridgeError::Protocol(_))));
    }

    #[test]
    fn test_frame_with_wrong_data_rejected() {
        let text = r#"{"type":"frame","timestamp":1,"deviceId":"d","data":{"fps":"fast"}}"#;
        assert!(Packet::from_json(text).is_err());
    }

    #[test]
    fn test_to_json_uses_wire_field_names() {
        let packet = Packet {
            timestamp: 7,
            device_id: "dev-1".to_string(),
            body: PacketBody::Frame(FrameData { fps: 60.0, frame_time: 16.6, jank: false }),
        };
        let value: Value = serde_json::from_str(&packet.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "frame");
        assert_eq!(value["deviceId"], "dev-1");
        assert_eq!(value["data"]["frameTime"], 16.6);
    }
}
