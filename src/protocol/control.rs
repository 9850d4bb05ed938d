//! Control messages
//!
//! Non-telemetry JSON messages, tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::pairing::PairingTicket;

/// Sent by the aggregator as the first message on every connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    pub server_id: String,
    #[serde(default)]
    pub server_name: String,
    pub version: String,
    #[serde(default)]
    pub message: String,
}

/// Reply to every telemetry packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub received: bool,
    pub stored: bool,
}

/// Aggregator asks the probe to pair using the code shown on the probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequest {
    pub pairing_code: String,
    pub requester_name: String,
    pub requester_id: String,
}

/// Probe's answer to a [`PairingRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_info: Option<PairingTicket>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Welcome(Welcome),
    Ack(Ack),
    PairingRequest(PairingRequest),
    PairingResponse(PairingResponse),
}

impl ControlMessage {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| BridgeError::Protocol(format!("malformed control message: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_welcome_wire_shape() {
        let msg = ControlMessage::Welcome(Welcome {
            server_id: "agg-1".to_string(),
            server_name: "Desk".to_string(),
            version: "0.1.0".to_string(),
            message: "connected".to_string(),
        });
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "welcome");
        assert_eq!(value["serverId"], "agg-1");
        assert_eq!(value["version"], "0.1.0");
    }

    #[test]
    fn test_ack_wire_shape() {
        let text = ControlMessage::Ack(Ack { received: true, stored: false }).to_json().unwrap();
        assert_eq!(text, r#"{"type":"ack","received":true,"stored":false}"#);
    }

    #[test]
    fn test_parse_pairing_request() {
        let text = r#"{"type":"pairing_request","pairingCode":"123456","requesterName":"Desk","requesterId":"agg-1"}"#;
        let msg = ControlMessage::from_json(text).unwrap();

        assert_eq!(
            msg,
            ControlMessage::PairingRequest(PairingRequest {
                pairing_code: "123456".to_string(),
                requester_name: "Desk".to_string(),
                requester_id: "agg-1".to_string(),
            })
        );
    }

    #[test]
    fn test_failed_pairing_response_omits_device_info() {
        let msg = ControlMessage::PairingResponse(PairingResponse {
            success: false,
            message: "invalid pairing code".to_string(),
            device_info: None,
        });
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "pairing_response");
        assert_eq!(value["success"], false);
        assert!(value.get("deviceInfo").is_none());
    }

    #[test]
    fn test_telemetry_packet_is_not_a_control_message() {
        let text = r#"{"type":"frame","timestamp":1,"deviceId":"d","data":{}}"#;
        assert!(ControlMessage::from_json(text).is_err());
    }
}
