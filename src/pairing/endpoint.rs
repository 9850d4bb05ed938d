//! `pairing_request`/`pairing_response` over WebSocket
//!
//! The probe listens; the aggregator connects, presents the code the user
//! read off the probe, and on success trusts the probe's device id.

use std::time::Duration;

use futures::{SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async};
use tracing::{debug, info, warn};

use super::{PairingManager, TrustStore, TrustedPeer};
use crate::error::{BridgeError, PairingError, Result, TransportError};
use crate::protocol::{now_millis, ControlMessage, PairingRequest, PairingResponse};

/// How long either side waits for the other's message
pub const PAIRING_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept pairing connections until the listener fails
///
/// Each connection carries exactly one request and one response.
pub async fn serve_pairing(listener: TcpListener, manager: PairingManager) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Pairing endpoint listening on {}", addr);
    }

    loop {
        let (stream, peer) = listener.accept().await?;
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_pairing_connection(stream, manager).await {
                warn!("Pairing connection from {} failed: {}", peer, e);
            }
        });
    }
}

async fn handle_pairing_connection(stream: TcpStream, manager: PairingManager) -> Result<()> {
    let mut ws = accept_async(stream)
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;

    let request = match timeout(PAIRING_EXCHANGE_TIMEOUT, next_text(&mut ws)).await {
        Ok(Some(text)) => ControlMessage::from_json(&text),
        Ok(None) => return Ok(()),
        Err(_) => {
            debug!("Pairing peer sent nothing before the timeout");
            return Ok(());
        }
    };

    let response = match request {
        Ok(ControlMessage::PairingRequest(req)) => {
            let result = manager.accept_request(&req.pairing_code, &req.requester_id, &req.requester_name);
            PairingResponse {
                success: result.success,
                message: result.message(),
                device_info: result.ticket,
            }
        }
        Ok(_) | Err(_) => PairingResponse {
            success: false,
            message: PairingError::Malformed("expected pairing_request".to_string()).to_string(),
            device_info: None,
        },
    };

    let text = ControlMessage::PairingResponse(response).to_json()?;
    ws.send(Message::Text(text))
        .await
        .map_err(|e| TransportError::Send(e.to_string()))?;
    let _ = ws.close(None).await;
    Ok(())
}

async fn next_text<S>(ws: &mut S) -> Option<String>
where
    S: Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

/// Present `code` to the probe at `url` and wait for its answer
///
/// # Errors
///
/// Returns `BridgeError::Transport` if the probe cannot be reached or does
/// not answer in time
pub async fn request_pairing(url: &str, code: &str, requester_id: &str, requester_name: &str) -> Result<PairingResponse> {
    let (mut ws, _) = timeout(PAIRING_EXCHANGE_TIMEOUT, connect_async(url))
        .await
        .map_err(|_| TransportError::ConnectTimeout(PAIRING_EXCHANGE_TIMEOUT.as_millis() as u64))?
        .map_err(|e| TransportError::Connect(e.to_string()))?;

    let request = ControlMessage::PairingRequest(PairingRequest {
        pairing_code: code.to_string(),
        requester_name: requester_name.to_string(),
        requester_id: requester_id.to_string(),
    });
    ws.send(Message::Text(request.to_json()?))
        .await
        .map_err(|e| TransportError::Send(e.to_string()))?;

    let reply = timeout(PAIRING_EXCHANGE_TIMEOUT, next_text(&mut ws))
        .await
        .map_err(|_| TransportError::Connect("no pairing response".to_string()))?
        .ok_or_else(|| TransportError::Connect("connection closed before pairing response".to_string()))?;
    let _ = ws.close(None).await;

    match ControlMessage::from_json(&reply)? {
        ControlMessage::PairingResponse(response) => Ok(response),
        other => Err(BridgeError::Protocol(format!("unexpected reply to pairing request: {:?}", other))),
    }
}

/// Pair with the probe at `url` and trust it locally on success
///
/// # Returns
///
/// * `Result<TrustedPeer>` - The probe as now stored in `trust`
///
/// # Errors
///
/// Returns `BridgeError::Pairing` if the probe rejects the code, plus any
/// transport or persistence error
pub async fn complete_pairing(url: &str, code: &str, trust: &TrustStore, requester_name: &str) -> Result<TrustedPeer> {
    let requester_id = trust.device_id()?;
    let response = request_pairing(url, code, &requester_id, requester_name).await?;

    if !response.success {
        return Err(PairingError::Rejected(response.message).into());
    }

    let ticket = response
        .device_info
        .ok_or_else(|| PairingError::Malformed("pairing response without deviceInfo".to_string()))?;

    let peer = TrustedPeer {
        peer_id: ticket.device_id,
        peer_name: ticket.device_name,
        paired_at: now_millis(),
    };
    trust.trust(peer.clone())?;
    Ok(peer)
}
