//! Terminal QR rendering of a pairing ticket

use qrcode::render::unicode;
use qrcode::QrCode;

use super::PairingTicket;
use crate::error::{BridgeError, Result};

/// Render the ticket JSON as a QR code made of Unicode half blocks
///
/// # Errors
///
/// Returns error if the ticket is too large for a QR code
///
/// # Examples
///
/// ```no_run
/// use telemetry_bridge::pairing::{render_qr, PairingTicket};
///
/// # fn show(ticket: &PairingTicket) -> telemetry_bridge::error::Result<()> {
/// println!("{}", render_qr(ticket)?);
/// # Ok(())
/// # }
/// ```
pub fn render_qr(ticket: &PairingTicket) -> Result<String> {
    let json = serde_json::to_string(ticket)?;
    let code = QrCode::new(json.as_bytes()).map_err(|e| BridgeError::Encode(format!("QR encoding failed: {}", e)))?;

    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_qr_produces_block_art() {
        let ticket = PairingTicket {
            device_id: "8b0c6a5e-3f7e-4b61-9d4e-2f1a9c0d7e11".to_string(),
            device_name: "Pixel".to_string(),
            device_model: "Pixel 8".to_string(),
            ip_address: "192.168.1.50".to_string(),
            transport_port: 38300,
            pairing_code: "123456".to_string(),
            issued_at: 1_700_000_000_000,
            app_version: "0.1.0".to_string(),
        };

        let art = render_qr(&ticket).unwrap();
        let lines: Vec<&str> = art.lines().collect();

        assert!(lines.len() > 10);
        assert!(art.contains('█') || art.contains('▀') || art.contains('▄'));
    }
}
