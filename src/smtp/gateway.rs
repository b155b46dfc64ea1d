//! HTTP gateway fallback: POST the message as JSON to the hosted relay.

use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::alarm::profile::EmailProfile;

use super::machine::Outcome;
use super::message::Attachment;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Relay endpoint plus the device identity it expects.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub url: String,
    pub model: String,
    pub serial_no: String,
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    #[serde(default)]
    outcome: String,
    #[serde(default)]
    message: String,
}

/// Send one message through the gateway. The server's outcome string maps
/// onto the SMTP outcome codes verbatim.
pub async fn send_via_gateway(
    settings: &GatewaySettings,
    profile: &EmailProfile,
    subject: &str,
    body: &str,
    attachments: &[Attachment],
) -> Outcome {
    let payload = json!({
        "model": settings.model,
        "serial": settings.serial_no,
        "profile": {
            "name": profile.name,
            "from": profile.from_address,
            "to": profile.to_address,
            "cc": profile.cc_address,
            "bcc": profile.bcc_address,
        },
        "subject": subject,
        "body": body,
        "attachments": attachments
            .iter()
            .map(|a| {
                json!({
                    "name": a.file_name,
                    "content_type": if a.content_type.is_empty() {
                        "application/octet-stream"
                    } else {
                        &a.content_type
                    },
                    "content_base64": BASE64.encode(&a.content),
                })
            })
            .collect::<Vec<_>>(),
    });
    let client = reqwest::Client::new();
    let response = match client.post(&settings.url).json(&payload).send().await {
        Ok(response) => response,
        Err(e) => {
            warn!("[SmtpGateway] request failed: {e}");
            return Outcome::ConnectionFailed;
        }
    };
    if !response.status().is_success() {
        warn!("[SmtpGateway] gateway returned {}", response.status());
        return Outcome::UnknownFailure;
    }
    match response.json::<GatewayResponse>().await {
        Ok(parsed) => {
            let outcome = Outcome::from_gateway(&parsed.outcome);
            if outcome != Outcome::Success && !parsed.message.is_empty() {
                warn!("[SmtpGateway] gateway reported: {}", parsed.message);
            }
            outcome
        }
        Err(e) => {
            warn!("[SmtpGateway] unparseable response: {e}");
            Outcome::UnknownFailure
        }
    }
}
