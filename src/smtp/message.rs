//! RFC 5322 message assembly with MIME multipart attachments.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::Rng;

/// One attachment, content already loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub content: Vec<u8>,
    /// Defaults to application/octet-stream when empty.
    pub content_type: String,
    /// Defaults to "attachment" when empty.
    pub disposition: String,
}

impl Attachment {
    pub fn new(file_name: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            content,
            content_type: String::new(),
            disposition: String::new(),
        }
    }
}

/// Addressing and identification for one message.
#[derive(Debug, Clone, Default)]
pub struct MessageHeaders {
    pub from: String,
    pub to: String,
    pub cc: String,
    pub subject: String,
    pub product_name: String,
    pub product_version: String,
}

/// Assemble the full RFC 5322 text: headers, then the body, MIME multipart
/// when attachments are present. CRLF line endings throughout; trailing
/// whitespace is trimmed from the body so the terminating dot sequence
/// cannot be forged.
pub fn format_message(
    headers: &MessageHeaders,
    body: &str,
    attachments: &[Attachment],
    now: DateTime<Utc>,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("Date: {}\r\n", now.to_rfc2822()));
    out.push_str(&format!("From: {}\r\n", headers.from));
    out.push_str(&format!("To: {}\r\n", headers.to));
    if !headers.cc.is_empty() {
        out.push_str(&format!("Cc: {}\r\n", headers.cc));
    }
    out.push_str(&format!("Subject: {}\r\n", headers.subject));
    out.push_str(&format!(
        "Message-ID: <{}.{}.{}@{}>\r\n",
        sanitize_token(&headers.product_name),
        sanitize_token(&headers.product_version),
        now.timestamp_nanos_opt().unwrap_or_default(),
        "vigil"
    ));
    out.push_str("MIME-Version: 1.0\r\n");

    let body = normalize_body(body);
    if attachments.is_empty() {
        out.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        out.push_str("\r\n");
        out.push_str(&body);
        return out;
    }

    let boundary = make_boundary();
    out.push_str(&format!(
        "Content-Type: multipart/mixed; boundary=\"{boundary}\"\r\n"
    ));
    out.push_str("\r\n");
    out.push_str(&format!("--{boundary}\r\n"));
    out.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
    out.push_str(&body);
    out.push_str("\r\n");
    for attachment in attachments {
        let content_type = if attachment.content_type.is_empty() {
            "application/octet-stream"
        } else {
            &attachment.content_type
        };
        let disposition = if attachment.disposition.is_empty() {
            "attachment"
        } else {
            &attachment.disposition
        };
        let name = base_name(&attachment.file_name);
        out.push_str(&format!("--{boundary}\r\n"));
        out.push_str(&format!("Content-Type: {content_type}; name=\"{name}\"\r\n"));
        out.push_str("Content-Transfer-Encoding: base64\r\n");
        out.push_str(&format!(
            "Content-Disposition: {disposition}; filename=\"{name}\"\r\n\r\n"
        ));
        for chunk in BASE64.encode(&attachment.content).as_bytes().chunks(76) {
            out.push_str(&String::from_utf8_lossy(chunk));
            out.push_str("\r\n");
        }
    }
    out.push_str(&format!("--{boundary}--\r\n"));
    out
}

/// Normalize line endings to CRLF and trim trailing whitespace.
fn normalize_body(body: &str) -> String {
    let unified = body.replace("\r\n", "\n");
    let mut out = String::with_capacity(unified.len());
    for (idx, line) in unified.split('\n').enumerate() {
        if idx > 0 {
            out.push_str("\r\n");
        }
        out.push_str(line);
    }
    out.trim_end().to_string()
}

fn sanitize_token(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "vigil".to_string()
    } else {
        cleaned
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn make_boundary() -> String {
    let mut rng = rand::thread_rng();
    let token: String = (0..24)
        .map(|_| {
            let n: u8 = rng.gen_range(0..36);
            char::from_digit(u32::from(n), 36).unwrap_or('0')
        })
        .collect();
    format!("=_vigil_{token}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn headers() -> MessageHeaders {
        MessageHeaders {
            from: "logger@example.com".into(),
            to: "oncall@example.com, lead@example.com".into(),
            cc: String::new(),
            subject: "Over Temp triggered".into(),
            product_name: "vigil".into(),
            product_version: "0.1.0".into(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn plain_message_has_standard_headers() {
        let msg = format_message(&headers(), "Temp is 101\n", &[], now());
        assert!(msg.contains("Date: Sat, 1 Jun 2024 12:30:00 +0000\r\n"));
        assert!(msg.contains("From: logger@example.com\r\n"));
        assert!(msg.contains("Subject: Over Temp triggered\r\n"));
        assert!(msg.contains("Message-ID: <vigil.0-1-0."));
        // body separated by a blank line, trailing whitespace trimmed
        assert!(msg.ends_with("\r\nTemp is 101"));
    }

    #[test]
    fn attachments_produce_multipart() {
        let attachment = Attachment::new("data/report.csv", b"a,b\r\n1,2\r\n".to_vec());
        let msg = format_message(&headers(), "see attached", &[attachment], now());
        assert!(msg.contains("Content-Type: multipart/mixed; boundary="));
        assert!(msg.contains("Content-Disposition: attachment; filename=\"report.csv\""));
        assert!(msg.contains("Content-Transfer-Encoding: base64"));
        assert!(msg.trim_end().ends_with("--"));
    }

    #[test]
    fn body_line_endings_are_normalized() {
        let msg = format_message(&headers(), "one\ntwo\r\nthree\n\n", &[], now());
        assert!(msg.contains("one\r\ntwo\r\nthree"));
        assert!(!msg.ends_with('\n'));
    }
}
