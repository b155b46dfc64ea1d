//! One-shot SMTP sending: the protocol state machine, message assembly, the
//! async socket driver with STARTTLS, and the HTTP gateway fallback.
//!
//! The protocol logic lives in [`machine::Machine`] and is pure; this module
//! owns sockets, TLS, and deadlines, and adapts the whole thing to the
//! manager's [`EmailTransport`] interface.

pub mod gateway;
pub mod machine;
pub mod message;

pub use gateway::GatewaySettings;
pub use machine::{cram_md5_digest, dot_stuff, Action, Event, Machine, Outcome, Reply, Session};
pub use message::{format_message, Attachment, MessageHeaders};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::alarm::manager::{EmailRequest, EmailTransport, EngineEvent, EventSender};
use crate::clock::SharedClock;

/// Split a comma/semicolon separated address list.
pub fn parse_addresses(raw: &str) -> Vec<String> {
    raw.split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Drives one SMTP exchange over a TCP (and optionally TLS) stream.
#[derive(Debug)]
pub struct SmtpSender {
    /// `host` or `host:port`; port defaults to 25.
    pub server_address: String,
    pub session: Session,
}

enum Transport {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Transport {
    async fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf).await,
            Transport::Tls(s) => s.read(buf).await,
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Transport::Plain(s) => s.write_all(data).await,
            Transport::Tls(s) => s.write_all(data).await,
        }
    }
}

impl SmtpSender {
    /// Run the exchange to completion and return the single outcome.
    pub async fn send(self) -> Outcome {
        let (host, port) = split_host_port(&self.server_address);
        let mut machine = Machine::new(self.session);
        let mut pending: VecDeque<Action> = machine.start().into();
        let mut deadline_ms: u64 = 5_000;
        for action in &pending {
            if let Action::SetDeadline(ms) = action {
                deadline_ms = u64::from(*ms);
            }
        }
        pending.retain(|a| !matches!(a, Action::SetDeadline(_)));

        let connect = timeout(
            Duration::from_millis(deadline_ms),
            TcpStream::connect((host.as_str(), port)),
        )
        .await;
        let mut transport = match connect {
            Ok(Ok(stream)) => Some(Transport::Plain(stream)),
            Ok(Err(e)) => {
                debug!("[SmtpSender] connect failed: {e}");
                pending.extend(machine.step(Event::ConnectionError));
                None
            }
            Err(_) => {
                pending.extend(machine.step(Event::Timeout));
                None
            }
        };
        if transport.is_some() {
            pending.extend(machine.step(Event::Connected));
        }

        let mut read_buf: Vec<u8> = Vec::with_capacity(1024);
        loop {
            // drain actions before waiting on the wire
            while let Some(action) = pending.pop_front() {
                match action {
                    Action::SetDeadline(ms) => deadline_ms = u64::from(ms),
                    Action::Complete(outcome) => return outcome,
                    Action::Send(data) => {
                        let Some(t) = transport.as_mut() else {
                            pending.extend(machine.step(Event::ConnectionError));
                            continue;
                        };
                        if let Err(e) = t.write_all(data.as_bytes()).await {
                            debug!("[SmtpSender] write failed: {e}");
                            pending.extend(machine.step(Event::ConnectionError));
                        }
                    }
                    Action::StartTls => {
                        let upgraded = match transport.take() {
                            Some(Transport::Plain(tcp)) => {
                                upgrade_tls(tcp, &host).await.map(|tls| {
                                    Transport::Tls(Box::new(tls))
                                })
                            }
                            other => {
                                transport = other;
                                Err("stream is not in a plain state".to_string())
                            }
                        };
                        match upgraded {
                            Ok(tls) => {
                                read_buf.clear();
                                transport = Some(tls);
                                pending.extend(machine.step(Event::TlsReady));
                            }
                            Err(e) => {
                                warn!("[SmtpSender] TLS handshake failed: {e}");
                                pending.extend(machine.step(Event::TlsFailed));
                            }
                        }
                    }
                }
            }

            let Some(t) = transport.as_mut() else {
                // no connection and nothing pending: the machine must have
                // completed; treat anything else as a connection failure
                pending.extend(machine.step(Event::ConnectionError));
                continue;
            };
            match timeout(
                Duration::from_millis(deadline_ms),
                read_reply(t, &mut read_buf),
            )
            .await
            {
                Ok(Ok(reply)) => pending.extend(machine.step(Event::Reply(reply))),
                Ok(Err(e)) => {
                    debug!("[SmtpSender] read failed: {e}");
                    pending.extend(machine.step(Event::ConnectionError));
                }
                Err(_) => pending.extend(machine.step(Event::Timeout)),
            }
        }
    }
}

fn split_host_port(address: &str) -> (String, u16) {
    match address.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (address.to_string(), 25),
        },
        None => (address.to_string(), 25),
    }
}

async fn upgrade_tls(
    tcp: TcpStream,
    host: &str,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, String> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| e.to_string())?;
    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| e.to_string())
}

async fn read_line(t: &mut Transport, buf: &mut Vec<u8>) -> std::io::Result<String> {
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line: Vec<u8> = buf.drain(..pos + 2).collect();
            return Ok(String::from_utf8_lossy(&line[..line.len() - 2]).into_owned());
        }
        let mut chunk = [0u8; 1024];
        let n = t.read_some(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Read one complete (possibly multiline) SMTP reply.
async fn read_reply(t: &mut Transport, buf: &mut Vec<u8>) -> std::io::Result<Reply> {
    let mut lines = Vec::new();
    let mut code = 0u16;
    loop {
        let line = read_line(t, buf).await?;
        code = line.get(0..3).and_then(|c| c.parse().ok()).unwrap_or(0);
        let is_final = line.len() <= 3 || line.as_bytes().get(3) == Some(&b' ');
        lines.push(line.get(4..).unwrap_or("").to_string());
        if is_final {
            break;
        }
    }
    Ok(Reply { code, lines })
}

/// Production [`EmailTransport`]: resolves the profile into either a direct
/// SMTP exchange or the HTTP gateway, on a background task.
pub struct SmtpEmailTransport {
    pub clock: SharedClock,
    pub gateway: Option<GatewaySettings>,
    pub local_name: String,
    pub product_name: String,
    pub product_version: String,
}

impl EmailTransport for SmtpEmailTransport {
    fn send(&mut self, action: u64, request: EmailRequest, done: EventSender) {
        let clock = self.clock.clone();
        let gateway = self.gateway.clone();
        let local_name = self.local_name.clone();
        let product_name = self.product_name.clone();
        let product_version = self.product_version.clone();
        tokio::spawn(async move {
            let outcome = run_email(
                &request,
                clock,
                gateway.as_ref(),
                &local_name,
                &product_name,
                &product_version,
            )
            .await;
            let error = (outcome != Outcome::Success).then(|| outcome.to_string());
            let _ = done.send(EngineEvent::ActionComplete { action, error });
        });
    }
}

async fn run_email(
    request: &EmailRequest,
    clock: SharedClock,
    gateway: Option<&GatewaySettings>,
    local_name: &str,
    product_name: &str,
    product_version: &str,
) -> Outcome {
    let mut attachments = Vec::new();
    for path in &request.attachments {
        match tokio::fs::read(path).await {
            Ok(content) => attachments.push(Attachment::new(path.clone(), content)),
            Err(e) => warn!("[SmtpEmailTransport] skipping attachment {path}: {e}"),
        }
    }
    let profile = &request.profile;
    if profile.use_gateway {
        let Some(settings) = gateway else {
            warn!("[SmtpEmailTransport] profile wants the gateway but none is configured");
            return Outcome::UnknownFailure;
        };
        return gateway::send_via_gateway(
            settings,
            profile,
            &request.subject,
            &request.message,
            &attachments,
        )
        .await;
    }

    let mut recipients = parse_addresses(&profile.to_address);
    recipients.extend(parse_addresses(&profile.cc_address));
    recipients.extend(parse_addresses(&profile.bcc_address));
    let headers = MessageHeaders {
        from: profile.from_address.clone(),
        to: profile.to_address.clone(),
        cc: profile.cc_address.clone(),
        subject: request.subject.clone(),
        product_name: product_name.to_string(),
        product_version: product_version.to_string(),
    };
    let message = format_message(&headers, &request.message, &attachments, clock.now());
    let sender = SmtpSender {
        server_address: profile.smtp_server.clone(),
        session: Session {
            local_name: local_name.to_string(),
            user_name: profile.smtp_user_name.clone(),
            password: profile.smtp_password.clone(),
            from_address: profile.from_address.clone(),
            recipients,
            message,
        },
    };
    sender.send().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_lists_split_on_commas_and_semicolons() {
        let out = parse_addresses("a@x.com, b@y.com;  ; c@z.com");
        assert_eq!(out, vec!["a@x.com", "b@y.com", "c@z.com"]);
    }

    #[test]
    fn host_port_parsing_defaults_to_25() {
        assert_eq!(split_host_port("mail.example.com"), ("mail.example.com".into(), 25));
        assert_eq!(
            split_host_port("mail.example.com:587"),
            ("mail.example.com".into(), 587)
        );
    }
}
