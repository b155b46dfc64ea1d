//! The SMTP protocol state machine.
//!
//! Pure: every transition goes through [`Machine::step`], which consumes one
//! event (a parsed server reply, a connection milestone, a timeout) and
//! returns the actions the driver must carry out. Cancellation is a single
//! reset to `Standby`. The async driver owns sockets, TLS, and deadlines.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Final result of one send, surfaced exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    UnknownFailure,
    Success,
    ConnectionFailed,
    AuthorisationFailed,
    TlsInitialiseFailed,
    DataAckInvalid,
    RcptToAckInvalid,
    PasswordAckInvalid,
    UserNameAckInvalid,
    AuthAckInvalid,
    StartTlsAckInvalid,
    HeloAckInvalid,
    TimedOut,
}

impl Outcome {
    /// Map a gateway response's outcome string.
    pub fn from_gateway(outcome: &str) -> Self {
        match outcome {
            "success" => Outcome::Success,
            "connection-failed" => Outcome::ConnectionFailed,
            "authorisation-failed" => Outcome::AuthorisationFailed,
            "timed-out" => Outcome::TimedOut,
            _ => Outcome::UnknownFailure,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Outcome::UnknownFailure => "an unrecognised failure occurred",
            Outcome::Success => "success",
            Outcome::ConnectionFailed => "the connection to the server failed",
            Outcome::AuthorisationFailed => "authorisation with the server failed",
            Outcome::TlsInitialiseFailed => "the TLS handshake failed",
            Outcome::DataAckInvalid => "the server rejected the message data",
            Outcome::RcptToAckInvalid => "the server rejected a recipient address",
            Outcome::PasswordAckInvalid => "the server rejected the account password",
            Outcome::UserNameAckInvalid => "the server rejected the account name",
            Outcome::AuthAckInvalid => "the server rejected the authorisation request",
            Outcome::StartTlsAckInvalid => "the server rejected the STARTTLS request",
            Outcome::HeloAckInvalid => "the server rejected the client greeting",
            Outcome::TimedOut => "the server did not respond in time",
        };
        write!(f, "{text}")
    }
}

/// One complete (possibly multiline) server reply.
#[derive(Debug, Clone)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

/// What the driver reports into the machine.
#[derive(Debug, Clone)]
pub enum Event {
    /// The TCP connection is established.
    Connected,
    /// The TLS handshake completed after a `StartTls` action.
    TlsReady,
    /// The TLS handshake failed.
    TlsFailed,
    Reply(Reply),
    /// The current state's deadline expired.
    Timeout,
    ConnectionError,
}

/// What the driver must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write these bytes to the server.
    Send(String),
    /// Upgrade the stream to TLS, then post `TlsReady`/`TlsFailed`.
    StartTls,
    /// Arm the deadline for the state just entered (milliseconds).
    SetDeadline(u32),
    /// The exchange is over; the machine is back in standby.
    Complete(Outcome),
}

/// Per-state deadlines.
const CONNECT_TIMEOUT_MS: u32 = 5_000;
const REPLY_TIMEOUT_MS: u32 = 30_000;
const DATA_ACK_TIMEOUT_MS: u32 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Standby,
    Connecting,
    Wait220,
    EhloWait250,
    StartTlsWait220,
    TlsHandshake,
    CramWait334,
    LoginNameWait334,
    LoginPasswordWait334,
    AuthWait235,
    RcptToWait250,
    DataWait354,
    DataWait250,
    QuitWait221,
}

/// Capabilities parsed from the EHLO response.
#[derive(Debug, Clone, Copy, Default)]
struct Caps {
    starttls: bool,
    auth_cram_md5: bool,
    auth_login: bool,
    auth_plain: bool,
}

/// Session parameters for one message.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub local_name: String,
    pub user_name: String,
    pub password: String,
    pub from_address: String,
    /// to + cc + bcc, already split.
    pub recipients: Vec<String>,
    /// Fully formatted RFC 5322 message (headers + body, CRLF line ends).
    pub message: String,
}

#[derive(Debug)]
pub struct Machine {
    session: Session,
    state: State,
    caps: Caps,
    tls_active: bool,
    next_rcpt: usize,
}

impl Machine {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            state: State::Standby,
            caps: Caps::default(),
            tls_active: false,
            next_rcpt: 0,
        }
    }

    /// Begin the exchange; the driver should start connecting.
    pub fn start(&mut self) -> Vec<Action> {
        self.state = State::Connecting;
        self.caps = Caps::default();
        self.tls_active = false;
        self.next_rcpt = 0;
        vec![Action::SetDeadline(CONNECT_TIMEOUT_MS)]
    }

    pub fn is_standby(&self) -> bool {
        self.state == State::Standby
    }

    /// Abandon the exchange without surfacing an outcome.
    pub fn reset(&mut self) {
        self.state = State::Standby;
    }

    pub fn step(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::Timeout => self.complete(Outcome::TimedOut),
            Event::ConnectionError => {
                if self.state == State::TlsHandshake {
                    self.complete(Outcome::TlsInitialiseFailed)
                } else {
                    self.complete(Outcome::ConnectionFailed)
                }
            }
            Event::Connected => {
                self.state = State::Wait220;
                vec![Action::SetDeadline(REPLY_TIMEOUT_MS)]
            }
            Event::TlsReady => {
                self.tls_active = true;
                self.state = State::EhloWait250;
                vec![
                    Action::Send(format!("EHLO {}\r\n", self.helo_name())),
                    Action::SetDeadline(REPLY_TIMEOUT_MS),
                ]
            }
            Event::TlsFailed => self.complete(Outcome::TlsInitialiseFailed),
            Event::Reply(reply) => self.on_reply(reply),
        }
    }

    fn on_reply(&mut self, reply: Reply) -> Vec<Action> {
        match self.state {
            State::Standby | State::Connecting | State::TlsHandshake => Vec::new(),
            State::Wait220 => {
                if reply.code != 220 {
                    return self.complete(Outcome::HeloAckInvalid);
                }
                self.state = State::EhloWait250;
                vec![
                    Action::Send(format!("EHLO {}\r\n", self.helo_name())),
                    Action::SetDeadline(REPLY_TIMEOUT_MS),
                ]
            }
            State::EhloWait250 => {
                if reply.code != 250 {
                    return self.complete(Outcome::HeloAckInvalid);
                }
                self.parse_caps(&reply);
                if self.caps.starttls && !self.tls_active {
                    self.state = State::StartTlsWait220;
                    return vec![
                        Action::Send("STARTTLS\r\n".to_string()),
                        Action::SetDeadline(REPLY_TIMEOUT_MS),
                    ];
                }
                self.begin_auth()
            }
            State::StartTlsWait220 => {
                if reply.code != 220 {
                    return self.complete(Outcome::StartTlsAckInvalid);
                }
                self.state = State::TlsHandshake;
                vec![Action::StartTls, Action::SetDeadline(REPLY_TIMEOUT_MS)]
            }
            State::CramWait334 => {
                if reply.code != 334 {
                    return self.complete(Outcome::AuthAckInvalid);
                }
                let challenge = reply
                    .lines
                    .first()
                    .and_then(|l| BASE64.decode(l.trim()).ok())
                    .unwrap_or_default();
                let digest = cram_md5_digest(self.session.password.as_bytes(), &challenge);
                let response = format!("{} {digest}", self.session.user_name);
                self.state = State::AuthWait235;
                vec![
                    Action::Send(format!("{}\r\n", BASE64.encode(response))),
                    Action::SetDeadline(REPLY_TIMEOUT_MS),
                ]
            }
            State::LoginNameWait334 => {
                if reply.code != 334 {
                    return self.complete(Outcome::UserNameAckInvalid);
                }
                self.state = State::LoginPasswordWait334;
                vec![
                    Action::Send(format!(
                        "{}\r\n",
                        BASE64.encode(&self.session.user_name)
                    )),
                    Action::SetDeadline(REPLY_TIMEOUT_MS),
                ]
            }
            State::LoginPasswordWait334 => {
                if reply.code != 334 {
                    return self.complete(Outcome::PasswordAckInvalid);
                }
                self.state = State::AuthWait235;
                vec![
                    Action::Send(format!("{}\r\n", BASE64.encode(&self.session.password))),
                    Action::SetDeadline(REPLY_TIMEOUT_MS),
                ]
            }
            State::AuthWait235 => {
                if reply.code != 235 {
                    return self.complete(Outcome::AuthorisationFailed);
                }
                self.begin_mail_from()
            }
            State::RcptToWait250 => {
                if reply.code != 250 && reply.code != 251 {
                    return self.complete(Outcome::RcptToAckInvalid);
                }
                match self.session.recipients.get(self.next_rcpt) {
                    Some(addr) => {
                        let line = format!("RCPT TO:<{addr}>\r\n");
                        self.next_rcpt += 1;
                        vec![Action::Send(line), Action::SetDeadline(REPLY_TIMEOUT_MS)]
                    }
                    None => {
                        self.state = State::DataWait354;
                        vec![
                            Action::Send("DATA\r\n".to_string()),
                            Action::SetDeadline(REPLY_TIMEOUT_MS),
                        ]
                    }
                }
            }
            State::DataWait354 => {
                if reply.code != 354 {
                    return self.complete(Outcome::DataAckInvalid);
                }
                let mut body = dot_stuff(&self.session.message);
                if !body.ends_with("\r\n") {
                    body.push_str("\r\n");
                }
                body.push_str(".\r\n");
                self.state = State::DataWait250;
                vec![Action::Send(body), Action::SetDeadline(DATA_ACK_TIMEOUT_MS)]
            }
            State::DataWait250 => {
                if reply.code != 250 {
                    return self.complete(Outcome::DataAckInvalid);
                }
                self.state = State::QuitWait221;
                vec![
                    Action::Send("QUIT\r\n".to_string()),
                    Action::SetDeadline(REPLY_TIMEOUT_MS),
                ]
            }
            // The message is already accepted; any reply (or none) is fine.
            State::QuitWait221 => self.complete(Outcome::Success),
        }
    }

    fn begin_auth(&mut self) -> Vec<Action> {
        if self.session.user_name.is_empty() {
            return self.begin_mail_from();
        }
        // preference order: CRAM-MD5, LOGIN, PLAIN
        if self.caps.auth_cram_md5 {
            self.state = State::CramWait334;
            vec![
                Action::Send("AUTH CRAM-MD5\r\n".to_string()),
                Action::SetDeadline(REPLY_TIMEOUT_MS),
            ]
        } else if self.caps.auth_login {
            self.state = State::LoginNameWait334;
            vec![
                Action::Send("AUTH LOGIN\r\n".to_string()),
                Action::SetDeadline(REPLY_TIMEOUT_MS),
            ]
        } else if self.caps.auth_plain {
            let token = format!(
                "\0{}\0{}",
                self.session.user_name, self.session.password
            );
            self.state = State::AuthWait235;
            vec![
                Action::Send(format!("AUTH PLAIN {}\r\n", BASE64.encode(token))),
                Action::SetDeadline(REPLY_TIMEOUT_MS),
            ]
        } else {
            self.begin_mail_from()
        }
    }

    fn begin_mail_from(&mut self) -> Vec<Action> {
        self.state = State::RcptToWait250;
        vec![
            Action::Send(format!("MAIL FROM:<{}>\r\n", self.session.from_address)),
            Action::SetDeadline(REPLY_TIMEOUT_MS),
        ]
    }

    fn parse_caps(&mut self, reply: &Reply) {
        for line in &reply.lines {
            let upper = line.to_ascii_uppercase();
            if upper == "STARTTLS" {
                self.caps.starttls = true;
            } else if let Some(mechs) = upper.strip_prefix("AUTH ") {
                for mech in mechs.split_whitespace() {
                    match mech {
                        "CRAM-MD5" => self.caps.auth_cram_md5 = true,
                        "LOGIN" => self.caps.auth_login = true,
                        "PLAIN" => self.caps.auth_plain = true,
                        _ => {}
                    }
                }
            }
        }
    }

    fn helo_name(&self) -> &str {
        if self.session.local_name.is_empty() {
            "localhost"
        } else {
            &self.session.local_name
        }
    }

    fn complete(&mut self, outcome: Outcome) -> Vec<Action> {
        self.state = State::Standby;
        vec![Action::Complete(outcome)]
    }
}

/// Double any leading dot per RFC 5321 §4.5.2.
pub fn dot_stuff(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for (idx, line) in message.split("\r\n").enumerate() {
        if idx > 0 {
            out.push_str("\r\n");
        }
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
    }
    out
}

/// HMAC-MD5 of the challenge keyed on the password, hex-encoded (RFC 2195).
pub fn cram_md5_digest(key: &[u8], challenge: &[u8]) -> String {
    const BLOCK: usize = 64;
    let mut key_block = [0u8; BLOCK];
    if key.len() > BLOCK {
        let digest = md5::compute(key);
        key_block[..16].copy_from_slice(&digest.0);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }
    let mut inner = Vec::with_capacity(BLOCK + challenge.len());
    let mut outer_key = [0u8; BLOCK];
    for i in 0..BLOCK {
        inner.push(key_block[i] ^ 0x36);
        outer_key[i] = key_block[i] ^ 0x5c;
    }
    inner.extend_from_slice(challenge);
    let inner_digest = md5::compute(&inner);
    let mut outer = Vec::with_capacity(BLOCK + 16);
    outer.extend_from_slice(&outer_key);
    outer.extend_from_slice(&inner_digest.0);
    let digest = md5::compute(&outer);
    digest.0.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session {
            local_name: "vigil.test".into(),
            user_name: "ops".into(),
            password: "secret".into(),
            from_address: "logger@example.com".into(),
            recipients: vec!["a@example.com".into(), "b@example.com".into()],
            message: "Subject: hi\r\n\r\nbody".into(),
        }
    }

    fn reply(code: u16, lines: &[&str]) -> Event {
        Event::Reply(Reply {
            code,
            lines: lines.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn sent(actions: &[Action]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    fn outcome(actions: &[Action]) -> Option<Outcome> {
        actions.iter().find_map(|a| match a {
            Action::Complete(o) => Some(*o),
            _ => None,
        })
    }

    #[test]
    fn happy_path_without_auth_advertised() {
        let mut m = Machine::new(session());
        m.start();
        m.step(Event::Connected);
        let a = m.step(reply(220, &["mail.example.com ready"]));
        assert_eq!(sent(&a), vec!["EHLO vigil.test\r\n"]);
        // no STARTTLS, no AUTH advertised: straight to MAIL FROM
        let a = m.step(reply(250, &["mail.example.com", "SIZE 35882577"]));
        assert_eq!(sent(&a), vec!["MAIL FROM:<logger@example.com>\r\n"]);
        let a = m.step(reply(250, &["ok"]));
        assert_eq!(sent(&a), vec!["RCPT TO:<a@example.com>\r\n"]);
        let a = m.step(reply(250, &["ok"]));
        assert_eq!(sent(&a), vec!["RCPT TO:<b@example.com>\r\n"]);
        let a = m.step(reply(250, &["ok"]));
        assert_eq!(sent(&a), vec!["DATA\r\n"]);
        let a = m.step(reply(354, &["go ahead"]));
        assert!(sent(&a)[0].ends_with("\r\n.\r\n"));
        let a = m.step(reply(250, &["queued"]));
        assert_eq!(sent(&a), vec!["QUIT\r\n"]);
        let a = m.step(reply(221, &["bye"]));
        assert_eq!(outcome(&a), Some(Outcome::Success));
        assert!(m.is_standby());
    }

    #[test]
    fn starttls_upgrade_then_second_ehlo() {
        let mut m = Machine::new(session());
        m.start();
        m.step(Event::Connected);
        m.step(reply(220, &["ready"]));
        let a = m.step(reply(250, &["mail.example.com", "STARTTLS"]));
        assert_eq!(sent(&a), vec!["STARTTLS\r\n"]);
        let a = m.step(reply(220, &["go ahead"]));
        assert!(a.contains(&Action::StartTls));
        let a = m.step(Event::TlsReady);
        assert_eq!(sent(&a), vec!["EHLO vigil.test\r\n"]);
        // second EHLO advertises auth now that TLS is up
        let a = m.step(reply(250, &["mail.example.com", "AUTH LOGIN PLAIN"]));
        assert_eq!(sent(&a), vec!["AUTH LOGIN\r\n"]);
    }

    #[test]
    fn cram_md5_preferred_over_login_and_plain() {
        let mut m = Machine::new(session());
        m.start();
        m.step(Event::Connected);
        m.step(reply(220, &["ready"]));
        let a = m.step(reply(250, &["x", "AUTH PLAIN LOGIN CRAM-MD5"]));
        assert_eq!(sent(&a), vec!["AUTH CRAM-MD5\r\n"]);
    }

    #[test]
    fn cram_md5_matches_rfc_2195_vector() {
        let digest = cram_md5_digest(
            b"tanstaaftanstaaf",
            b"<1896.697170952@postoffice.reston.mci.net>",
        );
        assert_eq!(digest, "b913a602c7eda7a495b4e6e7334d3890");
    }

    #[test]
    fn ehlo_rejection_maps_to_helo_ack_invalid() {
        let mut m = Machine::new(session());
        m.start();
        m.step(Event::Connected);
        m.step(reply(220, &["ready"]));
        let a = m.step(reply(421, &["service not available"]));
        assert_eq!(outcome(&a), Some(Outcome::HeloAckInvalid));
        assert!(m.is_standby());
    }

    #[test]
    fn recipient_rejection_maps_to_rcpt_outcome() {
        let mut m = Machine::new(session());
        m.start();
        m.step(Event::Connected);
        m.step(reply(220, &["ready"]));
        m.step(reply(250, &["x"]));
        m.step(reply(250, &["ok"])); // MAIL FROM ack → first RCPT
        let a = m.step(reply(550, &["no such user"]));
        assert_eq!(outcome(&a), Some(Outcome::RcptToAckInvalid));
    }

    #[test]
    fn timeout_surfaces_timed_out() {
        let mut m = Machine::new(session());
        m.start();
        m.step(Event::Connected);
        let a = m.step(Event::Timeout);
        assert_eq!(outcome(&a), Some(Outcome::TimedOut));
    }

    #[test]
    fn dot_stuffing_doubles_leading_dots() {
        let stuffed = dot_stuff("line\r\n.hidden\r\n..already\r\ntail");
        assert_eq!(stuffed, "line\r\n..hidden\r\n...already\r\ntail");
    }
}
