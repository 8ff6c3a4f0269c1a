//! Email channel: SMTP via lettre for outbound, IMAP polling for inbound.
//!
//! All mail I/O is blocking and runs on `spawn_blocking`.

use std::collections::{HashSet, VecDeque};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::channels::channel::{
    Channel, ChannelKind, ChannelState, ChannelStatus, IncomingMessage, RestartOutcome,
    SendOptions,
};
use crate::config::ChannelConfig;
use crate::error::{ChannelError, ConfigError};

/// Subject used when the message does not carry one.
const DEFAULT_SUBJECT: &str = "Check-in";

/// Message ids remembered for de-duplication before the oldest are evicted.
const SEEN_CAPACITY: usize = 1024;

// ── Settings ────────────────────────────────────────────────────────

/// Connection settings read from the channel's `settings` map.
#[derive(Debug, Clone)]
pub struct EmailSettings {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub allowed_senders: Vec<String>,
}

impl EmailSettings {
    /// Required: `smtp_host`, `username`, `password`. `imap_host` defaults to
    /// the SMTP host with `smtp` replaced by `imap`.
    pub fn from_config(config: &ChannelConfig) -> Result<Self, ConfigError> {
        let smtp_host = config.require_str("smtp_host")?.to_string();
        let username = config.require_str("username")?.to_string();
        let password = SecretString::from(config.require_str("password")?.to_string());
        let imap_host = config
            .setting_str("imap_host")
            .map(str::to_string)
            .unwrap_or_else(|| smtp_host.replace("smtp", "imap"));
        let from_address = config
            .setting_str("from_address")
            .map(str::to_string)
            .unwrap_or_else(|| username.clone());

        Ok(Self {
            imap_host,
            imap_port: port(config, "imap_port", 993)?,
            smtp_host,
            smtp_port: port(config, "smtp_port", 587)?,
            username,
            password,
            from_address,
            allowed_senders: config.setting_list("allowed_senders"),
        })
    }
}

fn port(config: &ChannelConfig, key: &str, default: u16) -> Result<u16, ConfigError> {
    u16::try_from(config.setting_u64(key, u64::from(default))).map_err(|_| {
        ConfigError::InvalidValue {
            key: format!("{}.settings.{key}", config.name),
            message: "port out of range".into(),
        }
    })
}

// ── Channel ─────────────────────────────────────────────────────────

/// Bounded set of recently delivered message ids, oldest evicted first.
#[derive(Debug)]
struct SeenIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: String) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.order.clear();
    }
}

/// Email channel: SMTP outbound, IMAP inbound.
pub struct EmailChannel {
    config: ChannelConfig,
    state: ChannelState,
    settings: Mutex<Option<Arc<EmailSettings>>>,
    seen_messages: Mutex<SeenIds>,
}

impl EmailChannel {
    /// Settings are validated in `initialize`, so construction never fails.
    pub fn from_config(config: &ChannelConfig) -> Result<Self, ChannelError> {
        Ok(Self {
            config: config.clone(),
            state: ChannelState::new(&config.name),
            settings: Mutex::new(None),
            seen_messages: Mutex::new(SeenIds::new(SEEN_CAPACITY)),
        })
    }

    fn settings(&self) -> Option<Arc<EmailSettings>> {
        self.settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Run blocking mail work off the async executor, bounded by the channel timeout.
    async fn blocking<T, F>(&self, op: F) -> Result<T, ChannelError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, ChannelError> + Send + 'static,
    {
        let name = self.config.name.clone();
        let timeout = self.config.timeout;
        match tokio::time::timeout(timeout, tokio::task::spawn_blocking(op)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ChannelError::Panicked {
                name,
                reason: e.to_string(),
            }),
            Err(_) => Err(ChannelError::Timeout { name, timeout }),
        }
    }

    async fn connect(&self) -> Result<Arc<EmailSettings>, ChannelError> {
        let settings =
            EmailSettings::from_config(&self.config).map_err(|e| ChannelError::Misconfigured {
                name: self.config.name.clone(),
                reason: e.to_string(),
            })?;
        let settings = Arc::new(settings);

        let probe = Arc::clone(&settings);
        let name = self.config.name.clone();
        let connected = self
            .blocking(move || {
                smtp_transport(&probe, &name)?
                    .test_connection()
                    .map_err(|e| ChannelError::StartupFailed {
                        name,
                        reason: format!("SMTP connection test failed: {e}"),
                    })
            })
            .await?;

        if !connected {
            return Err(ChannelError::StartupFailed {
                name: self.config.name.clone(),
                reason: format!("SMTP server {} refused the connection", settings.smtp_host),
            });
        }
        Ok(settings)
    }

    async fn fetch(&self, settings: Arc<EmailSettings>) -> Result<Vec<IncomingMessage>, ChannelError> {
        let name = self.config.name.clone();
        let fetched = self
            .blocking(move || {
                fetch_unseen_imap(&settings).map_err(|e| ChannelError::ReceiveFailed {
                    name,
                    reason: e.to_string(),
                })
            })
            .await?;

        let allowed = self
            .settings()
            .map(|s| s.allowed_senders.clone())
            .unwrap_or_default();
        let mut seen = self.seen_messages.lock().unwrap_or_else(|e| e.into_inner());
        let mut messages = Vec::new();
        for email in fetched {
            if seen.contains(&email.message_id) {
                continue;
            }
            if !is_sender_allowed(&allowed, &email.sender) {
                tracing::warn!(channel = %self.config.name, sender = %email.sender, "Blocked email from sender");
                continue;
            }
            seen.insert(email.message_id.clone());

            let mut incoming = IncomingMessage::new(&self.config.name, &email.sender, email.body)
                .with_metadata(serde_json::json!({
                    "reply_to": email.sender,
                    "subject": email.subject,
                    "message_id": email.message_id,
                }));
            incoming.user_name = Some(email.sender);
            incoming.received_at = email.received_at;
            messages.push(incoming);
        }
        tracing::debug!(
            channel = %self.config.name,
            new = messages.len(),
            remembered = seen.len(),
            "Email inbox polled"
        );
        Ok(messages)
    }
}

#[async_trait]
impl Channel for EmailChannel {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Sync
    }

    fn status(&self) -> ChannelStatus {
        self.state.status()
    }

    fn last_error(&self) -> Option<String> {
        self.state.last_error()
    }

    async fn initialize(&self) -> bool {
        if !self.state.transition_to(ChannelStatus::Initializing) {
            return false;
        }
        match self.connect().await {
            Ok(settings) => {
                tracing::info!(
                    channel = %self.config.name,
                    smtp = %settings.smtp_host,
                    imap = %settings.imap_host,
                    "Email channel ready"
                );
                *self.settings.lock().unwrap_or_else(|e| e.into_inner()) = Some(settings);
                self.state.transition_to(ChannelStatus::Ready)
            }
            Err(e) => {
                self.state.fail(&e);
                false
            }
        }
    }

    async fn shutdown(&self) -> bool {
        tracing::info!(channel = %self.config.name, "Email channel shutting down");
        self.settings.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.seen_messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.state.transition_to(ChannelStatus::Stopped)
    }

    async fn send_message(&self, recipient: &str, message: &str, options: &SendOptions) -> bool {
        let Some(settings) = self.settings().filter(|_| self.state.is_ready()) else {
            self.state.record_error(&self.state.not_ready());
            return false;
        };

        let (subject, body) = match &options.subject {
            Some(subject) => (subject.clone(), message.to_string()),
            None => {
                let (subject, body) = extract_subject(message);
                (subject, body.to_string())
            }
        };
        let to = recipient.to_string();
        let name = self.config.name.clone();

        match self
            .blocking(move || send_email(&settings, &name, &to, &subject, &body))
            .await
        {
            Ok(()) => {
                tracing::info!(channel = %self.config.name, recipient, "Email sent");
                true
            }
            Err(e) => {
                self.state.record_error(&e);
                false
            }
        }
    }

    async fn receive_messages(&self) -> Vec<IncomingMessage> {
        let Some(settings) = self.settings().filter(|_| self.state.is_ready()) else {
            return Vec::new();
        };
        match self.fetch(settings).await {
            Ok(messages) => messages,
            Err(e) => {
                self.state.record_error(&e);
                Vec::new()
            }
        }
    }

    async fn health_check(&self) -> bool {
        let Some(settings) = self.settings() else {
            return false;
        };
        let host = settings.smtp_host.clone();
        let port = settings.smtp_port;
        let probe_timeout = self.config.timeout;
        let reachable = self
            .blocking(move || Ok(tcp_reachable(&host, port, probe_timeout)))
            .await
            .unwrap_or(false);

        self.state.record_health(reachable);
        reachable && self.state.is_ready()
    }

    async fn restart(&self) -> RestartOutcome {
        if self.initialize().await {
            RestartOutcome::Restarted
        } else {
            RestartOutcome::Failed
        }
    }
}

// ── SMTP ────────────────────────────────────────────────────────────

fn smtp_transport(settings: &EmailSettings, name: &str) -> Result<SmtpTransport, ChannelError> {
    let creds = Credentials::new(
        settings.username.clone(),
        settings.password.expose_secret().to_string(),
    );
    Ok(SmtpTransport::starttls_relay(&settings.smtp_host)
        .map_err(|e| ChannelError::Misconfigured {
            name: name.to_string(),
            reason: format!("SMTP relay error: {e}"),
        })?
        .port(settings.smtp_port)
        .credentials(creds)
        .build())
}

fn send_email(
    settings: &EmailSettings,
    name: &str,
    to: &str,
    subject: &str,
    body: &str,
) -> Result<(), ChannelError> {
    let send_failed = |reason: String| ChannelError::SendFailed {
        name: name.to_string(),
        reason,
    };

    let email = Message::builder()
        .from(
            settings
                .from_address
                .parse()
                .map_err(|e| send_failed(format!("Invalid from address: {e}")))?,
        )
        .to(to
            .parse()
            .map_err(|e| send_failed(format!("Invalid to address: {e}")))?)
        .subject(subject)
        .body(body.to_string())
        .map_err(|e| send_failed(format!("Failed to build email: {e}")))?;

    smtp_transport(settings, name)?
        .send(&email)
        .map_err(|e| send_failed(format!("SMTP send failed: {e}")))?;
    Ok(())
}

fn tcp_reachable(host: &str, port: u16, timeout: Duration) -> bool {
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, timeout).is_ok())
}

// ── Helpers (public for testing) ────────────────────────────────────

/// Check a sender against the allowlist.
///
/// Empty list denies everyone; `*` allows everyone; `@domain` or `domain`
/// matches a whole domain; a full address matches exactly (case-insensitive).
pub fn is_sender_allowed(allowed: &[String], email: &str) -> bool {
    let email = email.to_lowercase();
    allowed.iter().any(|entry| {
        let entry = entry.to_lowercase();
        if entry == "*" {
            true
        } else if let Some(domain) = entry.strip_prefix('@') {
            email.ends_with(&format!("@{domain}"))
        } else if entry.contains('@') {
            entry == email
        } else {
            email.ends_with(&format!("@{entry}"))
        }
    })
}

/// Strip HTML tags and collapse whitespace.
pub fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut depth = 0usize;
    for ch in html.chars() {
        match ch {
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            _ if depth == 0 => text.push(ch),
            _ => {}
        }
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split a leading `Subject: ...` line off outgoing content.
pub fn extract_subject(content: &str) -> (String, &str) {
    if let Some(rest) = content.strip_prefix("Subject: ")
        && let Some((subject, body)) = rest.split_once('\n')
    {
        return (subject.trim().to_string(), body.trim_start());
    }
    (DEFAULT_SUBJECT.to_string(), content)
}

fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map_or_else(|| "unknown".to_string(), str::to_string)
}

fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.to_string();
        }
    }
    "(no readable content)".to_string()
}

// ── IMAP ────────────────────────────────────────────────────────────

/// One unseen message pulled from the inbox.
#[derive(Debug, Clone)]
struct FetchedEmail {
    message_id: String,
    sender: String,
    subject: String,
    body: String,
    received_at: DateTime<Utc>,
}

type ImapError = Box<dyn std::error::Error + Send + Sync>;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Minimal tagged-command IMAP session over TLS.
struct ImapSession {
    tls: TlsStream,
    next_tag: u32,
}

impl ImapSession {
    fn connect(settings: &EmailSettings) -> Result<Self, ImapError> {
        let tcp = TcpStream::connect((settings.imap_host.as_str(), settings.imap_port))?;
        tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(settings.imap_host.clone())?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)?;

        let mut session = Self {
            tls: rustls::StreamOwned::new(conn, tcp),
            next_tag: 1,
        };
        let _greeting = session.read_line()?;
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, ImapError> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            if self.tls.read(&mut byte)? == 0 {
                return Err("IMAP connection closed".into());
            }
            buf.push(byte[0]);
            if buf.ends_with(b"\r\n") {
                return Ok(String::from_utf8_lossy(&buf).into_owned());
            }
        }
    }

    fn command(&mut self, cmd: &str) -> Result<Vec<String>, ImapError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;
        self.tls.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        self.tls.flush()?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(&tag);
            lines.push(line);
            if done {
                return Ok(lines);
            }
        }
    }
}

fn fetch_unseen_imap(settings: &EmailSettings) -> Result<Vec<FetchedEmail>, ImapError> {
    let mut session = ImapSession::connect(settings)?;

    let login = session.command(&format!(
        "LOGIN \"{}\" \"{}\"",
        settings.username,
        settings.password.expose_secret()
    ))?;
    if !login.last().is_some_and(|l| l.contains("OK")) {
        return Err("IMAP login failed".into());
    }

    session.command("SELECT \"INBOX\"")?;
    let search = session.command("SEARCH UNSEEN")?;
    let ids: Vec<String> = search
        .iter()
        .filter_map(|line| line.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().map(str::to_string))
        .collect();

    let mut results = Vec::with_capacity(ids.len());
    for id in &ids {
        let response = session.command(&format!("FETCH {id} RFC822"))?;
        // Drop the untagged header line and the tagged completion line.
        let raw: String = response
            .iter()
            .skip(1)
            .take(response.len().saturating_sub(2))
            .cloned()
            .collect();

        if let Some(parsed) = MessageParser::default().parse(raw.as_bytes()) {
            let subject = parsed.subject().unwrap_or("(no subject)").to_string();
            let body = format!("Subject: {subject}\n\n{}", extract_text(&parsed));
            let received_at = parsed
                .date()
                .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
                .unwrap_or_else(Utc::now);
            results.push(FetchedEmail {
                message_id: parsed
                    .message_id()
                    .map_or_else(|| format!("gen-{}", Uuid::new_v4()), str::to_string),
                sender: extract_sender(&parsed),
                subject,
                body,
                received_at,
            });
        }

        let _ = session.command(&format!("STORE {id} +FLAGS (\\Seen)"));
    }

    let _ = session.command("LOGOUT");
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email_config() -> ChannelConfig {
        ChannelConfig::new("email")
            .with_setting("smtp_host", serde_json::json!("smtp.test.com"))
            .with_setting("username", serde_json::json!("user@test.com"))
            .with_setting("password", serde_json::json!("pass"))
            .with_setting("allowed_senders", serde_json::json!(["@trusted.com"]))
    }

    // ── Settings ────────────────────────────────────────────────────

    #[test]
    fn settings_defaults() {
        let settings = EmailSettings::from_config(&email_config()).unwrap();
        assert_eq!(settings.imap_host, "imap.test.com");
        assert_eq!(settings.imap_port, 993);
        assert_eq!(settings.smtp_port, 587);
        assert_eq!(settings.from_address, "user@test.com");
        assert_eq!(settings.allowed_senders, vec!["@trusted.com"]);
    }

    #[test]
    fn settings_missing_smtp_host() {
        let config = ChannelConfig::new("email");
        assert!(EmailSettings::from_config(&config).is_err());
    }

    #[test]
    fn settings_port_out_of_range() {
        let config = email_config().with_setting("smtp_port", serde_json::json!(70000));
        assert!(EmailSettings::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn initialize_with_missing_settings_fails_into_error() {
        let channel = EmailChannel::from_config(&ChannelConfig::new("email")).unwrap();
        assert!(!channel.initialize().await);
        assert_eq!(channel.status(), ChannelStatus::Error);
        assert!(channel.last_error().unwrap().contains("smtp_host"));
    }

    #[tokio::test]
    async fn send_before_initialize_returns_false() {
        let channel = EmailChannel::from_config(&email_config()).unwrap();
        assert!(
            !channel
                .send_message("a@b.com", "hello", &SendOptions::default())
                .await
        );
        assert!(channel.last_error().unwrap().contains("not ready"));
        assert!(channel.receive_messages().await.is_empty());
        assert!(!channel.health_check().await);
    }

    #[tokio::test]
    async fn shutdown_is_terminal() {
        let channel = EmailChannel::from_config(&email_config()).unwrap();
        assert!(channel.shutdown().await);
        assert_eq!(channel.status(), ChannelStatus::Stopped);
        assert!(!channel.initialize().await);
    }

    #[test]
    fn seen_ids_evict_oldest_past_capacity() {
        let mut seen = SeenIds::new(2);
        seen.insert("a".into());
        seen.insert("b".into());
        seen.insert("b".into());
        assert_eq!(seen.len(), 2);

        seen.insert("c".into());
        assert_eq!(seen.len(), 2);
        assert!(!seen.contains("a"));
        assert!(seen.contains("b"));
        assert!(seen.contains("c"));

        seen.clear();
        assert_eq!(seen.len(), 0);
        assert!(!seen.contains("c"));
    }

    #[tokio::test]
    async fn shutdown_forgets_seen_ids() {
        let channel = EmailChannel::from_config(&email_config()).unwrap();
        channel
            .seen_messages
            .lock()
            .unwrap()
            .insert("<id@test.com>".into());
        assert!(channel.shutdown().await);
        assert_eq!(channel.seen_messages.lock().unwrap().len(), 0);
    }

    #[test]
    fn email_channel_is_sync_kind() {
        let channel = EmailChannel::from_config(&email_config()).unwrap();
        assert_eq!(channel.kind(), ChannelKind::Sync);
        assert_eq!(channel.name(), "email");
    }

    // ── Sender allowlist ────────────────────────────────────────────

    #[test]
    fn allowlist_empty_denies_all() {
        assert!(!is_sender_allowed(&[], "anyone@example.com"));
    }

    #[test]
    fn allowlist_wildcard_allows_all() {
        let allowed = vec!["*".to_string()];
        assert!(is_sender_allowed(&allowed, "anyone@example.com"));
    }

    #[test]
    fn allowlist_exact_and_domain_entries() {
        let allowed = vec![
            "admin@company.com".to_string(),
            "@trusted.org".to_string(),
            "partner.io".to_string(),
        ];
        assert!(is_sender_allowed(&allowed, "Admin@Company.com"));
        assert!(is_sender_allowed(&allowed, "anyone@trusted.org"));
        assert!(is_sender_allowed(&allowed, "ceo@partner.io"));
        assert!(!is_sender_allowed(&allowed, "random@evil.com"));
        assert!(!is_sender_allowed(&allowed, "x@nottrusted.org"));
    }

    // ── Content helpers ─────────────────────────────────────────────

    #[test]
    fn strip_html_nested_tags() {
        assert_eq!(
            strip_html("<div><b>Bold</b>  and <i>italic</i></div>"),
            "Bold and italic"
        );
        assert_eq!(strip_html("plain"), "plain");
    }

    #[test]
    fn extract_subject_present() {
        let (subject, body) = extract_subject("Subject: Morning check-in\n\nHow did you sleep?");
        assert_eq!(subject, "Morning check-in");
        assert_eq!(body, "How did you sleep?");
    }

    #[test]
    fn extract_subject_missing_or_single_line() {
        assert_eq!(extract_subject("Just text"), (DEFAULT_SUBJECT.to_string(), "Just text"));
        assert_eq!(
            extract_subject("Subject: Only"),
            (DEFAULT_SUBJECT.to_string(), "Subject: Only")
        );
    }
}
