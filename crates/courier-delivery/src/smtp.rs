//! SMTP transport for outbound email.
//!
//! Wraps lettre's async SMTP client behind the [`MailTransport`] trait so
//! the delivery pipeline can run against a real relay in production and a
//! scripted mock in tests. Relay configuration comes from `SMTP_*`
//! environment variables.

use std::{fmt, str::FromStr, time::Duration};

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, Result};

/// Default SMTP submission port.
pub const DEFAULT_SMTP_PORT: u16 = 587;

/// Default per-send timeout in seconds.
pub const DEFAULT_SMTP_TIMEOUT_SECS: u64 = 30;

/// Outcome of an accepted send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReceipt {
    /// Reply code from the relay, when one was parseable.
    pub smtp_code: Option<u16>,
}

/// Abstraction over an outbound mail relay.
///
/// Implementations must be safe to share across worker tasks. Failures are
/// reported as [`DeliveryError`] values carrying the reply code and message
/// so the failure classifier can decide permanence.
#[async_trait]
pub trait MailTransport: Send + Sync + fmt::Debug {
    /// Sends one HTML email to `recipient`.
    async fn send(&self, recipient: &str, subject: &str, html: &str) -> Result<SendReceipt>;

    /// Stable key identifying the relay, used to scope circuit breakers.
    fn transport_key(&self) -> &str;
}

/// Connection security for the SMTP session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Plaintext connection upgraded via STARTTLS (port 587 convention).
    Starttls,
    /// TLS from the first byte (port 465 convention).
    Tls,
    /// No transport security. Local relays and test harnesses only.
    None,
}

impl FromStr for TlsMode {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "starttls" => Ok(Self::Starttls),
            "tls" => Ok(Self::Tls),
            "none" => Ok(Self::None),
            other => Err(DeliveryError::configuration(format!(
                "SMTP_TLS must be starttls, tls, or none (got {other:?})"
            ))),
        }
    }
}

/// SMTP relay settings.
///
/// `Default` targets a local development relay (MailHog style) with no
/// authentication and no transport security.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Relay hostname.
    pub host: String,
    /// Relay port.
    pub port: u16,
    /// Username for AUTH, if the relay requires it.
    pub username: Option<String>,
    /// Password for AUTH, if the relay requires it.
    pub password: Option<String>,
    /// Sender address placed in the From header.
    pub from: String,
    /// Connection security.
    pub tls: TlsMode,
    /// Per-send timeout covering connect, handshake, and data transfer.
    pub timeout: Duration,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1025,
            username: None,
            password: None,
            from: "courier@localhost".to_string(),
            tls: TlsMode::None,
            timeout: Duration::from_secs(DEFAULT_SMTP_TIMEOUT_SECS),
        }
    }
}

impl SmtpConfig {
    /// Loads relay settings from `SMTP_*` environment variables.
    ///
    /// `SMTP_HOST` and `SMTP_FROM` are required. `SMTP_PORT` defaults to
    /// 587, `SMTP_TLS` to `starttls`, and `SMTP_TIMEOUT_SECONDS` to 30.
    /// `SMTP_USER` and `SMTP_PASSWORD` must be set together or not at all.
    pub fn from_env() -> Result<Self> {
        let host = std::env::var("SMTP_HOST")
            .map_err(|_| DeliveryError::configuration("SMTP_HOST environment variable not set"))?;

        let port = match std::env::var("SMTP_PORT") {
            Ok(raw) => raw.parse().map_err(|_| {
                DeliveryError::configuration(format!("SMTP_PORT is not a valid port: {raw:?}"))
            })?,
            Err(_) => DEFAULT_SMTP_PORT,
        };

        let username = std::env::var("SMTP_USER").ok();
        let password = std::env::var("SMTP_PASSWORD").ok();

        let from = std::env::var("SMTP_FROM")
            .map_err(|_| DeliveryError::configuration("SMTP_FROM environment variable not set"))?;

        let tls = match std::env::var("SMTP_TLS") {
            Ok(raw) => raw.parse()?,
            Err(_) => TlsMode::Starttls,
        };

        let timeout = match std::env::var("SMTP_TIMEOUT_SECONDS") {
            Ok(raw) => {
                let secs: u64 = raw.parse().map_err(|_| {
                    DeliveryError::configuration(format!(
                        "SMTP_TIMEOUT_SECONDS is not a valid duration: {raw:?}"
                    ))
                })?;
                Duration::from_secs(secs)
            },
            Err(_) => Duration::from_secs(DEFAULT_SMTP_TIMEOUT_SECS),
        };

        let config = Self { host, port, username, password, from, tls, timeout };
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints that `from_env` and manual
    /// construction both need.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(DeliveryError::configuration("SMTP host must not be empty"));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(DeliveryError::configuration(
                "SMTP_USER and SMTP_PASSWORD must be set together",
            ));
        }
        Ok(())
    }
}

/// Production transport backed by lettre's async SMTP client.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    transport_key: String,
    timeout: Duration,
}

impl fmt::Debug for SmtpMailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpMailer")
            .field("transport_key", &self.transport_key)
            .field("from", &self.from.to_string())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SmtpMailer {
    /// Builds a mailer from explicit settings.
    pub fn new(config: SmtpConfig) -> Result<Self> {
        config.validate()?;

        let from: Mailbox = config.from.parse().map_err(|e| {
            DeliveryError::configuration(format!("invalid SMTP_FROM address {:?}: {e}", config.from))
        })?;

        let mut builder = match config.tls {
            TlsMode::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| {
                    DeliveryError::configuration(format!("cannot configure STARTTLS relay: {e}"))
                })?,
            TlsMode::Tls => {
                AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host).map_err(|e| {
                    DeliveryError::configuration(format!("cannot configure TLS relay: {e}"))
                })?
            },
            TlsMode::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host),
        };

        builder = builder.port(config.port).timeout(Some(config.timeout));

        if let (Some(username), Some(password)) = (config.username, config.password) {
            builder = builder.credentials(Credentials::new(username, password));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            transport_key: config.host,
            timeout: config.timeout,
        })
    }

    /// Builds a mailer from `SMTP_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(SmtpConfig::from_env()?)
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, recipient: &str, subject: &str, html: &str) -> Result<SendReceipt> {
        // An unparseable address can never be delivered; phrase the message
        // so the classifier treats it as permanent.
        let to: Mailbox = recipient.parse().map_err(|e| {
            DeliveryError::smtp_rejection(None, format!("invalid recipient {recipient:?}: {e}"))
        })?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html.to_string())
            .map_err(|e| DeliveryError::internal(format!("cannot build message: {e}")))?;

        let response = self
            .transport
            .send(message)
            .await
            .map_err(|e| map_transport_error(&e, self.timeout))?;

        Ok(SendReceipt { smtp_code: response.code().to_string().parse().ok() })
    }

    fn transport_key(&self) -> &str {
        &self.transport_key
    }
}

/// Maps a lettre transport error onto the delivery error taxonomy.
///
/// Timeouts and connection problems stay transient network errors. A reply
/// from the relay becomes an [`DeliveryError::SmtpRejection`] carrying the
/// numeric code so classification can decide permanence.
fn map_transport_error(
    error: &lettre::transport::smtp::Error,
    timeout: Duration,
) -> DeliveryError {
    if error.is_timeout() {
        return DeliveryError::timeout(timeout.as_secs());
    }
    if let Some(code) = error.status() {
        let numeric = code.to_string().parse::<u16>().ok();
        return DeliveryError::smtp_rejection(numeric, error.to_string());
    }
    DeliveryError::network(error.to_string())
}

/// Scripted in-memory transport for tests.
pub mod mock {
    use std::{collections::VecDeque, sync::Arc};

    use tokio::sync::Mutex;

    use super::{MailTransport, SendReceipt};
    use crate::error::{DeliveryError, Result};

    /// One captured outbound message.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SentMail {
        /// Recipient address as passed to `send`.
        pub recipient: String,
        /// Subject line.
        pub subject: String,
        /// Rendered HTML body.
        pub html: String,
    }

    /// Mail transport that records sends and replays scripted outcomes.
    ///
    /// Outcomes queue up front-to-back; once the script is exhausted every
    /// send succeeds with a 250 receipt.
    #[derive(Debug, Clone)]
    pub struct MockMailTransport {
        transport_key: String,
        outcomes: Arc<Mutex<VecDeque<std::result::Result<SendReceipt, DeliveryError>>>>,
        sent: Arc<Mutex<Vec<SentMail>>>,
    }

    impl MockMailTransport {
        /// Creates a transport keyed as `smtp.test.invalid`.
        #[must_use]
        pub fn new() -> Self {
            Self::with_key("smtp.test.invalid")
        }

        /// Creates a transport with an explicit breaker key.
        #[must_use]
        pub fn with_key(transport_key: impl Into<String>) -> Self {
            Self {
                transport_key: transport_key.into(),
                outcomes: Arc::new(Mutex::new(VecDeque::new())),
                sent: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Queues a successful send with the given reply code.
        pub async fn script_success(&self, smtp_code: u16) {
            self.outcomes
                .lock()
                .await
                .push_back(Ok(SendReceipt { smtp_code: Some(smtp_code) }));
        }

        /// Queues a failed send.
        pub async fn script_failure(&self, error: DeliveryError) {
            self.outcomes.lock().await.push_back(Err(error));
        }

        /// Queues `count` identical failures.
        pub async fn script_failures(&self, count: usize, error: DeliveryError) {
            let mut outcomes = self.outcomes.lock().await;
            for _ in 0..count {
                outcomes.push_back(Err(error.clone()));
            }
        }

        /// Returns every message handed to `send`, in order.
        pub async fn sent_mails(&self) -> Vec<SentMail> {
            self.sent.lock().await.clone()
        }

        /// Number of messages handed to `send`.
        pub async fn sent_count(&self) -> usize {
            self.sent.lock().await.len()
        }
    }

    impl Default for MockMailTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait::async_trait]
    impl MailTransport for MockMailTransport {
        async fn send(&self, recipient: &str, subject: &str, html: &str) -> Result<SendReceipt> {
            self.sent.lock().await.push(SentMail {
                recipient: recipient.to_string(),
                subject: subject.to_string(),
                html: html.to_string(),
            });

            match self.outcomes.lock().await.pop_front() {
                Some(outcome) => outcome,
                None => Ok(SendReceipt { smtp_code: Some(250) }),
            }
        }

        fn transport_key(&self) -> &str {
            &self.transport_key
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{classify, FailureClass};

    fn base_config() -> SmtpConfig {
        SmtpConfig {
            host: "smtp.example.com".to_string(),
            port: DEFAULT_SMTP_PORT,
            username: None,
            password: None,
            from: "Courier <noreply@example.com>".to_string(),
            tls: TlsMode::Starttls,
            timeout: Duration::from_secs(DEFAULT_SMTP_TIMEOUT_SECS),
        }
    }

    #[test]
    fn tls_mode_parses_case_insensitively() {
        assert_eq!("starttls".parse::<TlsMode>().unwrap(), TlsMode::Starttls);
        assert_eq!("TLS".parse::<TlsMode>().unwrap(), TlsMode::Tls);
        assert_eq!("None".parse::<TlsMode>().unwrap(), TlsMode::None);
        assert!("ssl".parse::<TlsMode>().is_err());
    }

    #[test]
    fn credentials_must_be_paired() {
        let mut config = base_config();
        config.username = Some("mailer".to_string());
        assert!(config.validate().is_err());

        config.password = Some("hunter2".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn mailer_rejects_unparseable_from_address() {
        let mut config = base_config();
        config.from = "not an address".to_string();

        let err = SmtpMailer::new(config).unwrap_err();
        assert!(matches!(err, DeliveryError::Configuration { .. }));
    }

    #[tokio::test]
    async fn mailer_builds_for_each_tls_mode() {
        for tls in [TlsMode::Starttls, TlsMode::Tls, TlsMode::None] {
            let mut config = base_config();
            config.tls = tls;
            config.username = Some("mailer".to_string());
            config.password = Some("hunter2".to_string());

            let mailer = SmtpMailer::new(config).unwrap();
            assert_eq!(mailer.transport_key(), "smtp.example.com");
        }
    }

    #[tokio::test]
    async fn mock_replays_scripted_outcomes_then_succeeds() {
        let transport = mock::MockMailTransport::new();
        transport
            .script_failure(DeliveryError::smtp_rejection(Some(451), "greylisted"))
            .await;

        let err = transport.send("a@example.com", "hi", "<p>hi</p>").await.unwrap_err();
        assert_eq!(err.smtp_code(), Some(451));

        let receipt = transport.send("a@example.com", "hi", "<p>hi</p>").await.unwrap();
        assert_eq!(receipt.smtp_code, Some(250));
        assert_eq!(transport.sent_count().await, 2);
    }

    #[tokio::test]
    async fn mock_records_message_content() {
        let transport = mock::MockMailTransport::new();
        transport.send("user@example.com", "Welcome", "<h1>Hello</h1>").await.unwrap();

        let sent = transport.sent_mails().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, "user@example.com");
        assert_eq!(sent[0].subject, "Welcome");
        assert_eq!(sent[0].html, "<h1>Hello</h1>");
    }

    #[test]
    fn invalid_recipient_message_classifies_as_permanent() {
        let err =
            DeliveryError::smtp_rejection(None, "invalid recipient \"nobody\": missing domain");
        let classification = classify(&err);
        assert_eq!(classification.class, FailureClass::Permanent);
    }
}
