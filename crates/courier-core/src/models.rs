//! Core domain models and strongly-typed identifiers.
//!
//! Defines email jobs, the inbound wire payload, status updates and delivery
//! attempt records, along with newtype ID wrappers for compile-time type
//! safety and the database serialization impls the queue layer relies on.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CourierError;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Highest priority a job may carry; inbound values above this are rejected.
pub const MAX_PRIORITY: i32 = 10;

/// Strongly-typed job row identifier.
///
/// Wraps a UUID to prevent mixing with the caller-assigned job key. The row
/// ID is internal to the queue; the job key travels on the wire.
///
/// # Example
///
/// ```
/// use courier_core::models::JobId;
/// let job_id = JobId::new();
/// println!("claimed job: {}", job_id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for JobId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for JobId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Job lifecycle status.
///
/// Jobs progress through these states while queued and processed. The state
/// transitions are strictly controlled:
///
/// ```text
/// Pending -> Delivering -> Delivered
///         ^             -> Pending (transient failure, redelivery scheduled)
///         |             -> DeadLetter (permanent failure or retries exhausted)
///         └── visibility-timeout sweep (worker crashed mid-claim)
/// ```
///
/// There is no separate terminal `failed` state: both permanent failures and
/// exhausted retry budgets route to dead-letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued and waiting for a worker, or scheduled for redelivery.
    Pending,

    /// Claimed by a worker; prevents concurrent delivery of the same row.
    Delivering,

    /// Successfully delivered. Terminal.
    Delivered,

    /// Routed to the dead-letter destination. Terminal unless manually
    /// requeued.
    DeadLetter,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Delivering => write!(f, "delivering"),
            Self::Delivered => write!(f, "delivered"),
            Self::DeadLetter => write!(f, "dead_letter"),
        }
    }
}

impl sqlx::Type<PgDb> for JobStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "pending" => Ok(Self::Pending),
            "delivering" => Ok(Self::Delivering),
            "delivered" => Ok(Self::Delivered),
            "dead_letter" => Ok(Self::DeadLetter),
            _ => Err(format!("invalid job status: {s}").into()),
        }
    }
}

/// Inbound job payload as it arrives on the wire.
///
/// ```json
/// { "jobId": "order-1042", "recipient": "a@example.com",
///   "templateRef": "welcome", "params": {"name": "Ada"}, "priority": 5 }
/// ```
///
/// Must pass [`JobPayload::validate`] before entering the pipeline; anything
/// that fails is a `MalformedJob` and never reaches the retry machinery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    /// Caller-assigned unique job identifier (the idempotency key)
    pub job_id: String,
    /// Destination email address
    pub recipient: String,
    /// Template reference resolved by the template collaborator
    pub template_ref: String,
    /// Template parameters; must be a JSON object
    #[serde(default = "empty_params")]
    pub params: serde_json::Value,
    /// Priority 0..=10, higher first; defaults to 0
    #[serde(default)]
    pub priority: i32,
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl JobPayload {
    /// Validates the payload against the inbound contract.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::MalformedJob` naming the first violated rule.
    pub fn validate(&self) -> Result<(), CourierError> {
        if self.job_id.trim().is_empty() {
            return Err(CourierError::malformed("jobId must not be empty"));
        }
        validate_recipient(&self.recipient)?;
        if self.template_ref.trim().is_empty() {
            return Err(CourierError::malformed("templateRef must not be empty"));
        }
        if !self.params.is_object() {
            return Err(CourierError::malformed("params must be a JSON object"));
        }
        validate_priority(self.priority)?;
        Ok(())
    }
}

fn validate_recipient(recipient: &str) -> Result<(), CourierError> {
    let trimmed = recipient.trim();
    if trimmed.is_empty() {
        return Err(CourierError::malformed("recipient must not be empty"));
    }
    // Intentionally shallow: real mailbox verification is the transport's
    // job and surfaces as a classified bounce.
    match trimmed.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(CourierError::malformed(format!("recipient {trimmed:?} is not an address"))),
    }
}

fn validate_priority(priority: i32) -> Result<(), CourierError> {
    if (0..=MAX_PRIORITY).contains(&priority) {
        return Ok(());
    }
    Err(CourierError::malformed(format!("priority {priority} outside 0..={MAX_PRIORITY}")))
}

/// Queued email job.
///
/// One row per enqueued job. Immutable payload fields once enqueued; only
/// lifecycle columns change as the pipeline processes the job.
///
/// # Idempotency
///
/// `job_key` is the caller-assigned identifier. Enqueueing deduplicates on it
/// within a 24-hour window, and the delivery path consults the idempotency
/// store under the same key before any send.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EmailJob {
    /// Internal row identifier.
    pub id: JobId,

    /// Caller-assigned job identifier; the idempotency key.
    pub job_key: String,

    /// Destination address.
    pub recipient: String,

    /// Template reference for the template collaborator.
    pub template_ref: String,

    /// Template parameters (JSON object).
    pub params: sqlx::types::Json<serde_json::Value>,

    /// Claim priority, 0..=10, higher first.
    pub priority: i32,

    /// Current lifecycle status.
    pub status: JobStatus,

    /// Last classified failure reason; dead-lettered rows keep the reason
    /// that terminated them.
    pub last_error: Option<String>,

    /// When to redeliver next (set on transient failure).
    pub next_retry_at: Option<DateTime<Utc>>,

    /// When the current worker claimed the row; drives the visibility sweep.
    pub claimed_at: Option<DateTime<Utc>>,

    /// When the job was enqueued.
    pub received_at: DateTime<Utc>,

    /// When successfully delivered (terminal).
    pub delivered_at: Option<DateTime<Utc>>,

    /// When routed to dead-letter (terminal).
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl EmailJob {
    /// Builds a fresh pending job from a validated payload.
    pub fn from_payload(payload: JobPayload, received_at: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            job_key: payload.job_id,
            recipient: payload.recipient,
            template_ref: payload.template_ref,
            params: sqlx::types::Json(payload.params),
            priority: payload.priority,
            status: JobStatus::Pending,
            last_error: None,
            next_retry_at: None,
            claimed_at: None,
            received_at,
            delivered_at: None,
            dead_lettered_at: None,
        }
    }

    /// Template parameters as plain JSON.
    pub fn params(&self) -> &serde_json::Value {
        &self.params.0
    }

    /// Subject line for the outgoing mail.
    ///
    /// `params["subject"]` wins when present; otherwise the template
    /// reference doubles as the subject, matching the upstream producer
    /// contract.
    pub fn subject(&self) -> String {
        self.params
            .0
            .get("subject")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| self.template_ref.clone())
    }

    /// Re-validates a claimed row against the inbound contract.
    ///
    /// Rows can be inserted by external producers, so the worker checks
    /// again at claim time; violations dead-letter immediately as
    /// `MalformedJob`.
    pub fn validate_claimed(&self) -> Result<(), CourierError> {
        if self.job_key.trim().is_empty() {
            return Err(CourierError::malformed("job key must not be empty"));
        }
        validate_recipient(&self.recipient)?;
        if self.template_ref.trim().is_empty() {
            return Err(CourierError::malformed("template reference must not be empty"));
        }
        if !self.params.0.is_object() {
            return Err(CourierError::malformed("params must be a JSON object"));
        }
        validate_priority(self.priority)
    }
}

/// Terminal outcome carried by a status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    /// Send succeeded.
    Delivered,
    /// Send failed (this attempt); the reason says whether it bounced.
    Failed,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered => write!(f, "delivered"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl sqlx::Type<PgDb> for StatusKind {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for StatusKind {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid status kind: {s}").into()),
        }
    }
}

/// Status event row on the status topic.
///
/// The publisher inserts these fire-and-forget; the feedback consumer claims
/// unconsumed rows and marks them consumed.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StatusUpdate {
    /// Row identifier.
    pub id: Uuid,

    /// Caller-assigned job identifier the event refers to.
    pub notification_id: String,

    /// Outcome of the attempt.
    pub status: StatusKind,

    /// Classified failure reason, absent on delivered events.
    pub error: Option<String>,

    /// When the event was published.
    pub created_at: DateTime<Utc>,

    /// When the feedback consumer processed the event.
    pub consumed_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    /// Wire representation of this event.
    pub fn to_message(&self) -> StatusMessage {
        StatusMessage {
            notification_id: self.notification_id.clone(),
            status: self.status,
            timestamp: self.created_at,
            error: self.error.clone(),
        }
    }
}

/// Status event wire schema.
///
/// ```json
/// { "notificationId": "order-1042", "status": "failed",
///   "timestamp": "2025-03-01T10:15:00Z", "error": "5.1.1 User unknown" }
/// ```
///
/// `error` serializes as `null` on delivered events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    /// Caller-assigned job identifier
    pub notification_id: String,
    /// "delivered" or "failed"
    pub status: StatusKind,
    /// When the outcome was recorded, ISO 8601
    pub timestamp: DateTime<Utc>,
    /// Classified reason for failed events, null otherwise
    pub error: Option<String>,
}

/// Audit record of a single delivery attempt.
///
/// Written for every attempt including breaker-denied ones (which carry no
/// SMTP code because the transport was never contacted).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryAttempt {
    /// Attempt identifier.
    pub id: Uuid,

    /// Job row the attempt belongs to.
    pub job_id: JobId,

    /// 1-based attempt ordinal for the job key.
    pub attempt_number: i32,

    /// SMTP reply code when the transport answered.
    pub smtp_code: Option<i32>,

    /// Whether the send succeeded.
    pub succeeded: bool,

    /// Classified failure reason when it did not.
    pub error_message: Option<String>,

    /// When the attempt ran.
    pub attempted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(job_id: &str, recipient: &str, priority: i32) -> JobPayload {
        JobPayload {
            job_id: job_id.to_string(),
            recipient: recipient.to_string(),
            template_ref: "welcome".to_string(),
            params: serde_json::json!({"name": "Ada"}),
            priority,
        }
    }

    #[test]
    fn wire_payload_uses_camel_case_field_names() {
        let parsed: JobPayload = serde_json::from_str(
            r#"{"jobId":"j-1","recipient":"a@example.com","templateRef":"welcome",
                "params":{"name":"Ada"},"priority":5}"#,
        )
        .expect("payload parses");

        assert_eq!(parsed.job_id, "j-1");
        assert_eq!(parsed.template_ref, "welcome");
        assert_eq!(parsed.priority, 5);
    }

    #[test]
    fn missing_priority_and_params_take_defaults() {
        let parsed: JobPayload = serde_json::from_str(
            r#"{"jobId":"j-2","recipient":"a@example.com","templateRef":"welcome"}"#,
        )
        .expect("payload parses");

        assert_eq!(parsed.priority, 0);
        assert!(parsed.params.is_object());
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_payloads() {
        assert!(payload("", "a@example.com", 0).validate().is_err());
        assert!(payload("j-1", "", 0).validate().is_err());
        assert!(payload("j-1", "not-an-address", 0).validate().is_err());
        assert!(payload("j-1", "@example.com", 0).validate().is_err());
        assert!(payload("j-1", "a@", 0).validate().is_err());
        assert!(payload("j-1", "a@example.com", 11).validate().is_err());
        assert!(payload("j-1", "a@example.com", -1).validate().is_err());
        assert!(payload("j-1", "a@example.com", 10).validate().is_ok());
    }

    #[test]
    fn validation_rejects_non_object_params() {
        let mut p = payload("j-1", "a@example.com", 0);
        p.params = serde_json::json!(["not", "an", "object"]);
        assert!(p.validate().is_err());
    }

    #[test]
    fn subject_prefers_params_over_template_ref() {
        let mut p = payload("j-1", "a@example.com", 0);
        p.params = serde_json::json!({"subject": "Welcome aboard"});
        let job = EmailJob::from_payload(p, Utc::now());
        assert_eq!(job.subject(), "Welcome aboard");

        let plain = EmailJob::from_payload(payload("j-2", "a@example.com", 0), Utc::now());
        assert_eq!(plain.subject(), "welcome");
    }

    #[test]
    fn status_message_serializes_wire_schema() {
        let message = StatusMessage {
            notification_id: "j-1".to_string(),
            status: StatusKind::Failed,
            timestamp: DateTime::parse_from_rfc3339("2025-03-01T10:15:00Z")
                .expect("valid timestamp")
                .with_timezone(&Utc),
            error: Some("5.1.1 User unknown".to_string()),
        };

        let json = serde_json::to_value(&message).expect("serializes");
        assert_eq!(json["notificationId"], "j-1");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["timestamp"], "2025-03-01T10:15:00Z");
        assert_eq!(json["error"], "5.1.1 User unknown");
    }

    #[test]
    fn delivered_status_serializes_null_error() {
        let message = StatusMessage {
            notification_id: "j-1".to_string(),
            status: StatusKind::Delivered,
            timestamp: Utc::now(),
            error: None,
        };

        let json = serde_json::to_value(&message).expect("serializes");
        assert!(json["error"].is_null());
        assert_eq!(json["status"], "delivered");
    }

    #[test]
    fn claimed_row_revalidation_matches_payload_rules() {
        let mut job = EmailJob::from_payload(payload("j-1", "a@example.com", 3), Utc::now());
        assert!(job.validate_claimed().is_ok());

        job.recipient = "broken".to_string();
        assert!(job.validate_claimed().is_err());
    }
}
