//! Failure classification for delivery errors.
//!
//! Maps a raw transport error into permanent (bounce) versus transient and
//! derives the reason string carried on status events and dead letter rows.
//! Classification decides whether the retry path is taken at all, so the
//! rules here are deliberately small and total: anything not provably
//! permanent is transient.

use crate::error::DeliveryError;

/// SMTP reply codes that always indicate a permanent failure.
pub const PERMANENT_CODES: [u16; 5] = [550, 551, 552, 553, 554];

/// Message fragments that indicate a permanent failure regardless of code.
///
/// Matched case-insensitively against the raw server message. Covers relays
/// that report hard bounces with a non-5xx envelope or no code at all.
pub const PERMANENT_PHRASES: [&str; 4] =
    ["user unknown", "mailbox unavailable", "invalid recipient", "no such user"];

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Hard bounce. Never retried, dead lettered on first failure.
    Permanent,
    /// Possibly recoverable. Eligible for the retry path.
    Transient,
}

/// Outcome of classifying one delivery error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Permanent or transient.
    pub class: FailureClass,
    /// Human-readable reason recorded on status events and dead letters.
    pub reason: String,
}

impl Classification {
    /// Returns true for hard bounces.
    pub fn is_permanent(&self) -> bool {
        self.class == FailureClass::Permanent
    }
}

/// Classifies a raw SMTP outcome from its reply code and message text.
///
/// Permanent iff the code is one of [`PERMANENT_CODES`] or the message
/// contains one of [`PERMANENT_PHRASES`] (case-insensitive). The reason is
/// the raw message when present, otherwise `SMTP_<code>`, otherwise
/// `SMTP_unknown`.
pub fn classify_smtp(code: Option<u16>, message: &str) -> Classification {
    let permanent = code.is_some_and(|c| PERMANENT_CODES.contains(&c))
        || matches_permanent_phrase(message);

    let reason = if message.is_empty() {
        match code {
            Some(c) => format!("SMTP_{c}"),
            None => "SMTP_unknown".to_string(),
        }
    } else {
        message.to_string()
    };

    let class = if permanent { FailureClass::Permanent } else { FailureClass::Transient };

    Classification { class, reason }
}

/// Classifies any delivery error.
///
/// SMTP rejections go through the code and phrase rules. Every other error
/// kind is transient by construction: breaker denials, timeouts, template
/// and database trouble all deserve another attempt. The error display text
/// becomes the reason so unclassified failures stay diagnosable.
pub fn classify(error: &DeliveryError) -> Classification {
    match error {
        DeliveryError::SmtpRejection { code, message } => classify_smtp(*code, message),
        other => classify_smtp(None, &other.to_string()),
    }
}

/// Checks the message against the permanent phrase list, case-insensitive.
pub fn matches_permanent_phrase(message: &str) -> bool {
    let lowered = message.to_lowercase();
    PERMANENT_PHRASES.iter().any(|phrase| lowered.contains(phrase))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_codes_classified_as_bounce() {
        for code in PERMANENT_CODES {
            let result = classify_smtp(Some(code), "delivery refused");
            assert!(result.is_permanent(), "code {code} must be permanent");
        }
    }

    #[test]
    fn neighboring_codes_stay_transient() {
        assert!(!classify_smtp(Some(549), "odd reply").is_permanent());
        assert!(!classify_smtp(Some(555), "syntax error").is_permanent());
        assert!(!classify_smtp(Some(421), "service not available").is_permanent());
    }

    #[test]
    fn user_unknown_with_550_is_permanent() {
        let result = classify_smtp(Some(550), "5.1.1 User unknown");
        assert!(result.is_permanent());
        assert_eq!(result.reason, "5.1.1 User unknown");
    }

    #[test]
    fn phrases_match_case_insensitively_without_code() {
        for message in
            ["Mailbox Unavailable", "NO SUCH USER here", "invalid Recipient", "user UNKNOWN"]
        {
            let result = classify_smtp(None, message);
            assert!(result.is_permanent(), "{message:?} must be permanent");
        }
    }

    #[test]
    fn timeout_without_code_is_transient() {
        let result = classify(&DeliveryError::timeout(30));
        assert!(!result.is_permanent());
        assert_eq!(result.reason, "delivery timeout after 30s");
    }

    #[test]
    fn reason_falls_back_to_code_then_unknown() {
        assert_eq!(classify_smtp(Some(550), "").reason, "SMTP_550");
        assert_eq!(classify_smtp(None, "").reason, "SMTP_unknown");
        assert_eq!(classify_smtp(Some(450), "greylisted").reason, "greylisted");
    }

    #[test]
    fn breaker_denial_classifies_transient() {
        let result = classify(&DeliveryError::circuit_open("smtp.example.com"));
        assert!(!result.is_permanent());
    }

    #[test]
    fn rejection_with_bounce_phrase_but_transient_code_is_permanent() {
        let result = classify_smtp(Some(450), "recipient mailbox unavailable, closing");
        assert!(result.is_permanent());
    }
}
