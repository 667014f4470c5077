//! Keyed pseudonymization of student keys and college credentials.
//!
//! Every token is an HMAC-SHA256 over a canonical input under one process-wide
//! secret. Rotating the secret invalidates every existing mapping.

use std::fmt;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;

use crate::error::PulseError;
use crate::models::AnonymizedId;

type HmacSha256 = Hmac<Sha256>;

pub const MIN_SECRET_LEN: usize = 16;

const SECONDS_PER_DAY: i64 = 86_400;

/// Fields that could re-identify a person and never leave the system.
const IDENTITY_FIELDS: [&str; 8] = [
    "collegeId",
    "college_id",
    "studentId",
    "student_id",
    "email",
    "phone",
    "enrollmentYear",
    "department",
];

#[derive(Clone)]
pub struct Anonymizer {
    keyed: HmacSha256,
}

impl fmt::Debug for Anonymizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Anonymizer").finish_non_exhaustive()
    }
}

impl Anonymizer {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, PulseError> {
        let secret = secret.as_ref();
        if secret.len() < MIN_SECRET_LEN {
            return Err(PulseError::Config(format!(
                "anonymization secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        let keyed = HmacSha256::new_from_slice(secret)
            .map_err(|e| PulseError::Config(format!("invalid anonymization secret: {e}")))?;
        Ok(Self { keyed })
    }

    /// Map a natural student key to its stable pseudonym.
    ///
    /// Parts are trimmed and lowercased before hashing, so formatting noise in
    /// college exports does not fork a student into two identities.
    pub fn create_anonymized_id(
        &self,
        college_id: &str,
        enrollment_year: Option<&str>,
        department: Option<&str>,
    ) -> AnonymizedId {
        let canonical = [college_id, enrollment_year.unwrap_or(""), department.unwrap_or("")]
            .iter()
            .map(|part| part.trim().to_lowercase())
            .collect::<Vec<_>>()
            .join("|");

        let mut mac = self.keyed.clone();
        mac.update(b"student:");
        mac.update(canonical.as_bytes());
        let digest = hex::encode(mac.finalize().into_bytes());
        AnonymizedId::from_digest_hex(digest[..AnonymizedId::LEN].to_string())
    }

    pub fn create_college_token(&self, college_id: &str) -> String {
        self.create_college_token_at(college_id, Utc::now())
    }

    /// Token authenticating a college sync for the UTC day containing `at`.
    pub fn create_college_token_at(&self, college_id: &str, at: DateTime<Utc>) -> String {
        hex::encode(self.college_mac(college_id, at).finalize().into_bytes())
    }

    pub fn verify_college_token(&self, token: &str, college_id: &str) -> bool {
        self.verify_college_token_at(token, college_id, Utc::now())
    }

    /// Recompute and compare in constant time. Malformed tokens never verify.
    pub fn verify_college_token_at(&self, token: &str, college_id: &str, at: DateTime<Utc>) -> bool {
        let Ok(presented) = hex::decode(token.trim()) else {
            return false;
        };
        self.college_mac(college_id, at).verify_slice(&presented).is_ok()
    }

    fn college_mac(&self, college_id: &str, at: DateTime<Utc>) -> HmacSha256 {
        let day_bucket = at.timestamp().div_euclid(SECONDS_PER_DAY);
        let mut mac = self.keyed.clone();
        mac.update(b"college:");
        mac.update(college_id.trim().to_lowercase().as_bytes());
        mac.update(b"|");
        mac.update(day_bucket.to_string().as_bytes());
        mac
    }
}

/// Strip re-identifying fields from a record at any depth. Idempotent.
pub fn sanitize_for_api(record: Value) -> Value {
    match record {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| !IDENTITY_FIELDS.contains(&key.as_str()))
                .map(|(key, value)| (key, sanitize_for_api(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_for_api).collect()),
        other => other,
    }
}

/// Serialize an outward-facing value and pass it through [`sanitize_for_api`].
pub fn to_api_value<T: Serialize>(value: &T) -> Result<Value, serde_json::Error> {
    Ok(sanitize_for_api(serde_json::to_value(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn anonymizer() -> Anonymizer {
        Anonymizer::new("unit-test-secret-0123456789").unwrap()
    }

    #[test]
    fn anonymized_ids_are_deterministic() {
        let anon = anonymizer();
        let first = anon.create_anonymized_id("S-1042", Some("2026"), Some("Biology"));
        let second = anon.create_anonymized_id("S-1042", Some("2026"), Some("Biology"));
        assert_eq!(first, second);
        assert_eq!(first.as_str().len(), AnonymizedId::LEN);
        assert!(AnonymizedId::parse(first.as_str()).is_ok());
    }

    #[test]
    fn canonicalization_ignores_case_and_whitespace() {
        let anon = anonymizer();
        assert_eq!(
            anon.create_anonymized_id(" s-1042 ", Some("2026"), Some("BIOLOGY")),
            anon.create_anonymized_id("S-1042", Some("2026"), Some("biology"))
        );
    }

    #[test]
    fn distinct_keys_and_secrets_yield_distinct_ids() {
        let anon = anonymizer();
        let ids: std::collections::HashSet<_> = (0..500)
            .map(|i| anon.create_anonymized_id(&format!("S-{i}"), Some("2026"), None))
            .collect();
        assert_eq!(ids.len(), 500);

        let other = Anonymizer::new("another-secret-abcdefghijkl").unwrap();
        assert_ne!(
            anon.create_anonymized_id("S-1", None, None),
            other.create_anonymized_id("S-1", None, None)
        );
    }

    #[test]
    fn short_secrets_are_rejected() {
        assert!(matches!(Anonymizer::new("short"), Err(PulseError::Config(_))));
    }

    #[test]
    fn college_tokens_rotate_daily() {
        let anon = anonymizer();
        let morning = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        let token = anon.create_college_token_at("S-1042", morning);

        assert!(anon.verify_college_token_at(&token, "S-1042", morning + Duration::hours(10)));
        assert!(!anon.verify_college_token_at(&token, "S-1042", morning + Duration::days(1)));
        assert!(!anon.verify_college_token_at(&token, "S-9999", morning));
    }

    #[test]
    fn malformed_tokens_fail_verification() {
        let anon = anonymizer();
        assert!(!anon.verify_college_token("not-hex", "S-1042"));
        assert!(!anon.verify_college_token("", "S-1042"));
        assert!(!anon.verify_college_token("abcd", "S-1042"));
    }

    #[test]
    fn sanitize_strips_identity_fields_at_every_depth() {
        let record = json!({
            "anonymizedId": "0123456789abcdef0123456789abcdef",
            "collegeId": "S-1042",
            "email": "someone@college.edu",
            "nested": { "phone": "555-0100", "keep": 1 },
            "items": [{ "student_id": "x", "score": 0.4 }]
        });

        let sanitized = sanitize_for_api(record);
        assert_eq!(
            sanitized,
            json!({
                "anonymizedId": "0123456789abcdef0123456789abcdef",
                "nested": { "keep": 1 },
                "items": [{ "score": 0.4 }]
            })
        );
        assert_eq!(sanitize_for_api(sanitized.clone()), sanitized);
    }
}
