use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a closed set of wire values with `as_str`, `Display` and `FromStr`.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($wire => Ok($name::$variant),)+
                    other => Err(format!("unknown {} value: {other}", stringify!($name))),
                }
            }
        }
    };
}

wire_enum!(
    /// Meal slot of a dining observation, in serving order.
    MealType {
        Breakfast => "breakfast",
        Lunch => "lunch",
        Dinner => "dinner",
    }
);

wire_enum!(
    /// Why an analysis reached its verdict.
    AnalysisReason {
        None => "none",
        StudentOptedOut => "student_opted_out",
        InsufficientData => "insufficient_data",
        UnknownStudent => "unknown_student",
        AnalysisUnavailable => "analysis_unavailable",
        MissedConsecutive => "missed_consecutive",
        FrequencyDrop => "frequency_drop",
        PatternChange => "pattern_change",
    }
);

wire_enum!(
    /// The four independent signal analyzers.
    Signal {
        ConsecutiveMisses => "consecutive_misses",
        FrequencyDrop => "frequency_drop",
        PatternChange => "pattern_change",
        MealTypeShift => "meal_type_shift",
    }
);

wire_enum!(
    CheckInType {
        MealConcern => "meal_concern",
        WellnessCheck => "wellness_check",
        SupportOffer => "support_offer",
    }
);

wire_enum!(
    /// Message framing. Higher concern maps to gentler wording.
    Tone {
        Gentle => "gentle",
        Supportive => "supportive",
        Encouraging => "encouraging",
    }
);

wire_enum!(
    Priority {
        High => "high",
        Medium => "medium",
        Low => "low",
    }
);

wire_enum!(
    DeliveryStatus {
        Pending => "pending",
        Sent => "sent",
        Delivered => "delivered",
        Failed => "failed",
    }
);

wire_enum!(
    DeliveryMethod {
        Push => "push",
        Email => "email",
        Sms => "sms",
        InApp => "in_app",
    }
);

wire_enum!(
    ResponseType {
        Acknowledged => "acknowledged",
        NeedsHelp => "needs_help",
        DoingFine => "doing_fine",
        NoResponse => "no_response",
    }
);

wire_enum!(
    CooldownReason {
        Standard => "standard",
        Escalation => "escalation",
        DoingFineBackoff => "doing_fine_backoff",
    }
);

wire_enum!(
    /// Why a check-in was not sent.
    SkipReason {
        NoAnomaly => "no_anomaly",
        StudentOptedOut => "student_opted_out",
        UnknownStudent => "unknown_student",
        CooldownActive => "cooldown_active",
        StoreUnavailable => "store_unavailable",
    }
);

impl MealType {
    pub const ALL: [MealType; 3] = [MealType::Breakfast, MealType::Lunch, MealType::Dinner];

    /// Position within a day, used to order observations.
    pub fn slot(&self) -> usize {
        match self {
            MealType::Breakfast => 0,
            MealType::Lunch => 1,
            MealType::Dinner => 2,
        }
    }

    /// Canonical serving time, used when a college system omits the timestamp.
    pub fn serving_time(&self) -> NaiveTime {
        let (hour, minute) = match self {
            MealType::Breakfast => (8, 0),
            MealType::Lunch => (12, 30),
            MealType::Dinner => (18, 30),
        };
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
    }
}

impl DeliveryStatus {
    /// Statuses whose cooldown blocks further check-ins.
    pub fn holds_cooldown(&self) -> bool {
        !matches!(self, DeliveryStatus::Failed)
    }
}

/// Opaque pseudonym of a student: 32 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnonymizedId(String);

impl AnonymizedId {
    pub const LEN: usize = 32;

    pub fn parse(value: &str) -> Result<Self, String> {
        let valid = value.len() == Self::LEN
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(value.to_string()))
        } else {
            Err(format!(
                "anonymized id must be {} lowercase hex characters",
                Self::LEN
            ))
        }
    }

    pub(crate) fn from_digest_hex(hex: String) -> Self {
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for AnonymizedId {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl fmt::Display for AnonymizedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivacySettings {
    pub opt_out: bool,
    pub allow_check_ins: bool,
    pub data_retention_days: i64,
    pub last_opt_out_update: Option<DateTime<Utc>>,
}

impl PrivacySettings {
    pub fn with_retention(data_retention_days: i64) -> Self {
        Self {
            opt_out: false,
            allow_check_ins: true,
            data_retention_days,
            last_opt_out_update: None,
        }
    }

    pub fn permits_check_ins(&self) -> bool {
        !self.opt_out && self.allow_check_ins
    }
}

/// Partial privacy update; absent fields keep their stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivacyUpdate {
    pub opt_out: Option<bool>,
    pub allow_check_ins: Option<bool>,
    pub data_retention_days: Option<i64>,
}

/// Rolling summary of a student's usual dining behavior.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaselinePattern {
    pub average_meals_per_week: f64,
    pub preferred_meal_times: Vec<MealType>,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub anonymized_id: AnonymizedId,
    pub college_token: String,
    pub privacy_settings: PrivacySettings,
    pub baseline_pattern: BaselinePattern,
    pub data_expiry_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MealData {
    pub date: NaiveDate,
    pub meal_type: MealType,
    pub attended: bool,
    pub timestamp: DateTime<Utc>,
}

/// Analysis verdict cached on attendance records of the analysed window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSnapshot {
    pub is_anomaly: bool,
    pub anomaly_score: f64,
    pub reason: AnalysisReason,
    pub last_analyzed: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    pub college_system: String,
    pub sync_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MealAttendance {
    pub id: Uuid,
    pub student_anonymized_id: AnonymizedId,
    pub meal_data: MealData,
    pub pattern_analysis: Option<AnalysisSnapshot>,
    pub source: SourceInfo,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckInData {
    #[serde(rename = "type")]
    pub check_in_type: CheckInType,
    pub message: String,
    pub tone: Tone,
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub status: DeliveryStatus,
    pub method: DeliveryMethod,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckInResponse {
    pub received: bool,
    pub response_type: Option<ResponseType>,
    pub response_text: Option<String>,
    pub responded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cooldown {
    pub next_allowed_check_in: DateTime<Utc>,
    pub reason: CooldownReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckIn {
    pub id: Uuid,
    pub student_anonymized_id: AnonymizedId,
    pub check_in_data: CheckInData,
    pub delivery: Delivery,
    pub response: CheckInResponse,
    pub cooldown: Cooldown,
    pub created_at: DateTime<Utc>,
}

/// Per-signal scores, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalScores {
    pub consecutive_misses: f64,
    pub frequency_drop: f64,
    pub pattern_change: f64,
    pub meal_type_shift: f64,
}

/// Evidence behind a verdict, kept for auditability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalDetails {
    pub recent_records: usize,
    pub baseline_records: usize,
    pub longest_miss_run: usize,
    pub recent_rate: Option<f64>,
    pub baseline_rate: Option<f64>,
    pub scores: SignalScores,
    pub triggered_by: Option<Signal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternAnalysis {
    pub is_anomaly: bool,
    pub reason: AnalysisReason,
    pub score: f64,
    pub details: Option<SignalDetails>,
}

impl PatternAnalysis {
    /// A non-anomalous verdict with no evidence attached.
    pub fn neutral(reason: AnalysisReason) -> Self {
        Self {
            is_anomaly: false,
            reason,
            score: 0.0,
            details: None,
        }
    }

    pub fn summary(&self) -> AnalysisSummary {
        AnalysisSummary {
            is_anomaly: self.is_anomaly,
            reason: self.reason,
            score: self.score,
        }
    }
}

/// The verdict fields returned to ingesting systems.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSummary {
    pub is_anomaly: bool,
    pub reason: AnalysisReason,
    pub score: f64,
}

/// Rows removed by a TTL sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeReport {
    pub students: u64,
    pub attendance: u64,
    pub check_ins: u64,
}
