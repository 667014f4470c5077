//! Runtime configuration loaded from environment variables.
//!
//! | Variable                               | Default | Description                          |
//! |----------------------------------------|---------|--------------------------------------|
//! | `DATABASE_URL`                         | -       | Postgres connection string (CLI)     |
//! | `MEAL_PULSE_SECRET`                    | -       | HMAC secret, at least 16 bytes       |
//! | `MEAL_PULSE_LOG_LEVEL`                 | `info`  | tracing filter                       |
//! | `MEAL_PULSE_ANOMALY_THRESHOLD`         | `0.7`   | minimum signal score for an anomaly  |
//! | `MEAL_PULSE_COOLDOWN_HOURS`            | `24`    | standard check-in cooldown           |
//! | `MEAL_PULSE_ESCALATION_COOLDOWN_HOURS` | `2`     | cooldown after a `needs_help` reply  |
//! | `MEAL_PULSE_DOING_FINE_BACKOFF`        | `2.0`   | cooldown multiplier on `doing_fine`  |
//! | `MEAL_PULSE_MAX_BATCH`                 | `100`   | batch ingestion size cap             |
//! | `MEAL_PULSE_RETENTION_DAYS`            | `365`   | retention for new students           |
//! | `MEAL_PULSE_DELIVERY_ATTEMPTS`         | `3`     | transport attempts per check-in      |
//! | `MEAL_PULSE_DELIVERY_BACKOFF_MS`       | `500`   | linear retry backoff step            |
//! | `MEAL_PULSE_DELIVERY_METHOD`           | `push`  | delivery method recorded on check-ins|
//! | `MEAL_PULSE_QUEUE_CAPACITY`            | `256`   | bounded delivery queue size          |
//! | `MEAL_PULSE_MAX_CONNECTIONS`           | `5`     | Postgres pool size                   |

use crate::models::DeliveryMethod;

/// Largest retention a student may choose, in days.
pub const MAX_RETENTION_DAYS: i64 = 365;

/// Fixed lifetime of a meal attendance record, in days.
pub const ATTENDANCE_TTL_DAYS: i64 = 90;

/// Longest cooldown a deployment may configure, in hours.
pub const MAX_COOLDOWN_HOURS: i64 = 24 * 30;

/// Largest `doing_fine` cooldown multiplier.
pub const MAX_DOING_FINE_BACKOFF: f64 = 10.0;

/// Thresholds and window sizes for the pattern detection engine.
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    /// Minimum score a candidate signal needs to be reported as an anomaly.
    pub threshold: f64,
    pub recent_window_days: i64,
    pub baseline_window_days: i64,
    /// Recent records required before any signal is computed.
    pub min_recent_records: usize,
    /// Miss run that makes consecutive misses a candidate.
    pub consecutive_miss_trigger: usize,
    /// Miss run that saturates the consecutive-miss score at 1.0.
    pub consecutive_miss_saturation: usize,
    pub frequency_drop_trigger: f64,
    pub pattern_change_trigger: f64,
    pub baseline_refresh_days: i64,
    pub baseline_refresh_min_records: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            recent_window_days: 14,
            baseline_window_days: 30,
            min_recent_records: 7,
            consecutive_miss_trigger: 3,
            consecutive_miss_saturation: 5,
            frequency_drop_trigger: 0.30,
            pattern_change_trigger: 0.5,
            baseline_refresh_days: 7,
            baseline_refresh_min_records: 14,
        }
    }
}

/// Cadence rules for the check-in orchestrator.
#[derive(Debug, Clone)]
pub struct CheckInConfig {
    pub cooldown_hours: i64,
    pub escalation_cooldown_hours: i64,
    pub doing_fine_backoff: f64,
    /// How many check-ins a pattern query returns.
    pub recent_check_in_limit: usize,
}

impl CheckInConfig {
    /// Clamp cooldowns into ranges `chrono::Duration` can always represent.
    pub fn bounded(self) -> Self {
        let backoff = if self.doing_fine_backoff.is_finite() {
            self.doing_fine_backoff.clamp(1.0, MAX_DOING_FINE_BACKOFF)
        } else {
            1.0
        };
        Self {
            cooldown_hours: self.cooldown_hours.clamp(1, MAX_COOLDOWN_HOURS),
            escalation_cooldown_hours: self.escalation_cooldown_hours.clamp(1, MAX_COOLDOWN_HOURS),
            doing_fine_backoff: backoff,
            ..self
        }
    }
}

impl Default for CheckInConfig {
    fn default() -> Self {
        Self {
            cooldown_hours: 24,
            escalation_cooldown_hours: 2,
            doing_fine_backoff: 2.0,
            recent_check_in_limit: 5,
        }
    }
}

/// Transport retry policy and queue sizing.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub method: DeliveryMethod,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub queue_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            method: DeliveryMethod::Push,
            max_attempts: 3,
            backoff_ms: 500,
            queue_capacity: 256,
        }
    }
}

/// Top-level configuration for a Meal Pulse process.
#[derive(Debug, Clone)]
pub struct PulseConfig {
    pub database_url: Option<String>,
    pub secret: Option<String>,
    pub log_level: String,
    pub max_batch_size: usize,
    pub default_retention_days: i64,
    pub max_connections: u32,
    pub detection: DetectionConfig,
    pub check_in: CheckInConfig,
    pub delivery: DeliveryConfig,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            secret: None,
            log_level: "info".to_string(),
            max_batch_size: 100,
            default_retention_days: MAX_RETENTION_DAYS,
            max_connections: 5,
            detection: DetectionConfig::default(),
            check_in: CheckInConfig::default(),
            delivery: DeliveryConfig::default(),
        }
    }
}

impl PulseConfig {
    /// Load configuration from environment variables, applying defaults where
    /// a variable is absent or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let detection = DetectionConfig {
            threshold: env_parse("MEAL_PULSE_ANOMALY_THRESHOLD", defaults.detection.threshold),
            ..defaults.detection
        };
        let check_in = CheckInConfig {
            cooldown_hours: env_parse("MEAL_PULSE_COOLDOWN_HOURS", defaults.check_in.cooldown_hours),
            escalation_cooldown_hours: env_parse(
                "MEAL_PULSE_ESCALATION_COOLDOWN_HOURS",
                defaults.check_in.escalation_cooldown_hours,
            ),
            doing_fine_backoff: env_parse(
                "MEAL_PULSE_DOING_FINE_BACKOFF",
                defaults.check_in.doing_fine_backoff,
            ),
            ..defaults.check_in
        }
        .bounded();
        let delivery = DeliveryConfig {
            method: env_parse("MEAL_PULSE_DELIVERY_METHOD", defaults.delivery.method),
            max_attempts: env_parse("MEAL_PULSE_DELIVERY_ATTEMPTS", defaults.delivery.max_attempts),
            backoff_ms: env_parse("MEAL_PULSE_DELIVERY_BACKOFF_MS", defaults.delivery.backoff_ms),
            queue_capacity: env_parse(
                "MEAL_PULSE_QUEUE_CAPACITY",
                defaults.delivery.queue_capacity,
            ),
        };

        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            secret: std::env::var("MEAL_PULSE_SECRET").ok(),
            log_level: env_str("MEAL_PULSE_LOG_LEVEL", &defaults.log_level),
            max_batch_size: env_parse("MEAL_PULSE_MAX_BATCH", defaults.max_batch_size),
            default_retention_days: env_parse(
                "MEAL_PULSE_RETENTION_DAYS",
                defaults.default_retention_days,
            )
            .clamp(1, MAX_RETENTION_DAYS),
            max_connections: env_parse("MEAL_PULSE_MAX_CONNECTIONS", defaults.max_connections),
            detection,
            check_in,
            delivery,
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = PulseConfig::default();
        assert_eq!(cfg.detection.threshold, 0.7);
        assert_eq!(cfg.detection.recent_window_days, 14);
        assert_eq!(cfg.detection.baseline_window_days, 30);
        assert_eq!(cfg.check_in.cooldown_hours, 24);
        assert_eq!(cfg.check_in.escalation_cooldown_hours, 2);
        assert_eq!(cfg.max_batch_size, 100);
        assert_eq!(cfg.default_retention_days, 365);
    }

    #[test]
    fn from_env_keeps_sane_values() {
        let cfg = PulseConfig::from_env();
        assert!(cfg.detection.threshold > 0.0);
        assert!((1..=MAX_COOLDOWN_HOURS).contains(&cfg.check_in.cooldown_hours));
        assert!((1..=MAX_COOLDOWN_HOURS).contains(&cfg.check_in.escalation_cooldown_hours));
        assert!(cfg.max_batch_size > 0);
        assert!((1..=MAX_RETENTION_DAYS).contains(&cfg.default_retention_days));
    }

    #[test]
    fn cooldowns_are_clamped_to_representable_ranges() {
        let cfg = CheckInConfig {
            cooldown_hours: i64::MAX,
            escalation_cooldown_hours: -4,
            doing_fine_backoff: f64::INFINITY,
            ..CheckInConfig::default()
        }
        .bounded();
        assert_eq!(cfg.cooldown_hours, MAX_COOLDOWN_HOURS);
        assert_eq!(cfg.escalation_cooldown_hours, 1);
        assert_eq!(cfg.doing_fine_backoff, 1.0);

        let huge = CheckInConfig {
            doing_fine_backoff: 1e300,
            ..CheckInConfig::default()
        }
        .bounded();
        assert_eq!(huge.doing_fine_backoff, MAX_DOING_FINE_BACKOFF);
        assert_eq!(huge.cooldown_hours, 24);
    }

    #[test]
    fn default_cadence_is_already_in_bounds() {
        let cfg = CheckInConfig::default().bounded();
        assert_eq!(cfg.cooldown_hours, 24);
        assert_eq!(cfg.escalation_cooldown_hours, 2);
        assert_eq!(cfg.doing_fine_backoff, 2.0);
    }
}
