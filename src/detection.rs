//! Pattern detection engine.
//!
//! Loads the recent and baseline attendance windows of one student, runs the
//! signal analyzers and turns their scores into a verdict. The engine never
//! returns an error: storage failures degrade to a neutral verdict.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::DetectionConfig;
use crate::error::StoreError;
use crate::models::{
    AnalysisReason, AnalysisSnapshot, AnonymizedId, BaselinePattern, MealAttendance, MealType,
    PatternAnalysis, SignalDetails, SignalScores, Student,
};
use crate::signals;
use crate::store::PulseStore;

/// Date bounds of the two analysis windows; each is `(start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Windows {
    pub baseline_start: NaiveDate,
    pub recent_start: NaiveDate,
    pub today: NaiveDate,
}

impl Windows {
    pub fn ending(today: NaiveDate, config: &DetectionConfig) -> Self {
        let recent_start = today - Duration::days(config.recent_window_days);
        Self {
            baseline_start: recent_start - Duration::days(config.baseline_window_days),
            recent_start,
            today,
        }
    }
}

pub struct PatternEngine {
    store: Arc<dyn PulseStore>,
    clock: Arc<dyn Clock>,
    config: DetectionConfig,
}

impl PatternEngine {
    pub fn new(store: Arc<dyn PulseStore>, clock: Arc<dyn Clock>, config: DetectionConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Analyse the attendance of one student.
    pub async fn analyze_patterns(&self, id: &AnonymizedId) -> PatternAnalysis {
        let now = self.clock.now();
        match self.try_analyze(id, now).await {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!(anonymized_id = %id, error = %e, "pattern analysis unavailable");
                PatternAnalysis::neutral(AnalysisReason::AnalysisUnavailable)
            }
        }
    }

    async fn try_analyze(
        &self,
        id: &AnonymizedId,
        now: DateTime<Utc>,
    ) -> Result<PatternAnalysis, StoreError> {
        let Some(student) = self.store.find_student(id, now).await? else {
            return Ok(PatternAnalysis::neutral(AnalysisReason::UnknownStudent));
        };
        if student.privacy_settings.opt_out {
            return Ok(PatternAnalysis::neutral(AnalysisReason::StudentOptedOut));
        }

        let windows = Windows::ending(now.date_naive(), &self.config);
        let recent = self
            .store
            .attendance_between(id, windows.recent_start, windows.today, now)
            .await?;
        if recent.len() < self.config.min_recent_records {
            debug!(anonymized_id = %id, records = recent.len(), "not enough recent attendance");
            return Ok(PatternAnalysis::neutral(AnalysisReason::InsufficientData));
        }

        let baseline = self
            .store
            .attendance_between(id, windows.baseline_start, windows.recent_start, now)
            .await?;

        let analysis = self.evaluate(&recent, &baseline);
        debug!(
            anonymized_id = %id,
            reason = %analysis.reason,
            score = analysis.score,
            "pattern analysis complete"
        );

        self.cache_verdict(id, &windows, &analysis, now).await;
        self.refresh_baseline(&student, &recent, now).await;

        Ok(analysis)
    }

    /// Score both windows and apply the decision rule.
    pub fn evaluate(&self, recent: &[MealAttendance], baseline: &[MealAttendance]) -> PatternAnalysis {
        let scores = signals::score_all(recent, baseline, &self.config);
        let picked = signals::decide(&scores, self.config.threshold);

        let details = SignalDetails {
            recent_records: recent.len(),
            baseline_records: baseline.len(),
            longest_miss_run: signals::longest_miss_run(recent),
            recent_rate: signals::attendance_rate(recent),
            baseline_rate: signals::attendance_rate(baseline),
            scores: SignalScores {
                consecutive_misses: scores[0].score,
                frequency_drop: scores[1].score,
                pattern_change: scores[2].score,
                meal_type_shift: scores[3].score,
            },
            triggered_by: picked.map(|score| score.signal),
        };

        match picked {
            Some(score) => PatternAnalysis {
                is_anomaly: true,
                reason: score.reason(),
                score: score.score,
                details: Some(details),
            },
            None => PatternAnalysis {
                is_anomaly: false,
                reason: AnalysisReason::None,
                score: 0.0,
                details: Some(details),
            },
        }
    }

    async fn cache_verdict(
        &self,
        id: &AnonymizedId,
        windows: &Windows,
        analysis: &PatternAnalysis,
        now: DateTime<Utc>,
    ) {
        let snapshot = AnalysisSnapshot {
            is_anomaly: analysis.is_anomaly,
            anomaly_score: analysis.score,
            reason: analysis.reason,
            last_analyzed: now,
        };
        if let Err(e) = self
            .store
            .annotate_attendance(id, windows.recent_start, windows.today, &snapshot, now)
            .await
        {
            warn!(anonymized_id = %id, error = %e, "failed to cache analysis on attendance");
        }
    }

    /// Moving-window refresh: the new baseline comes from the recent window only.
    async fn refresh_baseline(&self, student: &Student, recent: &[MealAttendance], now: DateTime<Utc>) {
        let due = student
            .baseline_pattern
            .last_updated
            .map_or(true, |updated| now - updated >= Duration::days(self.config.baseline_refresh_days));
        if !due || recent.len() < self.config.baseline_refresh_min_records {
            return;
        }

        let baseline = baseline_from(recent, self.config.recent_window_days, now);
        match self.store.save_baseline(&student.anonymized_id, &baseline).await {
            Ok(()) => debug!(
                anonymized_id = %student.anonymized_id,
                meals_per_week = baseline.average_meals_per_week,
                "baseline refreshed"
            ),
            Err(e) => warn!(
                anonymized_id = %student.anonymized_id,
                error = %e,
                "failed to persist refreshed baseline"
            ),
        }
    }
}

/// Summarise a window of `window_days` days into a baseline pattern.
pub fn baseline_from(records: &[MealAttendance], window_days: i64, now: DateTime<Utc>) -> BaselinePattern {
    let attended = records.iter().filter(|record| record.meal_data.attended);
    let mut counts = [0usize; 3];
    let mut total = 0usize;
    for record in attended {
        counts[record.meal_data.meal_type.slot()] += 1;
        total += 1;
    }

    let mut preferred: Vec<MealType> = MealType::ALL
        .into_iter()
        .filter(|meal| counts[meal.slot()] > 0)
        .collect();
    preferred.sort_by(|a, b| counts[b.slot()].cmp(&counts[a.slot()]));

    BaselinePattern {
        average_meals_per_week: total as f64 * 7.0 / window_days.max(1) as f64,
        preferred_meal_times: preferred,
        last_updated: Some(now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{MealData, PrivacySettings, Signal, SourceInfo};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 20, 0, 0).unwrap()
    }

    fn student_id() -> AnonymizedId {
        AnonymizedId::parse("00112233445566778899aabbccddeeff").unwrap()
    }

    fn record(days_ago: i64, meal_type: MealType, attended: bool) -> MealAttendance {
        let date = now().date_naive() - Duration::days(days_ago);
        MealAttendance {
            id: Uuid::new_v4(),
            student_anonymized_id: student_id(),
            meal_data: MealData {
                date,
                meal_type,
                attended,
                timestamp: date.and_time(meal_type.serving_time()).and_utc(),
            },
            pattern_analysis: None,
            source: SourceInfo {
                college_system: "dining-hub".to_string(),
                sync_timestamp: now(),
            },
            created_at: now(),
            expires_at: now() + Duration::days(90),
        }
    }

    async fn engine_with(records: Vec<MealAttendance>, config: DetectionConfig) -> (PatternEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let student = Student {
            anonymized_id: student_id(),
            college_token: "token".to_string(),
            privacy_settings: PrivacySettings::with_retention(365),
            baseline_pattern: BaselinePattern::default(),
            data_expiry_date: now() + Duration::days(365),
            created_at: now() - Duration::days(60),
        };
        store.upsert_student(&student, now()).await.unwrap();
        store.insert_attendance(&records).await.unwrap();

        let clock = Arc::new(ManualClock::new(now()));
        (PatternEngine::new(store.clone(), clock, config), store)
    }

    /// Dinner every day for `days` days ending `offset` days ago.
    fn dinners(offset: i64, days: i64, attended: impl Fn(i64) -> bool) -> Vec<MealAttendance> {
        (offset..offset + days)
            .map(|days_ago| record(days_ago, MealType::Dinner, attended(days_ago)))
            .collect()
    }

    #[test]
    fn windows_cover_fourteen_and_thirty_days() {
        let windows = Windows::ending(now().date_naive(), &DetectionConfig::default());
        assert_eq!((windows.today - windows.recent_start).num_days(), 14);
        assert_eq!((windows.recent_start - windows.baseline_start).num_days(), 30);
    }

    #[tokio::test]
    async fn too_few_recent_records_is_insufficient_data() {
        let (engine, _) = engine_with(dinners(0, 6, |_| false), DetectionConfig::default()).await;
        let analysis = engine.analyze_patterns(&student_id()).await;
        assert_eq!(analysis, PatternAnalysis::neutral(AnalysisReason::InsufficientData));
    }

    #[tokio::test]
    async fn unknown_students_are_neutral() {
        let (engine, _) = engine_with(vec![], DetectionConfig::default()).await;
        let stranger = AnonymizedId::parse("ffffffffffffffffffffffffffffffff").unwrap();
        let analysis = engine.analyze_patterns(&stranger).await;
        assert_eq!(analysis.reason, AnalysisReason::UnknownStudent);
        assert!(!analysis.is_anomaly);
    }

    #[tokio::test]
    async fn opted_out_students_short_circuit() {
        let (engine, store) = engine_with(dinners(0, 14, |_| false), DetectionConfig::default()).await;
        let settings = PrivacySettings {
            opt_out: true,
            ..PrivacySettings::with_retention(365)
        };
        store
            .save_privacy(&student_id(), &settings, now() + Duration::days(365))
            .await
            .unwrap();

        let analysis = engine.analyze_patterns(&student_id()).await;
        assert_eq!(analysis, PatternAnalysis::neutral(AnalysisReason::StudentOptedOut));
    }

    #[tokio::test]
    async fn long_miss_streak_is_reported() {
        let mut records = dinners(14, 30, |_| true);
        records.extend(dinners(0, 14, |days_ago| days_ago >= 5));
        let (engine, _) = engine_with(records, DetectionConfig::default()).await;

        let analysis = engine.analyze_patterns(&student_id()).await;
        assert!(analysis.is_anomaly);
        assert_eq!(analysis.reason, AnalysisReason::MissedConsecutive);
        assert_eq!(analysis.score, 1.0);
        let details = analysis.details.unwrap();
        assert_eq!(details.longest_miss_run, 5);
        assert_eq!(details.triggered_by, Some(Signal::ConsecutiveMisses));
    }

    #[tokio::test]
    async fn steady_routine_is_not_anomalous() {
        let records = dinners(0, 44, |days_ago| days_ago % 7 != 3);
        let (engine, _) = engine_with(records, DetectionConfig::default()).await;

        let analysis = engine.analyze_patterns(&student_id()).await;
        assert!(!analysis.is_anomaly);
        assert_eq!(analysis.reason, AnalysisReason::None);
        assert_eq!(analysis.score, 0.0);
    }

    #[tokio::test]
    async fn verdict_is_cached_on_recent_records() {
        let (engine, store) = engine_with(dinners(0, 44, |_| true), DetectionConfig::default()).await;
        engine.analyze_patterns(&student_id()).await;

        let windows = Windows::ending(now().date_naive(), engine.config());
        let recent = store
            .attendance_between(&student_id(), windows.recent_start, windows.today, now())
            .await
            .unwrap();
        assert!(recent.iter().all(|record| record.pattern_analysis.is_some()));

        let baseline = store
            .attendance_between(&student_id(), windows.baseline_start, windows.recent_start, now())
            .await
            .unwrap();
        assert!(baseline.iter().all(|record| record.pattern_analysis.is_none()));
    }

    #[tokio::test]
    async fn baseline_refreshes_from_recent_window() {
        let (engine, store) = engine_with(dinners(0, 44, |_| true), DetectionConfig::default()).await;
        engine.analyze_patterns(&student_id()).await;

        let student = store.find_student(&student_id(), now()).await.unwrap().unwrap();
        assert_eq!(
            student.baseline_pattern,
            BaselinePattern {
                average_meals_per_week: 7.0,
                preferred_meal_times: vec![MealType::Dinner],
                last_updated: Some(now()),
            }
        );
    }

    #[tokio::test]
    async fn baseline_is_not_refreshed_with_a_thin_window() {
        let (engine, store) = engine_with(dinners(0, 10, |_| true), DetectionConfig::default()).await;
        engine.analyze_patterns(&student_id()).await;

        let student = store.find_student(&student_id(), now()).await.unwrap().unwrap();
        assert_eq!(student.baseline_pattern.last_updated, None);
    }

    struct BrokenStore;

    #[async_trait]
    impl PulseStore for BrokenStore {
        async fn find_student(&self, _: &AnonymizedId, _: DateTime<Utc>) -> Result<Option<Student>, StoreError> {
            Err(StoreError::corrupt("students", "unreachable"))
        }
        async fn upsert_student(&self, s: &Student, _: DateTime<Utc>) -> Result<Student, StoreError> {
            Ok(s.clone())
        }
        async fn save_privacy(&self, _: &AnonymizedId, _: &PrivacySettings, _: DateTime<Utc>) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn save_baseline(&self, _: &AnonymizedId, _: &BaselinePattern) -> Result<(), StoreError> {
            Ok(())
        }
        async fn insert_attendance(&self, _: &[MealAttendance]) -> Result<u64, StoreError> {
            Ok(0)
        }
        async fn attendance_between(&self, _: &AnonymizedId, _: NaiveDate, _: NaiveDate, _: DateTime<Utc>) -> Result<Vec<MealAttendance>, StoreError> {
            Ok(vec![])
        }
        async fn annotate_attendance(&self, _: &AnonymizedId, _: NaiveDate, _: NaiveDate, _: &AnalysisSnapshot, _: DateTime<Utc>) -> Result<u64, StoreError> {
            Ok(0)
        }
        async fn insert_check_in_if_clear(&self, _: &crate::models::CheckIn, _: DateTime<Utc>) -> Result<crate::store::CheckInGate, StoreError> {
            Ok(crate::store::CheckInGate::Inserted)
        }
        async fn insert_check_in(&self, _: &crate::models::CheckIn) -> Result<(), StoreError> {
            Ok(())
        }
        async fn find_check_in(&self, _: Uuid) -> Result<Option<crate::models::CheckIn>, StoreError> {
            Ok(None)
        }
        async fn transition_delivery(&self, _: Uuid, _: crate::models::DeliveryStatus, _: crate::models::DeliveryStatus, _: DateTime<Utc>) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn record_response(&self, _: Uuid, _: &crate::models::CheckInResponse, _: crate::store::ResponseFollowUp<'_>) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn recent_check_ins(&self, _: &AnonymizedId, _: usize) -> Result<Vec<crate::models::CheckIn>, StoreError> {
            Ok(vec![])
        }
        async fn purge_expired(&self, _: DateTime<Utc>) -> Result<crate::models::PurgeReport, StoreError> {
            Ok(Default::default())
        }
    }

    #[tokio::test]
    async fn store_failures_degrade_to_no_anomaly() {
        let engine = PatternEngine::new(
            Arc::new(BrokenStore),
            Arc::new(ManualClock::new(now())),
            DetectionConfig::default(),
        );
        let analysis = engine.analyze_patterns(&student_id()).await;
        assert_eq!(analysis, PatternAnalysis::neutral(AnalysisReason::AnalysisUnavailable));
    }
}
