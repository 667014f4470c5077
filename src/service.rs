//! Service facade over anonymization, storage, detection and check-ins.
//!
//! Callers only ever see anonymized ids. Natural keys enter through the
//! ingestion requests and are dropped as soon as the pseudonym is derived.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::anonymize::Anonymizer;
use crate::checkin::{CheckInOrchestrator, ResponseOutcome};
use crate::clock::Clock;
use crate::config::{PulseConfig, ATTENDANCE_TTL_DAYS, MAX_RETENTION_DAYS};
use crate::delivery::{Courier, DeliveryQueue, Notifier};
use crate::detection::PatternEngine;
use crate::error::PulseError;
use crate::messages::MessageComposer;
use crate::models::{
    AnalysisSummary, AnonymizedId, BaselinePattern, CheckIn, MealAttendance, MealData, MealType,
    PatternAnalysis, PrivacySettings, PrivacyUpdate, PurgeReport, ResponseType, SourceInfo,
    Student, Tone,
};
use crate::store::PulseStore;

const MAX_COLLEGE_ID_LEN: usize = 128;

/// One dining observation as reported by a college system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MealInput {
    pub date: NaiveDate,
    pub meal_type: MealType,
    pub attended: bool,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInput {
    pub college_system: String,
    #[serde(default)]
    pub sync_timestamp: Option<DateTime<Utc>>,
}

/// Natural key and credential of the student an ingestion is about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentKey {
    pub college_token: String,
    pub college_id: String,
    #[serde(default)]
    pub enrollment_year: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    #[serde(flatten)]
    pub student: StudentKey,
    pub meal_data: MealInput,
    pub source: SourceInput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchIngestRequest {
    #[serde(flatten)]
    pub student: StudentKey,
    pub meal_data: Vec<MealInput>,
    pub source: SourceInput,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub anonymized_id: AnonymizedId,
    pub pattern_analysis: AnalysisSummary,
    pub check_in_triggered: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckInSummary {
    pub id: Uuid,
    pub message: String,
    pub tone: Tone,
    pub created_at: DateTime<Utc>,
    pub response_received: bool,
}

impl From<&CheckIn> for CheckInSummary {
    fn from(check_in: &CheckIn) -> Self {
        Self {
            id: check_in.id,
            message: check_in.check_in_data.message.clone(),
            tone: check_in.check_in_data.tone,
            created_at: check_in.created_at,
            response_received: check_in.response.received,
        }
    }
}

/// Everything the system holds about one pseudonymous student.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternReport {
    pub anonymized_id: AnonymizedId,
    pub pattern_analysis: PatternAnalysis,
    pub baseline_pattern: BaselinePattern,
    pub recent_check_ins: Vec<CheckInSummary>,
    pub privacy_settings: PrivacySettings,
    pub data_expiry_date: DateTime<Utc>,
}

pub struct MealPulse {
    anonymizer: Anonymizer,
    store: Arc<dyn PulseStore>,
    engine: PatternEngine,
    courier: Arc<Courier>,
    orchestrator: CheckInOrchestrator,
    clock: Arc<dyn Clock>,
    config: PulseConfig,
}

impl MealPulse {
    pub fn new(
        anonymizer: Anonymizer,
        store: Arc<dyn PulseStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        composer: MessageComposer,
        config: PulseConfig,
    ) -> Self {
        let engine = PatternEngine::new(store.clone(), clock.clone(), config.detection.clone());
        let courier = Arc::new(Courier::new(
            store.clone(),
            notifier,
            clock.clone(),
            config.delivery.clone(),
        ));
        let orchestrator = CheckInOrchestrator::new(
            store.clone(),
            courier.clone(),
            clock.clone(),
            composer,
            config.check_in.clone(),
        );
        Self {
            anonymizer,
            store,
            engine,
            courier,
            orchestrator,
            clock,
            config,
        }
    }

    /// Route deliveries through a background queue.
    pub fn with_delivery_queue(mut self, queue: DeliveryQueue) -> Self {
        self.orchestrator = self.orchestrator.with_queue(queue);
        self
    }

    pub fn courier(&self) -> Arc<Courier> {
        self.courier.clone()
    }

    pub fn anonymizer(&self) -> &Anonymizer {
        &self.anonymizer
    }

    /// Token a trusted college system presents today for `college_id`.
    pub fn mint_college_token(&self, college_id: &str) -> String {
        self.anonymizer
            .create_college_token_at(college_id, self.clock.now())
    }

    pub fn orchestrator(&self) -> &CheckInOrchestrator {
        &self.orchestrator
    }

    pub fn config(&self) -> &PulseConfig {
        &self.config
    }

    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestOutcome, PulseError> {
        self.ingest_meals(&request.student, &[request.meal_data], &request.source)
            .await
    }

    /// Store a whole batch, then analyse once.
    pub async fn ingest_batch(&self, request: BatchIngestRequest) -> Result<IngestOutcome, PulseError> {
        let max = self.config.max_batch_size;
        if request.meal_data.is_empty() || request.meal_data.len() > max {
            return Err(PulseError::Validation(format!(
                "mealData must hold between 1 and {max} records"
            )));
        }
        self.ingest_meals(&request.student, &request.meal_data, &request.source)
            .await
    }

    async fn ingest_meals(
        &self,
        key: &StudentKey,
        meals: &[MealInput],
        source: &SourceInput,
    ) -> Result<IngestOutcome, PulseError> {
        let now = self.clock.now();
        validate_key(key)?;
        validate_source(source)?;
        for meal in meals {
            validate_meal(meal, now)?;
        }

        if !self
            .anonymizer
            .verify_college_token_at(&key.college_token, &key.college_id, now)
        {
            warn!("ingestion rejected: college token does not verify");
            return Err(PulseError::Unauthorized("invalid college token".to_string()));
        }

        let id = self.anonymizer.create_anonymized_id(
            &key.college_id,
            key.enrollment_year.as_deref(),
            key.department.as_deref(),
        );
        let student = self.resolve_student(&id, &key.college_token, now).await?;

        let source = SourceInfo {
            college_system: source.college_system.trim().to_string(),
            sync_timestamp: source.sync_timestamp.unwrap_or(now),
        };
        let expires_at = (now + Duration::days(ATTENDANCE_TTL_DAYS)).min(student.data_expiry_date);
        let records: Vec<MealAttendance> = meals
            .iter()
            .map(|meal| MealAttendance {
                id: Uuid::new_v4(),
                student_anonymized_id: id.clone(),
                meal_data: MealData {
                    date: meal.date,
                    meal_type: meal.meal_type,
                    attended: meal.attended,
                    timestamp: meal
                        .timestamp
                        .unwrap_or_else(|| meal.date.and_time(meal.meal_type.serving_time()).and_utc()),
                },
                pattern_analysis: None,
                source: source.clone(),
                created_at: now,
                expires_at,
            })
            .collect();
        let stored = self.store.insert_attendance(&records).await?;
        debug!(anonymized_id = %id, records = stored, "attendance stored");

        let analysis = self.engine.analyze_patterns(&id).await;
        let check_in_triggered = self
            .orchestrator
            .trigger_check_in(&id, &analysis)
            .await
            .is_triggered();

        info!(
            anonymized_id = %id,
            records = stored,
            is_anomaly = analysis.is_anomaly,
            reason = %analysis.reason,
            score = analysis.score,
            check_in_triggered,
            "ingestion processed"
        );
        Ok(IngestOutcome {
            anonymized_id: id,
            pattern_analysis: analysis.summary(),
            check_in_triggered,
        })
    }

    async fn resolve_student(
        &self,
        id: &AnonymizedId,
        college_token: &str,
        now: DateTime<Utc>,
    ) -> Result<Student, PulseError> {
        let retention = self.config.default_retention_days.clamp(1, MAX_RETENTION_DAYS);
        let candidate = Student {
            anonymized_id: id.clone(),
            college_token: college_token.to_string(),
            privacy_settings: PrivacySettings::with_retention(retention),
            baseline_pattern: BaselinePattern::default(),
            data_expiry_date: now + Duration::days(retention),
            created_at: now,
        };
        Ok(self.store.upsert_student(&candidate, now).await?)
    }

    pub async fn analyze(&self, id: &AnonymizedId) -> PatternAnalysis {
        self.engine.analyze_patterns(id).await
    }

    pub async fn pattern_report(&self, id: &AnonymizedId) -> Result<PatternReport, PulseError> {
        let now = self.clock.now();
        self.store
            .find_student(id, now)
            .await?
            .ok_or_else(|| PulseError::NotFound(format!("student {id}")))?;

        let pattern_analysis = self.engine.analyze_patterns(id).await;
        let recent = self
            .store
            .recent_check_ins(id, self.config.check_in.recent_check_in_limit)
            .await?;
        // Re-read so a baseline refreshed by the analysis above is reported.
        let student = self
            .store
            .find_student(id, now)
            .await?
            .ok_or_else(|| PulseError::NotFound(format!("student {id}")))?;

        Ok(PatternReport {
            anonymized_id: id.clone(),
            pattern_analysis,
            baseline_pattern: student.baseline_pattern,
            recent_check_ins: recent.iter().map(CheckInSummary::from).collect(),
            privacy_settings: student.privacy_settings,
            data_expiry_date: student.data_expiry_date,
        })
    }

    pub async fn update_privacy(
        &self,
        id: &AnonymizedId,
        update: &PrivacyUpdate,
    ) -> Result<PrivacySettings, PulseError> {
        self.orchestrator.update_privacy_preferences(id, update).await
    }

    /// Record a student's answer to one of their own check-ins.
    pub async fn respond(
        &self,
        id: &AnonymizedId,
        check_in_id: Uuid,
        response_type: ResponseType,
        response_text: Option<String>,
    ) -> Result<ResponseOutcome, PulseError> {
        let check_in = self.orchestrator.find_check_in(check_in_id).await?;
        let owner_live = self.store.find_student(id, self.clock.now()).await?.is_some();
        if &check_in.student_anonymized_id != id || !owner_live {
            return Err(PulseError::NotFound(format!("check-in {check_in_id}")));
        }
        self.orchestrator
            .handle_check_in_response(check_in_id, response_type, response_text)
            .await
    }

    pub async fn confirm_delivery(&self, check_in_id: Uuid) -> bool {
        self.orchestrator.confirm_delivery(check_in_id).await
    }

    pub async fn purge(&self) -> Result<PurgeReport, PulseError> {
        let report = self.store.purge_expired(self.clock.now()).await?;
        info!(
            students = report.students,
            attendance = report.attendance,
            check_ins = report.check_ins,
            "expired records purged"
        );
        Ok(report)
    }
}

fn validate_key(key: &StudentKey) -> Result<(), PulseError> {
    let college_id = key.college_id.trim();
    if college_id.is_empty() || college_id.len() > MAX_COLLEGE_ID_LEN {
        return Err(PulseError::Validation(format!(
            "collegeId must be 1 to {MAX_COLLEGE_ID_LEN} characters"
        )));
    }
    if key.college_token.trim().is_empty() {
        return Err(PulseError::Unauthorized("missing college token".to_string()));
    }
    Ok(())
}

fn validate_source(source: &SourceInput) -> Result<(), PulseError> {
    if source.college_system.trim().is_empty() {
        return Err(PulseError::Validation("source.collegeSystem is required".to_string()));
    }
    Ok(())
}

fn validate_meal(meal: &MealInput, now: DateTime<Utc>) -> Result<(), PulseError> {
    if meal.date > now.date_naive() {
        return Err(PulseError::Validation(format!(
            "mealData.date {} is in the future",
            meal.date
        )));
    }
    Ok(())
}
