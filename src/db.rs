use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    AnalysisSnapshot, AnonymizedId, BaselinePattern, CheckIn, CheckInData, CheckInResponse,
    Cooldown, Delivery, DeliveryStatus, MealAttendance, MealData, MealType, PrivacySettings,
    PurgeReport, SourceInfo, Student,
};
use crate::service::{BatchIngestRequest, MealInput, MealPulse, SourceInput, StudentKey};
use crate::store::{CheckInGate, PulseStore, ResponseFollowUp};

pub async fn init_db(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// [`PulseStore`] backed by the `meal_pulse` Postgres schema.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const STUDENT_COLUMNS: &str = "anonymized_id, college_token, opt_out, allow_check_ins, \
     data_retention_days, last_opt_out_update, average_meals_per_week, preferred_meal_times, \
     baseline_updated_at, data_expiry_date, created_at";

const ATTENDANCE_COLUMNS: &str = "id, student_anonymized_id, meal_date, meal_type, attended, \
     meal_timestamp, is_anomaly, anomaly_score, analysis_reason, last_analyzed, college_system, \
     sync_timestamp, created_at, expires_at";

const CHECK_IN_COLUMNS: &str = "id, student_anonymized_id, check_in_type, message, tone, \
     priority, delivery_status, delivery_method, sent_at, delivered_at, response_received, \
     response_type, response_text, responded_at, next_allowed_check_in, cooldown_reason, created_at";

fn wire<T: std::str::FromStr>(row: &PgRow, column: &'static str) -> Result<T, StoreError> {
    let value: String = row.try_get(column)?;
    value.parse().map_err(|_| StoreError::corrupt(column, value))
}

fn opt_wire<T: std::str::FromStr>(row: &PgRow, column: &'static str) -> Result<Option<T>, StoreError> {
    let value: Option<String> = row.try_get(column)?;
    value
        .map(|value| value.parse().map_err(|_| StoreError::corrupt(column, value)))
        .transpose()
}

fn anonymized_id(row: &PgRow, column: &'static str) -> Result<AnonymizedId, StoreError> {
    let value: String = row.try_get(column)?;
    AnonymizedId::parse(&value).map_err(|_| StoreError::corrupt(column, value))
}

fn student_from_row(row: &PgRow) -> Result<Student, StoreError> {
    let preferred: Vec<String> = row.try_get("preferred_meal_times")?;
    let preferred_meal_times = preferred
        .into_iter()
        .map(|meal| {
            meal.parse::<MealType>()
                .map_err(|_| StoreError::corrupt("preferred_meal_times", meal))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Student {
        anonymized_id: anonymized_id(row, "anonymized_id")?,
        college_token: row.try_get("college_token")?,
        privacy_settings: PrivacySettings {
            opt_out: row.try_get("opt_out")?,
            allow_check_ins: row.try_get("allow_check_ins")?,
            data_retention_days: i64::from(row.try_get::<i32, _>("data_retention_days")?),
            last_opt_out_update: row.try_get("last_opt_out_update")?,
        },
        baseline_pattern: BaselinePattern {
            average_meals_per_week: row.try_get("average_meals_per_week")?,
            preferred_meal_times,
            last_updated: row.try_get("baseline_updated_at")?,
        },
        data_expiry_date: row.try_get("data_expiry_date")?,
        created_at: row.try_get("created_at")?,
    })
}

fn attendance_from_row(row: &PgRow) -> Result<MealAttendance, StoreError> {
    let pattern_analysis = match row.try_get::<Option<DateTime<Utc>>, _>("last_analyzed")? {
        Some(last_analyzed) => Some(AnalysisSnapshot {
            is_anomaly: row.try_get::<Option<bool>, _>("is_anomaly")?.unwrap_or(false),
            anomaly_score: row.try_get::<Option<f64>, _>("anomaly_score")?.unwrap_or(0.0),
            reason: wire(row, "analysis_reason")?,
            last_analyzed,
        }),
        None => None,
    };

    Ok(MealAttendance {
        id: row.try_get("id")?,
        student_anonymized_id: anonymized_id(row, "student_anonymized_id")?,
        meal_data: MealData {
            date: row.try_get("meal_date")?,
            meal_type: wire(row, "meal_type")?,
            attended: row.try_get("attended")?,
            timestamp: row.try_get("meal_timestamp")?,
        },
        pattern_analysis,
        source: SourceInfo {
            college_system: row.try_get("college_system")?,
            sync_timestamp: row.try_get("sync_timestamp")?,
        },
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn check_in_from_row(row: &PgRow) -> Result<CheckIn, StoreError> {
    Ok(CheckIn {
        id: row.try_get("id")?,
        student_anonymized_id: anonymized_id(row, "student_anonymized_id")?,
        check_in_data: CheckInData {
            check_in_type: wire(row, "check_in_type")?,
            message: row.try_get("message")?,
            tone: wire(row, "tone")?,
            priority: wire(row, "priority")?,
        },
        delivery: Delivery {
            status: wire(row, "delivery_status")?,
            method: wire(row, "delivery_method")?,
            sent_at: row.try_get("sent_at")?,
            delivered_at: row.try_get("delivered_at")?,
        },
        response: CheckInResponse {
            received: row.try_get("response_received")?,
            response_type: opt_wire(row, "response_type")?,
            response_text: row.try_get("response_text")?,
            responded_at: row.try_get("responded_at")?,
        },
        cooldown: Cooldown {
            next_allowed_check_in: row.try_get("next_allowed_check_in")?,
            reason: wire(row, "cooldown_reason")?,
        },
        created_at: row.try_get("created_at")?,
    })
}

fn insert_check_in_query(check_in: &CheckIn) -> Query<'_, Postgres, PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO meal_pulse.check_ins
        (id, student_anonymized_id, check_in_type, message, tone, priority,
         delivery_status, delivery_method, sent_at, delivered_at,
         response_received, response_type, response_text, responded_at,
         next_allowed_check_in, cooldown_reason, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        "#,
    )
    .bind(check_in.id)
    .bind(check_in.student_anonymized_id.as_str())
    .bind(check_in.check_in_data.check_in_type.as_str())
    .bind(&check_in.check_in_data.message)
    .bind(check_in.check_in_data.tone.as_str())
    .bind(check_in.check_in_data.priority.as_str())
    .bind(check_in.delivery.status.as_str())
    .bind(check_in.delivery.method.as_str())
    .bind(check_in.delivery.sent_at)
    .bind(check_in.delivery.delivered_at)
    .bind(check_in.response.received)
    .bind(check_in.response.response_type.map(|kind| kind.as_str()))
    .bind(check_in.response.response_text.as_deref())
    .bind(check_in.response.responded_at)
    .bind(check_in.cooldown.next_allowed_check_in)
    .bind(check_in.cooldown.reason.as_str())
    .bind(check_in.created_at)
}

#[async_trait]
impl PulseStore for PgStore {
    async fn find_student(
        &self,
        id: &AnonymizedId,
        now: DateTime<Utc>,
    ) -> Result<Option<Student>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {STUDENT_COLUMNS} FROM meal_pulse.students \
             WHERE anonymized_id = $1 AND data_expiry_date > $2"
        ))
        .bind(id.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(student_from_row).transpose()
    }

    async fn upsert_student(
        &self,
        student: &Student,
        now: DateTime<Utc>,
    ) -> Result<Student, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Cascades to the history of an expired identity.
        sqlx::query(
            "DELETE FROM meal_pulse.students WHERE anonymized_id = $1 AND data_expiry_date <= $2",
        )
        .bind(student.anonymized_id.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let preferred: Vec<&str> = student
            .baseline_pattern
            .preferred_meal_times
            .iter()
            .map(|meal| meal.as_str())
            .collect();
        let settings = &student.privacy_settings;
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO meal_pulse.students ({STUDENT_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (anonymized_id) DO UPDATE
            SET college_token = EXCLUDED.college_token
            RETURNING {STUDENT_COLUMNS}
            "#
        ))
        .bind(student.anonymized_id.as_str())
        .bind(&student.college_token)
        .bind(settings.opt_out)
        .bind(settings.allow_check_ins)
        .bind(settings.data_retention_days as i32)
        .bind(settings.last_opt_out_update)
        .bind(student.baseline_pattern.average_meals_per_week)
        .bind(preferred)
        .bind(student.baseline_pattern.last_updated)
        .bind(student.data_expiry_date)
        .bind(student.created_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        student_from_row(&row)
    }

    async fn save_privacy(
        &self,
        id: &AnonymizedId,
        settings: &PrivacySettings,
        data_expiry_date: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE meal_pulse.students
            SET opt_out = $2, allow_check_ins = $3, data_retention_days = $4,
                last_opt_out_update = $5, data_expiry_date = $6
            WHERE anonymized_id = $1
            "#,
        )
        .bind(id.as_str())
        .bind(settings.opt_out)
        .bind(settings.allow_check_ins)
        .bind(settings.data_retention_days as i32)
        .bind(settings.last_opt_out_update)
        .bind(data_expiry_date)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE meal_pulse.meal_attendance
            SET expires_at = LEAST(expires_at, $2)
            WHERE student_anonymized_id = $1
            "#,
        )
        .bind(id.as_str())
        .bind(data_expiry_date)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn save_baseline(
        &self,
        id: &AnonymizedId,
        baseline: &BaselinePattern,
    ) -> Result<(), StoreError> {
        let preferred: Vec<&str> = baseline
            .preferred_meal_times
            .iter()
            .map(|meal| meal.as_str())
            .collect();
        sqlx::query(
            r#"
            UPDATE meal_pulse.students
            SET average_meals_per_week = $2, preferred_meal_times = $3, baseline_updated_at = $4
            WHERE anonymized_id = $1
            "#,
        )
        .bind(id.as_str())
        .bind(baseline.average_meals_per_week)
        .bind(preferred)
        .bind(baseline.last_updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_attendance(&self, records: &[MealAttendance]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;

        for record in records {
            let result = sqlx::query(
                r#"
                INSERT INTO meal_pulse.meal_attendance
                (id, student_anonymized_id, meal_date, meal_type, attended, meal_timestamp,
                 college_system, sync_timestamp, created_at, expires_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (student_anonymized_id, meal_date, meal_type) DO UPDATE
                SET attended = EXCLUDED.attended,
                    meal_timestamp = EXCLUDED.meal_timestamp,
                    college_system = EXCLUDED.college_system,
                    sync_timestamp = EXCLUDED.sync_timestamp
                "#,
            )
            .bind(record.id)
            .bind(record.student_anonymized_id.as_str())
            .bind(record.meal_data.date)
            .bind(record.meal_data.meal_type.as_str())
            .bind(record.meal_data.attended)
            .bind(record.meal_data.timestamp)
            .bind(&record.source.college_system)
            .bind(record.source.sync_timestamp)
            .bind(record.created_at)
            .bind(record.expires_at)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn attendance_between(
        &self,
        id: &AnonymizedId,
        from: NaiveDate,
        to: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Vec<MealAttendance>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ATTENDANCE_COLUMNS}
            FROM meal_pulse.meal_attendance
            WHERE student_anonymized_id = $1
              AND meal_date > $2 AND meal_date <= $3
              AND expires_at > $4
            ORDER BY meal_date,
                     CASE meal_type WHEN 'breakfast' THEN 0 WHEN 'lunch' THEN 1 ELSE 2 END
            "#
        ))
        .bind(id.as_str())
        .bind(from)
        .bind(to)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(attendance_from_row).collect()
    }

    async fn annotate_attendance(
        &self,
        id: &AnonymizedId,
        from: NaiveDate,
        to: NaiveDate,
        snapshot: &AnalysisSnapshot,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE meal_pulse.meal_attendance
            SET is_anomaly = $4, anomaly_score = $5, analysis_reason = $6, last_analyzed = $7
            WHERE student_anonymized_id = $1 AND meal_date > $2 AND meal_date <= $3
              AND expires_at > $8
            "#,
        )
        .bind(id.as_str())
        .bind(from)
        .bind(to)
        .bind(snapshot.is_anomaly)
        .bind(snapshot.anomaly_score)
        .bind(snapshot.reason.as_str())
        .bind(snapshot.last_analyzed)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_check_in_if_clear(
        &self,
        check_in: &CheckIn,
        now: DateTime<Utc>,
    ) -> Result<CheckInGate, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent gates for one student until commit.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(check_in.student_anonymized_id.as_str())
            .execute(&mut *tx)
            .await?;

        let latest: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT next_allowed_check_in
            FROM meal_pulse.check_ins
            WHERE student_anonymized_id = $1 AND delivery_status <> 'failed'
            ORDER BY created_at DESC, next_allowed_check_in DESC
            LIMIT 1
            "#,
        )
        .bind(check_in.student_anonymized_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(next_allowed) = latest.filter(|next_allowed| *next_allowed > now) {
            tx.rollback().await?;
            return Ok(CheckInGate::Blocked { next_allowed });
        }

        insert_check_in_query(check_in).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(CheckInGate::Inserted)
    }

    async fn insert_check_in(&self, check_in: &CheckIn) -> Result<(), StoreError> {
        insert_check_in_query(check_in).execute(&self.pool).await?;
        Ok(())
    }

    async fn find_check_in(&self, id: Uuid) -> Result<Option<CheckIn>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CHECK_IN_COLUMNS} FROM meal_pulse.check_ins WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(check_in_from_row).transpose()
    }

    async fn transition_delivery(
        &self,
        id: Uuid,
        from: DeliveryStatus,
        to: DeliveryStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE meal_pulse.check_ins
            SET delivery_status = $3,
                sent_at = CASE WHEN $3 = 'sent' THEN $4 ELSE sent_at END,
                delivered_at = CASE WHEN $3 = 'delivered' THEN $4 ELSE delivered_at END
            WHERE id = $1 AND delivery_status = $2
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_response(
        &self,
        id: Uuid,
        response: &CheckInResponse,
        follow_up: ResponseFollowUp<'_>,
    ) -> Result<bool, StoreError> {
        let back_off = match follow_up {
            ResponseFollowUp::BackOff(cooldown) => Some(cooldown),
            _ => None,
        };
        let mut tx = self.pool.begin().await?;

        let recorded = sqlx::query(
            r#"
            UPDATE meal_pulse.check_ins
            SET response_received = $2, response_type = $3, response_text = $4, responded_at = $5,
                next_allowed_check_in = COALESCE($6, next_allowed_check_in),
                cooldown_reason = COALESCE($7, cooldown_reason)
            WHERE id = $1 AND NOT response_received
            "#,
        )
        .bind(id)
        .bind(response.received)
        .bind(response.response_type.map(|kind| kind.as_str()))
        .bind(response.response_text.as_deref())
        .bind(response.responded_at)
        .bind(back_off.map(|cooldown| cooldown.next_allowed_check_in))
        .bind(back_off.map(|cooldown| cooldown.reason.as_str()))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if recorded == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        if let ResponseFollowUp::Escalate(escalation) = follow_up {
            insert_check_in_query(escalation).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn recent_check_ins(
        &self,
        id: &AnonymizedId,
        limit: usize,
    ) -> Result<Vec<CheckIn>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CHECK_IN_COLUMNS} FROM meal_pulse.check_ins \
             WHERE student_anonymized_id = $1 ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(id.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(check_in_from_row).collect()
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeReport, StoreError> {
        let mut tx = self.pool.begin().await?;

        let check_ins = sqlx::query(
            r#"
            DELETE FROM meal_pulse.check_ins c
            USING meal_pulse.students s
            WHERE c.student_anonymized_id = s.anonymized_id AND s.data_expiry_date <= $1
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let attendance = sqlx::query(
            r#"
            DELETE FROM meal_pulse.meal_attendance a
            WHERE a.expires_at <= $1
               OR EXISTS (
                   SELECT 1 FROM meal_pulse.students s
                   WHERE s.anonymized_id = a.student_anonymized_id AND s.data_expiry_date <= $1
               )
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let students = sqlx::query("DELETE FROM meal_pulse.students WHERE data_expiry_date <= $1")
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(PurgeReport {
            students,
            attendance,
            check_ins,
        })
    }
}

/// Demo identities: steady, a missed-dinner streak, and a shifted routine.
const DEMO_STUDENTS: [(&str, &str, &str); 3] = [
    ("GS-1001", "2025", "Biology"),
    ("GS-1002", "2026", "Economics"),
    ("GS-1003", "2024", "History"),
];

const SEED_DAYS: i64 = 45;

fn demo_meals(profile: usize, today: NaiveDate) -> Vec<MealInput> {
    let mut meals = Vec::new();
    for days_ago in (0..SEED_DAYS).rev() {
        let date = today - Duration::days(days_ago);
        let weekend = matches!(date.weekday(), Weekday::Sat | Weekday::Sun);
        for meal_type in MealType::ALL {
            let attended = match (profile, meal_type) {
                // Steady: skips weekend breakfast.
                (0, MealType::Breakfast) => !weekend,
                (0, _) => true,
                // Dinner-only plan, last five dinners missed.
                (1, MealType::Dinner) => days_ago >= 5,
                (1, _) => continue,
                // Used to eat early, now only turns up for dinner.
                (_, MealType::Dinner) => days_ago < 14,
                (_, _) => days_ago >= 14,
            };
            meals.push(MealInput {
                date,
                meal_type,
                attended,
                timestamp: None,
            });
        }
    }
    meals
}

/// Ingest 45 days of demo history for three students through the service.
pub async fn seed(pulse: &MealPulse) -> anyhow::Result<usize> {
    let today = Utc::now().date_naive();
    let mut ingested = 0usize;

    for (profile, (college_id, year, department)) in DEMO_STUDENTS.into_iter().enumerate() {
        let key = StudentKey {
            college_token: pulse.mint_college_token(college_id),
            college_id: college_id.to_string(),
            enrollment_year: Some(year.to_string()),
            department: Some(department.to_string()),
        };
        let meals = demo_meals(profile, today);
        ingested += ingest_in_batches(pulse, &key, meals, "seed").await?;
    }

    Ok(ingested)
}

/// Import a college dining export. Rows are grouped per identity and system
/// and ingested in batches, oldest first.
pub async fn import_csv(pulse: &MealPulse, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        college_id: String,
        enrollment_year: Option<String>,
        department: Option<String>,
        date: NaiveDate,
        meal_type: MealType,
        attended: bool,
        timestamp: Option<DateTime<Utc>>,
        college_system: String,
    }

    type GroupKey = (String, Option<String>, Option<String>, String);

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut order: Vec<GroupKey> = Vec::new();
    let mut groups: HashMap<GroupKey, Vec<MealInput>> = HashMap::new();

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("invalid row {}", line + 2))?;
        let key = (row.college_id, row.enrollment_year, row.department, row.college_system);
        let meals = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            Vec::new()
        });
        meals.push(MealInput {
            date: row.date,
            meal_type: row.meal_type,
            attended: row.attended,
            timestamp: row.timestamp,
        });
    }

    let mut ingested = 0usize;
    for key in order {
        let Some(mut meals) = groups.remove(&key) else {
            continue;
        };
        meals.sort_by_key(|meal| (meal.date, meal.meal_type.slot()));
        let (college_id, enrollment_year, department, college_system) = key;
        let student = StudentKey {
            college_token: pulse.mint_college_token(&college_id),
            college_id,
            enrollment_year,
            department,
        };
        ingested += ingest_in_batches(pulse, &student, meals, &college_system).await?;
    }

    Ok(ingested)
}

async fn ingest_in_batches(
    pulse: &MealPulse,
    key: &StudentKey,
    meals: Vec<MealInput>,
    college_system: &str,
) -> anyhow::Result<usize> {
    let batch_size = pulse.config().max_batch_size.max(1);
    let mut ingested = 0usize;

    for chunk in meals.chunks(batch_size) {
        let outcome = pulse
            .ingest_batch(BatchIngestRequest {
                student: key.clone(),
                meal_data: chunk.to_vec(),
                source: SourceInput {
                    college_system: college_system.to_string(),
                    sync_timestamp: None,
                },
            })
            .await?;
        ingested += chunk.len();
        info!(
            anonymized_id = %outcome.anonymized_id,
            records = chunk.len(),
            reason = %outcome.pattern_analysis.reason,
            check_in_triggered = outcome.check_in_triggered,
            "batch ingested"
        );
    }

    Ok(ingested)
}
