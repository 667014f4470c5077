//! Persistence boundary for students, attendance and check-ins.
//!
//! Every read filters out records past their expiry, so expired data is
//! unreachable before the purge sweep physically removes it.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    AnalysisSnapshot, AnonymizedId, BaselinePattern, CheckIn, CheckInResponse, Cooldown,
    DeliveryStatus, MealAttendance, MealType, PrivacySettings, PurgeReport, Student,
};

/// Result of the atomic cooldown-guarded check-in insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckInGate {
    Inserted,
    Blocked { next_allowed: DateTime<Utc> },
}

/// Write committed together with a check-in response.
#[derive(Debug, Clone, Copy)]
pub enum ResponseFollowUp<'a> {
    None,
    /// Replace the answered check-in's cooldown.
    BackOff(&'a Cooldown),
    /// Insert a new check-in, bypassing the cooldown gate.
    Escalate(&'a CheckIn),
}

#[async_trait]
pub trait PulseStore: Send + Sync {
    /// Live student by pseudonym.
    async fn find_student(
        &self,
        id: &AnonymizedId,
        now: DateTime<Utc>,
    ) -> Result<Option<Student>, StoreError>;

    /// Insert a new student, or refresh the college token of the live one.
    /// An expired record is replaced and its history dropped. Returns the
    /// stored record.
    async fn upsert_student(
        &self,
        student: &Student,
        now: DateTime<Utc>,
    ) -> Result<Student, StoreError>;

    /// Persist privacy settings and the new expiry; caps attendance expiry at
    /// it. Returns false when the student does not exist.
    async fn save_privacy(
        &self,
        id: &AnonymizedId,
        settings: &PrivacySettings,
        data_expiry_date: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn save_baseline(
        &self,
        id: &AnonymizedId,
        baseline: &BaselinePattern,
    ) -> Result<(), StoreError>;

    /// Upsert observations keyed by (student, date, meal type).
    async fn insert_attendance(&self, records: &[MealAttendance]) -> Result<u64, StoreError>;

    /// Live attendance with `from < date <= to`, oldest first.
    async fn attendance_between(
        &self,
        id: &AnonymizedId,
        from: NaiveDate,
        to: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Vec<MealAttendance>, StoreError>;

    /// Cache an analysis verdict on live attendance with `from < date <= to`.
    async fn annotate_attendance(
        &self,
        id: &AnonymizedId,
        from: NaiveDate,
        to: NaiveDate,
        snapshot: &AnalysisSnapshot,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Insert unless the student's most recent cooldown-holding check-in has
    /// `next_allowed_check_in > now`. Check and insert are one atomic step.
    async fn insert_check_in_if_clear(
        &self,
        check_in: &CheckIn,
        now: DateTime<Utc>,
    ) -> Result<CheckInGate, StoreError>;

    /// Unconditional insert.
    async fn insert_check_in(&self, check_in: &CheckIn) -> Result<(), StoreError>;

    async fn find_check_in(&self, id: Uuid) -> Result<Option<CheckIn>, StoreError>;

    /// Move delivery status `from -> to`, stamping `at`. Returns false when the
    /// check-in is not currently in `from`.
    async fn transition_delivery(
        &self,
        id: Uuid,
        from: DeliveryStatus,
        to: DeliveryStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Record a response unless one was already received, applying
    /// `follow_up` in the same atomic step. Returns false, writing nothing,
    /// when the check-in is unknown or already answered.
    async fn record_response(
        &self,
        id: Uuid,
        response: &CheckInResponse,
        follow_up: ResponseFollowUp<'_>,
    ) -> Result<bool, StoreError>;

    /// Newest first.
    async fn recent_check_ins(
        &self,
        id: &AnonymizedId,
        limit: usize,
    ) -> Result<Vec<CheckIn>, StoreError>;

    /// Delete expired students (with their check-ins and attendance) and
    /// expired attendance.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeReport, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    students: HashMap<AnonymizedId, Student>,
    attendance: HashMap<Uuid, MealAttendance>,
    /// (student, date, meal type) -> attendance id.
    attendance_slots: HashMap<(AnonymizedId, NaiveDate, MealType), Uuid>,
    check_ins: HashMap<Uuid, CheckIn>,
}

impl MemoryState {
    fn drop_orphaned_slots(&mut self) {
        let MemoryState {
            attendance,
            attendance_slots,
            ..
        } = self;
        attendance_slots.retain(|_, record_id| attendance.contains_key(record_id));
    }
}

/// In-process store backed by maps under one async lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PulseStore for MemoryStore {
    async fn find_student(
        &self,
        id: &AnonymizedId,
        now: DateTime<Utc>,
    ) -> Result<Option<Student>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .students
            .get(id)
            .filter(|student| student.data_expiry_date > now)
            .cloned())
    }

    async fn upsert_student(
        &self,
        student: &Student,
        now: DateTime<Utc>,
    ) -> Result<Student, StoreError> {
        let mut state = self.state.write().await;
        let id = &student.anonymized_id;
        if let Some(existing) = state.students.get_mut(id) {
            if existing.data_expiry_date > now {
                existing.college_token = student.college_token.clone();
                return Ok(existing.clone());
            }
        }

        // Expired identities start over without their old history.
        state.check_ins.retain(|_, check_in| &check_in.student_anonymized_id != id);
        state.attendance.retain(|_, record| &record.student_anonymized_id != id);
        state.drop_orphaned_slots();
        state.students.insert(id.clone(), student.clone());
        Ok(student.clone())
    }

    async fn save_privacy(
        &self,
        id: &AnonymizedId,
        settings: &PrivacySettings,
        data_expiry_date: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let Some(student) = state.students.get_mut(id) else {
            return Ok(false);
        };
        student.privacy_settings = settings.clone();
        student.data_expiry_date = data_expiry_date;

        for record in state
            .attendance
            .values_mut()
            .filter(|record| &record.student_anonymized_id == id)
        {
            record.expires_at = record.expires_at.min(data_expiry_date);
        }
        Ok(true)
    }

    async fn save_baseline(
        &self,
        id: &AnonymizedId,
        baseline: &BaselinePattern,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if let Some(student) = state.students.get_mut(id) {
            student.baseline_pattern = baseline.clone();
        }
        Ok(())
    }

    async fn insert_attendance(&self, records: &[MealAttendance]) -> Result<u64, StoreError> {
        let mut state = self.state.write().await;
        let MemoryState {
            attendance,
            attendance_slots,
            ..
        } = &mut *state;
        for record in records {
            let slot = (
                record.student_anonymized_id.clone(),
                record.meal_data.date,
                record.meal_data.meal_type,
            );
            match attendance_slots.get(&slot).and_then(|id| attendance.get_mut(id)) {
                Some(stored) => {
                    stored.meal_data = record.meal_data.clone();
                    stored.source = record.source.clone();
                }
                None => {
                    attendance_slots.insert(slot, record.id);
                    attendance.insert(record.id, record.clone());
                }
            }
        }
        Ok(records.len() as u64)
    }

    async fn attendance_between(
        &self,
        id: &AnonymizedId,
        from: NaiveDate,
        to: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Vec<MealAttendance>, StoreError> {
        let state = self.state.read().await;
        let mut records: Vec<MealAttendance> = state
            .attendance
            .values()
            .filter(|record| {
                &record.student_anonymized_id == id
                    && record.expires_at > now
                    && record.meal_data.date > from
                    && record.meal_data.date <= to
            })
            .cloned()
            .collect();
        records.sort_by_key(|record| (record.meal_data.date, record.meal_data.meal_type.slot()));
        Ok(records)
    }

    async fn annotate_attendance(
        &self,
        id: &AnonymizedId,
        from: NaiveDate,
        to: NaiveDate,
        snapshot: &AnalysisSnapshot,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.write().await;
        let mut touched = 0;
        for record in state.attendance.values_mut().filter(|record| {
            &record.student_anonymized_id == id
                && record.expires_at > now
                && record.meal_data.date > from
                && record.meal_data.date <= to
        }) {
            record.pattern_analysis = Some(snapshot.clone());
            touched += 1;
        }
        Ok(touched)
    }

    async fn insert_check_in_if_clear(
        &self,
        check_in: &CheckIn,
        now: DateTime<Utc>,
    ) -> Result<CheckInGate, StoreError> {
        let mut state = self.state.write().await;
        let latest = state
            .check_ins
            .values()
            .filter(|existing| {
                existing.student_anonymized_id == check_in.student_anonymized_id
                    && existing.delivery.status.holds_cooldown()
            })
            .max_by_key(|existing| (existing.created_at, existing.cooldown.next_allowed_check_in))
            .map(|existing| existing.cooldown.next_allowed_check_in);

        if let Some(next_allowed) = latest.filter(|next_allowed| *next_allowed > now) {
            return Ok(CheckInGate::Blocked { next_allowed });
        }
        state.check_ins.insert(check_in.id, check_in.clone());
        Ok(CheckInGate::Inserted)
    }

    async fn insert_check_in(&self, check_in: &CheckIn) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.check_ins.insert(check_in.id, check_in.clone());
        Ok(())
    }

    async fn find_check_in(&self, id: Uuid) -> Result<Option<CheckIn>, StoreError> {
        let state = self.state.read().await;
        Ok(state.check_ins.get(&id).cloned())
    }

    async fn transition_delivery(
        &self,
        id: Uuid,
        from: DeliveryStatus,
        to: DeliveryStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let Some(check_in) = state
            .check_ins
            .get_mut(&id)
            .filter(|check_in| check_in.delivery.status == from)
        else {
            return Ok(false);
        };

        check_in.delivery.status = to;
        match to {
            DeliveryStatus::Sent => check_in.delivery.sent_at = Some(at),
            DeliveryStatus::Delivered => check_in.delivery.delivered_at = Some(at),
            DeliveryStatus::Pending | DeliveryStatus::Failed => {}
        }
        Ok(true)
    }

    async fn record_response(
        &self,
        id: Uuid,
        response: &CheckInResponse,
        follow_up: ResponseFollowUp<'_>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.check_ins.get_mut(&id) {
            Some(check_in) if !check_in.response.received => {
                check_in.response = response.clone();
                if let ResponseFollowUp::BackOff(cooldown) = follow_up {
                    check_in.cooldown = cooldown.clone();
                }
            }
            _ => return Ok(false),
        }
        if let ResponseFollowUp::Escalate(escalation) = follow_up {
            state.check_ins.insert(escalation.id, escalation.clone());
        }
        Ok(true)
    }

    async fn recent_check_ins(
        &self,
        id: &AnonymizedId,
        limit: usize,
    ) -> Result<Vec<CheckIn>, StoreError> {
        let state = self.state.read().await;
        let mut check_ins: Vec<CheckIn> = state
            .check_ins
            .values()
            .filter(|check_in| &check_in.student_anonymized_id == id)
            .cloned()
            .collect();
        check_ins.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        check_ins.truncate(limit);
        Ok(check_ins)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeReport, StoreError> {
        let mut state = self.state.write().await;
        let expired: Vec<AnonymizedId> = state
            .students
            .values()
            .filter(|student| student.data_expiry_date <= now)
            .map(|student| student.anonymized_id.clone())
            .collect();

        let mut report = PurgeReport::default();
        for id in &expired {
            state.students.remove(id);
            report.students += 1;
        }

        let check_ins_before = state.check_ins.len();
        state
            .check_ins
            .retain(|_, check_in| !expired.contains(&check_in.student_anonymized_id));
        report.check_ins = (check_ins_before - state.check_ins.len()) as u64;

        let attendance_before = state.attendance.len();
        state.attendance.retain(|_, record| {
            record.expires_at > now && !expired.contains(&record.student_anonymized_id)
        });
        report.attendance = (attendance_before - state.attendance.len()) as u64;
        state.drop_orphaned_slots();

        Ok(report)
    }
}
