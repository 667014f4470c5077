//! Check-in orchestration.
//!
//! A check-in moves `pending -> sent -> delivered` (or `failed`) and may later
//! carry a response. Before any new check-in the privacy and cooldown gates
//! must pass; the cooldown gate is the store's atomic conditional insert.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{CheckInConfig, MAX_RETENTION_DAYS};
use crate::delivery::{Courier, DeliveryQueue};
use crate::error::PulseError;
use crate::messages::MessageComposer;
use crate::models::{
    AnalysisReason, AnonymizedId, CheckIn, CheckInData, CheckInResponse, CheckInType, Cooldown,
    CooldownReason, Delivery, DeliveryStatus, PatternAnalysis, Priority, PrivacySettings,
    PrivacyUpdate, ResponseType, SkipReason, Tone,
};
use crate::store::{CheckInGate, PulseStore, ResponseFollowUp};

const MAX_RESPONSE_TEXT: usize = 2_000;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Triggered {
        #[serde(rename = "checkIn")]
        check_in: CheckIn,
        #[serde(rename = "deliveryStatus")]
        delivery_status: DeliveryStatus,
    },
    Skipped {
        reason: SkipReason,
        #[serde(rename = "nextAllowed", skip_serializing_if = "Option::is_none")]
        next_allowed: Option<DateTime<Utc>>,
    },
}

impl TriggerOutcome {
    fn skipped(reason: SkipReason) -> Self {
        TriggerOutcome::Skipped {
            reason,
            next_allowed: None,
        }
    }

    pub fn is_triggered(&self) -> bool {
        matches!(self, TriggerOutcome::Triggered { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum ResponseEffect {
    None,
    Escalated {
        #[serde(rename = "checkInId")]
        check_in_id: Uuid,
        #[serde(rename = "nextAllowed")]
        next_allowed: DateTime<Utc>,
    },
    BackedOff {
        #[serde(rename = "nextAllowed")]
        next_allowed: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseOutcome {
    pub check_in_id: Uuid,
    pub response_type: ResponseType,
    pub effect: ResponseEffect,
}

/// Check-in type for the reason behind an anomaly.
pub fn classify_type(reason: AnalysisReason) -> CheckInType {
    match reason {
        AnalysisReason::MissedConsecutive | AnalysisReason::FrequencyDrop => CheckInType::MealConcern,
        AnalysisReason::PatternChange => CheckInType::WellnessCheck,
        _ => CheckInType::SupportOffer,
    }
}

/// Tone and priority for an anomaly score. Higher concern gets gentler words.
pub fn classify_tone(score: f64) -> (Tone, Priority) {
    if score >= 0.8 {
        (Tone::Gentle, Priority::High)
    } else if score >= 0.6 {
        (Tone::Supportive, Priority::Medium)
    } else {
        (Tone::Encouraging, Priority::Low)
    }
}

pub struct CheckInOrchestrator {
    store: Arc<dyn PulseStore>,
    courier: Arc<Courier>,
    queue: Option<DeliveryQueue>,
    clock: Arc<dyn Clock>,
    composer: MessageComposer,
    config: CheckInConfig,
}

impl CheckInOrchestrator {
    pub fn new(
        store: Arc<dyn PulseStore>,
        courier: Arc<Courier>,
        clock: Arc<dyn Clock>,
        composer: MessageComposer,
        config: CheckInConfig,
    ) -> Self {
        Self {
            store,
            courier,
            queue: None,
            clock,
            composer,
            config,
        }
    }

    /// Hand deliveries to a background queue instead of sending inline.
    pub fn with_queue(mut self, queue: DeliveryQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn config(&self) -> &CheckInConfig {
        &self.config
    }

    pub async fn trigger_check_in(
        &self,
        id: &AnonymizedId,
        analysis: &PatternAnalysis,
    ) -> TriggerOutcome {
        if !analysis.is_anomaly {
            return TriggerOutcome::skipped(SkipReason::NoAnomaly);
        }

        let now = self.clock.now();
        let student = match self.store.find_student(id, now).await {
            Ok(Some(student)) => student,
            Ok(None) => return TriggerOutcome::skipped(SkipReason::UnknownStudent),
            Err(e) => {
                warn!(anonymized_id = %id, error = %e, "could not load student for check-in");
                return TriggerOutcome::skipped(SkipReason::StoreUnavailable);
            }
        };
        if !student.privacy_settings.permits_check_ins() {
            debug!(anonymized_id = %id, "check-in suppressed by privacy settings");
            return TriggerOutcome::skipped(SkipReason::StudentOptedOut);
        }

        let check_in_type = classify_type(analysis.reason);
        let (tone, priority) = classify_tone(analysis.score);
        let message =
            self.composer
                .compose(check_in_type, tone, analysis.reason, analysis.details.as_ref());
        let check_in = self.new_check_in(
            id,
            CheckInData {
                check_in_type,
                message,
                tone,
                priority,
            },
            Cooldown {
                next_allowed_check_in: now + Duration::hours(self.config.cooldown_hours),
                reason: CooldownReason::Standard,
            },
            now,
        );

        match self.store.insert_check_in_if_clear(&check_in, now).await {
            Ok(CheckInGate::Inserted) => {}
            Ok(CheckInGate::Blocked { next_allowed }) => {
                debug!(anonymized_id = %id, %next_allowed, "check-in held back by cooldown");
                return TriggerOutcome::Skipped {
                    reason: SkipReason::CooldownActive,
                    next_allowed: Some(next_allowed),
                };
            }
            Err(e) => {
                warn!(anonymized_id = %id, error = %e, "could not persist check-in");
                return TriggerOutcome::skipped(SkipReason::StoreUnavailable);
            }
        }

        info!(
            anonymized_id = %id,
            check_in_id = %check_in.id,
            check_in_type = %check_in_type,
            tone = %tone,
            "check-in created"
        );
        let delivery_status = self.send_check_in(&check_in).await;
        TriggerOutcome::Triggered {
            check_in,
            delivery_status,
        }
    }

    /// Hand a check-in to delivery. Failures are recorded, never returned.
    pub async fn send_check_in(&self, check_in: &CheckIn) -> DeliveryStatus {
        match &self.queue {
            Some(queue) => {
                if queue.enqueue(check_in.clone()) {
                    DeliveryStatus::Pending
                } else {
                    self.courier.cancel(check_in.id).await;
                    DeliveryStatus::Failed
                }
            }
            None => self.courier.send(check_in).await,
        }
    }

    pub async fn confirm_delivery(&self, check_in_id: Uuid) -> bool {
        self.courier.confirm(check_in_id).await
    }

    pub async fn cancel_delivery(&self, check_in_id: Uuid) -> bool {
        self.courier.cancel(check_in_id).await
    }

    pub async fn find_check_in(&self, check_in_id: Uuid) -> Result<CheckIn, PulseError> {
        self.store
            .find_check_in(check_in_id)
            .await?
            .ok_or_else(|| PulseError::NotFound(format!("check-in {check_in_id}")))
    }

    pub async fn handle_check_in_response(
        &self,
        check_in_id: Uuid,
        response_type: ResponseType,
        response_text: Option<String>,
    ) -> Result<ResponseOutcome, PulseError> {
        if response_text
            .as_ref()
            .is_some_and(|text| text.chars().count() > MAX_RESPONSE_TEXT)
        {
            return Err(PulseError::Validation(format!(
                "response text longer than {MAX_RESPONSE_TEXT} characters"
            )));
        }

        let check_in = self.find_check_in(check_in_id).await?;
        let now = self.clock.now();
        let response = CheckInResponse {
            received: response_type != ResponseType::NoResponse,
            response_type: Some(response_type),
            response_text,
            responded_at: Some(now),
        };

        let effect = match response_type {
            ResponseType::NeedsHelp => {
                let escalation = self.escalation_for(&check_in.student_anonymized_id, now).await?;
                let follow_up = escalation
                    .as_ref()
                    .map_or(ResponseFollowUp::None, ResponseFollowUp::Escalate);
                self.record_response(check_in_id, &response, follow_up).await?;
                match escalation {
                    Some(escalation) => {
                        info!(
                            anonymized_id = %escalation.student_anonymized_id,
                            check_in_id = %escalation.id,
                            "needs_help escalated"
                        );
                        self.send_check_in(&escalation).await;
                        ResponseEffect::Escalated {
                            check_in_id: escalation.id,
                            next_allowed: escalation.cooldown.next_allowed_check_in,
                        }
                    }
                    None => ResponseEffect::None,
                }
            }
            ResponseType::DoingFine => {
                let window = self.config.cooldown_hours as f64 * self.config.doing_fine_backoff;
                let cooldown = Cooldown {
                    next_allowed_check_in: check_in.created_at
                        + Duration::seconds((window * 3600.0).round() as i64),
                    reason: CooldownReason::DoingFineBackoff,
                };
                self.record_response(check_in_id, &response, ResponseFollowUp::BackOff(&cooldown))
                    .await?;
                ResponseEffect::BackedOff {
                    next_allowed: cooldown.next_allowed_check_in,
                }
            }
            ResponseType::Acknowledged | ResponseType::NoResponse => {
                self.record_response(check_in_id, &response, ResponseFollowUp::None)
                    .await?;
                ResponseEffect::None
            }
        };

        Ok(ResponseOutcome {
            check_in_id,
            response_type,
            effect,
        })
    }

    async fn record_response(
        &self,
        check_in_id: Uuid,
        response: &CheckInResponse,
        follow_up: ResponseFollowUp<'_>,
    ) -> Result<(), PulseError> {
        if !self
            .store
            .record_response(check_in_id, response, follow_up)
            .await?
        {
            return Err(PulseError::Validation(format!(
                "check-in {check_in_id} already has a response"
            )));
        }
        info!(check_in_id = %check_in_id, response_type = ?response.response_type, "check-in response recorded");
        Ok(())
    }

    /// Immediate high-priority support offer with a short cooldown, or `None`
    /// when privacy settings forbid it. Bypasses the cooldown gate.
    async fn escalation_for(
        &self,
        id: &AnonymizedId,
        now: DateTime<Utc>,
    ) -> Result<Option<CheckIn>, PulseError> {
        let permitted = self
            .store
            .find_student(id, now)
            .await?
            .is_some_and(|student| student.privacy_settings.permits_check_ins());
        if !permitted {
            debug!(anonymized_id = %id, "escalation suppressed by privacy settings");
            return Ok(None);
        }

        let tone = Tone::Gentle;
        let message = self
            .composer
            .compose(CheckInType::SupportOffer, tone, AnalysisReason::None, None);
        Ok(Some(self.new_check_in(
            id,
            CheckInData {
                check_in_type: CheckInType::SupportOffer,
                message,
                tone,
                priority: Priority::High,
            },
            Cooldown {
                next_allowed_check_in: now + Duration::hours(self.config.escalation_cooldown_hours),
                reason: CooldownReason::Escalation,
            },
            now,
        )))
    }

    pub async fn update_privacy_preferences(
        &self,
        id: &AnonymizedId,
        update: &PrivacyUpdate,
    ) -> Result<PrivacySettings, PulseError> {
        if let Some(days) = update.data_retention_days {
            if !(1..=MAX_RETENTION_DAYS).contains(&days) {
                return Err(PulseError::Validation(format!(
                    "dataRetentionDays must be between 1 and {MAX_RETENTION_DAYS}"
                )));
            }
        }

        let now = self.clock.now();
        let student = self
            .store
            .find_student(id, now)
            .await?
            .ok_or_else(|| PulseError::NotFound(format!("student {id}")))?;

        let mut settings = student.privacy_settings;
        if let Some(opt_out) = update.opt_out {
            settings.opt_out = opt_out;
            settings.last_opt_out_update = Some(now);
        }
        if let Some(allow) = update.allow_check_ins {
            settings.allow_check_ins = allow;
        }
        if let Some(days) = update.data_retention_days {
            settings.data_retention_days = days;
        }

        let expiry = now + Duration::days(settings.data_retention_days);
        if !self.store.save_privacy(id, &settings, expiry).await? {
            return Err(PulseError::NotFound(format!("student {id}")));
        }
        info!(
            anonymized_id = %id,
            opt_out = settings.opt_out,
            allow_check_ins = settings.allow_check_ins,
            retention_days = settings.data_retention_days,
            "privacy preferences updated"
        );
        Ok(settings)
    }

    fn new_check_in(
        &self,
        id: &AnonymizedId,
        data: CheckInData,
        cooldown: Cooldown,
        now: DateTime<Utc>,
    ) -> CheckIn {
        CheckIn {
            id: Uuid::new_v4(),
            student_anonymized_id: id.clone(),
            check_in_data: data,
            delivery: Delivery {
                status: DeliveryStatus::Pending,
                method: self.courier.method(),
                sent_at: None,
                delivered_at: None,
            },
            response: CheckInResponse::default(),
            cooldown,
            created_at: now,
        }
    }
}
