use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;

use meal_pulse::delivery::{DeliveryReceipt, Notifier};
use meal_pulse::models::{
    AnalysisReason, AnonymizedId, CheckInType, CooldownReason, DeliveryMethod, DeliveryStatus,
    MealType, PrivacyUpdate, Priority, ResponseType, SkipReason,
};
use meal_pulse::service::{BatchIngestRequest, IngestOutcome, MealInput, SourceInput, StudentKey};
use meal_pulse::{
    Anonymizer, Clock, DeliveryError, DeliveryQueue, ManualClock, MealPulse, MemoryStore,
    MessageComposer, PulseConfig, PulseError, PulseStore, ResponseEffect, TriggerOutcome,
};

#[derive(Default)]
struct RecordingNotifier {
    messages: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    fn count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn method(&self) -> DeliveryMethod {
        DeliveryMethod::Push
    }

    async fn deliver(
        &self,
        message: &str,
        recipient_token: &str,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        self.messages
            .lock()
            .unwrap()
            .push((recipient_token.to_string(), message.to_string()));
        Ok(DeliveryReceipt { confirmed: true })
    }
}

struct World {
    pulse: MealPulse,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    notifier: Arc<RecordingNotifier>,
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 20, 21, 0, 0).unwrap()
}

fn world(config: PulseConfig) -> World {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(start()));
    let notifier = Arc::new(RecordingNotifier::default());
    let pulse = MealPulse::new(
        Anonymizer::new("scenario-secret-0123456789").unwrap(),
        store.clone(),
        notifier.clone(),
        clock.clone(),
        MessageComposer::seeded(2026),
        config,
    );
    World {
        pulse,
        store,
        clock,
        notifier,
    }
}

fn config_with_threshold(threshold: f64) -> PulseConfig {
    let mut config = PulseConfig::default();
    config.detection.threshold = threshold;
    config
}

fn meal(world: &World, days_ago: i64, meal_type: MealType, attended: bool) -> MealInput {
    MealInput {
        date: world.clock_today() - Duration::days(days_ago),
        meal_type,
        attended,
        timestamp: None,
    }
}

impl World {
    fn clock_today(&self) -> chrono::NaiveDate {
        self.clock.now().date_naive()
    }

    async fn ingest(&self, college_id: &str, meals: Vec<MealInput>) -> IngestOutcome {
        self.try_ingest(college_id, meals).await.unwrap()
    }

    async fn try_ingest(
        &self,
        college_id: &str,
        meals: Vec<MealInput>,
    ) -> Result<IngestOutcome, PulseError> {
        self.pulse
            .ingest_batch(BatchIngestRequest {
                student: StudentKey {
                    college_token: self.pulse.mint_college_token(college_id),
                    college_id: college_id.to_string(),
                    enrollment_year: Some("2025".to_string()),
                    department: None,
                },
                meal_data: meals,
                source: SourceInput {
                    college_system: "dining-hub".to_string(),
                    sync_timestamp: None,
                },
            })
            .await
    }
}

/// Ten dinners, the last three missed.
fn three_missed_dinners(world: &World) -> Vec<MealInput> {
    (0..10)
        .rev()
        .map(|days_ago| meal(world, days_ago, MealType::Dinner, days_ago >= 3))
        .collect()
}

/// Five dinners in a row missed on top of a month of steady dinners.
fn long_streak(world: &World) -> Vec<MealInput> {
    let mut meals: Vec<MealInput> = (14..44)
        .rev()
        .map(|days_ago| meal(world, days_ago, MealType::Dinner, true))
        .collect();
    meals.extend((0..14).rev().map(|days_ago| meal(world, days_ago, MealType::Dinner, days_ago >= 5)));
    meals
}

/// Baseline 18 of 21 meals attended, recent 9 of 18, with no run of misses
/// longer than one and an unchanged meal mix.
fn halved_attendance(world: &World) -> Vec<MealInput> {
    let mut meals = Vec::new();
    for (offset, days_ago) in (20..27).rev().enumerate() {
        for meal_type in MealType::ALL {
            let missed = meal_type.slot() == offset % 3 && offset < 3;
            meals.push(meal(world, days_ago, meal_type, !missed));
        }
    }
    for days_ago in (0..6).rev() {
        for meal_type in MealType::ALL {
            let attended = if days_ago % 2 == 0 {
                meal_type != MealType::Lunch
            } else {
                meal_type == MealType::Lunch
            };
            meals.push(meal(world, days_ago, meal_type, attended));
        }
    }
    meals
}

#[tokio::test]
async fn three_missed_dinners_trigger_a_meal_concern() {
    let world = world(config_with_threshold(0.6));
    let outcome = world.ingest("S-100", three_missed_dinners(&world)).await;

    assert!(outcome.pattern_analysis.is_anomaly);
    assert_eq!(outcome.pattern_analysis.reason, AnalysisReason::MissedConsecutive);
    assert!(outcome.pattern_analysis.score >= 0.6);
    assert!(outcome.check_in_triggered);

    let check_ins = world.store.recent_check_ins(&outcome.anonymized_id, 5).await.unwrap();
    assert_eq!(check_ins.len(), 1);
    assert_eq!(check_ins[0].check_in_data.check_in_type, CheckInType::MealConcern);
    assert_eq!(check_ins[0].delivery.status, DeliveryStatus::Delivered);
    assert!(check_ins[0].check_in_data.message.contains("missed 3 meals in a row"));
    assert_eq!(world.notifier.count(), 1);
}

#[tokio::test]
async fn three_missed_dinners_stay_quiet_at_the_default_threshold() {
    let world = world(PulseConfig::default());
    let outcome = world.ingest("S-100", three_missed_dinners(&world)).await;

    assert!(!outcome.pattern_analysis.is_anomaly);
    assert_eq!(outcome.pattern_analysis.reason, AnalysisReason::None);
    assert!(!outcome.check_in_triggered);
    assert_eq!(world.notifier.count(), 0);
}

#[tokio::test]
async fn frequency_drop_respects_the_threshold_boundary() {
    let strict = world(PulseConfig::default());
    let outcome = strict.ingest("S-200", halved_attendance(&strict)).await;
    assert!(!outcome.pattern_analysis.is_anomaly);
    assert_eq!(outcome.pattern_analysis.reason, AnalysisReason::None);

    let analysis = strict.pulse.analyze(&outcome.anonymized_id).await;
    let details = analysis.details.unwrap();
    let expected = (18.0 / 21.0 - 0.5) / (18.0 / 21.0);
    assert!((details.scores.frequency_drop - expected).abs() < 1e-9);
    assert_eq!(details.longest_miss_run, 1);

    let lenient = world(config_with_threshold(0.4));
    let outcome = lenient.ingest("S-200", halved_attendance(&lenient)).await;
    assert!(outcome.pattern_analysis.is_anomaly);
    assert_eq!(outcome.pattern_analysis.reason, AnalysisReason::FrequencyDrop);
    assert!((outcome.pattern_analysis.score - expected).abs() < 1e-9);
    assert!(outcome.check_in_triggered);
}

#[tokio::test]
async fn second_ingestion_inside_cooldown_is_held_back() {
    let world = world(PulseConfig::default());
    let first = world.ingest("S-300", long_streak(&world)).await;
    assert!(first.check_in_triggered);
    let stored = world.store.recent_check_ins(&first.anonymized_id, 1).await.unwrap();
    let next_allowed = stored[0].cooldown.next_allowed_check_in;
    assert_eq!(next_allowed, start() + Duration::hours(24));

    world.clock.advance(Duration::hours(2));
    let second = world
        .ingest("S-300", vec![meal(&world, 0, MealType::Dinner, false)])
        .await;
    assert!(second.pattern_analysis.is_anomaly);
    assert!(!second.check_in_triggered);

    let analysis = world.pulse.analyze(&first.anonymized_id).await;
    match world
        .pulse
        .orchestrator()
        .trigger_check_in(&first.anonymized_id, &analysis)
        .await
    {
        TriggerOutcome::Skipped {
            reason: SkipReason::CooldownActive,
            next_allowed: Some(at),
        } => assert_eq!(at, next_allowed),
        other => panic!("expected cooldown, got {other:?}"),
    }

    world.clock.set(next_allowed + Duration::minutes(1));
    let third = world
        .ingest("S-300", vec![meal(&world, 0, MealType::Dinner, false)])
        .await;
    assert!(third.check_in_triggered);
    assert_eq!(world.notifier.count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_batches_for_one_student_send_one_check_in() {
    let world = Arc::new(world(PulseConfig::default()));
    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let world = world.clone();
        tasks.spawn(async move { world.ingest("S-350", long_streak(&world)).await });
    }

    let mut triggered = 0;
    let mut ids = Vec::new();
    while let Some(outcome) = tasks.join_next().await {
        let outcome = outcome.unwrap();
        assert!(outcome.pattern_analysis.is_anomaly);
        if outcome.check_in_triggered {
            triggered += 1;
        }
        ids.push(outcome.anonymized_id);
    }
    assert_eq!(triggered, 1);
    ids.dedup();
    assert_eq!(ids.len(), 1);

    let check_ins = world.store.recent_check_ins(&ids[0], 10).await.unwrap();
    assert_eq!(check_ins.len(), 1);
    assert_eq!(world.notifier.count(), 1);
}

#[tokio::test]
async fn needs_help_escalates_with_a_short_cooldown() {
    let world = world(PulseConfig::default());
    let outcome = world.ingest("S-400", long_streak(&world)).await;
    let original = world
        .store
        .recent_check_ins(&outcome.anonymized_id, 1)
        .await
        .unwrap()
        .remove(0);

    world.clock.advance(Duration::minutes(30));
    let responded_at = start() + Duration::minutes(30);
    let response = world
        .pulse
        .respond(
            &outcome.anonymized_id,
            original.id,
            ResponseType::NeedsHelp,
            Some("not great".to_string()),
        )
        .await
        .unwrap();

    let ResponseEffect::Escalated { check_in_id, next_allowed } = response.effect else {
        panic!("expected escalation, got {:?}", response.effect);
    };
    assert!(next_allowed <= responded_at + Duration::hours(2));

    let escalation = world.store.find_check_in(check_in_id).await.unwrap().unwrap();
    assert_eq!(escalation.check_in_data.check_in_type, CheckInType::SupportOffer);
    assert_eq!(escalation.check_in_data.priority, Priority::High);
    assert_eq!(escalation.cooldown.reason, CooldownReason::Escalation);
    assert_eq!(escalation.cooldown.next_allowed_check_in, responded_at + Duration::hours(2));

    let all = world.store.recent_check_ins(&outcome.anonymized_id, 10).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(world.notifier.count(), 2);

    let answered = world.store.find_check_in(original.id).await.unwrap().unwrap();
    assert!(answered.response.received);
    assert_eq!(answered.response.response_type, Some(ResponseType::NeedsHelp));
}

#[tokio::test]
async fn doing_fine_lengthens_the_next_cooldown() {
    let world = world(PulseConfig::default());
    let outcome = world.ingest("S-450", long_streak(&world)).await;
    let original = world
        .store
        .recent_check_ins(&outcome.anonymized_id, 1)
        .await
        .unwrap()
        .remove(0);
    let default_window = original.cooldown.next_allowed_check_in - original.created_at;

    world
        .pulse
        .respond(&outcome.anonymized_id, original.id, ResponseType::DoingFine, None)
        .await
        .unwrap();

    let updated = world.store.find_check_in(original.id).await.unwrap().unwrap();
    let backed_off = updated.cooldown.next_allowed_check_in - updated.created_at;
    assert!(backed_off > default_window);
    assert_eq!(updated.cooldown.reason, CooldownReason::DoingFineBackoff);

    world.clock.advance(Duration::hours(25));
    let again = world
        .ingest("S-450", vec![meal(&world, 0, MealType::Dinner, false)])
        .await;
    assert!(again.pattern_analysis.is_anomaly);
    assert!(!again.check_in_triggered);
}

#[tokio::test]
async fn opted_out_students_never_hear_from_us() {
    let world = world(PulseConfig::default());
    let first = world
        .ingest("S-500", vec![meal(&world, 40, MealType::Dinner, true)])
        .await;
    world
        .pulse
        .update_privacy(
            &first.anonymized_id,
            &PrivacyUpdate {
                opt_out: Some(true),
                ..PrivacyUpdate::default()
            },
        )
        .await
        .unwrap();

    let outcome = world.ingest("S-500", long_streak(&world)).await;
    assert_eq!(outcome.anonymized_id, first.anonymized_id);
    assert!(!outcome.check_in_triggered);
    assert_eq!(outcome.pattern_analysis.reason, AnalysisReason::StudentOptedOut);
    assert_eq!(world.notifier.count(), 0);
    assert!(world
        .store
        .recent_check_ins(&outcome.anonymized_id, 5)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn attendance_and_students_expire() {
    let world = world(PulseConfig::default());
    let outcome = world
        .ingest("S-600", vec![meal(&world, 0, MealType::Lunch, true)])
        .await;
    let id = outcome.anonymized_id;
    let today = world.clock_today();

    world.clock.advance(Duration::days(91));
    let now = world.clock.now();
    let records = world
        .store
        .attendance_between(&id, today - Duration::days(1), today, now)
        .await
        .unwrap();
    assert!(records.is_empty());
    assert!(world.pulse.pattern_report(&id).await.is_ok());

    world
        .pulse
        .update_privacy(
            &id,
            &PrivacyUpdate {
                data_retention_days: Some(10),
                ..PrivacyUpdate::default()
            },
        )
        .await
        .unwrap();
    world.clock.advance(Duration::days(10));
    assert!(matches!(
        world.pulse.pattern_report(&id).await,
        Err(PulseError::NotFound(_))
    ));

    let purged = world.pulse.purge().await.unwrap();
    assert_eq!(purged.students, 1);
    assert_eq!(purged.attendance, 1);
}

#[tokio::test]
async fn anonymized_ids_are_stable_and_distinct() {
    let world = world(PulseConfig::default());
    let a = world
        .ingest("S-700", vec![meal(&world, 0, MealType::Lunch, true)])
        .await;
    let b = world
        .ingest("S-700", vec![meal(&world, 1, MealType::Lunch, true)])
        .await;
    let c = world
        .ingest("S-701", vec![meal(&world, 0, MealType::Lunch, true)])
        .await;

    assert_eq!(a.anonymized_id, b.anonymized_id);
    assert_ne!(a.anonymized_id, c.anonymized_id);
    assert!(AnonymizedId::parse(a.anonymized_id.as_str()).is_ok());
}

#[tokio::test]
async fn queued_deliveries_drain_on_shutdown() {
    let World {
        pulse,
        store,
        notifier,
        ..
    } = world(PulseConfig::default());
    let (queue, worker) = DeliveryQueue::spawn(pulse.courier(), 16);
    let pulse = pulse.with_delivery_queue(queue);

    let key = |college_id: &str| StudentKey {
        college_token: pulse.mint_college_token(college_id),
        college_id: college_id.to_string(),
        enrollment_year: None,
        department: None,
    };
    let today = start().date_naive();
    let mut meals: Vec<MealInput> = (14..44)
        .rev()
        .map(|days_ago| MealInput {
            date: today - Duration::days(days_ago),
            meal_type: MealType::Dinner,
            attended: true,
            timestamp: None,
        })
        .collect();
    meals.extend((0..14).rev().map(|days_ago| MealInput {
        date: today - Duration::days(days_ago),
        meal_type: MealType::Dinner,
        attended: days_ago >= 5,
        timestamp: None,
    }));

    let outcome = pulse
        .ingest_batch(BatchIngestRequest {
            student: key("S-800"),
            meal_data: meals,
            source: SourceInput {
                college_system: "dining-hub".to_string(),
                sync_timestamp: None,
            },
        })
        .await
        .unwrap();
    assert!(outcome.check_in_triggered);

    drop(pulse);
    assert_eq!(worker.shutdown().await, 1);
    assert_eq!(notifier.count(), 1);

    let check_ins = store.recent_check_ins(&outcome.anonymized_id, 1).await.unwrap();
    assert_eq!(check_ins[0].delivery.status, DeliveryStatus::Delivered);
}
