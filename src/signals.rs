//! Signal analyzers over attendance windows.
//!
//! Each analyzer is a pure function of the recent and baseline windows and
//! returns a score in [0, 1]. A signal is a *candidate* when its own trigger
//! condition holds; only candidates can become the reported anomaly.

use chrono::{Datelike, Timelike};

use crate::config::DetectionConfig;
use crate::models::{AnalysisReason, MealAttendance, MealType, Signal};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalScore {
    pub signal: Signal,
    pub score: f64,
    pub candidate: bool,
}

impl SignalScore {
    pub fn reason(&self) -> AnalysisReason {
        match self.signal {
            Signal::ConsecutiveMisses => AnalysisReason::MissedConsecutive,
            Signal::FrequencyDrop => AnalysisReason::FrequencyDrop,
            Signal::PatternChange | Signal::MealTypeShift => AnalysisReason::PatternChange,
        }
    }
}

/// Coarse time-of-day bucket of an attended meal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeBucket {
    Morning,
    Midday,
    Evening,
    Late,
}

impl TimeBucket {
    const COUNT: usize = 4;

    fn of_hour(hour: u32) -> Self {
        match hour {
            5..=10 => TimeBucket::Morning,
            11..=15 => TimeBucket::Midday,
            16..=21 => TimeBucket::Evening,
            _ => TimeBucket::Late,
        }
    }

    fn index(&self) -> usize {
        match self {
            TimeBucket::Morning => 0,
            TimeBucket::Midday => 1,
            TimeBucket::Evening => 2,
            TimeBucket::Late => 3,
        }
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Longest run of missed meals, in serving order across days.
pub fn longest_miss_run(records: &[MealAttendance]) -> usize {
    let mut ordered: Vec<&MealAttendance> = records.iter().collect();
    ordered.sort_by_key(|record| (record.meal_data.date, record.meal_data.meal_type.slot()));

    let mut longest = 0;
    let mut current = 0;
    for record in ordered {
        if record.meal_data.attended {
            current = 0;
        } else {
            current += 1;
            longest = longest.max(current);
        }
    }
    longest
}

/// Score of a miss run: `min(run / saturation, 1)`.
pub fn miss_run_score(run: usize, saturation: usize) -> f64 {
    clamp_unit(run as f64 / saturation.max(1) as f64)
}

pub fn consecutive_misses(recent: &[MealAttendance], config: &DetectionConfig) -> SignalScore {
    let run = longest_miss_run(recent);
    SignalScore {
        signal: Signal::ConsecutiveMisses,
        score: miss_run_score(run, config.consecutive_miss_saturation),
        candidate: run >= config.consecutive_miss_trigger,
    }
}

/// Fraction of observed meals that were attended.
pub fn attendance_rate(records: &[MealAttendance]) -> Option<f64> {
    if records.is_empty() {
        return None;
    }
    let attended = records.iter().filter(|record| record.meal_data.attended).count();
    Some(attended as f64 / records.len() as f64)
}

pub fn frequency_drop(
    recent: &[MealAttendance],
    baseline: &[MealAttendance],
    config: &DetectionConfig,
) -> SignalScore {
    let drop = match (attendance_rate(recent), attendance_rate(baseline)) {
        (Some(recent_rate), Some(baseline_rate)) if baseline_rate > 0.0 => {
            (baseline_rate - recent_rate) / baseline_rate
        }
        _ => 0.0,
    };
    let score = clamp_unit(drop);
    SignalScore {
        signal: Signal::FrequencyDrop,
        score,
        candidate: score >= config.frequency_drop_trigger,
    }
}

fn normalize(counts: &[f64]) -> Option<Vec<f64>> {
    let total: f64 = counts.iter().sum();
    if total <= 0.0 {
        return None;
    }
    Some(counts.iter().map(|count| count / total).collect())
}

/// Histogram intersection of two distributions; symmetric, in [0, 1].
pub fn similarity(p: &[f64], q: &[f64]) -> f64 {
    clamp_unit(p.iter().zip(q).map(|(a, b)| a.min(*b)).sum())
}

fn meal_type_counts(records: &[MealAttendance]) -> Vec<f64> {
    let mut counts = vec![0.0; MealType::ALL.len()];
    for record in records.iter().filter(|record| record.meal_data.attended) {
        counts[record.meal_data.meal_type.slot()] += 1.0;
    }
    counts
}

fn time_bucket_counts(records: &[MealAttendance]) -> Vec<f64> {
    let mut counts = vec![0.0; TimeBucket::COUNT];
    for record in records.iter().filter(|record| record.meal_data.attended) {
        counts[TimeBucket::of_hour(record.meal_data.timestamp.hour()).index()] += 1.0;
    }
    counts
}

fn weekday_counts(records: &[MealAttendance]) -> Vec<f64> {
    let mut counts = vec![0.0; 7];
    for record in records.iter().filter(|record| record.meal_data.attended) {
        counts[record.meal_data.date.weekday().num_days_from_monday() as usize] += 1.0;
    }
    counts
}

/// Share of attended meals per meal type, `None` when nothing was attended.
pub fn meal_type_shares(records: &[MealAttendance]) -> Option<Vec<f64>> {
    normalize(&meal_type_counts(records))
}

pub fn pattern_change(
    recent: &[MealAttendance],
    baseline: &[MealAttendance],
    config: &DetectionConfig,
) -> SignalScore {
    let dimensions: [fn(&[MealAttendance]) -> Vec<f64>; 3] =
        [meal_type_counts, time_bucket_counts, weekday_counts];

    let mut total = 0.0;
    let mut compared = 0;
    for counts in dimensions {
        if let (Some(p), Some(q)) = (normalize(&counts(recent)), normalize(&counts(baseline))) {
            total += similarity(&p, &q);
            compared += 1;
        }
    }

    let score = if compared == 0 {
        0.0
    } else {
        clamp_unit(1.0 - total / compared as f64)
    };
    SignalScore {
        signal: Signal::PatternChange,
        score,
        candidate: score >= config.pattern_change_trigger,
    }
}

pub fn meal_type_shift(
    recent: &[MealAttendance],
    baseline: &[MealAttendance],
    config: &DetectionConfig,
) -> SignalScore {
    let score = match (meal_type_shares(recent), meal_type_shares(baseline)) {
        (Some(p), Some(q)) => clamp_unit(
            p.iter()
                .zip(&q)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max),
        ),
        _ => 0.0,
    };
    SignalScore {
        signal: Signal::MealTypeShift,
        score,
        candidate: score >= config.pattern_change_trigger,
    }
}

/// Run all four analyzers in declaration order.
pub fn score_all(
    recent: &[MealAttendance],
    baseline: &[MealAttendance],
    config: &DetectionConfig,
) -> [SignalScore; 4] {
    [
        consecutive_misses(recent, config),
        frequency_drop(recent, baseline, config),
        pattern_change(recent, baseline, config),
        meal_type_shift(recent, baseline, config),
    ]
}

/// Highest-scoring candidate at or above `threshold`; earlier signals win ties.
pub fn decide(scores: &[SignalScore], threshold: f64) -> Option<SignalScore> {
    scores
        .iter()
        .filter(|score| score.candidate && score.score >= threshold)
        .fold(None, |best: Option<SignalScore>, score| match best {
            Some(current) if current.score >= score.score => Some(current),
            _ => Some(*score),
        })
}
