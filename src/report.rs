use std::fmt::Write;

use crate::models::{PatternAnalysis, Signal};
use crate::service::PatternReport;

/// Signal scores ordered from strongest to weakest.
pub fn ranked_signals(analysis: &PatternAnalysis) -> Vec<(Signal, f64)> {
    let Some(details) = &analysis.details else {
        return Vec::new();
    };
    let scores = details.scores;
    let mut ranked = vec![
        (Signal::ConsecutiveMisses, scores.consecutive_misses),
        (Signal::FrequencyDrop, scores.frequency_drop),
        (Signal::PatternChange, scores.pattern_change),
        (Signal::MealTypeShift, scores.meal_type_shift),
    ];
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
}

pub fn build_report(report: &PatternReport) -> String {
    let analysis = &report.pattern_analysis;
    let mut output = String::new();

    let _ = writeln!(output, "# Meal Pulse Report");
    let _ = writeln!(
        output,
        "Generated for student {} (data kept until {})",
        report.anonymized_id,
        report.data_expiry_date.date_naive()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Verdict");

    if analysis.is_anomaly {
        let _ = writeln!(
            output,
            "Anomaly detected: {} (score {:.2})",
            analysis.reason, analysis.score
        );
    } else {
        let _ = writeln!(output, "No anomaly ({})", analysis.reason);
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Signal Scores");

    let ranked = ranked_signals(analysis);
    if ranked.is_empty() {
        let _ = writeln!(output, "No signals computed for this window.");
    } else {
        for (signal, score) in ranked {
            let _ = writeln!(output, "- {signal}: {score:.2}");
        }
        if let Some(details) = &analysis.details {
            let _ = writeln!(
                output,
                "- records: {} recent, {} baseline; longest miss run {}",
                details.recent_records, details.baseline_records, details.longest_miss_run
            );
        }
    }

    let baseline = &report.baseline_pattern;
    let _ = writeln!(output);
    let _ = writeln!(output, "## Baseline");

    match baseline.last_updated {
        Some(updated) => {
            let preferred: Vec<&str> = baseline
                .preferred_meal_times
                .iter()
                .map(|meal| meal.as_str())
                .collect();
            let _ = writeln!(
                output,
                "- {:.1} meals per week, preferred: {} (updated {})",
                baseline.average_meals_per_week,
                if preferred.is_empty() {
                    "none".to_string()
                } else {
                    preferred.join(", ")
                },
                updated.date_naive()
            );
        }
        None => {
            let _ = writeln!(output, "No baseline established yet.");
        }
    }

    let privacy = &report.privacy_settings;
    let _ = writeln!(output);
    let _ = writeln!(output, "## Privacy");
    let _ = writeln!(
        output,
        "- opted out: {}, check-ins allowed: {}, retention {} days",
        privacy.opt_out, privacy.allow_check_ins, privacy.data_retention_days
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Check-Ins");

    if report.recent_check_ins.is_empty() {
        let _ = writeln!(output, "No check-ins sent.");
    } else {
        for check_in in &report.recent_check_ins {
            let _ = writeln!(
                output,
                "- {} ({}, {}): {}",
                check_in.created_at.format("%Y-%m-%d %H:%M"),
                check_in.tone,
                if check_in.response_received {
                    "answered"
                } else {
                    "no answer"
                },
                check_in.message
            );
        }
    }

    output
}
