//! Check-in message templates and composition.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::models::{AnalysisReason, CheckInType, SignalDetails, Tone};

fn templates(check_in_type: CheckInType, tone: Tone) -> &'static [&'static str] {
    match (check_in_type, tone) {
        (CheckInType::MealConcern, Tone::Gentle) => &[
            "Hey, just checking in. We haven't seen you at the dining hall much lately, and we hope you're doing okay.",
            "Hi there. No pressure at all, but we wanted to make sure you're eating well and taking care of yourself.",
            "Thinking of you today. If meals have been hard to fit in lately, we're here whenever you want to talk.",
        ],
        (CheckInType::MealConcern, Tone::Supportive) => &[
            "Hi! We noticed your dining routine has shifted a bit. Anything we can do to help?",
            "Busy stretch? Remember the dining hall has grab-and-go options if time is tight.",
        ],
        (CheckInType::MealConcern, Tone::Encouraging) => &[
            "Quick reminder that a good meal can make a long day easier. Hope to see you at dinner!",
            "Fuel up! Today's dining hall menu has a few new favorites worth trying.",
        ],
        (CheckInType::WellnessCheck, Tone::Gentle) => &[
            "Hi, we noticed your routine looks a little different lately. How are you feeling?",
            "Just a gentle check-in. Changes in routine happen, and we're here if anything is on your mind.",
        ],
        (CheckInType::WellnessCheck, Tone::Supportive) => &[
            "Schedules change and that's okay. Want some tips for keeping meals regular this week?",
            "Hope the semester is treating you well! Let us know if you'd like any support.",
        ],
        (CheckInType::WellnessCheck, Tone::Encouraging) => &[
            "New routine? Nice! Keep making time for meals that keep you going.",
            "Hope your week is off to a great start. Don't forget to take a break for a good meal.",
        ],
        (CheckInType::SupportOffer, Tone::Gentle) => &[
            "We're here for you. If you'd like to talk to someone, support is available any time.",
            "You don't have to handle everything alone. Reach out whenever you're ready and we'll help.",
        ],
        (CheckInType::SupportOffer, Tone::Supportive) => &[
            "If things feel like a lot right now, our student support team would be glad to help.",
            "Support is just a message away whenever you need it.",
        ],
        (CheckInType::SupportOffer, Tone::Encouraging) => &[
            "Just a reminder that campus support resources are always open to you.",
            "Keep going! And remember, help is always available if you want it.",
        ],
    }
}

/// Deterministic clause grounding the message in the observed data.
fn data_clause(reason: AnalysisReason, details: &SignalDetails) -> Option<String> {
    match reason {
        AnalysisReason::MissedConsecutive if details.longest_miss_run > 0 => Some(format!(
            " It looks like you've missed {} meals in a row.",
            details.longest_miss_run
        )),
        AnalysisReason::FrequencyDrop => {
            let drop = (details.scores.frequency_drop * 100.0).round();
            (drop > 0.0).then(|| {
                format!(" Your dining visits are down about {drop:.0}% from your usual.")
            })
        }
        AnalysisReason::PatternChange => {
            Some(" Your meal times look a bit different from your usual routine.".to_string())
        }
        _ => None,
    }
}

/// Picks templates with an injected random source so output is reproducible.
#[derive(Debug)]
pub struct MessageComposer {
    rng: Mutex<StdRng>,
}

impl Default for MessageComposer {
    fn default() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }
}

impl MessageComposer {
    pub fn seeded(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    pub fn from_rng(rng: StdRng) -> Self {
        Self {
            rng: Mutex::new(rng),
        }
    }

    pub fn compose(
        &self,
        check_in_type: CheckInType,
        tone: Tone,
        reason: AnalysisReason,
        details: Option<&SignalDetails>,
    ) -> String {
        let bank = templates(check_in_type, tone);
        let pick = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            rng.gen_range(0..bank.len())
        };

        let mut message = bank[pick].to_string();
        if let Some(clause) = details.and_then(|details| data_clause(reason, details)) {
            message.push_str(&clause);
        }
        message
    }
}
