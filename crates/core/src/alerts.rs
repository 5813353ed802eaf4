//! Per-rule alert evaluation. Each condition variant gets its own pure check;
//! inactivity needs absence-over-time and is left to the background jobs.

use crate::model::{AlertCondition, AlertRule, LocationFix, TriggeredAlert};

/// Whether a rule is in play for this user at all.
pub fn applies_to(rule: &AlertRule, user_id: i64) -> bool {
    rule.active && rule.target_user_id.is_none_or(|target| target == user_id)
}

/// Evaluates one rule against one fix. Returns the descriptor to hand to the
/// notification collaborator when the rule trips.
pub fn evaluate(rule: &AlertRule, fix: &LocationFix) -> Option<TriggeredAlert> {
    let triggered = match &rule.condition {
        AlertCondition::Speed { limit_kmh } => {
            fix.speed_kmh().is_some_and(|kmh| kmh > *limit_kmh)
        }
        AlertCondition::Battery { floor_pct } => {
            fix.battery.is_some_and(|pct| pct < *floor_pct)
        }
        // Requires absence of fixes over a window, not a single sample.
        AlertCondition::Inactivity { .. } => false,
    };

    triggered.then(|| TriggeredAlert {
        rule_id: Some(rule.id),
        name: rule.name.clone(),
        kind: rule.condition.kind(),
    })
}
