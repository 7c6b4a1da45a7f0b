//! Skip rule evaluation for steps and cases.

use crate::assertion::{self, ComparatorError};
use crate::model::{DataSource, RunContext, SkipPolicy, SkipRule};
use serde_json::Value;
use tracing::{debug, warn};

/// Return the reason to skip, or `None` to run.
///
/// The unconditional flag wins; otherwise the first rule whose
/// comparator outcome matches its polarity skips. A rule whose
/// comparator is unknown or cannot compare its operands never skips.
pub fn evaluate(
    skip: bool,
    rules: &[SkipRule],
    ctx: &RunContext,
    case_failed: bool,
) -> Option<String> {
    if skip {
        return Some("skip flag set".to_string());
    }
    rules.iter().find_map(|rule| rule_matches(rule, ctx, case_failed))
}

fn source_value(source: DataSource, ctx: &RunContext, case_failed: bool) -> Value {
    let text = |v: &Option<String>| v.clone().map(Value::String).unwrap_or(Value::Null);
    match source {
        DataSource::RunEnv => Value::String(ctx.env.clone()),
        DataSource::RunServer => text(&ctx.server_id),
        DataSource::RunDevice => text(&ctx.device_id),
        DataSource::CaseFailed => Value::Bool(case_failed),
    }
}

fn rule_matches(rule: &SkipRule, ctx: &RunContext, case_failed: bool) -> Option<String> {
    let Some(entry) = assertion::lookup(&rule.comparator) else {
        warn!(comparator = %rule.comparator, "Unknown comparator in skip rule, ignoring rule");
        return None;
    };
    let actual = source_value(rule.data_source, ctx, case_failed);
    let holds = match (entry.func)(&actual, &rule.expected) {
        Ok(()) => true,
        Err(ComparatorError::Mismatch(_)) => false,
        Err(ComparatorError::Invalid(msg)) => {
            warn!(comparator = %rule.comparator, "Skip rule cannot be evaluated: {msg}");
            return None;
        }
    };
    let skips = match rule.skip_type {
        SkipPolicy::IfTrue => holds,
        SkipPolicy::IfFalse => !holds,
    };
    debug!(source = ?rule.data_source, holds, skips, "Evaluated skip rule");
    skips.then(|| {
        format!(
            "{:?} {} {} is {}",
            rule.data_source, entry.name, rule.expected, holds
        )
    })
}
