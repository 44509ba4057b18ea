//! Decides whether an inbound event resumes a suspended execution.

use serde_json::{json, Value};
use tracing::warn;

use crate::{
    definition::TriggerDescriptor,
    expression,
    trigger::TriggerEvent,
    workflow::ResumeState,
};

/// The trigger id equals the waited name or contains it (`slack.approve`
/// answers `approve`). Empty names never match.
pub fn names_match(waited: &str, trigger_id: &str) -> bool {
    !waited.is_empty() && !trigger_id.is_empty() && trigger_id.contains(waited)
}

/// Whether the event answers `waited`. Events without a trigger id are
/// identified by their type, which must equal the waited name.
pub fn identifies(event: &TriggerEvent, waited: &str) -> bool {
    match (&event.trigger_id, &event.event_type) {
        (Some(trigger_id), _) => names_match(waited, trigger_id),
        (None, Some(event_type)) => !waited.is_empty() && event_type == waited,
        (None, None) => false,
    }
}

/// Read-only scope an await filter is evaluated against.
pub fn filter_scope(event: &TriggerEvent, state: &ResumeState) -> Value {
    json!({
        "payload": event.payload,
        "event": event.to_variables(),
        "variables": state.variables,
        "outputs": state.node_outputs,
    })
}

pub fn matches(event: &TriggerEvent, state: &ResumeState) -> bool {
    let named = state
        .waiting_for
        .procedures
        .iter()
        .any(|waited| identifies(event, waited));
    if !named {
        return false;
    }

    match &state.waiting_for.filter {
        None => true,
        Some(filter) => match expression::evaluate_bool(filter, &filter_scope(event, state)) {
            Ok(passed) => passed,
            Err(e) => {
                warn!(
                    "Filter `{}` of execution {} failed to evaluate: {}",
                    filter, state.execution_id, e
                );
                false
            }
        },
    }
}

/// The earliest-paused state the event matches.
pub fn find_match<'a>(
    event: &TriggerEvent,
    states: impl IntoIterator<Item = &'a ResumeState>,
) -> Option<&'a ResumeState> {
    states
        .into_iter()
        .filter(|state| matches(event, state))
        .min_by_key(|state| state.paused_at)
}

/// Whether the event may start a new run of a workflow with this trigger.
pub fn event_type_allowed(trigger: &TriggerDescriptor, event: &TriggerEvent) -> bool {
    match &trigger.event_type {
        None => true,
        Some(expected) => event.event_type.as_deref() == Some(expected.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{ExecutionContext, PauseSignal};
    use chrono::Duration;
    use serde_json::Map;

    fn paused(execution_id: &str, waiting: &[&str], filter: Option<&str>) -> ResumeState {
        let mut ctx = ExecutionContext::new("wf", execution_id, Map::new());
        ctx.variables.insert("orderId".into(), json!("o-1"));
        ResumeState::capture(
            &ctx,
            "wait",
            PauseSignal::awaiting(
                waiting.iter().map(|s| s.to_string()).collect(),
                filter.map(String::from),
                None,
            ),
        )
    }

    #[test]
    fn trigger_id_matches_by_substring() {
        let state = paused("e1", &["approve"], None);
        let event = TriggerEvent::new("slack", json!({})).with_trigger_id("slack.approve");
        assert!(matches(&event, &state));

        let other = TriggerEvent::new("slack", json!({})).with_trigger_id("reject");
        assert!(!matches(&other, &state));

        let fragment = TriggerEvent::new("slack", json!({})).with_trigger_id("a");
        assert!(!matches(&fragment, &state));
    }

    #[test]
    fn trigger_id_takes_precedence_over_event_type() {
        let state = paused("e1", &["approve"], None);
        let event = TriggerEvent::new("slack", json!({}))
            .with_trigger_id("reject")
            .with_event_type("approve");
        assert!(!matches(&event, &state));
    }

    #[test]
    fn event_type_can_identify_the_callback() {
        let state = paused("e1", &["payment.succeeded"], None);
        let event = TriggerEvent::new("stripe", json!({})).with_event_type("payment.succeeded");
        assert!(matches(&event, &state));

        let prefixed = TriggerEvent::new("stripe", json!({})).with_event_type("stripe.payment.succeeded");
        assert!(!matches(&prefixed, &state));
    }

    #[test]
    fn filter_sees_payload_and_variables() {
        let state = paused("e1", &["approve"], Some("payload.orderId == variables.orderId"));
        let matching = TriggerEvent::new("x", json!({"orderId": "o-1"})).with_trigger_id("approve");
        let other = TriggerEvent::new("x", json!({"orderId": "o-2"})).with_trigger_id("approve");

        assert!(matches(&matching, &state));
        assert!(!matches(&other, &state));
    }

    #[test]
    fn broken_filter_never_matches() {
        let state = paused("e1", &["approve"], Some("payload.x = 1"));
        let event = TriggerEvent::new("x", json!({"x": 1})).with_trigger_id("approve");
        assert!(!matches(&event, &state));
    }

    #[test]
    fn earliest_paused_wins() {
        let mut first = paused("first", &["approve"], None);
        let second = paused("second", &["approve"], None);
        first.paused_at = second.paused_at - Duration::seconds(1);

        let event = TriggerEvent::new("x", json!({})).with_trigger_id("approve");
        let states = [second.clone(), first.clone()];
        assert_eq!(find_match(&event, &states).unwrap().execution_id, "first");
    }

    #[test]
    fn event_type_filter_guards_new_runs() {
        let trigger = TriggerDescriptor {
            provider: "github".into(),
            trigger_procedure_name: "github.watch".into(),
            event_type: Some("push".into()),
            subscription_config: Map::new(),
        };
        assert!(event_type_allowed(&trigger, &TriggerEvent::new("github", json!({})).with_event_type("push")));
        assert!(!event_type_allowed(&trigger, &TriggerEvent::new("github", json!({})).with_event_type("issues")));
        assert!(!event_type_allowed(&trigger, &TriggerEvent::new("github", json!({}))));
    }
}
