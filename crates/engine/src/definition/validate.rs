use std::collections::HashSet;

use crate::{
    definition::{NodeKind, WorkflowDefinition},
    procedure::ProcedureRegistry,
};

/// Checks a definition before it runs. Returns every problem found; an empty
/// list means every node reference resolves and every procedure node names a
/// procedure in `registry`.
///
/// The trigger procedure is not checked here; deployment resolves it.
pub fn validate(definition: &WorkflowDefinition, registry: &dyn ProcedureRegistry) -> Vec<String> {
    let mut errors = Vec::new();

    let mut ids = HashSet::new();
    for node in &definition.nodes {
        if !ids.insert(node.id.as_str()) {
            errors.push(format!("duplicate node id '{}'", node.id));
        }
    }

    if !ids.contains(definition.start_node_id.as_str()) {
        errors.push(format!(
            "start node '{}' does not exist",
            definition.start_node_id
        ));
    }

    for node in &definition.nodes {
        for reference in node.references() {
            if !ids.contains(reference) {
                errors.push(format!(
                    "node '{}' references unknown node '{}'",
                    node.id, reference
                ));
            }
        }

        if let NodeKind::Procedure { procedure_name, .. } = &node.kind {
            match procedure_name {
                None => errors.push(format!("procedure node '{}' has no procedureName", node.id)),
                Some(name) if !registry.has(name) => errors.push(format!(
                    "procedure node '{}' uses unregistered procedure '{}'",
                    node.id, name
                )),
                Some(_) => {}
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{TriggerDescriptor, WorkflowNode};
    use crate::procedure::{register_builtins, InMemoryRegistry};
    use serde_json::json;

    fn registry() -> InMemoryRegistry {
        let mut registry = InMemoryRegistry::new();
        register_builtins(&mut registry);
        registry
    }

    #[test]
    fn sound_graph_has_no_errors() {
        let definition = WorkflowDefinition::new(
            "wf",
            "A",
            vec![
                WorkflowNode::procedure("A", "math.add", json!({"a": 1, "b": 2})).with_next("B"),
                WorkflowNode::predicate("B", "result > 2", "C", "D"),
                WorkflowNode::sequential("C"),
                WorkflowNode::sequential("D"),
            ],
        );

        assert!(validate(&definition, &registry()).is_empty());
    }

    #[test]
    fn reports_every_dangling_reference() {
        let definition = WorkflowDefinition::new(
            "wf",
            "missing",
            vec![
                WorkflowNode::procedure("A", "no.such", json!({}))
                    .with_next("B")
                    .with_on_error("E"),
                WorkflowNode::parallel("P", &["A", "Q"], true),
            ],
        );

        let errors = validate(&definition, &registry());
        assert_eq!(errors.len(), 5, "{:?}", errors);
        assert!(errors.iter().any(|e| e.contains("start node 'missing'")));
        assert!(errors.iter().any(|e| e.contains("unknown node 'B'")));
        assert!(errors.iter().any(|e| e.contains("unknown node 'E'")));
        assert!(errors.iter().any(|e| e.contains("unknown node 'Q'")));
        assert!(errors.iter().any(|e| e.contains("unregistered procedure 'no.such'")));
    }

    #[test]
    fn flags_duplicates_and_missing_procedure_names() {
        let mut definition = WorkflowDefinition::new(
            "wf",
            "A",
            vec![WorkflowNode::sequential("A"), WorkflowNode::sequential("A")],
        );
        definition.nodes.push(WorkflowNode::new(
            "N",
            NodeKind::Procedure {
                procedure_name: None,
                config: Default::default(),
            },
        ));

        let errors = validate(&definition, &registry());
        assert!(errors.iter().any(|e| e.contains("duplicate node id 'A'")));
        assert!(errors.iter().any(|e| e.contains("has no procedureName")));
    }

    #[test]
    fn shape_and_trigger_are_not_reference_problems() {
        let definition = WorkflowDefinition::new(
            "wf",
            "P",
            vec![
                WorkflowNode::parallel("P", &[], true).with_next("W"),
                WorkflowNode::await_on("W", &[]).with_next("A"),
                WorkflowNode::procedure("A", "core.noop", json!({})),
            ],
        )
        .with_trigger(TriggerDescriptor {
            provider: "p".into(),
            trigger_procedure_name: "p.watch".into(),
            event_type: None,
            subscription_config: Default::default(),
        });

        assert!(validate(&definition, &registry()).is_empty());
    }
}
