use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One addressable unit of a workflow graph.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNode {
    /// Node id, unique within its definition
    pub id: String,

    /// What the node does
    #[serde(flatten)]
    pub kind: NodeKind,

    /// Continuation after the node completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Next>,

    /// Node to redirect to when the node's handler fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum NodeKind {
    Procedure {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        procedure_name: Option<String>,
        #[serde(default)]
        config: Map<String, Value>,
    },
    Condition {
        /// Boolean expression, paired with `true_branch`/`false_branch`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expression: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        true_branch: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        false_branch: Option<String>,
        /// Discriminator expression, paired with `cases`/`default`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        switch: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        cases: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    Parallel {
        branches: Vec<String>,
        #[serde(default = "default_wait_for_all")]
        wait_for_all: bool,
    },
    Sequential,
    Await {
        /// Procedure or event names whose arrival resumes the graph
        procedures: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<AwaitTimeout>,
    },
}

fn default_wait_for_all() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwaitTimeout {
    pub duration_ms: u64,
    /// Node to continue at once the wait expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

/// A single successor or a fan-out list.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum Next {
    One(String),
    Many(Vec<String>),
}

impl Next {
    pub fn ids(&self) -> Vec<&str> {
        match self {
            Next::One(id) => vec![id.as_str()],
            Next::Many(ids) => ids.iter().map(String::as_str).collect(),
        }
    }
}

impl From<&str> for Next {
    fn from(id: &str) -> Self {
        Next::One(id.to_string())
    }
}

impl From<Vec<&str>> for Next {
    fn from(ids: Vec<&str>) -> Self {
        Next::Many(ids.into_iter().map(String::from).collect())
    }
}

/// The two shapes a condition node can take.
pub enum ConditionForm<'a> {
    Predicate {
        expression: &'a str,
        true_branch: Option<&'a str>,
        false_branch: Option<&'a str>,
    },
    Switch {
        discriminator: &'a str,
        cases: &'a BTreeMap<String, String>,
        default: Option<&'a str>,
    },
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            next: None,
            on_error: None,
        }
    }

    pub fn procedure(id: impl Into<String>, procedure_name: &str, config: Value) -> Self {
        let config = match config {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(
            id,
            NodeKind::Procedure {
                procedure_name: Some(procedure_name.to_string()),
                config,
            },
        )
    }

    pub fn predicate(id: impl Into<String>, expression: &str, true_branch: &str, false_branch: &str) -> Self {
        Self::new(
            id,
            NodeKind::Condition {
                expression: Some(expression.to_string()),
                true_branch: Some(true_branch.to_string()),
                false_branch: Some(false_branch.to_string()),
                switch: None,
                cases: BTreeMap::new(),
                default: None,
            },
        )
    }

    pub fn switch(id: impl Into<String>, discriminator: &str, cases: &[(&str, &str)], default: Option<&str>) -> Self {
        Self::new(
            id,
            NodeKind::Condition {
                expression: None,
                true_branch: None,
                false_branch: None,
                switch: Some(discriminator.to_string()),
                cases: cases
                    .iter()
                    .map(|(case, node)| (case.to_string(), node.to_string()))
                    .collect(),
                default: default.map(String::from),
            },
        )
    }

    pub fn parallel(id: impl Into<String>, branches: &[&str], wait_for_all: bool) -> Self {
        Self::new(
            id,
            NodeKind::Parallel {
                branches: branches.iter().map(|b| b.to_string()).collect(),
                wait_for_all,
            },
        )
    }

    pub fn sequential(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Sequential)
    }

    pub fn await_on(id: impl Into<String>, procedures: &[&str]) -> Self {
        Self::new(
            id,
            NodeKind::Await {
                procedures: procedures.iter().map(|p| p.to_string()).collect(),
                filter: None,
                timeout: None,
            },
        )
    }

    pub fn with_next(mut self, next: impl Into<Next>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn with_on_error(mut self, node: &str) -> Self {
        self.on_error = Some(node.to_string());
        self
    }

    /// Sets the await filter; no effect on other node kinds.
    pub fn with_filter(mut self, expression: &str) -> Self {
        if let NodeKind::Await { filter, .. } = &mut self.kind {
            *filter = Some(expression.to_string());
        }
        self
    }

    /// Sets the await timeout; no effect on other node kinds.
    pub fn with_timeout(mut self, duration_ms: u64, node: Option<&str>) -> Self {
        if let NodeKind::Await { timeout, .. } = &mut self.kind {
            *timeout = Some(AwaitTimeout {
                duration_ms,
                node: node.map(String::from),
            });
        }
        self
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            NodeKind::Procedure { .. } => "procedure",
            NodeKind::Condition { .. } => "condition",
            NodeKind::Parallel { .. } => "parallel",
            NodeKind::Sequential => "sequential",
            NodeKind::Await { .. } => "await",
        }
    }

    /// Resolves which condition shape the node declares. A switch takes
    /// precedence when both are present.
    pub fn condition_form(&self) -> Option<ConditionForm<'_>> {
        match &self.kind {
            NodeKind::Condition {
                switch: Some(discriminator),
                cases,
                default,
                ..
            } => Some(ConditionForm::Switch {
                discriminator,
                cases,
                default: default.as_deref(),
            }),
            NodeKind::Condition {
                expression: Some(expression),
                true_branch,
                false_branch,
                ..
            } => Some(ConditionForm::Predicate {
                expression,
                true_branch: true_branch.as_deref(),
                false_branch: false_branch.as_deref(),
            }),
            _ => None,
        }
    }

    /// Every node id this node can hand control to.
    pub fn references(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = Vec::new();
        if let Some(next) = &self.next {
            refs.extend(next.ids());
        }
        if let Some(on_error) = &self.on_error {
            refs.push(on_error);
        }
        match &self.kind {
            NodeKind::Condition {
                true_branch,
                false_branch,
                cases,
                default,
                ..
            } => {
                refs.extend(true_branch.as_deref());
                refs.extend(false_branch.as_deref());
                refs.extend(cases.values().map(String::as_str));
                refs.extend(default.as_deref());
            }
            NodeKind::Parallel { branches, .. } => {
                refs.extend(branches.iter().map(String::as_str));
            }
            NodeKind::Await {
                timeout: Some(AwaitTimeout { node: Some(node), .. }),
                ..
            } => refs.push(node),
            _ => {}
        }
        refs
    }
}
