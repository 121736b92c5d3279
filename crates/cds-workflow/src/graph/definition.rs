use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use super::label::EdgeLabel;
use super::model::{Graph, END, START};
use crate::error::GraphParseError;

/// A blueprint workflow written as an ordered list of steps.
///
/// The first step is the entry point. Each step names the steps that follow
/// it on success and on failure; an empty list routes that outcome to `END`.
///
/// ```toml
/// name = "config-assign"
///
/// [[steps]]
/// name = "resolve"
/// target = "resource-assignment"
/// on_success = ["activate"]
///
/// [[steps]]
/// name = "activate"
/// target = "netconf-activate"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<StepDefinition>,
}

/// One step of a [`WorkflowDefinition`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    /// Node template the step runs; opaque to the engine.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub on_success: Vec<String>,
    #[serde(default)]
    pub on_failure: Vec<String>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: None,
            description: None,
            on_success: vec![],
            on_failure: vec![],
        }
    }

    pub fn on_success(mut self, step: impl Into<String>) -> Self {
        self.on_success.push(step.into());
        self
    }

    pub fn on_failure(mut self, step: impl Into<String>) -> Self {
        self.on_failure.push(step.into());
        self
    }
}

impl WorkflowDefinition {
    pub fn from_toml_str(s: &str) -> Result<Self, GraphParseError> {
        toml::from_str(s).map_err(|e| GraphParseError::Definition(e.to_string()))
    }

    pub fn from_json_str(s: &str) -> Result<Self, GraphParseError> {
        serde_json::from_str(s).map_err(|e| GraphParseError::Definition(e.to_string()))
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Build the execution graph for this workflow.
    pub fn to_graph(&self) -> Result<Graph, GraphParseError> {
        let first = self.steps.first().ok_or(GraphParseError::EmptyDefinition)?;

        let mut names = HashSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(GraphParseError::EmptyNodeId(format!("{:?}", step)));
            }
            if step.name == START || step.name == END {
                return Err(GraphParseError::Definition(format!(
                    "step name '{}' is reserved",
                    step.name
                )));
            }
            if !names.insert(step.name.as_str()) {
                return Err(GraphParseError::DuplicateStep(step.name.clone()));
            }
        }

        let mut graph = Graph::new();
        graph.add_edge(START, first.name.as_str(), EdgeLabel::Success);

        for step in &self.steps {
            for (targets, label) in [
                (&step.on_success, EdgeLabel::Success),
                (&step.on_failure, EdgeLabel::Failure),
            ] {
                if targets.is_empty() {
                    graph.add_edge(step.name.as_str(), END, label);
                    continue;
                }
                for target in targets {
                    if !names.contains(target.as_str()) {
                        return Err(GraphParseError::UndefinedStep {
                            step: step.name.clone(),
                            target: target.clone(),
                        });
                    }
                    graph.add_edge(step.name.as_str(), target.as_str(), label);
                }
            }
        }

        // A step the entry point never leads to would hold its targets' joins open.
        let reachable = self.reachable_from(&first.name);
        if let Some(orphan) = self.steps.iter().find(|s| !reachable.contains(s.name.as_str())) {
            return Err(GraphParseError::Definition(format!(
                "step '{}' is not reachable from '{}'",
                orphan.name, first.name
            )));
        }

        Ok(graph)
    }

    fn reachable_from<'a>(&'a self, entry: &'a str) -> HashSet<&'a str> {
        let mut seen = HashSet::from([entry]);
        let mut queue = VecDeque::from([entry]);
        while let Some(name) = queue.pop_front() {
            let Some(step) = self.step(name) else { continue };
            for next in step.on_success.iter().chain(&step.on_failure) {
                if seen.insert(next.as_str()) {
                    queue.push_back(next.as_str());
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::parse_graph;

    #[test]
    fn test_toml_definition_to_graph() {
        let def = WorkflowDefinition::from_toml_str(
            r#"
name = "config-assign"

[[steps]]
name = "resolve"
target = "resource-assignment"
on_success = ["activate"]
on_failure = ["rollback"]

[[steps]]
name = "activate"
target = "netconf-activate"

[[steps]]
name = "rollback"
"#,
        )
        .unwrap();

        assert_eq!(def.name.as_deref(), Some("config-assign"));
        assert_eq!(
            def.step("resolve").and_then(|s| s.target.as_deref()),
            Some("resource-assignment")
        );

        let graph = def.to_graph().unwrap();
        let expected = parse_graph(
            "[START>resolve/SUCCESS, resolve>activate/SUCCESS, resolve>rollback/FAILURE, \
             activate>END/SUCCESS, activate>END/FAILURE, rollback>END/SUCCESS, rollback>END/FAILURE]",
        )
        .unwrap();
        assert_eq!(graph, expected);
    }

    #[test]
    fn test_json_definition() {
        let def = WorkflowDefinition::from_json_str(
            r#"{"steps": [{"name": "only", "on_success": [], "on_failure": []}]}"#,
        )
        .unwrap();
        let graph = def.to_graph().unwrap();
        assert_eq!(graph.in_degree(END), 2);
        assert_eq!(graph.outgoing_edges(START).count(), 1);
    }

    #[test]
    fn test_undefined_step_reference() {
        let def = WorkflowDefinition {
            name: None,
            steps: vec![StepDefinition::new("a").on_success("missing")],
        };
        assert_eq!(
            def.to_graph().unwrap_err(),
            GraphParseError::UndefinedStep {
                step: "a".into(),
                target: "missing".into()
            }
        );
    }

    #[test]
    fn test_rejects_empty_duplicate_and_reserved() {
        let empty = WorkflowDefinition {
            name: None,
            steps: vec![],
        };
        assert_eq!(empty.to_graph().unwrap_err(), GraphParseError::EmptyDefinition);

        let dup = WorkflowDefinition {
            name: None,
            steps: vec![StepDefinition::new("a"), StepDefinition::new("a")],
        };
        assert_eq!(
            dup.to_graph().unwrap_err(),
            GraphParseError::DuplicateStep("a".into())
        );

        let reserved = WorkflowDefinition {
            name: None,
            steps: vec![StepDefinition::new(END)],
        };
        assert!(matches!(
            reserved.to_graph(),
            Err(GraphParseError::Definition(_))
        ));
    }

    #[test]
    fn test_rejects_unreachable_steps() {
        let def = WorkflowDefinition {
            name: None,
            steps: vec![
                StepDefinition::new("a").on_success("b"),
                StepDefinition::new("b"),
                StepDefinition::new("orphan").on_success("b"),
            ],
        };
        let err = def.to_graph().unwrap_err();
        assert!(matches!(err, GraphParseError::Definition(ref msg) if msg.contains("orphan")));

        // Steps reached only through another step are fine.
        let def = WorkflowDefinition {
            name: None,
            steps: vec![
                StepDefinition::new("a").on_failure("b"),
                StepDefinition::new("b").on_success("c"),
                StepDefinition::new("c"),
            ],
        };
        assert!(def.to_graph().is_ok());
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            WorkflowDefinition::from_toml_str("steps = 3"),
            Err(GraphParseError::Definition(_))
        ));
    }
}
