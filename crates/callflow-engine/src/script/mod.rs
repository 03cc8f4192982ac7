//! Validated, immutable conversation scripts.
//!
//! A [`ScriptGraph`] is built once from an authored [`ScriptDefinition`] and
//! never mutated. Every transition in a built graph resolves to a node or to
//! the end of the conversation.

pub mod pattern;

use std::collections::{HashMap, HashSet};

use callflow_core::types::{RuleAction, ScriptDefinition, END_NODE};

use crate::error::ScriptError;
pub use pattern::Pattern;

/// Where a matched response leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    End,
    /// Index into [`ScriptGraph::nodes`].
    Node(usize),
}

#[derive(Debug, Clone)]
pub struct ResponseRule {
    pub pattern: Pattern,
    pub next: Transition,
    pub action: Option<RuleAction>,
}

#[derive(Debug, Clone)]
pub struct ScriptNode {
    pub id: String,
    pub message: String,
    pub rules: Vec<ResponseRule>,
}

#[derive(Debug, Clone)]
pub struct ScriptGraph {
    greeting: String,
    nodes: Vec<ScriptNode>,
    index: HashMap<String, usize>,
}

impl ScriptGraph {
    /// Validate and compile an authored script.
    ///
    /// Checks run in a fixed order and the first failure is returned:
    /// greeting present, at least one node, every `next_node` resolves,
    /// node ids unique, every pattern compiles.
    pub fn build(definition: &ScriptDefinition) -> Result<Self, ScriptError> {
        if definition.initial_greeting.trim().is_empty() {
            return Err(ScriptError::MissingGreeting);
        }
        if definition.nodes.is_empty() {
            return Err(ScriptError::EmptyScript);
        }

        let ids: HashSet<&str> = definition.nodes.iter().map(|n| n.id.as_str()).collect();
        for node in &definition.nodes {
            for response in &node.responses {
                if response.next_node != END_NODE && !ids.contains(response.next_node.as_str()) {
                    return Err(ScriptError::DanglingReference {
                        node_id: node.id.clone(),
                        pattern: response.pattern.clone(),
                        next_node: response.next_node.clone(),
                    });
                }
            }
        }

        let mut index = HashMap::with_capacity(definition.nodes.len());
        for (i, node) in definition.nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(ScriptError::DuplicateNode(node.id.clone()));
            }
        }

        let mut nodes = Vec::with_capacity(definition.nodes.len());
        for node in &definition.nodes {
            let mut rules = Vec::with_capacity(node.responses.len());
            for response in &node.responses {
                let pattern = Pattern::parse(&response.pattern).map_err(|reason| {
                    ScriptError::InvalidPattern {
                        node_id: node.id.clone(),
                        pattern: response.pattern.clone(),
                        reason,
                    }
                })?;
                let next = if response.next_node == END_NODE {
                    Transition::End
                } else {
                    let target = index.get(&response.next_node).copied().ok_or_else(|| {
                        ScriptError::DanglingReference {
                            node_id: node.id.clone(),
                            pattern: response.pattern.clone(),
                            next_node: response.next_node.clone(),
                        }
                    })?;
                    Transition::Node(target)
                };
                rules.push(ResponseRule {
                    pattern,
                    next,
                    action: response.action.clone(),
                });
            }
            nodes.push(ScriptNode {
                id: node.id.clone(),
                message: node.message.clone(),
                rules,
            });
        }

        Ok(Self {
            greeting: definition.initial_greeting.clone(),
            nodes,
            index,
        })
    }

    pub fn greeting(&self) -> &str {
        &self.greeting
    }

    pub fn nodes(&self) -> &[ScriptNode] {
        &self.nodes
    }

    /// The node entered after the greeting.
    pub fn first(&self) -> usize {
        0
    }

    pub fn node(&self, index: usize) -> Option<&ScriptNode> {
        self.nodes.get(index)
    }

    pub fn find(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callflow_core::types::{NodeDefinition, ResponseDefinition};

    fn response(pattern: &str, next: &str) -> ResponseDefinition {
        ResponseDefinition {
            pattern: pattern.into(),
            next_node: next.into(),
            action: None,
        }
    }

    fn node(id: &str, responses: Vec<ResponseDefinition>) -> NodeDefinition {
        NodeDefinition {
            id: id.into(),
            message: format!("message for {}", id),
            responses,
        }
    }

    fn script(nodes: Vec<NodeDefinition>) -> ScriptDefinition {
        ScriptDefinition {
            initial_greeting: "Hi, this is Ava.".into(),
            nodes,
        }
    }

    #[test]
    fn test_build_valid_script() {
        let def = script(vec![
            node("n1", vec![response("yes", "n2"), response("no", "END")]),
            node("n2", vec![response("*", "END")]),
        ]);
        let graph = ScriptGraph::build(&def).unwrap();
        assert_eq!(graph.greeting(), "Hi, this is Ava.");
        assert_eq!(graph.nodes().len(), 2);
        assert_eq!(graph.find("n2"), Some(1));
        assert_eq!(graph.nodes()[0].rules[0].next, Transition::Node(1));
        assert_eq!(graph.nodes()[0].rules[1].next, Transition::End);
    }

    #[test]
    fn test_missing_greeting() {
        let mut def = script(vec![node("n1", vec![])]);
        def.initial_greeting = "   ".into();
        assert_eq!(
            ScriptGraph::build(&def).unwrap_err(),
            ScriptError::MissingGreeting
        );
    }

    #[test]
    fn test_empty_script() {
        assert_eq!(
            ScriptGraph::build(&script(vec![])).unwrap_err(),
            ScriptError::EmptyScript
        );
    }

    #[test]
    fn test_dangling_reference() {
        let def = script(vec![node("n1", vec![response("yes", "missing")])]);
        assert_eq!(
            ScriptGraph::build(&def).unwrap_err(),
            ScriptError::DanglingReference {
                node_id: "n1".into(),
                pattern: "yes".into(),
                next_node: "missing".into(),
            }
        );
    }

    #[test]
    fn test_missing_greeting_reported_before_dangling() {
        let mut def = script(vec![node("n1", vec![response("yes", "missing")])]);
        def.initial_greeting = String::new();
        assert_eq!(
            ScriptGraph::build(&def).unwrap_err(),
            ScriptError::MissingGreeting
        );
    }

    #[test]
    fn test_dangling_reported_before_duplicate_and_pattern() {
        let def = script(vec![
            node("n1", vec![response("re:(", "n1")]),
            node("n1", vec![response("ok", "ghost")]),
        ]);
        assert!(matches!(
            ScriptGraph::build(&def).unwrap_err(),
            ScriptError::DanglingReference { .. }
        ));
    }

    #[test]
    fn test_duplicate_node() {
        let def = script(vec![node("n1", vec![]), node("n1", vec![])]);
        assert_eq!(
            ScriptGraph::build(&def).unwrap_err(),
            ScriptError::DuplicateNode("n1".into())
        );
    }

    #[test]
    fn test_invalid_pattern() {
        let def = script(vec![node("n1", vec![response("re:(", "END")])]);
        assert!(matches!(
            ScriptGraph::build(&def).unwrap_err(),
            ScriptError::InvalidPattern { node_id, .. } if node_id == "n1"
        ));
    }

    #[test]
    fn test_end_is_reserved_not_a_node() {
        let def = script(vec![node("n1", vec![response("bye", "END")])]);
        let graph = ScriptGraph::build(&def).unwrap();
        assert_eq!(graph.find("END"), None);
    }

    #[test]
    fn test_every_transition_resolves() {
        let def = script(vec![
            node("a", vec![response("1", "b"), response("2", "c")]),
            node("b", vec![response("x", "a"), response("y", "END")]),
            node("c", vec![response("*", "b")]),
        ]);
        let graph = ScriptGraph::build(&def).unwrap();
        for node in graph.nodes() {
            for rule in &node.rules {
                if let Transition::Node(i) = rule.next {
                    assert!(graph.node(i).is_some());
                }
            }
        }
    }
}
