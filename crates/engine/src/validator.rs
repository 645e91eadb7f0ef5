//! Static analysis of workflow graphs.
//!
//! `validate` is pure: it inspects nodes and edges only, never stores or
//! collaborators, so the same graph always yields the same findings. An
//! empty result is required before a workflow can be activated.

use std::collections::{HashMap, HashSet};

use nurture_core::ValidationError;

use crate::types::{Edge, EmailMode, Node, NodeKind};

pub const BACK_TO_BACK_EMAIL: &str =
    "Cannot send two emails back-to-back. Add a delay node between them.";

/// Returns every problem found in the graph; empty means valid.
pub fn validate(nodes: &[Node], edges: &[Edge]) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let kinds: HashMap<&str, &NodeKind> = nodes.iter().map(|n| (n.id.as_str(), &n.kind)).collect();

    check_triggers(nodes, edges, &mut errors);
    check_edges(&kinds, edges, &mut errors);
    check_connectivity(nodes, edges, &mut errors);
    for node in nodes {
        check_node_data(node, &mut errors);
    }

    errors
}

fn check_triggers(nodes: &[Node], edges: &[Edge], errors: &mut Vec<ValidationError>) {
    let triggers: Vec<&Node> = nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::Trigger))
        .collect();

    match triggers.as_slice() {
        [] => errors.push(ValidationError::graph("Workflow must have a trigger node")),
        [_] => {}
        [_, extra @ ..] => {
            for node in extra {
                errors.push(ValidationError::node(
                    &node.id,
                    "Workflow can only have one trigger node",
                ));
            }
        }
    }

    for trigger in triggers {
        if let Some(edge) = edges.iter().find(|e| e.target == trigger.id) {
            errors.push(ValidationError::edge(
                &edge.id,
                Some(trigger.id.clone()),
                "Trigger node cannot have incoming connections",
            ));
        }
    }
}

fn check_edges(kinds: &HashMap<&str, &NodeKind>, edges: &[Edge], errors: &mut Vec<ValidationError>) {
    for edge in edges {
        let source = kinds.get(edge.source.as_str());
        let target = kinds.get(edge.target.as_str());

        if source.is_none() || target.is_none() {
            let missing = if source.is_none() { &edge.source } else { &edge.target };
            errors.push(ValidationError::edge(
                &edge.id,
                None,
                format!("Edge references unknown node \"{missing}\""),
            ));
            continue;
        }

        if matches!(source, Some(NodeKind::Email(_))) && matches!(target, Some(NodeKind::Email(_))) {
            errors.push(ValidationError::edge(
                &edge.id,
                Some(edge.target.clone()),
                BACK_TO_BACK_EMAIL,
            ));
        }
    }
}

fn check_connectivity(nodes: &[Node], edges: &[Edge], errors: &mut Vec<ValidationError>) {
    let connected: HashSet<&str> = edges
        .iter()
        .flat_map(|e| [e.source.as_str(), e.target.as_str()])
        .collect();

    for node in nodes {
        if matches!(node.kind, NodeKind::Trigger) || connected.contains(node.id.as_str()) {
            continue;
        }
        errors.push(ValidationError::node(
            &node.id,
            format!("Node \"{}\" is not connected to the workflow.", node.type_name()),
        ));
    }
}

fn check_node_data(node: &Node, errors: &mut Vec<ValidationError>) {
    match &node.kind {
        NodeKind::Email(email) => match email.mode {
            EmailMode::Template if is_blank(email.template_id.as_deref()) => {
                errors.push(ValidationError::node(
                    &node.id,
                    "Email node using template mode must have a template selected.",
                ));
            }
            EmailMode::Custom if is_blank(email.subject.as_deref()) => {
                errors.push(ValidationError::node(
                    &node.id,
                    "Email node using custom mode must have a subject.",
                ));
            }
            _ => {}
        },
        NodeKind::Webhook(webhook) => {
            let valid = url::Url::parse(&webhook.url)
                .map(|u| matches!(u.scheme(), "http" | "https"))
                .unwrap_or(false);
            if !valid {
                errors.push(ValidationError::node(
                    &node.id,
                    "Webhook node must have a valid http(s) URL.",
                ));
            }
        }
        NodeKind::Split(split) => {
            if !(0.0..=100.0).contains(&split.split_percentage) {
                errors.push(ValidationError::node(
                    &node.id,
                    "Split percentage must be between 0 and 100.",
                ));
            }
        }
        NodeKind::Delay(delay) if delay.delay_value == 0 => {
            errors.push(ValidationError::node(&node.id, "Delay must be at least 1."));
        }
        NodeKind::Action(action) => {
            if is_blank(action.tag_id.as_deref()) && is_blank(action.tag_name.as_deref()) {
                errors.push(ValidationError::node(&node.id, "Action node must reference a tag."));
            }
        }
        _ => {}
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}
