#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use nurture_core::config::AppConfig;
use nurture_core::event_bus::{capture_sink, CaptureSink};
use nurture_core::memory::InMemoryCollaborators;
use nurture_core::types::Contact;
use nurture_engine::types::{
    DelayNode, DelayUnit, Edge, EmailNode, Node, NodeKind, Trigger, WorkflowDefinition,
};
use nurture_engine::WorkflowEngine;

pub struct Harness {
    pub engine: WorkflowEngine,
    pub fakes: InMemoryCollaborators,
    pub events: Arc<CaptureSink>,
}

pub fn harness() -> Harness {
    let mut config = AppConfig::default();
    config.retry.initial_backoff_secs = 60;
    config.retry.max_attempts = 3;
    let fakes = InMemoryCollaborators::new();
    let events = capture_sink();
    let engine = WorkflowEngine::with_event_sink(&config, fakes.collaborators(), events.clone());
    Harness { engine, fakes, events }
}

impl Harness {
    pub fn add_contact(&self, id: &str) -> Contact {
        let contact = Contact::new(id, format!("{id}@example.com"));
        self.fakes.contacts.insert(contact.clone());
        contact
    }

    /// Creates and activates a workflow; panics on validation errors.
    pub fn activate(&self, name: &str, nodes: Vec<Node>, edges: Vec<Edge>) -> Uuid {
        let workflow = WorkflowDefinition::new(name, Trigger::Manual, nodes, edges);
        let created = self.engine.create_workflow(workflow).unwrap();
        self.engine.activate(created.id).unwrap();
        created.id
    }

    /// Sweeps at `now` until nothing is due.
    pub async fn drain(&self, now: DateTime<Utc>) -> usize {
        let mut ticks = 0;
        for _ in 0..100 {
            let report = self.engine.sweep(now).await;
            if report.due == 0 {
                break;
            }
            ticks += report.due;
        }
        ticks
    }
}

pub fn trigger(id: &str) -> Node {
    Node::new(id, NodeKind::Trigger)
}

pub fn email(id: &str, subject: &str) -> Node {
    Node::new(
        id,
        NodeKind::Email(EmailNode {
            subject: Some(subject.to_string()),
            body: Some(format!("<p>{subject}</p>")),
            ..EmailNode::default()
        }),
    )
}

pub fn delay_days(id: &str, days: u32) -> Node {
    Node::new(
        id,
        NodeKind::Delay(DelayNode {
            delay_value: days,
            delay_unit: DelayUnit::Days,
        }),
    )
}

pub fn edge(source: &str, target: &str) -> Edge {
    Edge::new(format!("{source}-{target}"), source, target)
}

pub fn handle_edge(source: &str, handle: &str, target: &str) -> Edge {
    Edge::new(format!("{source}-{handle}-{target}"), source, target).from_handle(handle)
}
