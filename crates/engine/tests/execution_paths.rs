mod common;

use chrono::Duration;
use serde_json::json;

use common::{delay_days, edge, email, handle_edge, harness, trigger};
use nurture_core::types::{EmailEvent, EventType, NotifyMethod};
use nurture_core::CollaboratorError;
use nurture_engine::evaluator::Condition;
use nurture_engine::types::{
    ActionNode, ExecutionStatus, GoalNode, Node, NodeKind, NotifyNode, SplitNode, TagAction,
    Trigger, WebhookNode, WorkflowDefinition,
};
use nurture_engine::TriggerEvent;

fn opened_branch() -> (Vec<Node>, Vec<nurture_engine::types::Edge>) {
    (
        vec![
            trigger("t"),
            email("intro", "Intro"),
            delay_days("wait", 1),
            Node::new(
                "opened",
                NodeKind::Condition(Condition::OpenedEmail {
                    email_node_id: Some("intro".into()),
                }),
            ),
            email("thanks", "Thanks for reading"),
            email("nudge", "Did you miss this?"),
        ],
        vec![
            edge("t", "intro"),
            edge("intro", "wait"),
            edge("wait", "opened"),
            handle_edge("opened", "yes", "thanks"),
            handle_edge("opened", "no", "nudge"),
        ],
    )
}

#[tokio::test]
async fn test_condition_follows_tracked_open() {
    let h = harness();
    let (nodes, edges) = opened_branch();
    let wf = h.activate("Opened?", nodes, edges);
    h.add_contact("reader");
    h.add_contact("skimmer");
    let reader = h.engine.enroll(wf, "reader").await.unwrap().execution_id();
    let skimmer = h.engine.enroll(wf, "skimmer").await.unwrap().execution_id();
    let t0 = chrono::Utc::now();
    h.drain(t0).await;

    let token = h.fakes.mailer.sent_to("reader@example.com")[0]
        .email
        .tracking_token
        .clone();
    h.engine.record_email_event(&token, EmailEvent::Opened).unwrap();

    h.drain(t0 + Duration::days(1)).await;
    let subjects = |to: &str| {
        h.fakes
            .mailer
            .sent_to(to)
            .into_iter()
            .map(|s| s.email.subject)
            .collect::<Vec<_>>()
    };
    assert_eq!(subjects("reader@example.com"), vec!["Intro", "Thanks for reading"]);
    assert_eq!(subjects("skimmer@example.com"), vec!["Intro", "Did you miss this?"]);
    for id in [reader, skimmer] {
        assert_eq!(h.engine.get_execution(id).unwrap().status, ExecutionStatus::Completed);
    }
}

#[tokio::test]
async fn test_unknown_tracking_token_is_rejected() {
    let h = harness();
    assert!(h.engine.record_email_event("not-a-token", EmailEvent::Opened).is_err());
}

#[tokio::test]
async fn test_tag_action_creates_missing_tag_by_name() {
    let h = harness();
    let wf = h.activate(
        "Tagger",
        vec![
            trigger("t"),
            Node::new(
                "tag",
                NodeKind::Action(ActionNode {
                    action_type: TagAction::AddTag,
                    tag_id: None,
                    tag_name: Some("engaged".into()),
                }),
            ),
        ],
        vec![edge("t", "tag")],
    );
    h.add_contact("c1");
    let id = h.engine.enroll(wf, "c1").await.unwrap().execution_id();
    h.drain(chrono::Utc::now()).await;

    assert_eq!(h.engine.get_execution(id).unwrap().status, ExecutionStatus::Completed);
    let contact = h.fakes.contacts.contact("c1").unwrap();
    assert_eq!(contact.tag_ids.len(), 1);
}

#[tokio::test]
async fn test_tag_action_on_missing_tag_fails() {
    let h = harness();
    let wf = h.activate(
        "Untagger",
        vec![
            trigger("t"),
            Node::new(
                "untag",
                NodeKind::Action(ActionNode {
                    action_type: TagAction::RemoveTag,
                    tag_id: None,
                    tag_name: Some("never-created".into()),
                }),
            ),
        ],
        vec![edge("t", "untag")],
    );
    h.add_contact("c1");
    let id = h.engine.enroll(wf, "c1").await.unwrap().execution_id();
    h.drain(chrono::Utc::now()).await;

    let execution = h.engine.get_execution(id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error_message.unwrap().contains("never-created"));
    assert_eq!(h.engine.execution_summary(wf).failed, 1);
}

#[tokio::test]
async fn test_webhook_failure_does_not_stop_execution() {
    let h = harness();
    let wf = h.activate(
        "Hook",
        vec![
            trigger("t"),
            Node::new(
                "hook",
                NodeKind::Webhook(WebhookNode {
                    url: "https://hooks.example.com/lead".into(),
                    payload: None,
                }),
            ),
            email("after", "After the hook"),
        ],
        vec![edge("t", "hook"), edge("hook", "after")],
    );
    h.fakes
        .webhooks
        .failures
        .fail_always(CollaboratorError::Permanent("502 Bad Gateway".into()));
    h.add_contact("c1");
    let id = h.engine.enroll(wf, "c1").await.unwrap().execution_id();
    h.drain(chrono::Utc::now()).await;

    assert_eq!(h.engine.get_execution(id).unwrap().status, ExecutionStatus::Completed);
    assert_eq!(h.fakes.mailer.count(), 1);
    assert_eq!(h.events.count_type(EventType::WebhookFailed), 1);
}

#[tokio::test]
async fn test_webhook_default_payload() {
    let h = harness();
    let wf = h.activate(
        "Hook",
        vec![
            trigger("t"),
            Node::new(
                "hook",
                NodeKind::Webhook(WebhookNode {
                    url: "https://hooks.example.com/lead".into(),
                    payload: None,
                }),
            ),
        ],
        vec![edge("t", "hook")],
    );
    h.add_contact("c1");
    h.engine.enroll(wf, "c1").await.unwrap();
    h.drain(chrono::Utc::now()).await;

    let calls = h.fakes.webhooks.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1["email"], json!("c1@example.com"));
    assert_eq!(calls[0].1["nodeId"], json!("hook"));
}

#[tokio::test]
async fn test_notify_failure_is_tolerated() {
    let h = harness();
    let wf = h.activate(
        "Notify",
        vec![
            trigger("t"),
            Node::new(
                "ping",
                NodeKind::Notify(NotifyNode {
                    method: NotifyMethod::Slack,
                    message: "Hot lead".into(),
                }),
            ),
        ],
        vec![edge("t", "ping")],
    );
    h.fakes
        .notifier
        .failures
        .fail_always(CollaboratorError::Timeout(10_000));
    h.add_contact("c1");
    let id = h.engine.enroll(wf, "c1").await.unwrap().execution_id();
    h.drain(chrono::Utc::now()).await;

    assert_eq!(h.engine.get_execution(id).unwrap().status, ExecutionStatus::Completed);
    assert_eq!(h.events.count_type(EventType::NotificationFailed), 1);
}

#[tokio::test]
async fn test_permanent_email_failure_fails_execution() {
    let h = harness();
    let wf = h.activate("Single", vec![trigger("t"), email("e", "Hi")], vec![edge("t", "e")]);
    h.fakes
        .mailer
        .failures
        .fail_always(CollaboratorError::Permanent("mailbox unavailable".into()));
    h.add_contact("c1");
    let id = h.engine.enroll(wf, "c1").await.unwrap().execution_id();
    h.drain(chrono::Utc::now()).await;

    let execution = h.engine.get_execution(id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error_message.unwrap().contains("mailbox unavailable"));
    assert_eq!(h.events.count_type(EventType::ExecutionFailed), 1);

    // Operator re-enrollment starts a fresh execution once the mailer recovers.
    h.fakes.mailer.failures.clear();
    let report = h.engine.reenroll_failed(wf).await.unwrap();
    assert_eq!(report.enrolled, 1);
    h.drain(chrono::Utc::now()).await;
    assert_eq!(h.fakes.mailer.count(), 1);
}

#[tokio::test]
async fn test_transient_email_failure_retries_with_backoff() {
    let h = harness();
    let wf = h.activate("Single", vec![trigger("t"), email("e", "Hi")], vec![edge("t", "e")]);
    h.fakes
        .mailer
        .failures
        .fail_times(CollaboratorError::Transient("rate limited".into()), 1);
    h.add_contact("c1");
    let id = h.engine.enroll(wf, "c1").await.unwrap().execution_id();
    let t0 = chrono::Utc::now();
    h.drain(t0).await;

    let execution = h.engine.get_execution(id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Running);
    assert_eq!(execution.current_node_id, "e");
    assert_eq!(execution.scheduled_for, t0 + Duration::seconds(60));
    assert_eq!(execution.vars.retry_attempts, 1);

    h.drain(t0 + Duration::seconds(60)).await;
    let execution = h.engine.get_execution(id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(h.fakes.mailer.count(), 1);
}

#[tokio::test]
async fn test_transient_tag_lookup_retries_then_tags() {
    let h = harness();
    let wf = h.activate(
        "Tagger",
        vec![
            trigger("t"),
            Node::new(
                "tag",
                NodeKind::Action(ActionNode {
                    action_type: TagAction::AddTag,
                    tag_id: None,
                    tag_name: Some("engaged".into()),
                }),
            ),
        ],
        vec![edge("t", "tag")],
    );
    h.add_contact("c1");
    let id = h.engine.enroll(wf, "c1").await.unwrap().execution_id();
    h.fakes
        .contacts
        .failures
        .fail_times(CollaboratorError::Timeout(2_000), 1);
    let t0 = chrono::Utc::now();
    h.drain(t0).await;

    let execution = h.engine.get_execution(id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Running);
    assert_eq!(execution.current_node_id, "tag");
    assert_eq!(execution.scheduled_for, t0 + Duration::seconds(60));
    assert_eq!(h.events.count_type(EventType::ExecutionRetryScheduled), 1);

    h.drain(t0 + Duration::seconds(60)).await;
    assert_eq!(h.engine.get_execution(id).unwrap().status, ExecutionStatus::Completed);
    assert_eq!(h.fakes.contacts.contact("c1").unwrap().tag_ids.len(), 1);
}

#[tokio::test]
async fn test_permanent_lookup_failure_fails_without_retry() {
    let h = harness();
    let wf = h.activate(
        "Buyer?",
        vec![
            trigger("t"),
            Node::new(
                "bought",
                NodeKind::Condition(Condition::HasPurchased {
                    product_id: None,
                    course_id: None,
                }),
            ),
            email("thanks", "Thanks"),
        ],
        vec![edge("t", "bought"), handle_edge("bought", "yes", "thanks")],
    );
    h.add_contact("c1");
    let id = h.engine.enroll(wf, "c1").await.unwrap().execution_id();
    h.fakes
        .purchases
        .failures
        .fail_always(CollaboratorError::Permanent("billing API rejected the request".into()));
    h.drain(chrono::Utc::now()).await;

    let execution = h.engine.get_execution(id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error_message.unwrap().starts_with("Purchase lookup failed"));
    assert_eq!(h.events.count_type(EventType::ExecutionRetryScheduled), 0);
    assert_eq!(h.fakes.mailer.count(), 0);
}

#[tokio::test]
async fn test_transient_failures_exhaust_attempts() {
    let h = harness();
    let wf = h.activate("Single", vec![trigger("t"), email("e", "Hi")], vec![edge("t", "e")]);
    h.fakes
        .mailer
        .failures
        .fail_always(CollaboratorError::Timeout(5_000));
    h.add_contact("c1");
    let id = h.engine.enroll(wf, "c1").await.unwrap().execution_id();

    let mut now = chrono::Utc::now();
    for _ in 0..5 {
        h.drain(now).await;
        now += Duration::hours(2);
    }
    let execution = h.engine.get_execution(id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(h.events.count_type(EventType::ExecutionRetryScheduled), 2);
}

#[tokio::test]
async fn test_split_assignment_is_deterministic() {
    let h = harness();
    let wf = h.activate(
        "Split",
        vec![
            trigger("t"),
            Node::new("split", NodeKind::Split(SplitNode { split_percentage: 30.0 })),
            email("a", "Path A"),
            email("b", "Path B"),
        ],
        vec![
            edge("t", "split"),
            handle_edge("split", "a", "a"),
            handle_edge("split", "b", "b"),
        ],
    );
    for i in 0..400 {
        h.add_contact(&format!("c{i}"));
        h.engine.enroll(wf, &format!("c{i}")).await.unwrap();
    }
    h.drain(chrono::Utc::now()).await;

    let a = h
        .fakes
        .mailer
        .sent()
        .iter()
        .filter(|s| s.email.subject == "Path A")
        .count();
    assert_eq!(h.fakes.mailer.count(), 400);
    // 30% of 400 = 120, well inside a 4-sigma band.
    assert!((85..=155).contains(&a), "path A got {a}");

    for execution in h.engine.executions_for_workflow(wf) {
        let path = execution.vars.split_paths["split"];
        let expected = if nurture_engine::assignment::stable_percent(execution.id, "split") < 30.0 {
            "a"
        } else {
            "b"
        };
        assert_eq!(path.handle(), expected);
    }
}

#[tokio::test]
async fn test_goal_enrolls_into_next_workflow() {
    let h = harness();
    let next = h.activate("Onboarding", vec![trigger("t"), email("e", "Welcome aboard")], vec![edge("t", "e")]);
    let wf = h.activate(
        "Sales",
        vec![
            trigger("t"),
            Node::new(
                "won",
                NodeKind::Goal(GoalNode {
                    goal_type: "purchase".into(),
                    description: None,
                    next_workflow_id: Some(next),
                }),
            ),
        ],
        vec![edge("t", "won")],
    );
    h.add_contact("c1");
    let id = h.engine.enroll(wf, "c1").await.unwrap().execution_id();
    h.drain(chrono::Utc::now()).await;

    let execution = h.engine.get_execution(id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.vars.goals_reached, vec!["won".to_string()]);
    assert_eq!(h.engine.get_workflow(wf).unwrap().stats.goals_reached, 1);

    let chained = h.engine.executions_for_workflow(next);
    assert_eq!(chained.len(), 1);
    assert_eq!(chained[0].vars.chained_from, Some(id));
    assert_eq!(chained[0].status, ExecutionStatus::Completed);
    assert_eq!(h.fakes.mailer.count(), 1);
}

#[tokio::test]
async fn test_trigger_event_enrolls_matching_workflows() {
    let h = harness();
    let mut tagged = WorkflowDefinition::new(
        "Tagged",
        Trigger::TagAdded { tag_id: "vip".into() },
        vec![trigger("t"), email("e", "VIP perks")],
        vec![edge("t", "e")],
    );
    tagged.description = Some("Fires when the vip tag lands".into());
    let tagged = h.engine.create_workflow(tagged).unwrap();
    h.engine.activate(tagged.id).unwrap();
    let other = h.engine.create_workflow(WorkflowDefinition::new(
        "Signup",
        Trigger::LeadSignup,
        vec![trigger("t"), email("e", "Hello")],
        vec![edge("t", "e")],
    ))
    .unwrap();
    h.engine.activate(other.id).unwrap();
    h.add_contact("c1");

    let event = TriggerEvent::TagAdded {
        contact_id: "c1".into(),
        tag_id: "vip".into(),
    };
    let report = h.engine.handle_trigger_event(&event).await.unwrap();
    assert_eq!(report.enrolled, 1);
    assert_eq!(h.engine.executions_for_workflow(tagged.id).len(), 1);
    assert!(h.engine.executions_for_workflow(other.id).is_empty());

    // Unsubscribe stops everything for the contact.
    assert_eq!(h.engine.cancel_for_contact("c1").unwrap(), 1);
}
