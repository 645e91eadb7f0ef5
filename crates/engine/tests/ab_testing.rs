mod common;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use common::{edge, email, harness, trigger};
use nurture_core::tracking::TrackingToken;
use nurture_core::types::{EmailEvent, EventType};
use nurture_engine::ab_test::{ABTestConfig, ABTestController, Variant, WinnerMetric};

fn variant(id: &str, subject: &str) -> Variant {
    Variant {
        id: id.into(),
        name: format!("Variant {id}"),
        subject: subject.into(),
        body: None,
        percentage: None,
    }
}

fn subject_test(workflow_id: Uuid, sample_size: u64, threshold: Option<f64>) -> ABTestConfig {
    ABTestConfig {
        workflow_id,
        node_id: "e".into(),
        variants: vec![variant("a", "Quick question"), variant("b", "You're invited")],
        sample_size,
        winner_metric: WinnerMetric::OpenRate,
        auto_select_winner: true,
        winner_threshold: threshold,
        is_enabled: true,
    }
}

#[test]
fn test_equal_split_converges() {
    let controller = ABTestController::new();
    let workflow_id = Uuid::new_v4();
    controller.save(subject_test(workflow_id, 1_000_000, None)).unwrap();

    let mut rng = StdRng::seed_from_u64(7);
    let mut a = 0u32;
    let trials = 10_000;
    for _ in 0..trials {
        let execution_id = Uuid::from_bytes(rng.gen());
        if controller.assign(workflow_id, "e", execution_id).unwrap().id == "a" {
            a += 1;
        }
    }
    let share = f64::from(a) / f64::from(trials);
    assert!((share - 0.5).abs() < 0.02, "variant a share {share}");
}

#[tokio::test]
async fn test_every_send_is_counted_once() {
    let h = harness();
    let wf = h.activate("Subject test", vec![trigger("t"), email("e", "Fallback")], vec![edge("t", "e")]);
    h.engine.save_ab_test(subject_test(wf, 1_000, None)).unwrap();
    let ids: Vec<String> = (0..100).map(|i| format!("c{i}")).collect();
    for id in &ids {
        h.add_contact(id);
    }
    h.engine.enroll_bulk(wf, &ids).await.unwrap();
    h.drain(chrono::Utc::now()).await;

    let stats = h.engine.variant_stats(wf, "e").unwrap();
    let sent: u64 = stats.iter().map(|s| s.sent).sum();
    assert_eq!(sent, 100);
    assert_eq!(h.fakes.mailer.count(), 100);
    for stat in &stats {
        assert!((30..=70).contains(&stat.sent), "{} got {}", stat.variant_id, stat.sent);
    }
    assert_eq!(h.events.count_type(EventType::VariantAssigned), 100);

    // Subjects come from the assigned variant and tokens carry it.
    for sent in h.fakes.mailer.sent() {
        let token = TrackingToken::decode(&sent.email.tracking_token).unwrap();
        let expected = match token.variant_id.as_deref() {
            Some("a") => "Quick question",
            Some("b") => "You're invited",
            other => panic!("unexpected variant {other:?}"),
        };
        assert_eq!(sent.email.subject, expected);
    }
}

#[tokio::test]
async fn test_winner_selected_from_tracked_opens() {
    let h = harness();
    let wf = h.activate("Subject test", vec![trigger("t"), email("e", "Fallback")], vec![edge("t", "e")]);
    h.engine.save_ab_test(subject_test(wf, 100, Some(10.0))).unwrap();
    let ids: Vec<String> = (0..100).map(|i| format!("c{i}")).collect();
    for id in &ids {
        h.add_contact(id);
    }
    h.engine.enroll_bulk(wf, &ids).await.unwrap();
    h.drain(chrono::Utc::now()).await;
    assert!(h.engine.get_ab_test(wf, "e").unwrap().winner.is_none());

    // Everyone who got "a" opens; nobody who got "b" does.
    for sent in h.fakes.mailer.sent() {
        let token = TrackingToken::decode(&sent.email.tracking_token).unwrap();
        h.engine
            .record_email_event(&sent.email.tracking_token, EmailEvent::Delivered)
            .unwrap();
        if token.variant_id.as_deref() == Some("a") {
            h.engine
                .record_email_event(&sent.email.tracking_token, EmailEvent::Opened)
                .unwrap();
        }
    }

    let view = h.engine.get_ab_test(wf, "e").unwrap();
    let winner = view.winner.expect("winner after sample size");
    assert_eq!(winner.variant_id, "a");
    assert!(!winner.manual);
    assert!(winner.confidence >= 50.0 && winner.confidence <= 95.0);
    assert_eq!(h.events.count_type(EventType::WinnerSelected), 1);

    // Later enrollments all get the winner.
    h.add_contact("late");
    h.engine.enroll(wf, "late").await.unwrap();
    h.drain(chrono::Utc::now()).await;
    let late = h.fakes.mailer.sent_to("late@example.com");
    assert_eq!(late[0].email.subject, "Quick question");
}

#[tokio::test]
async fn test_manual_winner_and_reset() {
    let h = harness();
    let wf = h.activate("Subject test", vec![trigger("t"), email("e", "Fallback")], vec![edge("t", "e")]);
    h.engine.save_ab_test(subject_test(wf, 100, None)).unwrap();

    let selection = h.engine.select_winner(wf, "e", "b").unwrap();
    assert!(selection.manual);
    assert!(h.engine.select_winner(wf, "e", "zzz").is_err());

    h.engine.reset_stats(wf, "e").unwrap();
    let view = h.engine.get_ab_test(wf, "e").unwrap();
    assert!(view.winner.is_none());
    assert_eq!(view.config.variants.len(), 2);

    assert!(h.engine.delete_ab_test(wf, "e"));
    assert!(h.engine.variant_stats(wf, "e").is_err());
}

#[tokio::test]
async fn test_ab_test_requires_known_workflow() {
    let h = harness();
    assert!(h.engine.save_ab_test(subject_test(Uuid::new_v4(), 100, None)).is_err());
}
