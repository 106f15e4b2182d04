mod common;

use access_service::models::{Channel, EventKind, NotificationEvent, Payload, SiteRole, Target};
use access_service::services::store::{Claim, DeliveryKey, DeliveryLog, DeliveryState};
use access_service::services::transports::Transport;
use access_service::services::{BatchEntry, Directory, MockTransport, NotificationDispatcher};
use access_service::AccessError;
use chrono::Utc;
use common::{test_config, Harness, Mocks};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

fn event(target: Target, channels: &[Channel]) -> NotificationEvent {
    NotificationEvent::new(
        EventKind::Granted,
        target,
        Payload {
            title: "Door open".to_string(),
            body: "D1 is yours".to_string(),
            data: Default::default(),
        },
        channels.iter().copied().collect(),
    )
}

fn user(user_id: &str) -> Target {
    Target::User {
        user_id: user_id.to_string(),
    }
}

#[tokio::test]
async fn resent_event_is_not_delivered_twice() {
    let h = Harness::new();
    let dispatcher = h.access.dispatcher();
    let event = event(user("U1"), &[Channel::Push, Channel::Email]);

    let first = dispatcher.send(event.clone()).await.unwrap();
    assert_eq!(first.delivered, 2);

    let second = dispatcher.send(event).await.unwrap();
    assert_eq!(second.delivered, 0);
    assert_eq!(second.skipped, 2);

    assert_eq!(h.mocks.push.sent_to("push-u1"), 1);
    assert_eq!(h.mocks.email.sent_to("u1@example.com"), 1);
}

#[tokio::test]
async fn site_target_reaches_every_member_and_reports_gaps() {
    let h = Harness::new();
    let report = h
        .access
        .dispatcher()
        .send(event(
            Target::Site {
                site_id: "S1".to_string(),
            },
            &[Channel::Email],
        ))
        .await
        .unwrap();

    // U1, U2 and M1 have email; R1 only has a phone
    assert_eq!(report.delivered, 3);
    assert_eq!(report.unreachable, vec!["R1:email".to_string()]);
    assert!(report.failed.is_empty());
}

#[tokio::test]
async fn role_target_resolves_through_directory() {
    let h = Harness::new();
    let report = h
        .access
        .dispatcher()
        .send(event(
            Target::Role {
                site_id: "S1".to_string(),
                role: SiteRole::Manager,
            },
            &[Channel::Email, Channel::Push],
        ))
        .await
        .unwrap();

    assert_eq!(report.delivered, 2);
    assert_eq!(h.mocks.email.sent_to("m1@example.com"), 1);
    assert_eq!(h.mocks.push.sent_to("push-m1"), 1);
    assert_eq!(h.mocks.push.sent_to("push-u1"), 0);
}

#[tokio::test]
async fn bad_targets_and_titles_are_validation_errors() {
    let h = Harness::new();
    let dispatcher = h.access.dispatcher();

    let unknown_site = dispatcher
        .send(event(
            Target::Site {
                site_id: "S404".to_string(),
            },
            &[Channel::Push],
        ))
        .await;
    assert!(matches!(unknown_site, Err(AccessError::Validation(_))));

    let no_users = dispatcher
        .send(event(Target::Users { user_ids: vec![] }, &[Channel::Push]))
        .await;
    assert!(matches!(no_users, Err(AccessError::Validation(_))));

    let mut untitled = event(user("U1"), &[Channel::Push]);
    untitled.payload.title = "  ".to_string();
    assert!(matches!(
        dispatcher.send(untitled).await,
        Err(AccessError::Validation(_))
    ));

    assert_eq!(h.mocks.push.sent_count(), 0);
}

#[tokio::test]
async fn site_without_members_is_an_empty_dispatch() {
    let h = Harness::new();
    let report = h
        .access
        .dispatcher()
        .send(event(
            Target::Site {
                site_id: "S2".to_string(),
            },
            &[Channel::Push],
        ))
        .await
        .unwrap();
    assert_eq!(report.delivered, 0);
    assert!(report.failed.is_empty());
}

#[tokio::test]
async fn batch_isolates_malformed_entries() {
    let h = Harness::new();
    let mut entries: Vec<BatchEntry> = (0..5)
        .map(|i| {
            serde_json::from_value(serde_json::json!({
                "kind": "granted",
                "target": { "type": "user", "user_id": "U2" },
                "payload": { "title": format!("Notice {}", i) },
                "channels": ["push"]
            }))
            .unwrap()
        })
        .collect();
    entries.push(
        serde_json::from_value(serde_json::json!({
            "kind": "granted",
            "target": { "type": "user", "user_id": "U2" },
            "payload": { "title": "" },
            "channels": ["push"]
        }))
        .unwrap(),
    );

    let report = h.access.batch_send(entries).await.unwrap();
    assert_eq!(report.total, 6);
    assert_eq!(report.succeeded, 5);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].index, 5);
    assert_eq!(h.mocks.push.sent_to("push-u2"), 5);
}

#[tokio::test]
async fn batch_entry_with_only_failed_deliveries_counts_as_failure() {
    let h = Harness::new();
    h.mocks.push.fail_address("push-u2");

    let entries: Vec<BatchEntry> = ["U1", "U2"]
        .iter()
        .map(|u| {
            serde_json::from_value(serde_json::json!({
                "kind": "extended",
                "target": { "type": "user", "user_id": u },
                "payload": { "title": "Extended" },
                "channels": ["push"]
            }))
            .unwrap()
        })
        .collect();

    let report = h.access.batch_send(entries).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].index, 1);
}

#[tokio::test]
async fn failing_address_is_retried_until_attempts_run_out() {
    let h = Harness::new();
    h.mocks.email.fail_address("u1@example.com");
    let dispatcher = h.access.dispatcher();
    let event = event(user("U1"), &[Channel::Email]);
    let key = DeliveryKey::new(&event.event_id, Channel::Email, "u1@example.com");

    let report = dispatcher.send(event).await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(dispatcher.pending_retries(), 1);

    let second = dispatcher.retry_failed().await;
    assert_eq!(second.failed.len(), 1);
    assert_eq!(dispatcher.pending_retries(), 1);

    let third = dispatcher.retry_failed().await;
    assert_eq!(third.failed.len(), 1);
    assert_eq!(dispatcher.pending_retries(), 0);

    let record = h.store.delivery(&key).await.unwrap().unwrap();
    assert_eq!(record.state, DeliveryState::Failed);
    assert_eq!(record.attempts, 3);
    assert!(record.last_error.is_some());

    // Nothing left to retry
    let idle = dispatcher.retry_failed().await;
    assert_eq!(idle.delivered + idle.failed.len(), 0);
}

#[tokio::test]
async fn transient_failure_recovers_on_retry() {
    let h = Harness::new();
    h.mocks.push.fail_next(1);
    let dispatcher = h.access.dispatcher();
    let event = event(user("U1"), &[Channel::Push]);
    let key = DeliveryKey::new(&event.event_id, Channel::Push, "push-u1");

    let first = dispatcher.send(event.clone()).await.unwrap();
    assert_eq!(first.delivered, 0);
    assert_eq!(first.failed.len(), 1);

    let retried = dispatcher.retry_failed().await;
    assert_eq!(retried.delivered, 1);
    assert_eq!(dispatcher.pending_retries(), 0);

    let record = h.store.delivery(&key).await.unwrap().unwrap();
    assert_eq!(record.state, DeliveryState::Delivered);
    assert_eq!(record.attempts, 2);

    let resend = dispatcher.send(event).await.unwrap();
    assert_eq!(resend.skipped, 1);
    assert_eq!(h.mocks.push.sent_to("push-u1"), 1);
}

#[tokio::test]
async fn slow_transport_times_out_and_is_queued() {
    let mut config = test_config();
    config.dispatch.delivery_timeout_ms = 50;
    let mocks = Mocks {
        push: Arc::new(MockTransport::new(Channel::Push).with_delay(Duration::from_millis(500))),
        email: Arc::new(MockTransport::new(Channel::Email)),
        sms: Arc::new(MockTransport::new(Channel::Sms)),
    };
    let h = Harness::with_mocks(config, mocks);
    let dispatcher = h.access.dispatcher();

    let report = dispatcher
        .send(event(user("U1"), &[Channel::Push, Channel::Email]))
        .await
        .unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].channel, Channel::Push);
    assert_eq!(dispatcher.pending_retries(), 1);
    assert_eq!(h.mocks.push.sent_count(), 0);
}

#[tokio::test]
async fn missing_transport_fails_without_retry() {
    let h = Harness::new();
    let push = Arc::new(MockTransport::new(Channel::Push));
    let dispatcher = NotificationDispatcher::new(
        h.directory.clone() as Arc<dyn Directory>,
        h.store.clone() as Arc<dyn DeliveryLog>,
        vec![push.clone() as Arc<dyn Transport>],
        h.config.dispatch.clone(),
    );

    let report = dispatcher
        .send(event(user("U1"), &[Channel::Push, Channel::Sms]))
        .await
        .unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].channel, Channel::Sms);
    assert_eq!(dispatcher.pending_retries(), 0);
    assert_eq!(push.sent_count(), 1);
}

#[tokio::test]
async fn default_channels_follow_event_kind() {
    let h = Harness::new();
    let event = NotificationEvent::new(
        EventKind::ExpiringSoon,
        user("U1"),
        Payload {
            title: "Ending".to_string(),
            body: String::new(),
            data: Default::default(),
        },
        BTreeSet::new(),
    );

    let report = h.access.dispatch_notification(event).await.unwrap();
    assert_eq!(report.delivered, 2);
    assert_eq!(h.mocks.sms.sent_to("+15550001"), 1);
    assert_eq!(h.mocks.push.sent_to("push-u1"), 1);
    assert_eq!(h.mocks.email.sent_count(), 0);
}

#[tokio::test]
async fn abandoned_claim_is_taken_over_after_its_lease() {
    let mut config = test_config();
    config.dispatch.delivery_timeout_ms = 200;
    let h = Harness::with_config(config);
    let dispatcher = h.access.dispatcher();
    let event = event(user("U1"), &[Channel::Push]);
    let key = DeliveryKey::new(&event.event_id, Channel::Push, "push-u1");

    // A sender that claimed the delivery and never reported back
    let claimed = h
        .store
        .claim(&key, Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(claimed, Claim::Acquired { attempt: 1 });

    let within_lease = dispatcher.send(event.clone()).await.unwrap();
    assert_eq!(within_lease.skipped, 1);
    assert_eq!(h.mocks.push.sent_count(), 0);

    tokio::time::sleep(Duration::from_millis(500)).await;

    let after_lease = dispatcher.send(event).await.unwrap();
    assert_eq!(after_lease.delivered, 1);
    assert_eq!(h.mocks.push.sent_to("push-u1"), 1);

    let record = h.store.delivery(&key).await.unwrap().unwrap();
    assert_eq!(record.state, DeliveryState::Delivered);
    assert_eq!(record.attempts, 2);
}

#[tokio::test]
async fn fresh_claim_is_not_taken_over() {
    let h = Harness::new();
    let key = DeliveryKey::new("evt-1", Channel::Email, "u1@example.com");
    let lease_start = Utc::now() - chrono::Duration::seconds(10);

    assert_eq!(
        h.store.claim(&key, lease_start).await.unwrap(),
        Claim::Acquired { attempt: 1 }
    );
    assert_eq!(h.store.claim(&key, lease_start).await.unwrap(), Claim::InFlight);

    h.store
        .complete(&key, DeliveryState::Delivered, None)
        .await
        .unwrap();
    let far_future = Utc::now() + chrono::Duration::hours(1);
    assert_eq!(
        h.store.claim(&key, far_future).await.unwrap(),
        Claim::AlreadyDelivered
    );
}
