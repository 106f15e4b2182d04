mod common;

use access_service::models::{HoldStatus, NewHold, RequestStatus};
use access_service::AccessError;
use chrono::{DateTime, Duration, Utc};
use common::Harness;
use tokio::sync::watch;

#[tokio::test]
async fn repeated_sweeps_expire_and_notify_once() {
    let h = Harness::new();
    let decision = h.grant("U1", "D1").await;
    let hold = decision.hold.unwrap();
    let after = hold.expires_at + Duration::seconds(1);

    let first = h.access.sweeper().run_sweep(after).await.unwrap();
    assert_eq!(first.expired, vec![hold.hold_id.clone()]);
    assert_eq!(first.errors, 0);

    let second = h.access.sweeper().run_sweep(after).await.unwrap();
    assert!(second.expired.is_empty());

    assert_eq!(h.mocks.push.sent_with_title("Access expired"), 1);

    let request = h
        .access
        .get_access_request(&decision.request.request_id)
        .await
        .unwrap();
    assert_eq!(request.status, RequestStatus::Expired);
    assert!(request.closed_at.is_some());

    let stored = h.ledger().get(&hold.hold_id).await.unwrap();
    assert_eq!(stored.status, HoldStatus::Expired);
}

#[tokio::test]
async fn sweep_before_expiry_changes_nothing() {
    let h = Harness::new();
    let hold = h.grant("U1", "D1").await.hold.unwrap();

    let report = h
        .access
        .sweeper()
        .run_sweep(hold.expires_at - Duration::seconds(1))
        .await
        .unwrap();
    assert!(report.expired.is_empty());
    assert_eq!(
        h.ledger().get(&hold.hold_id).await.unwrap().status,
        HoldStatus::Active
    );
}

#[tokio::test]
async fn extended_hold_survives_sweep_at_old_expiry() {
    let h = Harness::new();
    let hold = h.grant("U1", "D1").await.hold.unwrap();

    let extended = h.access.extend_hold(&hold.hold_id, 15).await.unwrap();
    assert_eq!(extended.new_expires_at, hold.expires_at + Duration::minutes(15));

    let report = h
        .access
        .run_sweep(Some(hold.expires_at + Duration::seconds(1)), false)
        .await
        .unwrap();
    assert!(report.expired.is_empty());

    let stored = h.ledger().get(&hold.hold_id).await.unwrap();
    assert_eq!(stored.status, HoldStatus::Extended);
    assert!(stored.live);
}

#[tokio::test]
async fn expiring_warning_is_sent_once() {
    let h = Harness::new();
    let hold = h.grant("U1", "D1").await.hold.unwrap();
    let near_end = hold.expires_at - Duration::minutes(5);

    let first = h.access.sweeper().warn_expiring(near_end).await.unwrap();
    assert_eq!(first.warned, vec![hold.hold_id.clone()]);

    let second = h.access.sweeper().warn_expiring(near_end).await.unwrap();
    assert!(second.warned.is_empty());

    assert_eq!(h.mocks.push.sent_with_title("Access expiring soon"), 1);
    assert_eq!(h.mocks.sms.sent_to("+15550001"), 1);
    assert_eq!(
        h.ledger().get(&hold.hold_id).await.unwrap().status,
        HoldStatus::Expiring
    );
}

#[tokio::test]
async fn holds_outside_the_window_are_not_warned() {
    let h = Harness::new();
    let hold = h.grant("U1", "D1").await.hold.unwrap();

    let report = h
        .access
        .run_sweep(Some(hold.expires_at - Duration::minutes(30)), true)
        .await
        .unwrap();
    assert!(report.warned.is_empty());
    assert!(report.expired.is_empty());
}

#[tokio::test]
async fn sweep_instant_out_of_range_is_a_validation_error() {
    let h = Harness::new();
    let result = h
        .access
        .run_sweep(Some(DateTime::<Utc>::MAX_UTC), true)
        .await;
    assert!(matches!(result, Err(AccessError::Validation(_))));
}

#[tokio::test]
async fn lookup_expires_a_lapsed_hold() {
    let h = Harness::new();
    let past = Utc::now() - Duration::hours(2);
    let hold = h
        .ledger()
        .create(
            NewHold {
                request_id: "req-orphan".to_string(),
                resource_id: "D2".to_string(),
                user_id: "U2".to_string(),
                site_id: "S1".to_string(),
                permissions: ["open".to_string()].into_iter().collect(),
                ttl: Duration::minutes(60),
            },
            past,
        )
        .await
        .unwrap();

    let fetched = h.access.get_hold(&hold.hold_id).await.unwrap();
    assert_eq!(fetched.status, HoldStatus::Expired);
    assert!(!fetched.live);

    let again = h.access.get_hold(&hold.hold_id).await.unwrap();
    assert_eq!(again.status, HoldStatus::Expired);
    assert_eq!(h.mocks.push.sent_with_title("Access expired"), 1);
}

#[tokio::test]
async fn spawned_sweeper_stops_on_shutdown() {
    let h = Harness::new();
    let (tx, rx) = watch::channel(false);

    let handle = h.access.sweeper().clone().spawn(rx);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    tx.send(true).unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(2), handle)
        .await
        .expect("sweeper did not stop")
        .unwrap();
}

#[tokio::test]
async fn spawned_retry_worker_stops_on_shutdown() {
    let h = Harness::new();
    let (tx, rx) = watch::channel(false);

    let handle = h.access.dispatcher().clone().spawn_retry_worker(rx);
    tx.send(true).unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(2), handle)
        .await
        .expect("retry worker did not stop")
        .unwrap();
}
