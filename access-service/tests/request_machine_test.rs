mod common;

use access_service::models::audit::token_fingerprint;
use access_service::models::{AuditAction, HoldStatus, Outcome, RequestStatus};
use access_service::models::Channel;
use access_service::services::request_machine::RESOURCE_HELD;
use access_service::services::store::{AuditStore, RequestStore};
use access_service::services::{AccessRequestMachine, Directory, MockTransport};
use access_service::AccessError;
use chrono::{Duration, Utc};
use common::{submit_access, test_config, Harness, Mocks};
use std::sync::Arc;

/// A machine over the harness store, for calling lifecycle steps directly.
fn machine(h: &Harness) -> AccessRequestMachine {
    AccessRequestMachine::new(
        h.store.clone() as Arc<dyn RequestStore>,
        h.store.clone() as Arc<dyn AuditStore>,
        h.ledger(),
        h.codec(),
        h.directory.clone() as Arc<dyn Directory>,
        h.config.token.clone(),
    )
}

#[tokio::test]
async fn decided_request_refuses_further_decisions() {
    let h = Harness::new();
    let decision = h.grant("U1", "D1").await;
    let request_id = decision.request.request_id.clone();
    let before = h.access.get_access_request(&request_id).await.unwrap();

    let again = h
        .access
        .decide_access_request(&request_id, Outcome::Deny, Some("changed my mind".into()))
        .await;
    assert!(matches!(again, Err(AccessError::InvalidState(_))));

    let after = h.access.get_access_request(&request_id).await.unwrap();
    assert_eq!(after, before);
    assert_eq!(after.version, before.version);
    assert_eq!(after.status, RequestStatus::Granted);
}

#[tokio::test]
async fn deny_records_reason_and_notifies_requester() {
    let h = Harness::new();
    let request_id = h.submit("U2", "D1").await;

    let decision = h
        .access
        .decide_access_request(&request_id, Outcome::Deny, Some("after hours".into()))
        .await
        .unwrap();
    assert!(!decision.granted());
    assert!(decision.hold.is_none());
    assert!(decision.token.is_none());
    assert_eq!(decision.request.reason.as_deref(), Some("after hours"));
    assert!(decision.request.decided_at.is_some());

    assert_eq!(h.mocks.push.sent_to("push-u2"), 1);
    assert_eq!(h.mocks.push.sent_with_title("Access denied"), 1);
}

#[tokio::test]
async fn held_door_denies_then_frees_after_sweep() {
    let h = Harness::new();
    let first = h.grant("U1", "D1").await;
    let hold = first.hold.unwrap();

    let contender = h.submit("U2", "D1").await;
    let denied = h
        .access
        .decide_access_request(&contender, Outcome::Grant, None)
        .await
        .unwrap();
    assert_eq!(denied.request.status, RequestStatus::Denied);
    assert_eq!(denied.request.reason.as_deref(), Some(RESOURCE_HELD));
    assert!(denied.token.is_none());

    h.access
        .run_sweep(Some(hold.expires_at + Duration::seconds(1)), false)
        .await
        .unwrap();

    let retry = h.grant("U2", "D1").await;
    assert!(retry.granted());
    assert_eq!(retry.hold.unwrap().user_id, "U2");
}

#[tokio::test]
async fn grant_uses_requested_ttl() {
    let h = Harness::new();
    let mut input = submit_access("U1", "S1", "D1");
    input.ttl_minutes = Some(5);
    let before = Utc::now();
    let request = h.access.submit_access_request(input).await.unwrap();

    let decision = h
        .access
        .decide_access_request(&request.request_id, Outcome::Grant, None)
        .await
        .unwrap();
    let hold = decision.hold.unwrap();

    assert!(hold.expires_at <= before + Duration::minutes(5) + Duration::seconds(2));
    assert!(hold.expires_at >= before + Duration::minutes(5) - Duration::seconds(1));
    assert_eq!(decision.request.hold_id.as_deref(), Some(hold.hold_id.as_str()));
}

#[tokio::test]
async fn submit_rejects_bad_requests() {
    let h = Harness::new();

    let cases = [
        submit_access("U1", "S404", "D1"),
        submit_access("U1", "S1", "D9"),
        submit_access("   ", "S1", "D1"),
        {
            let mut input = submit_access("U1", "S1", "D1");
            input.permissions = [" ".to_string()].into_iter().collect();
            input
        },
        {
            let mut input = submit_access("U1", "S1", "D1");
            input.ttl_minutes = Some(h.config.token.max_ttl_minutes + 1);
            input
        },
        {
            let mut input = submit_access("U1", "S1", "D1");
            input.ttl_minutes = Some(0);
            input
        },
    ];

    for input in cases {
        let result = h.access.submit_access_request(input.clone()).await;
        assert!(
            matches!(result, Err(AccessError::Validation(_))),
            "expected validation error for {:?}",
            input
        );
    }
}

#[tokio::test]
async fn audit_failures_do_not_block_decisions() {
    let h = Harness::new();
    h.store.set_audit_failure(true);

    let decision = h.grant("U1", "D1").await;
    assert!(decision.token.is_some());

    let records = h
        .store
        .records_for_request(&decision.request.request_id)
        .await
        .unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn audit_trail_stores_fingerprints_only() {
    let h = Harness::new();
    let decision = h.grant("U1", "D1").await;
    let token = decision.token.unwrap();
    let hold = decision.hold.unwrap();

    let extended = h.access.extend_hold(&hold.hold_id, 10).await.unwrap();

    let records = h
        .store
        .records_for_request(&decision.request.request_id)
        .await
        .unwrap();
    let actions: Vec<AuditAction> = records.iter().map(|r| r.action).collect();
    assert_eq!(
        actions,
        vec![
            AuditAction::Submitted,
            AuditAction::Granted,
            AuditAction::TokenIssued,
            AuditAction::Extended,
            AuditAction::TokenReissued,
        ]
    );

    let issued = &records[2];
    assert_eq!(issued.token_fingerprint, Some(token_fingerprint(&token)));
    let reissued = &records[4];
    assert_eq!(
        reissued.token_fingerprint,
        Some(token_fingerprint(&extended.token))
    );
    assert!(records
        .iter()
        .filter_map(|r| r.token_fingerprint.as_deref())
        .all(|f| f != token && f != extended.token));
}

#[tokio::test]
async fn close_is_idempotent_and_requires_a_grant() {
    let h = Harness::new();
    let machine = machine(&h);
    let now = Utc::now();

    let decision = h.grant("U1", "D1").await;
    let request_id = decision.request.request_id;

    let closed = machine
        .close(&request_id, RequestStatus::Revoked, now)
        .await
        .unwrap();
    assert_eq!(closed.status, RequestStatus::Revoked);

    let again = machine
        .close(&request_id, RequestStatus::Revoked, now)
        .await
        .unwrap();
    assert_eq!(again.version, closed.version);

    let other = machine.close(&request_id, RequestStatus::Expired, now).await;
    assert!(matches!(other, Err(AccessError::InvalidState(_))));

    let pending = h.submit("U2", "D2").await;
    let not_granted = machine.close(&pending, RequestStatus::Expired, now).await;
    assert!(matches!(not_granted, Err(AccessError::InvalidState(_))));

    let bad_target = machine.close(&pending, RequestStatus::Denied, now).await;
    assert!(matches!(bad_target, Err(AccessError::Validation(_))));
}

#[tokio::test]
async fn revoke_closes_request_and_frees_door() {
    let h = Harness::new();
    let decision = h.grant("U1", "D1").await;
    let hold = decision.hold.unwrap();

    let revoked = h.access.revoke_hold(&hold.hold_id, "shift over").await.unwrap();
    assert_eq!(revoked.status, HoldStatus::Revoked);

    let request = h
        .access
        .get_access_request(&decision.request.request_id)
        .await
        .unwrap();
    assert_eq!(request.status, RequestStatus::Revoked);

    let blank = h.access.revoke_hold(&hold.hold_id, "  ").await;
    assert!(matches!(blank, Err(AccessError::Validation(_))));
    let again = h.access.revoke_hold(&hold.hold_id, "again").await;
    assert!(matches!(again, Err(AccessError::InvalidState(_))));

    h.grant("U2", "D1").await;
}

#[tokio::test]
async fn extension_beyond_limit_is_rejected() {
    let h = Harness::new();
    let hold = h.grant("U1", "D1").await.hold.unwrap();

    let too_long = h
        .access
        .extend_hold(&hold.hold_id, h.config.token.max_ttl_minutes + 1)
        .await;
    assert!(matches!(too_long, Err(AccessError::Validation(_))));
    assert_eq!(
        h.ledger().get(&hold.hold_id).await.unwrap().extension_count,
        0
    );
}

#[tokio::test]
async fn token_validation_tracks_hold_state() {
    let h = Harness::new();
    let decision = h.grant("U1", "D1").await;
    let token = decision.token.unwrap();

    let valid = h.access.validate_access_token(&token).await.unwrap();
    assert!(valid.is_valid());

    let hold = decision.hold.unwrap();
    h.access
        .run_sweep(Some(hold.expires_at + Duration::seconds(1)), false)
        .await
        .unwrap();

    let invalid = h.access.validate_access_token(&token).await.unwrap();
    assert!(!invalid.is_valid());
}

/// A service whose push deliveries take longer than a whole operation may.
fn slow_push_harness() -> Harness {
    let mut config = test_config();
    config.operation_timeout_ms = 100;
    config.dispatch.delivery_timeout_ms = 1_000;
    let mocks = Mocks {
        push: Arc::new(
            MockTransport::new(Channel::Push).with_delay(std::time::Duration::from_millis(300)),
        ),
        email: Arc::new(MockTransport::new(Channel::Email)),
        sms: Arc::new(MockTransport::new(Channel::Sms)),
    };
    Harness::with_mocks(config, mocks)
}

#[tokio::test]
async fn slow_notifications_do_not_fail_a_committed_grant() {
    let h = slow_push_harness();
    let request_id = h.submit("U1", "D1").await;

    let decision = h
        .access
        .decide_access_request(&request_id, Outcome::Grant, None)
        .await
        .unwrap();
    assert!(decision.token.is_some());
    assert_eq!(
        h.access.get_access_request(&request_id).await.unwrap().status,
        RequestStatus::Granted
    );

    // The push announcement is still on its way and lands on its own
    tokio::time::sleep(std::time::Duration::from_millis(800)).await;
    assert_eq!(h.mocks.push.sent_to("push-u1"), 1);
    assert_eq!(h.mocks.email.sent_to("u1@example.com"), 1);
    assert_eq!(h.access.dispatcher().pending_retries(), 0);
}

#[tokio::test]
async fn slow_notifications_do_not_fail_a_committed_sweep() {
    let h = slow_push_harness();
    let hold = h.grant("U1", "D1").await.hold.unwrap();
    let after = hold.expires_at + Duration::seconds(1);

    let report = h.access.run_sweep(Some(after), false).await.unwrap();
    assert_eq!(report.expired, vec![hold.hold_id.clone()]);

    tokio::time::sleep(std::time::Duration::from_millis(800)).await;
    assert_eq!(h.mocks.push.sent_with_title("Access expired"), 1);
    assert_eq!(
        h.access
            .get_access_request(&hold.request_id)
            .await
            .unwrap()
            .status,
        RequestStatus::Expired
    );
}

#[tokio::test]
async fn slow_notifications_do_not_fail_a_committed_revoke() {
    let h = slow_push_harness();
    let hold = h.grant("U1", "D1").await.hold.unwrap();

    let revoked = h.access.revoke_hold(&hold.hold_id, "shift over").await.unwrap();
    assert_eq!(revoked.status, HoldStatus::Revoked);

    tokio::time::sleep(std::time::Duration::from_millis(800)).await;
    assert_eq!(h.mocks.push.sent_with_title("Access revoked"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_grants_of_one_request_leave_one_hold() {
    let h = Harness::new();

    for door in ["D1", "D2", "D3"] {
        let request_id = h.submit("U1", door).await;
        let attempts: Vec<_> = (0..2)
            .map(|_| {
                let access = h.access.clone();
                let request_id = request_id.clone();
                tokio::spawn(async move {
                    access
                        .decide_access_request(&request_id, Outcome::Grant, None)
                        .await
                })
            })
            .collect();

        let mut granted = 0;
        let mut conflicts = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(decision) => {
                    assert!(decision.granted());
                    granted += 1;
                }
                Err(AccessError::InvalidState(_)) => conflicts += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!((granted, conflicts), (1, 1), "door {}", door);

        let request = h.access.get_access_request(&request_id).await.unwrap();
        assert_eq!(request.status, RequestStatus::Granted);
        let live = h.ledger().live_hold_for(door).await.unwrap().unwrap();
        assert_eq!(Some(live.hold_id), request.hold_id);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_grant_and_deny_never_strand_a_hold() {
    let h = Harness::new();

    for door in ["D1", "D2", "D3"] {
        let request_id = h.submit("U2", door).await;
        let grant = {
            let access = h.access.clone();
            let request_id = request_id.clone();
            tokio::spawn(async move {
                access
                    .decide_access_request(&request_id, Outcome::Grant, None)
                    .await
            })
        };
        let deny = {
            let access = h.access.clone();
            let request_id = request_id.clone();
            tokio::spawn(async move {
                access
                    .decide_access_request(&request_id, Outcome::Deny, Some("no".into()))
                    .await
            })
        };

        let results = [grant.await.unwrap(), deny.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1, "door {}", door);
        for result in &results {
            if let Err(e) = result {
                assert!(matches!(e, AccessError::InvalidState(_)), "unexpected error: {}", e);
            }
        }

        let request = h.access.get_access_request(&request_id).await.unwrap();
        let live = h.ledger().live_hold_for(door).await.unwrap();
        match request.status {
            RequestStatus::Granted => {
                assert_eq!(live.map(|hold| hold.hold_id), request.hold_id);
            }
            RequestStatus::Denied => assert!(live.is_none(), "door {} left held", door),
            other => panic!("unexpected request status {}", other),
        }
    }

    // A grant rolled back before it committed was never announced
    assert_eq!(h.mocks.push.sent_with_title("Access revoked"), 0);
}
