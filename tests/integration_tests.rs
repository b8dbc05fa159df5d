//! Integration tests for the service dispatch pipeline
//!
//! These tests drive the whole system through the message dispatcher,
//! the way a websocket session would:
//! - Geo-filtered fan-out and first-accept-wins arbitration
//! - Expiry of unanswered broadcasts
//! - Room relays and membership
//! - Push fallback for offline users

mod fixtures;

use chrono::{Duration, Utc};
use serde_json::json;
use service_dispatch::error::DispatchError;
use service_dispatch::lifecycle::RequestStatus;
use service_dispatch::store::RequestStore;
use service_dispatch::types::{NewServiceRequest, Principal, Urgency};
use uuid::Uuid;

use fixtures::{
    drain, event_types, service_request_message, TestSystem, CUSTOMER_LAT, CUSTOMER_LNG,
};

fn urgent_plumbing() -> NewServiceRequest {
    NewServiceRequest {
        category: "Plomberie".to_string(),
        lat: CUSTOMER_LAT,
        lng: CUSTOMER_LNG,
        radius_km: Some(10.0),
        urgency: Urgency::Urgent,
        scheduled_for: None,
        description: Some("Fuite sous l'evier".to_string()),
    }
}

#[tokio::test]
async fn test_plumbing_request_reaches_only_nearby_worker() {
    let system = TestSystem::new();
    let customer = Principal::customer("c1");
    let w1 = Principal::worker("w1");
    let w2 = Principal::worker("w2");

    system.seed_worker("w1", "Plomberie", 5.0).await;
    system.seed_worker("w2", "Plomberie", 20.0).await;
    let mut c_rx = system.connect(&customer);
    let mut w1_rx = system.connect(&w1);
    let mut w2_rx = system.connect(&w2);

    // Step 1: customer creates the request
    system
        .send(&customer, service_request_message("Plomberie", 10.0))
        .await;

    assert_eq!(event_types(&drain(&mut c_rx)), vec!["request_created"]);
    let offers = drain(&mut w1_rx);
    assert_eq!(event_types(&offers), vec!["new_service_request"]);
    assert!(drain(&mut w2_rx).is_empty());

    let distance = offers[0]["distance_km"].as_f64().unwrap();
    assert!((distance - 5.0).abs() < 0.1, "distance was {}", distance);
    let request_id = offers[0]["request"]["id"].as_str().unwrap().to_string();

    // Step 2: the nearby worker accepts
    let accept = json!({"type": "request_accepted", "data": {"request_id": request_id}});
    system.send(&w1, accept.clone()).await;

    let customer_events = drain(&mut c_rx);
    assert_eq!(event_types(&customer_events), vec!["request_accepted"]);
    assert_eq!(customer_events[0]["worker_id"], "w1");
    assert!(customer_events[0]["eta_minutes"].as_f64().unwrap() > 0.0);
    assert_eq!(event_types(&drain(&mut w1_rx)), vec!["request_confirmed"]);

    // Step 3: the far worker tries anyway and loses
    system.send(&w2, accept).await;
    let rejected = drain(&mut w2_rx);
    assert_eq!(event_types(&rejected), vec!["request_unavailable"]);
    assert_eq!(rejected[0]["request_id"], request_id);

    let stored = system
        .store
        .load_request(Uuid::parse_str(&request_id).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, RequestStatus::Accepted);
    assert_eq!(stored.assigned_worker_id.as_deref(), Some("w1"));
    assert_eq!(stored.notified_workers, vec!["w1"]);
}

#[tokio::test]
async fn test_losing_accept_is_a_state_conflict() {
    let system = TestSystem::new();
    let customer = Principal::customer("c1");
    system.seed_worker("w1", "Plomberie", 2.0).await;
    system.seed_worker("w2", "Plomberie", 3.0).await;

    let now = Utc::now();
    let request = system
        .lifecycle
        .create_request(&customer, urgent_plumbing(), now)
        .await
        .unwrap();
    system.fan_out.fan_out(&request, now).await.unwrap();

    system
        .lifecycle
        .accept(&Principal::worker("w1"), request.id, now)
        .await
        .unwrap();
    let err = system
        .lifecycle
        .accept(&Principal::worker("w2"), request.id, now)
        .await
        .unwrap_err();
    assert!(matches!(
        DispatchError::classify(&err),
        Some(DispatchError::StateConflict { .. })
    ));

    // The loser keeps no claim and can take other work
    let w2 = system.store.load_worker("w2").await.unwrap().unwrap();
    assert!(!w2.has_active_assignment());
}

#[tokio::test]
async fn test_other_candidates_hear_request_is_taken() {
    let system = TestSystem::new();
    let customer = Principal::customer("c1");
    let w1 = Principal::worker("w1");
    let w2 = Principal::worker("w2");
    system.seed_worker("w1", "Plomberie", 2.0).await;
    system.seed_worker("w2", "Plomberie", 4.0).await;
    let _c_rx = system.connect(&customer);
    let mut w1_rx = system.connect(&w1);
    let mut w2_rx = system.connect(&w2);

    system
        .send(&customer, service_request_message("plomberie", 10.0))
        .await;
    let offer = drain(&mut w1_rx);
    assert_eq!(event_types(&drain(&mut w2_rx)), vec!["new_service_request"]);
    let request_id = offer[0]["request"]["id"].clone();

    system
        .send(
            &w1,
            json!({"type": "request_accepted", "data": {"request_id": request_id}}),
        )
        .await;

    let w2_events = drain(&mut w2_rx);
    assert_eq!(event_types(&w2_events), vec!["request_unavailable"]);
    assert_eq!(w2_events[0]["request_id"], request_id);
}

#[tokio::test]
async fn test_expiry_notifies_customer_once() {
    let system = TestSystem::new();
    let customer = Principal::customer("c1");
    let w1 = Principal::worker("w1");
    system.seed_worker("w1", "Plomberie", 5.0).await;
    let mut c_rx = system.connect(&customer);
    let mut w1_rx = system.connect(&w1);

    let created_at = Utc::now();
    let request = system
        .lifecycle
        .create_request(&customer, urgent_plumbing(), created_at)
        .await
        .unwrap();
    system.fan_out.fan_out(&request, created_at).await.unwrap();
    drain(&mut c_rx);
    drain(&mut w1_rx);

    // Still inside the acceptance window
    let early = system
        .sweeper
        .sweep_once(created_at + Duration::seconds(179))
        .await
        .unwrap();
    assert!(early.is_idle());

    let late = system
        .sweeper
        .sweep_once(created_at + Duration::seconds(181))
        .await
        .unwrap();
    assert_eq!(late.expired, 1);

    let again = system
        .sweeper
        .sweep_once(created_at + Duration::seconds(240))
        .await
        .unwrap();
    assert!(again.is_idle());

    assert_eq!(event_types(&drain(&mut c_rx)), vec!["request_expired"]);
    assert_eq!(event_types(&drain(&mut w1_rx)), vec!["request_expired"]);

    // An accept after expiry is rejected
    let err = system
        .lifecycle
        .accept(&w1, request.id, created_at + Duration::seconds(200))
        .await
        .unwrap_err();
    assert!(matches!(
        DispatchError::classify(&err),
        Some(DispatchError::StateConflict { .. })
    ));
}

#[tokio::test]
async fn test_room_relay_excludes_sender_and_outsiders() {
    let system = TestSystem::new();
    let customer = Principal::customer("c1");
    let worker = Principal::worker("w1");
    let outsider = Principal::worker("w9");
    let mut c_rx = system.connect(&customer);
    let mut w_rx = system.connect(&worker);
    let mut o_rx = system.connect(&outsider);

    for member in [&customer, &worker] {
        system
            .send(member, json!({"type": "join_room", "chat_room_id": 42}))
            .await;
    }

    system
        .send(
            &worker,
            json!({"type": "typing", "chat_room_id": "42", "data": {"is_typing": true}}),
        )
        .await;
    system
        .send(
            &customer,
            json!({"type": "read", "chat_room_id": "42", "data": {"message_id": "m-1"}}),
        )
        .await;

    let to_customer = drain(&mut c_rx);
    assert_eq!(event_types(&to_customer), vec!["typing"]);
    assert_eq!(to_customer[0]["sender_id"], "w1");
    assert_eq!(to_customer[0]["data"]["is_typing"], true);

    let to_worker = drain(&mut w_rx);
    assert_eq!(event_types(&to_worker), vec!["read_receipt"]);
    assert_eq!(to_worker[0]["sender_type"], "customer");
    assert!(drain(&mut o_rx).is_empty());

    // Leaving stops delivery
    system
        .send(&worker, json!({"type": "leave_room", "chat_room_id": "42"}))
        .await;
    system
        .send(
            &customer,
            json!({"type": "chat", "chat_room_id": "42", "content": "still there?"}),
        )
        .await;
    assert!(drain(&mut w_rx).is_empty());
}

#[tokio::test]
async fn test_offline_users_fall_back_to_push() {
    let system = TestSystem::new();
    let customer = Principal::customer("c1");
    let w1 = Principal::worker("w1");
    system.seed_worker("w1", "Plomberie", 5.0).await;

    // Neither side is connected
    let now = Utc::now();
    let request = system
        .lifecycle
        .create_request(&customer, urgent_plumbing(), now)
        .await
        .unwrap();
    let report = system.fan_out.fan_out(&request, now).await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(report.live, 0);

    system.lifecycle.accept(&w1, request.id, now).await.unwrap();
    system.notifier.flush_pushes().await;

    let worker_pushes = system.push.sent_to("w1");
    assert_eq!(worker_pushes.len(), 1);
    assert_eq!(worker_pushes[0].data["type"], "new_service_request");

    // request_created has no push form; the accept does
    let customer_pushes = system.push.sent_to("c1");
    assert_eq!(customer_pushes.len(), 1);
    assert_eq!(customer_pushes[0].data["type"], "request_accepted");
    assert_eq!(
        customer_pushes[0].data["request_id"],
        json!(request.id.to_string())
    );
}

#[tokio::test]
async fn test_cancel_after_accept_frees_worker() {
    let system = TestSystem::new();
    let customer = Principal::customer("c1");
    let w1 = Principal::worker("w1");
    system.seed_worker("w1", "Plomberie", 1.0).await;
    let mut w1_rx = system.connect(&w1);

    let now = Utc::now();
    let first = system
        .lifecycle
        .create_request(&customer, urgent_plumbing(), now)
        .await
        .unwrap();
    system.fan_out.fan_out(&first, now).await.unwrap();
    system.lifecycle.accept(&w1, first.id, now).await.unwrap();
    drain(&mut w1_rx);

    let cancelled = system
        .lifecycle
        .cancel(&customer, first.id, now)
        .await
        .unwrap();
    assert_eq!(cancelled.status, RequestStatus::Cancelled);
    assert_eq!(event_types(&drain(&mut w1_rx)), vec!["request_cancelled"]);

    // The worker is eligible again for the next request
    let second = system
        .lifecycle
        .create_request(&customer, urgent_plumbing(), now)
        .await
        .unwrap();
    let report = system.fan_out.fan_out(&second, now).await.unwrap();
    assert_eq!(report.live, 1);
    system.lifecycle.accept(&w1, second.id, now).await.unwrap();
}

#[tokio::test]
async fn test_full_job_lifecycle_through_dispatcher() {
    let system = TestSystem::new();
    let customer = Principal::customer("c1");
    let w1 = Principal::worker("w1");
    let mut c_rx = system.connect(&customer);
    let mut w1_rx = system.connect(&w1);

    system
        .send(
            &w1,
            json!({
                "type": "worker_availability",
                "data": {"is_available": true, "lat": CUSTOMER_LAT + 0.02,
                         "lng": CUSTOMER_LNG, "category": "Electricite"}
            }),
        )
        .await;
    system
        .send(&customer, service_request_message("electricite", 10.0))
        .await;
    drain(&mut c_rx);
    let offer = drain(&mut w1_rx);
    let request_id = offer[0]["request"]["id"].clone();

    for kind in ["request_accepted", "request_started", "request_completed"] {
        system
            .send(&w1, json!({"type": kind, "data": {"request_id": request_id}}))
            .await;
    }

    assert_eq!(
        event_types(&drain(&mut c_rx)),
        vec!["request_accepted", "request_started", "request_completed"]
    );

    let id = Uuid::parse_str(request_id.as_str().unwrap()).unwrap();
    let stored = system.store.load_request(id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Completed);
    assert!(stored.completed_at.is_some());
    let w1_state = system.store.load_worker("w1").await.unwrap().unwrap();
    assert!(!w1_state.has_active_assignment());
}

#[tokio::test]
async fn test_scheduled_request_is_promoted_by_sweeper() {
    let system = TestSystem::new();
    let customer = Principal::customer("c1");
    system.seed_worker("w1", "Plomberie", 3.0).await;
    let mut w1_rx = system.connect(&Principal::worker("w1"));

    let now = Utc::now();
    let draft = NewServiceRequest {
        urgency: Urgency::Scheduled,
        scheduled_for: Some(now + Duration::minutes(10)),
        ..urgent_plumbing()
    };
    let request = system
        .lifecycle
        .create_request(&customer, draft, now)
        .await
        .unwrap();
    assert_eq!(request.status, RequestStatus::Scheduled);

    let before = system
        .sweeper
        .sweep_once(now + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(before.promoted, 0);
    assert!(drain(&mut w1_rx).is_empty());

    let due = system
        .sweeper
        .sweep_once(now + Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(due.promoted, 1);
    assert_eq!(event_types(&drain(&mut w1_rx)), vec!["new_service_request"]);

    let stored = system.store.load_request(request.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Broadcast);
    assert!(stored.expires_at.is_some());
}
