#![allow(missing_docs)]

//! Human-review escalation lifecycle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use teamwire::clock::ManualClock;
use teamwire::escalation::{
    EscalationManager, EscalationParams, EscalationPriority, EscalationStatus,
};

#[tokio::test]
async fn unattended_escalation_expires_and_callbacks_never_fire() {
    let clock = Arc::new(ManualClock::start_now());
    let manager = EscalationManager::with_clock(30, true, clock.clone());

    let request = manager
        .create_escalation(
            EscalationParams::new("refund", "agent-7")
                .priority(EscalationPriority::Medium)
                .timeout_minutes(1),
        )
        .await;
    assert_eq!(request.status, EscalationStatus::Pending);
    assert_eq!(request.assigned_to, None); // no reviewers registered

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    manager
        .on_approval(
            request.id,
            Arc::new(move |_| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        )
        .await;

    clock.advance(Duration::from_secs(120));

    assert_eq!(manager.cleanup_expired().await, 1);
    let history = manager.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, EscalationStatus::Expired);

    // An approval after expiry is refused and the dropped callback stays
    // silent.
    assert!(!manager.process_approval(request.id, "r1", true, None).await);
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    let stats = manager.statistics().await;
    assert_eq!(stats.expired, 1);
    assert_eq!(stats.active_escalations, 0);
}

#[tokio::test]
async fn approval_and_rejection_flow_through_assigned_reviewer() {
    let manager = EscalationManager::new(30, true);
    manager.add_reviewer("r1", "Noor", 2, ["billing".to_string()]).await;

    let first = manager
        .create_escalation(
            EscalationParams::new("refund over limit", "agent-1")
                .context("topic", serde_json::json!("billing"))
                .priority(EscalationPriority::High),
        )
        .await;
    assert_eq!(first.assigned_to.as_deref(), Some("r1"));
    assert_eq!(manager.reviewer("r1").await.unwrap().current_load, 1);

    assert!(manager.process_approval(first.id, "r1", true, Some("within policy")).await);

    let reviewer = manager.reviewer("r1").await.unwrap();
    assert_eq!(reviewer.current_load, 0);
    assert_eq!(reviewer.resolved_count, 1);

    let second = manager
        .create_escalation(EscalationParams::new("chargeback", "agent-2"))
        .await;
    assert!(manager.process_approval(second.id, "r1", false, Some("needs docs")).await);

    let stats = manager.statistics().await;
    assert_eq!(stats.approved, 1);
    assert_eq!(stats.rejected, 1);
    assert!((stats.approval_rate - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn pending_queue_filters_by_reviewer_and_orders_by_priority() {
    let manager = EscalationManager::new(30, true);
    manager.add_reviewer("r1", "Noor", 10, []).await;

    manager
        .create_escalation(EscalationParams::new("low", "a").priority(EscalationPriority::Low))
        .await;
    let urgent = manager
        .create_escalation(
            EscalationParams::new("urgent", "a").priority(EscalationPriority::Urgent),
        )
        .await;

    let all = manager.get_pending_escalations(None).await;
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, urgent.id);

    let for_r1 = manager.get_pending_escalations(Some("r1")).await;
    assert_eq!(for_r1.len(), 2); // both auto-assigned to the only reviewer

    let for_ghost = manager.get_pending_escalations(Some("ghost")).await;
    assert!(for_ghost.is_empty());
}

#[tokio::test]
async fn sweeper_task_drains_stale_entries() {
    let clock = Arc::new(ManualClock::start_now());
    let manager = Arc::new(EscalationManager::with_clock(30, false, clock.clone()));

    manager
        .create_escalation(EscalationParams::new("stale", "a").timeout_minutes(1))
        .await;
    clock.advance(Duration::from_secs(600));

    let sweeper = manager.clone().spawn_sweeper(Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(50)).await;
    sweeper.abort();

    assert_eq!(manager.active_count().await, 0);
    assert_eq!(manager.history().await.len(), 1);
}
