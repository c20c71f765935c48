//! Kill switch behavior across a shared store and against live metrics.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use warden::killswitch::{KillSwitch, KillSwitchSettings, MarkerKind, Trigger};
use warden::monitoring::{ExecutionSample, MonitoringService, MonitoringSettings};
use warden::storage::{InMemoryStore, StateStore};
use warden::{AgentState, ThreatLevel, TriggerKind};

fn shared_store() -> Arc<dyn StateStore> {
    Arc::new(InMemoryStore::new())
}

#[tokio::test]
async fn test_block_survives_restart_on_shared_store() {
    let store = shared_store();
    let first = KillSwitch::new(Arc::clone(&store), KillSwitchSettings::default()).unwrap();
    first
        .trigger(Trigger::new(
            "agent-1",
            TriggerKind::SecurityViolation,
            ThreatLevel::High,
            "exfiltration attempt",
        ))
        .await
        .unwrap();

    let restarted = KillSwitch::new(store, KillSwitchSettings::default()).unwrap();
    let (allowed, reason) = restarted.is_agent_allowed("agent-1").await.unwrap();
    assert!(!allowed);
    assert!(reason.unwrap().contains("exfiltration attempt"));

    let marker = restarted.agent_marker("agent-1").await.unwrap().unwrap();
    assert_eq!(marker.kind, MarkerKind::Blocked);
    assert!(restarted.is_agent_allowed("agent-2").await.unwrap().0);
}

#[tokio::test]
async fn test_poll_escalates_on_repeated_violations() {
    let killswitch = KillSwitch::new(shared_store(), KillSwitchSettings::default()).unwrap();
    let monitoring = MonitoringService::new(MonitoringSettings::default());

    let sample = ExecutionSample {
        success: true,
        latency: Duration::from_millis(20),
        security_violation: true,
        ..ExecutionSample::default()
    };
    for _ in 0..5 {
        monitoring.record_execution("agent-1", &sample).await;
    }
    monitoring
        .record_execution("agent-2", &ExecutionSample::default())
        .await;

    // Five violations is at the limit, not over it.
    assert_eq!(killswitch.poll(&monitoring).await, 0);

    monitoring.record_execution("agent-1", &sample).await;
    assert_eq!(killswitch.poll(&monitoring).await, 1);

    let events = killswitch.get_recent_events(10).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].agent_id, "agent-1");
    assert_eq!(events[0].trigger, TriggerKind::SecurityViolation);
    assert_eq!(events[0].triggered_by, "auto");

    // Already blocked, so the next round stays quiet.
    assert_eq!(killswitch.poll(&monitoring).await, 0);
    assert_eq!(
        killswitch.get_agent_status("agent-1").await.unwrap().state,
        AgentState::Terminated
    );
}

#[tokio::test(start_paused = true)]
async fn test_lapsed_suspension_needs_fresh_activity_to_recur() {
    let killswitch = KillSwitch::new(shared_store(), KillSwitchSettings::default()).unwrap();
    let monitoring = MonitoringService::new(MonitoringSettings::default());
    let failure = ExecutionSample {
        success: false,
        latency: Duration::from_millis(20),
        ..ExecutionSample::default()
    };
    for _ in 0..10 {
        monitoring.record_execution("agent-1", &failure).await;
    }

    assert_eq!(killswitch.poll(&monitoring).await, 1);
    assert!(!killswitch.is_agent_allowed("agent-1").await.unwrap().0);

    tokio::time::advance(Duration::from_secs(31 * 60)).await;
    assert!(killswitch.is_agent_allowed("agent-1").await.unwrap().0);

    // The error rate is still high, but nothing ran since the suspension.
    assert_eq!(killswitch.poll(&monitoring).await, 0);
    assert!(killswitch.is_agent_allowed("agent-1").await.unwrap().0);

    monitoring.record_execution("agent-1", &failure).await;
    assert_eq!(killswitch.poll(&monitoring).await, 1);
    assert!(!killswitch.is_agent_allowed("agent-1").await.unwrap().0);

    let events = killswitch.get_recent_events(10).await;
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.trigger == TriggerKind::ErrorRate));
}

#[tokio::test]
async fn test_emergency_stop_cancels_every_registered_agent() {
    let killswitch = KillSwitch::new(shared_store(), KillSwitchSettings::default()).unwrap();
    let tokens: Vec<CancellationToken> = (0..2).map(|_| CancellationToken::new()).collect();
    killswitch
        .register_agent("agent-1", Uuid::new_v4(), tokens[0].clone())
        .await;
    killswitch
        .register_agent("agent-2", Uuid::new_v4(), tokens[1].clone())
        .await;

    let events = killswitch
        .emergency_stop_all("operator stop", "ops")
        .await
        .unwrap();

    assert_eq!(events.len(), 2);
    assert!(events
        .iter()
        .all(|e| e.threat_level == ThreatLevel::High && e.triggered_by == "ops"));
    assert!(tokens.iter().all(|t| t.is_cancelled()));
    assert!(!killswitch.is_global_shutdown().await.unwrap());

    let status = killswitch.get_system_status().await.unwrap();
    assert_eq!(status.total_events, 2);
    assert_eq!(status.agents_by_state.get("terminated"), Some(&2));
}
