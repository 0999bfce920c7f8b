//! Per-session periodic evaluator.
//!
//! One scheduler loop runs per active session so subscription sets stay
//! isolated: a heavy subscriber cannot delay another session's delivery. The
//! tick is fixed and finer-grained than the finest supported subscription
//! interval; each tick evaluates only the subscriptions whose interval has
//! elapsed since their last successful send.
use crate::{DeltaDecision, MetricStore, SessionHandle, StreamError};
use serde_json::Value;
use skiff_wire::ServerMessage;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// Drives [`scheduler_pass`] on a fixed tick until the session's cancellation
/// signal fires.
pub async fn run_session_scheduler(
    store: Arc<MetricStore>,
    session: Arc<SessionHandle>,
    tick: Duration,
    mut cancel: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                scheduler_pass(&store, &session, Instant::now());
            }
        }
    }
    tracing::debug!(session = %session.id(), "scheduler stopped");
}

/// One evaluation pass over a session's subscriptions.
///
/// For every due subscription: look up the channel snapshot (absent channels
/// are silently skipped), apply filters and field projection, run the delta
/// comparison when enabled, and enqueue the event. `last_sent_at` only
/// advances on a successful enqueue; suppressed and dropped sends leave the
/// interval clock untouched so the channel keeps being evaluated every tick.
pub fn scheduler_pass(store: &MetricStore, session: &SessionHandle, now: Instant) {
    let mut subscriptions = session.subscriptions.lock();
    for subscription in subscriptions.values_mut() {
        if !subscription.due(now) {
            continue;
        }
        let Some(snapshot) = store.get(&subscription.channel) else {
            // Channel has not published yet; not an error.
            continue;
        };
        if let Some(filters) = &subscription.filters
            && !matches_filters(&snapshot.value, filters)
        {
            continue;
        }
        let payload = match &subscription.fields {
            Some(fields) => project_fields(&snapshot.value, fields),
            None => snapshot.value.clone(),
        };

        let delta_enabled = subscription.delta_only && session.delta_capable();
        let delta = if delta_enabled {
            match session.delta.lock().observe(&subscription.channel, &payload) {
                DeltaDecision::Unchanged => continue,
                DeltaDecision::Full => false,
                DeltaDecision::Delta => true,
            }
        } else {
            false
        };

        let message = ServerMessage::Event {
            timestamp: snapshot.captured_at,
            channel: subscription.channel.clone(),
            data: payload.clone(),
            delta,
            sequence: Some(session.next_sequence()),
        };
        match session.enqueue(message) {
            Ok(()) => {
                subscription.last_sent_at = Some(now);
                if !delta_enabled {
                    // The baseline only reflects payloads that actually went
                    // out; a dropped send leaves it untouched.
                    session.delta.lock().prime(&subscription.channel, &payload);
                }
                metrics::counter!("skiff_events_sent_total").increment(1);
            }
            Err(StreamError::QueueFull { session, channel }) => {
                // Best-effort delivery: the freshest update is lost, the
                // session stays up.
                tracing::warn!(session = %session, channel = %channel, "outbound queue full, event dropped");
            }
            Err(err) => {
                tracing::debug!(error = %err, "enqueue after close");
            }
        }
    }
}

// Keep only the listed top-level keys of an object payload. Non-object
// payloads pass through untouched.
fn project_fields(value: &Value, fields: &[String]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            fields
                .iter()
                .filter_map(|field| map.get(field).map(|v| (field.clone(), v.clone())))
                .collect(),
        ),
        other => other.clone(),
    }
}

// Every filter key must be present in the payload with an equal value.
fn matches_filters(value: &Value, filters: &BTreeMap<String, Value>) -> bool {
    filters
        .iter()
        .all(|(key, expected)| value.get(key) == Some(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionReceivers;
    use serde_json::json;
    use skiff_wire::{Capabilities, ChannelRequest, ClientKind};

    fn delta_session() -> (Arc<SessionHandle>, SessionReceivers) {
        let (session, receivers) = SessionHandle::new(16);
        session.connect(
            ClientKind::Browser,
            Capabilities {
                delta: true,
                ..Capabilities::default()
            },
        );
        (session, receivers)
    }

    fn subscribe(session: &SessionHandle, channel: &str, delta_only: bool) {
        session.subscribe(vec![ChannelRequest {
            channel: channel.to_string(),
            interval: 1,
            fields: None,
            filters: None,
            delta_only,
        }]);
    }

    fn recv_event(receivers: &mut SessionReceivers) -> ServerMessage {
        receivers.outbound.try_recv().expect("queued event")
    }

    #[test]
    fn first_send_is_always_full() {
        let store = MetricStore::new();
        let (session, mut receivers) = delta_session();
        subscribe(&session, "system.stats", true);
        store.publish("system.stats", json!({"cpu": 10}));

        scheduler_pass(&store, &session, Instant::now());

        match recv_event(&mut receivers) {
            ServerMessage::Event { channel, data, delta, sequence, .. } => {
                assert_eq!(channel, "system.stats");
                assert_eq!(data, json!({"cpu": 10}));
                assert!(!delta);
                assert_eq!(sequence, Some(1));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn absent_channel_is_silently_skipped() {
        let store = MetricStore::new();
        let (session, mut receivers) = delta_session();
        subscribe(&session, "system.stats", true);

        scheduler_pass(&store, &session, Instant::now());
        assert!(receivers.outbound.try_recv().is_err());
    }

    #[test]
    fn suppression_does_not_advance_the_interval_clock() {
        let store = MetricStore::new();
        let (session, mut receivers) = delta_session();
        subscribe(&session, "system.stats", true);
        store.publish("system.stats", json!({"cpu": 10}));

        let start = Instant::now();
        scheduler_pass(&store, &session, start);
        let _ = recv_event(&mut receivers);

        // Unchanged value across several ticks: nothing sent, last_sent_at
        // frozen at the first send.
        for tick in 1..=5u64 {
            scheduler_pass(&store, &session, start + Duration::from_secs(tick));
        }
        assert!(receivers.outbound.try_recv().is_err());
        {
            let subscriptions = session.subscriptions.lock();
            let last_sent = subscriptions
                .get("system.stats")
                .and_then(|s| s.last_sent_at)
                .expect("sent once");
            assert_eq!(last_sent, start);
        }

        // The moment the value changes the very next pass sends, without
        // waiting a fresh full interval.
        store.publish("system.stats", json!({"cpu": 55}));
        scheduler_pass(&store, &session, start + Duration::from_millis(5100));
        match recv_event(&mut receivers) {
            ServerMessage::Event { data, delta, .. } => {
                assert_eq!(data, json!({"cpu": 55}));
                assert!(delta);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn subscription_not_due_before_interval_elapses() {
        let store = MetricStore::new();
        let (session, mut receivers) = delta_session();
        subscribe(&session, "system.stats", false);
        store.publish("system.stats", json!({"cpu": 10}));

        let start = Instant::now();
        scheduler_pass(&store, &session, start);
        let _ = recv_event(&mut receivers);

        store.publish("system.stats", json!({"cpu": 20}));
        scheduler_pass(&store, &session, start + Duration::from_millis(500));
        assert!(receivers.outbound.try_recv().is_err());
        scheduler_pass(&store, &session, start + Duration::from_secs(1));
        match recv_event(&mut receivers) {
            ServerMessage::Event { data, delta, .. } => {
                assert_eq!(data, json!({"cpu": 20}));
                assert!(!delta);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unsubscribe_then_resubscribe_sends_full_again() {
        let store = MetricStore::new();
        let (session, mut receivers) = delta_session();
        subscribe(&session, "system.stats", true);
        store.publish("system.stats", json!({"cpu": 10}));

        scheduler_pass(&store, &session, Instant::now());
        let _ = recv_event(&mut receivers);

        session.unsubscribe(&["system.stats".to_string()]);
        subscribe(&session, "system.stats", true);

        // Same value as before, but the baseline was cleared: full send, not
        // a diff against stale state.
        scheduler_pass(&store, &session, Instant::now());
        match recv_event(&mut receivers) {
            ServerMessage::Event { delta, data, .. } => {
                assert!(!delta);
                assert_eq!(data, json!({"cpu": 10}));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn capability_without_delta_disables_suppression() {
        let store = MetricStore::new();
        let (session, mut receivers) = SessionHandle::new(16);
        session.connect(ClientKind::Mobile, Capabilities::default());
        subscribe(&session, "system.stats", true);
        store.publish("system.stats", json!({"cpu": 10}));

        let start = Instant::now();
        scheduler_pass(&store, &session, start);
        scheduler_pass(&store, &session, start + Duration::from_secs(1));

        // Two full sends despite delta_only: the client opted out of delta.
        for _ in 0..2 {
            match recv_event(&mut receivers) {
                ServerMessage::Event { delta, .. } => assert!(!delta),
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[test]
    fn fields_projection_limits_payload() {
        let store = MetricStore::new();
        let (session, mut receivers) = delta_session();
        session.subscribe(vec![ChannelRequest {
            channel: "system.stats".to_string(),
            interval: 1,
            fields: Some(vec!["cpu".to_string()]),
            filters: None,
            delta_only: false,
        }]);
        store.publish("system.stats", json!({"cpu": 10, "mem": 42}));

        scheduler_pass(&store, &session, Instant::now());
        match recv_event(&mut receivers) {
            ServerMessage::Event { data, .. } => assert_eq!(data, json!({"cpu": 10})),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn filters_suppress_non_matching_payloads() {
        let store = MetricStore::new();
        let (session, mut receivers) = delta_session();
        session.subscribe(vec![ChannelRequest {
            channel: "docker.events".to_string(),
            interval: 1,
            fields: None,
            filters: Some(BTreeMap::from([(
                "action".to_string(),
                json!("start"),
            )])),
            delta_only: false,
        }]);

        store.publish("docker.events", json!({"action": "stop", "id": "c1"}));
        scheduler_pass(&store, &session, Instant::now());
        assert!(receivers.outbound.try_recv().is_err());

        store.publish("docker.events", json!({"action": "start", "id": "c1"}));
        scheduler_pass(&store, &session, Instant::now());
        match recv_event(&mut receivers) {
            ServerMessage::Event { data, .. } => assert_eq!(data["id"], json!("c1")),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn full_queue_drops_without_blocking_or_advancing_the_clock() {
        let store = MetricStore::new();
        let (session, mut receivers) = SessionHandle::new(1);
        session.connect(ClientKind::Browser, Capabilities::default());
        subscribe(&session, "system.stats", false);
        subscribe(&session, "storage.status", false);
        store.publish("system.stats", json!({"cpu": 10}));
        store.publish("storage.status", json!({"disks": 4}));

        let start = Instant::now();
        // Queue capacity 1: the second due subscription's event is dropped.
        scheduler_pass(&store, &session, start);
        let _ = recv_event(&mut receivers);
        assert!(receivers.outbound.try_recv().is_err());

        // Exactly one of the two advanced its clock; the dropped one retries
        // on the next pass.
        let pending: Vec<String> = {
            let subscriptions = session.subscriptions.lock();
            subscriptions
                .values()
                .filter(|s| s.last_sent_at.is_none())
                .map(|s| s.channel.clone())
                .collect()
        };
        assert_eq!(pending.len(), 1);
        scheduler_pass(&store, &session, start + Duration::from_millis(100));
        match recv_event(&mut receivers) {
            ServerMessage::Event { channel, .. } => assert_eq!(channel, pending[0]),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn dropped_full_send_does_not_prime_the_baseline() {
        let store = MetricStore::new();
        let (session, _receivers) = SessionHandle::new(1);
        session.connect(ClientKind::Browser, Capabilities::default());
        subscribe(&session, "system.stats", false);
        store.publish("system.stats", json!({"cpu": 10}));

        // Queue already full: the full send is dropped, so nothing may be
        // cached as "sent".
        session
            .enqueue(ServerMessage::Pong { timestamp: 1 })
            .expect("fill queue");
        scheduler_pass(&store, &session, Instant::now());

        assert_eq!(
            session
                .delta
                .lock()
                .observe("system.stats", &json!({"cpu": 10})),
            DeltaDecision::Full
        );
    }

    #[test]
    fn slow_session_does_not_affect_other_sessions() {
        let store = MetricStore::new();
        let (slow, mut slow_rx) = SessionHandle::new(1);
        let (healthy, mut healthy_rx) = SessionHandle::new(16);
        for session in [&slow, &healthy] {
            session.connect(ClientKind::Browser, Capabilities::default());
            subscribe(session, "system.stats", false);
            subscribe(session, "storage.status", false);
        }
        store.publish("system.stats", json!({"cpu": 10}));
        store.publish("storage.status", json!({"disks": 4}));

        let now = Instant::now();
        scheduler_pass(&store, &slow, now);
        scheduler_pass(&store, &healthy, now);

        // The slow session lost one event to its tiny queue; the healthy
        // session received both.
        let _ = slow_rx.outbound.try_recv().expect("one event");
        assert!(slow_rx.outbound.try_recv().is_err());
        let _ = healthy_rx.outbound.try_recv().expect("first event");
        let _ = healthy_rx.outbound.try_recv().expect("second event");
        assert!(!slow.is_closed());
    }

    #[tokio::test]
    async fn scheduler_loop_exits_on_cancel() {
        let store = Arc::new(MetricStore::new());
        let (session, receivers) = delta_session();
        let task = tokio::spawn(run_session_scheduler(
            Arc::clone(&store),
            Arc::clone(&session),
            Duration::from_millis(10),
            receivers.cancel,
        ));
        session.close();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("scheduler exits promptly")
            .expect("join");
    }

    #[test]
    fn project_fields_passes_non_objects_through() {
        let value = json!([1, 2, 3]);
        assert_eq!(project_fields(&value, &["cpu".to_string()]), value);
    }
}
