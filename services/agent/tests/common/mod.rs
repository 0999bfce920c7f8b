use agent::config::AgentConfig;
use agent::control::AdapterRegistry;
use agent::{AppState, api};
use std::net::SocketAddr;
use tokio::net::TcpListener;

pub fn test_config(max_sessions: usize) -> AgentConfig {
    AgentConfig {
        bind: "127.0.0.1:0".parse().expect("bind"),
        metrics_bind: "127.0.0.1:0".parse().expect("metrics bind"),
        max_sessions,
        outbound_queue_capacity: 64,
        scheduler_tick_ms: 25,
        keep_alive_secs: 30,
        read_deadline_secs: 60,
        collect_interval_secs: 60,
    }
}

/// Binds an ephemeral port, serves the full router on it, and hands back the
/// address plus the state so tests can publish snapshots directly.
pub async fn spawn_agent(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, api::router(state)).await;
    });
    addr
}

#[allow(dead_code)]
pub fn state_with_adapters(max_sessions: usize, adapters: AdapterRegistry) -> AppState {
    AppState::with_adapters(test_config(max_sessions), adapters)
}

#[allow(dead_code)]
pub fn default_state(max_sessions: usize) -> AppState {
    AppState::new(test_config(max_sessions))
}
