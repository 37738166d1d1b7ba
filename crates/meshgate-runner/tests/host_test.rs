//! Poll thread tests with an engine that never reaches a coordinator.

use std::sync::Arc;
use std::time::Duration;

use meshgate_classes::ClassRegistry;
use meshgate_engine::{Engine, EngineConfig, MemoryStore};
use meshgate_runner::{spawn_host_thread, HostRequest, TcpTransport};

fn offline_engine() -> Arc<Engine<TcpTransport>> {
    Arc::new(Engine::new(
        TcpTransport::new("127.0.0.1:1").with_connect_timeout(Duration::from_millis(50)),
        ClassRegistry::with_builtin(),
        MemoryStore::new(),
        EngineConfig::default(),
    ))
}

#[test]
fn test_cycle_limit_stops_thread() {
    let engine = offline_engine();
    let host = spawn_host_thread(engine, Duration::from_millis(1), Some(3)).unwrap();
    let summary = host.join().unwrap();
    assert_eq!(summary.cycles, 3);
    // Never connected: every cycle reports it.
    assert_eq!(summary.cycle_errors, 3);
}

#[test]
fn test_requests_are_served_between_cycles() {
    let engine = offline_engine();
    let host = spawn_host_thread(engine.clone(), Duration::from_millis(5), None).unwrap();

    host.send(HostRequest::Command("enable-trace on".into())).unwrap();
    host.send(HostRequest::Command("refresh 3".into())).unwrap();
    host.send(HostRequest::Shutdown).unwrap();

    let summary = host.join().unwrap();
    assert_eq!(summary.requests, 2);
    assert_eq!(summary.request_errors, 1);
    assert!(summary.cycles >= 1);
    assert!(engine.context().link().trace_enabled());
}
