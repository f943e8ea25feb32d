//! End-to-end tests of the delivery pipeline against a mock collection
//! endpoint: transaction capture, formatting, compression, response handling
//! and fork recovery.

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use apm_agent::agent::{AgentState, RETRY_QUEUE_LIMIT};
use apm_agent::config::flush_strategy::{FlushStrategy, PeriodicStrategy};
use apm_agent::config::Config;
use apm_agent::event::Event;
use apm_agent::monitor::Monitor;
use apm_agent::transaction::{CapturedError, TransactionContext, TransactionDefaults};
use flate2::read::GzDecoder;
use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::{json, Map, Value};

type Captured = Arc<Mutex<Vec<Value>>>;

fn config(server: &ServerGuard) -> Config {
    Config {
        active: true,
        env: "production".to_string(),
        name: "blog".to_string(),
        push_api_key: "abc-123".to_string(),
        endpoint: format!("{}/1", server.url()),
        flush_strategy: FlushStrategy::Manual,
        ..Config::default()
    }
}

/// Mocks the endpoint with `status` and records every decoded batch.
fn mock_endpoint(server: &mut ServerGuard, status: usize) -> (Mock, Captured) {
    mock_endpoint_expecting(server, status, None)
}

fn mock_endpoint_expecting(
    server: &mut ServerGuard,
    status: usize,
    hits: Option<usize>,
) -> (Mock, Captured) {
    let captured: Captured = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&captured);
    let mut mock = server
        .mock("POST", "/1/")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("token".into(), "abc-123".into()),
            Matcher::UrlEncoded("name".into(), "blog".into()),
            Matcher::UrlEncoded("environment".into(), "production".into()),
        ]))
        .match_header("content-type", "application/json; charset=UTF-8")
        .match_request(move |request| {
            let Ok(body) = request.body() else {
                return false;
            };
            let mut json = String::new();
            if GzDecoder::new(body.as_slice())
                .read_to_string(&mut json)
                .is_err()
            {
                return false;
            }
            match serde_json::from_str(&json) {
                Ok(batch) => {
                    sink.lock().expect("lock").push(batch);
                    true
                }
                Err(_) => false,
            }
        })
        .with_status(status);
    if let Some(hits) = hits {
        mock = mock.expect(hits);
    }
    (mock.create(), captured)
}

fn request_event(duration_ms: f64) -> Event {
    let mut payload = Map::new();
    payload.insert("controller".to_string(), json!("BlogPostsController"));
    payload.insert("action".to_string(), json!("show"));
    payload.insert("path".to_string(), json!("/blog"));
    Event::new(
        "process_action.web",
        1_389_783_600.0,
        1_389_783_600.0 + duration_ms / 1000.0,
        payload,
    )
}

fn record_request(monitor: &Monitor, id: &str, duration_ms: f64) {
    let handle = monitor.create_transaction(
        id,
        TransactionContext::default(),
        TransactionDefaults::default(),
    );
    handle.set_primary_request_event(&request_event(duration_ms));
    handle.complete();
}

#[test]
fn test_regular_request_is_delivered_as_summary() {
    let mut server = Server::new();
    let (mock, captured) = mock_endpoint(&mut server, 200);
    let monitor = Monitor::start(config(&server));

    record_request(&monitor, "abc", 100.0);
    monitor.flush();

    mock.assert();
    let batches = captured.lock().expect("lock");
    let record = &batches[0][0];
    assert_eq!(record["request_id"], "abc");
    assert_eq!(record["failed"], false);
    assert_eq!(record["log_entry"]["action"], "BlogPostsController#show");
    assert_eq!(record["log_entry"]["kind"], "http_request");
    let duration = record["log_entry"]["duration"].as_f64().expect("duration");
    assert!((duration - 100.0).abs() < 0.001);
    assert!(record.get("events").is_none());
    assert!(record.get("exception").is_none());
    assert_eq!(monitor.agent().retry_queue_len(), 0);
    assert!(monitor.agent().transmission_successful());
}

#[test]
fn test_exception_is_delivered_as_failed() {
    let mut server = Server::new();
    let (mock, captured) = mock_endpoint(&mut server, 200);
    let monitor = Monitor::start(config(&server));

    let handle = monitor.create_transaction(
        "err-1",
        TransactionContext::default(),
        TransactionDefaults::default(),
    );
    handle.set_primary_request_event(&request_event(50.0));
    handle.add_exception(&CapturedError::new("ArgumentError", "oh no"));
    handle.complete();
    monitor.flush();

    mock.assert();
    let batches = captured.lock().expect("lock");
    let record = &batches[0][0];
    assert_eq!(record["failed"], true);
    assert_eq!(record["exception"]["exception"], "ArgumentError");
    assert_eq!(record["exception"]["message"], "oh no");
    assert_eq!(record["exception"]["backtrace"], json!([]));
}

#[test]
fn test_exception_without_primary_event_is_delivered() {
    let mut server = Server::new();
    let (mock, captured) = mock_endpoint(&mut server, 200);
    let monitor = Monitor::start(config(&server));

    let handle = monitor.create_transaction(
        "err-2",
        TransactionContext::default(),
        TransactionDefaults::default(),
    );
    handle.add_exception(&CapturedError::new("ArgumentError", "oh no"));
    handle.complete();
    monitor.flush();

    mock.assert();
    let batches = captured.lock().expect("lock");
    let record = &batches[0][0];
    assert_eq!(record["request_id"], "err-2");
    assert_eq!(record["failed"], true);
    assert_eq!(record["exception"]["exception"], "ArgumentError");
    assert!(record["log_entry"].get("duration").is_none());
    assert!(record["log_entry"].get("end").is_none());
    assert!(record["log_entry"]["time"].as_f64().expect("time") > 0.0);
    assert!(record.get("events").is_none());
}

#[test]
fn test_batches_preserve_completion_order() {
    let mut server = Server::new();
    let (mock, captured) = mock_endpoint_expecting(&mut server, 200, Some(1));
    let monitor = Monitor::start(config(&server));

    for id in ["first", "second", "third"] {
        record_request(&monitor, id, 10.0);
    }
    monitor.flush();

    mock.assert();
    let batches = captured.lock().expect("lock");
    let ids: Vec<&str> = batches[0]
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|record| record["request_id"].as_str())
        .collect();
    assert_eq!(ids, vec!["first", "second", "third"]);
}

#[test]
fn test_nothing_pending_sends_nothing() {
    let mut server = Server::new();
    let (mock, _) = mock_endpoint_expecting(&mut server, 200, Some(0));
    let monitor = Monitor::start(config(&server));

    monitor.flush();

    mock.assert();
}

#[test]
fn test_failing_endpoint_bounds_retry_queue() {
    let mut server = Server::new();
    // Every cycle retries the whole queue before it is truncated:
    // 1 + 2 + 3 + 4 + 4 attempts.
    let (mock, _) = mock_endpoint_expecting(&mut server, 500, Some(14));
    let monitor = Monitor::start(config(&server));

    for cycle in 0..5 {
        record_request(&monitor, &format!("req-{cycle}"), 10.0);
        monitor.flush();
        assert!(monitor.agent().retry_queue_len() <= RETRY_QUEUE_LIMIT);
    }

    assert_eq!(monitor.agent().retry_queue_len(), RETRY_QUEUE_LIMIT);
    assert!(!monitor.agent().transmission_successful());
    mock.assert();
}

#[test]
fn test_retry_delivers_most_recent_first() {
    let mut server = Server::new();
    let (failing, _) = mock_endpoint(&mut server, 503);
    let monitor = Monitor::start(config(&server));
    record_request(&monitor, "old", 10.0);
    monitor.flush();
    assert_eq!(monitor.agent().retry_queue_len(), 1);
    failing.remove();

    let (_ok, captured) = mock_endpoint(&mut server, 200);
    record_request(&monitor, "new", 10.0);
    monitor.flush();

    let batches = captured.lock().expect("lock");
    let mut order: Vec<&str> = batches
        .iter()
        .filter_map(|batch| batch[0]["request_id"].as_str())
        .collect();
    order.dedup();
    assert_eq!(order, vec!["new", "old"]);
    assert_eq!(monitor.agent().retry_queue_len(), 0);
    assert!(monitor.agent().transmission_successful());
}

#[test]
fn test_concurrent_flushes_deliver_a_payload_once() {
    let mut server = Server::new();
    let (failing, _) = mock_endpoint(&mut server, 500);
    let monitor = Monitor::start(config(&server));
    record_request(&monitor, "queued", 10.0);
    monitor.flush();
    assert_eq!(monitor.agent().retry_queue_len(), 1);
    failing.remove();

    let slow = server
        .mock("POST", "/1/")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body_from_request(|_| {
            std::thread::sleep(Duration::from_millis(300));
            Vec::new()
        })
        .expect(1)
        .create();

    std::thread::scope(|scope| {
        for _ in 0..2 {
            scope.spawn(|| monitor.flush());
        }
    });

    slow.assert();
    assert_eq!(monitor.agent().retry_queue_len(), 0);
}

#[test]
fn test_enhance_your_calm_slows_down() {
    let mut server = Server::new();
    let (_mock, _) = mock_endpoint(&mut server, 420);
    let monitor = Monitor::start(Config {
        flush_strategy: FlushStrategy::Periodically(PeriodicStrategy {
            interval: 3_600_000,
        }),
        ..config(&server)
    });

    record_request(&monitor, "calm", 10.0);
    monitor.flush();

    assert_eq!(
        monitor.agent().sleep_interval(),
        Some(Duration::from_millis(5_400_000))
    );
    assert_eq!(monitor.agent().retry_queue_len(), 0);
    monitor.agent().stop_thread();
}

#[test]
fn test_unauthorized_shuts_agent_down() {
    let mut server = Server::new();
    let (mock, _) = mock_endpoint_expecting(&mut server, 401, Some(1));
    let monitor = Monitor::start(config(&server));

    record_request(&monitor, "denied", 10.0);
    monitor.flush();

    assert_eq!(monitor.agent().state(), AgentState::Shutdown);
    assert!(!monitor.is_active());
    assert_eq!(monitor.agent().retry_queue_len(), 0);

    // An inactive monitor neither enqueues nor sends.
    record_request(&monitor, "after", 10.0);
    monitor.flush();
    assert_eq!(monitor.agent().pending_transactions(), 0);
    mock.assert();
}

#[test]
fn test_forked_child_starts_with_fresh_state() {
    let mut server = Server::new();
    let (_mock, captured) = mock_endpoint(&mut server, 200);
    let monitor = Monitor::start(config(&server));
    let agent = monitor.agent();

    record_request(&monitor, "parent", 10.0);
    assert_eq!(agent.pending_transactions(), 1);

    // Pretend the agent was created by another process.
    agent.set_recorded_pid(agent.pid().wrapping_add(1));
    record_request(&monitor, "child", 10.0);

    assert_eq!(agent.pid(), std::process::id());
    assert_eq!(agent.pending_transactions(), 1);
    assert!(monitor.is_active());

    monitor.flush();
    let batches = captured.lock().expect("lock");
    let ids: Vec<&str> = batches
        .iter()
        .flat_map(|batch| batch.as_array().expect("array").iter())
        .filter_map(|record| record["request_id"].as_str())
        .collect();
    assert!(ids.iter().all(|id| *id == "child"), "{ids:?}");
    assert!(!ids.is_empty());
}

#[test]
fn test_forwarding_child_leaves_inherited_transactions_to_master() {
    let mut server = Server::new();
    let (mock, _) = mock_endpoint_expecting(&mut server, 200, Some(0));
    let monitor = Monitor::start(config(&server));

    record_request(&monitor, "pre-fork", 10.0);
    assert_eq!(monitor.agent().pending_transactions(), 1);

    monitor.ipc_forked();
    assert_eq!(monitor.agent().pending_transactions(), 0);

    // The at-exit flush and an exception flush must not resend them.
    monitor.send_exception(&CapturedError::new("RuntimeError", "late"), None);
    monitor.stop();

    mock.assert();
}

#[test]
fn test_stop_flushes_pending_transactions() {
    let mut server = Server::new();
    let (mock, captured) = mock_endpoint(&mut server, 200);
    let monitor = Monitor::start(config(&server));

    record_request(&monitor, "last", 10.0);
    monitor.stop();

    mock.assert();
    assert_eq!(captured.lock().expect("lock")[0][0]["request_id"], "last");
    assert!(!monitor.is_active());
}
