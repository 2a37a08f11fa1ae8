//! Job lifecycle tracking against a scripted peer.

mod support;

use std::thread;

use serde_json::json;

use vmrig_qmp::{Event, EventFilter, JobPolicy, JobProgress, JobState, QmpClient, QmpError};

#[test]
fn run_job_drives_complete_finalize_dismiss_in_order() {
    let (channel, mut peer) = support::connected_pair();
    let server = thread::spawn(move || {
        peer.handshake();
        peer.job_status("j1", "created");
        peer.job_status("j1", "running");
        peer.event("OTHER", json!({"x": 1}));
        peer.job_status("j2", "ready");
        peer.job_status("j1", "ready");
        let request = peer.recv();
        assert_eq!(
            request,
            json!({"execute": "block-job-complete", "arguments": {"device": "j1"}})
        );
        peer.respond(json!({}));
        peer.job_status("j1", "pending");
        let request = peer.recv();
        assert_eq!(
            request,
            json!({"execute": "job-finalize", "arguments": {"id": "j1"}})
        );
        peer.respond(json!({}));
        peer.job_status("j1", "concluded");
        let request = peer.recv();
        assert_eq!(
            request,
            json!({"execute": "job-dismiss", "arguments": {"id": "j1"}})
        );
        peer.respond(json!({}));
        peer.job_status("j1", "null");
    });

    let mut client = QmpClient::new(Box::new(channel)).expect("handshake failed");
    let policy = JobPolicy {
        auto_finalize: false,
        auto_dismiss: false,
        expect_error: false,
    };
    client.run_job("j1", &policy).expect("job failed");

    // Events this loop was not interested in are back in the main
    // buffer, in their original relative order.
    assert_eq!(client.buffered_events(), 2);
    let first = client.event_wait(EventFilter::Any).expect("event wait failed");
    assert_eq!(first.name(), Some("OTHER"));
    let second = client.event_wait(EventFilter::Any).expect("event wait failed");
    assert_eq!(second.data().get("id"), Some(&json!("j2")));
    drop(client);
    server.join().expect("peer panicked");
}

#[test]
fn auto_policies_suppress_finalize_and_dismiss() {
    let (channel, mut peer) = support::connected_pair();
    let server = thread::spawn(move || {
        peer.handshake();
        peer.job_status("j1", "ready");
        let request = peer.recv();
        assert_eq!(request["execute"], "block-job-complete");
        peer.respond(json!({}));
        peer.job_status("j1", "pending");
        peer.job_status("j1", "concluded");
        peer.job_status("j1", "null");
        // No finalize, no dismiss.
        assert!(peer.try_recv().is_none());
    });

    let mut client = QmpClient::new(Box::new(channel)).expect("handshake failed");
    let policy = JobPolicy {
        auto_finalize: true,
        auto_dismiss: true,
        expect_error: false,
    };
    client.run_job("j1", &policy).expect("job failed");
    drop(client);
    server.join().expect("peer panicked");
}

#[test]
fn redelivered_ready_status_sends_completion_only_once() {
    let (channel, mut peer) = support::connected_pair();
    let server = thread::spawn(move || {
        peer.handshake();
        peer.job_status("j1", "ready");
        let request = peer.recv();
        assert_eq!(request["execute"], "block-job-complete");
        peer.respond(json!({}));
        peer.job_status("j1", "ready");
        peer.job_status("j1", "pending");
        peer.job_status("j1", "concluded");
        let request = peer.recv();
        assert_eq!(request["execute"], "job-dismiss");
        peer.respond(json!({}));
        peer.job_status("j1", "null");
    });

    let mut client = QmpClient::new(Box::new(channel)).expect("handshake failed");
    client
        .run_job("j1", &JobPolicy::default())
        .expect("job failed");
    drop(client);
    server.join().expect("peer panicked");
}

#[test]
fn abort_surfaces_the_recorded_failure_reason() {
    let (channel, mut peer) = support::connected_pair();
    let server = thread::spawn(move || {
        peer.handshake();
        peer.job_status("j1", "ready");
        let request = peer.recv();
        assert_eq!(request["execute"], "block-job-complete");
        peer.respond(json!({}));
        peer.job_status("j1", "aborting");
        let request = peer.recv();
        assert_eq!(request, json!({"execute": "query-jobs"}));
        peer.respond(json!([
            {"id": "other", "status": "running"},
            {"id": "j1", "status": "aborting", "error": "Input/output error"},
        ]));
    });

    let mut client = QmpClient::new(Box::new(channel)).expect("handshake failed");
    let error = client
        .run_job("j1", &JobPolicy::default())
        .expect_err("job must fail");
    let QmpError::JobFailed { id, reason } = error else {
        panic!("expected a job failure, got {error}");
    };
    assert_eq!(id, "j1");
    assert_eq!(reason, "Input/output error");
    drop(client);
    server.join().expect("peer panicked");
}

#[test]
fn expected_abort_is_not_a_fault() {
    let (channel, mut peer) = support::connected_pair();
    let server = thread::spawn(move || {
        peer.handshake();
        peer.job_status("j1", "ready");
        let request = peer.recv();
        assert_eq!(request["execute"], "block-job-complete");
        peer.respond(json!({}));
        peer.job_status("j1", "aborting");
        peer.job_status("j1", "concluded");
        let request = peer.recv();
        assert_eq!(request["execute"], "job-dismiss");
        peer.respond(json!({}));
        peer.job_status("j1", "null");
    });

    let mut client = QmpClient::new(Box::new(channel)).expect("handshake failed");
    let policy = JobPolicy {
        expect_error: true,
        ..JobPolicy::default()
    };
    client.run_job("j1", &policy).expect("job failed");
    drop(client);
    server.join().expect("peer panicked");
}

#[test]
fn deferred_events_are_restored_even_when_the_job_fails() {
    let (channel, mut peer) = support::connected_pair();
    let server = thread::spawn(move || {
        peer.handshake();
        peer.event("OTHER", json!({}));
        peer.job_status("j1", "aborting");
        let request = peer.recv();
        assert_eq!(request["execute"], "query-jobs");
        peer.respond(json!([{"id": "j1", "error": "boom"}]));
    });

    let mut client = QmpClient::new(Box::new(channel)).expect("handshake failed");
    client
        .run_job("j1", &JobPolicy::default())
        .expect_err("job must fail");
    assert_eq!(client.buffered_events(), 1);
    let event = client.event_wait(EventFilter::Any).expect("event wait failed");
    assert_eq!(event.name(), Some("OTHER"));
    drop(client);
    server.join().expect("peer panicked");
}

#[test]
fn reducer_classifies_foreign_and_quiet_events() {
    let (channel, mut peer) = support::connected_pair();
    let server = thread::spawn(move || {
        peer.handshake();
    });

    let mut client = QmpClient::new(Box::new(channel)).expect("handshake failed");
    server.join().expect("peer panicked");

    let mut state = JobState::default();
    let policy = JobPolicy::default();

    let unrelated = Event::from_value(json!({"event": "SHUTDOWN", "data": {}}));
    assert_eq!(
        client
            .process_job_event("j1", &unrelated, &mut state, &policy)
            .expect("reducer failed"),
        JobProgress::NotMine
    );

    let other_job = Event::from_value(
        json!({"event": "JOB_STATUS_CHANGE", "data": {"id": "j2", "status": "ready"}}),
    );
    assert_eq!(
        client
            .process_job_event("j1", &other_job, &mut state, &policy)
            .expect("reducer failed"),
        JobProgress::NotMine
    );

    // Statuses without follow-up work keep the job running.
    let standby = Event::from_value(
        json!({"event": "JOB_STATUS_CHANGE", "data": {"id": "j1", "status": "standby"}}),
    );
    assert_eq!(
        client
            .process_job_event("j1", &standby, &mut state, &policy)
            .expect("reducer failed"),
        JobProgress::Running
    );
}
