use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use collab_upload_core::{
    CoordinatorConfig, CoordinatorHandle, Error, InMemoryEndpoint, MasterClient, Message,
    NoopEvents, RetryPolicy, ScriptedResponse, TaskHeader, WorkerClient, WorkerConfig, WorkerExit,
    spawn_coordinator,
};
use futures_util::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(10);

fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        task_timeout: Duration::from_secs(5),
        master_grace: Duration::from_secs(5),
        heartbeat_timeout: Duration::from_secs(5),
        sweep_interval: Duration::from_millis(50),
        max_queue_len: None,
    }
}

fn worker_config(url: &str, max_retries: u32) -> WorkerConfig {
    WorkerConfig {
        server_url: url.to_string(),
        retry: RetryPolicy::new(max_retries, 1),
        default_retry_after: Duration::from_millis(200),
        heartbeat_interval: Duration::from_millis(100),
        reconnect_delay: Duration::from_millis(50),
    }
}

struct RunningWorker {
    cancel: CancellationToken,
    task: JoinHandle<collab_upload_core::Result<WorkerExit>>,
}

async fn start_worker(
    url: &str,
    endpoint: Arc<InMemoryEndpoint>,
    max_retries: u32,
) -> RunningWorker {
    let client = WorkerClient::connect(worker_config(url, max_retries))
        .await
        .expect("worker connect");
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move { client.run(endpoint, &NoopEvents, &token).await });
    RunningWorker { cancel, task }
}

async fn wait_for_workers(handle: &CoordinatorHandle, n: usize) {
    let deadline = Instant::now() + WAIT;
    loop {
        let (_, stats) = handle.snapshot().await.expect("snapshot");
        if stats.worker_count == n {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {n} workers");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn tasks(names: &[&str]) -> Vec<(TaskHeader, Vec<u8>)> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let payload = vec![i as u8; 16 + i];
            (
                TaskHeader {
                    task_id: Uuid::new_v4(),
                    filename: name.to_string(),
                    mime_type: "image/png".to_string(),
                    size: payload.len() as u64,
                },
                payload,
            )
        })
        .collect()
}

async fn next_message(master: &mut MasterClient) -> Option<Message> {
    tokio::time::timeout(WAIT, master.next_message())
        .await
        .expect("timed out waiting for coordinator message")
        .expect("read coordinator message")
}

/// Reads messages until `sessionComplete`, returning everything seen.
async fn collect_until_complete(master: &mut MasterClient) -> Vec<Message> {
    let mut seen = Vec::new();
    loop {
        let msg = next_message(master).await.expect("connection closed early");
        let done = matches!(msg, Message::SessionComplete { .. });
        seen.push(msg);
        if done {
            return seen;
        }
    }
}

fn progress_results(messages: &[Message]) -> Vec<(Uuid, bool)> {
    messages
        .iter()
        .filter_map(|m| match m {
            Message::Progress {
                task_id, result, ..
            } => Some((*task_id, result.success)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn three_workers_upload_ten_files() {
    let handle = spawn_coordinator(test_config()).await.unwrap();
    let url = handle.url();
    let endpoint = Arc::new(InMemoryEndpoint::new());

    let workers = vec![
        start_worker(&url, endpoint.clone(), 2).await,
        start_worker(&url, endpoint.clone(), 2).await,
        start_worker(&url, endpoint.clone(), 2).await,
    ];
    wait_for_workers(&handle, 3).await;

    let mut master = MasterClient::connect(&url).await.unwrap();
    let names: Vec<String> = (0..10).map(|i| format!("f{i:02}.png")).collect();
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let batch = tasks(&name_refs);
    let ids: HashSet<Uuid> = batch.iter().map(|(h, _)| h.task_id).collect();
    master.submit_batch(batch).await.unwrap();

    let seen = collect_until_complete(&mut master).await;
    let results = progress_results(&seen);
    assert_eq!(results.len(), 10);
    assert!(results.iter().all(|(_, ok)| *ok));
    let reported: HashSet<Uuid> = results.iter().map(|(id, _)| *id).collect();
    assert_eq!(reported, ids, "every task reported exactly once");

    let submitted = seen.iter().find_map(|m| match m {
        Message::TasksSubmitted { count, .. } => Some(*count),
        _ => None,
    });
    assert_eq!(submitted, Some(10));

    match seen.last() {
        Some(Message::SessionComplete { progress }) => {
            assert_eq!(progress.completed, 10);
            assert_eq!(progress.failed, 0);
            assert_eq!(progress.total, 10);
        }
        other => panic!("expected sessionComplete, got {other:?}"),
    }

    let mut uploaded = endpoint.uploaded_filenames().await;
    uploaded.sort();
    assert_eq!(uploaded, names);

    let (_, stats) = handle.snapshot().await.unwrap();
    assert_eq!(stats.completed_tasks, 10);
    assert_eq!(stats.pending_tasks, 0);
    assert_eq!(stats.active_tasks, 0);
    let per_worker: u64 = stats.workers.iter().map(|w| w.stats.completed).sum();
    assert_eq!(per_worker, 10);

    for w in workers {
        w.cancel.cancel();
        assert_eq!(w.task.await.unwrap().unwrap(), WorkerExit::Cancelled);
    }
    handle.shutdown().await;
}

#[tokio::test]
async fn rate_limit_pauses_the_session_and_requeues_the_task() {
    let handle = spawn_coordinator(test_config()).await.unwrap();
    let url = handle.url();
    let endpoint = Arc::new(InMemoryEndpoint::new());
    endpoint
        .push_response(ScriptedResponse::RateLimited {
            retry_after_ms: Some(300),
        })
        .await;

    let _w1 = start_worker(&url, endpoint.clone(), 2).await;
    let _w2 = start_worker(&url, endpoint.clone(), 2).await;
    wait_for_workers(&handle, 2).await;

    let mut master = MasterClient::connect(&url).await.unwrap();
    let started = Instant::now();
    master
        .submit_batch(tasks(&["a.png", "b.png", "c.png", "d.png"]))
        .await
        .unwrap();

    let seen = collect_until_complete(&mut master).await;
    let waiting = seen.iter().find_map(|m| match m {
        Message::Waiting { progress } => Some(progress.clone()),
        _ => None,
    });
    let waiting = waiting.expect("master was told about the pause");
    assert_eq!(waiting.waiting_for, Some(300));
    assert!(waiting.waiting_worker_id.is_some());
    assert!(waiting.current_file.is_some());

    let results = progress_results(&seen);
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|(_, ok)| *ok), "429 is not a failure");
    assert!(started.elapsed() >= Duration::from_millis(300));

    let mut uploaded = endpoint.uploaded_filenames().await;
    uploaded.sort();
    assert_eq!(uploaded, vec!["a.png", "b.png", "c.png", "d.png"]);
    assert_eq!(endpoint.attempt_count(), 5);
    handle.shutdown().await;
}

/// Registers as a worker over a raw socket and returns after receiving
/// one assignment, keeping the connection open.
async fn silent_worker(
    url: &str,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let (mut ws, _) = connect_async(url).await.unwrap();
    ws.send(WsMessage::Text(
        r#"{"type":"register","role":"worker"}"#.to_string(),
    ))
    .await
    .unwrap();
    let registered = ws.next().await.unwrap().unwrap();
    assert!(registered.to_text().unwrap().contains("\"registered\""));
    ws
}

async fn expect_assignment(
    ws: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> TaskHeader {
    let header = tokio::time::timeout(WAIT, ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let header = match Message::decode(header.to_text().unwrap()).unwrap() {
        Message::Assign(h) => h,
        other => panic!("expected assign, got {other:?}"),
    };
    let payload = ws.next().await.unwrap().unwrap();
    assert_eq!(payload.into_data().len() as u64, header.size);
    header
}

#[tokio::test]
async fn lost_worker_task_is_requeued_to_a_live_worker() {
    let handle = spawn_coordinator(test_config()).await.unwrap();
    let url = handle.url();
    let endpoint = Arc::new(InMemoryEndpoint::new());

    let mut ws = silent_worker(&url).await;
    let mut master = MasterClient::connect(&url).await.unwrap();
    let batch = tasks(&["lost.png"]);
    let task_id = batch[0].0.task_id;
    master.submit_batch(batch).await.unwrap();

    let header = expect_assignment(&mut ws).await;
    assert_eq!(header.task_id, task_id);
    drop(ws);

    let _healthy = start_worker(&url, endpoint.clone(), 2).await;
    let seen = collect_until_complete(&mut master).await;
    assert_eq!(progress_results(&seen), vec![(task_id, true)]);
    assert_eq!(endpoint.uploaded_filenames().await, vec!["lost.png"]);
    handle.shutdown().await;
}

#[tokio::test]
async fn task_timeout_drops_the_worker_and_requeues() {
    let mut config = test_config();
    config.task_timeout = Duration::from_millis(300);
    let handle = spawn_coordinator(config).await.unwrap();
    let url = handle.url();
    let endpoint = Arc::new(InMemoryEndpoint::new());

    let mut ws = silent_worker(&url).await;
    let mut master = MasterClient::connect(&url).await.unwrap();
    master.submit_batch(tasks(&["slow.png"])).await.unwrap();
    expect_assignment(&mut ws).await;

    let notice = tokio::time::timeout(WAIT, ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match Message::decode(notice.to_text().unwrap()).unwrap() {
        Message::DisconnectNotice { reason } => assert_eq!(reason, "task timeout"),
        other => panic!("expected disconnectNotice, got {other:?}"),
    }

    let _healthy = start_worker(&url, endpoint.clone(), 2).await;
    let seen = collect_until_complete(&mut master).await;
    let results = progress_results(&seen);
    assert_eq!(results.len(), 1);
    assert!(results[0].1);
    handle.shutdown().await;
}

#[tokio::test]
async fn silent_worker_is_dropped_after_heartbeat_timeout() {
    let mut config = test_config();
    config.heartbeat_timeout = Duration::from_millis(200);
    let handle = spawn_coordinator(config).await.unwrap();

    let mut ws = silent_worker(&handle.url()).await;
    wait_for_workers(&handle, 1).await;

    let notice = tokio::time::timeout(WAIT, ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match Message::decode(notice.to_text().unwrap()).unwrap() {
        Message::DisconnectNotice { reason } => assert_eq!(reason, "heartbeat timeout"),
        other => panic!("expected disconnectNotice, got {other:?}"),
    }
    wait_for_workers(&handle, 0).await;
    handle.shutdown().await;
}

#[tokio::test]
async fn permanent_failure_is_reported_and_session_completes() {
    let handle = spawn_coordinator(test_config()).await.unwrap();
    let url = handle.url();
    let endpoint = Arc::new(InMemoryEndpoint::new());
    endpoint.fail_always("bad.png", "http 500").await;

    let _w = start_worker(&url, endpoint.clone(), 2).await;
    wait_for_workers(&handle, 1).await;

    let mut master = MasterClient::connect(&url).await.unwrap();
    master
        .submit_batch(tasks(&["good.png", "bad.png"]))
        .await
        .unwrap();

    let seen = collect_until_complete(&mut master).await;
    let failure = seen.iter().find_map(|m| match m {
        Message::Progress { result, .. } if !result.success => Some(result.clone()),
        _ => None,
    });
    let failure = failure.expect("failure reported");
    assert_eq!(failure.filename, "bad.png");
    assert!(failure.error.unwrap().contains("after 3 attempts"));

    match seen.last() {
        Some(Message::SessionComplete { progress }) => {
            assert_eq!(progress.completed, 1);
            assert_eq!(progress.failed, 1);
        }
        other => panic!("expected sessionComplete, got {other:?}"),
    }
    assert_eq!(endpoint.attempt_count(), 4);
    handle.shutdown().await;
}

#[tokio::test]
async fn second_master_is_rejected() {
    let handle = spawn_coordinator(test_config()).await.unwrap();
    let url = handle.url();

    let _first = MasterClient::connect(&url).await.unwrap();
    let err = MasterClient::connect(&url).await.err().expect("rejected");
    assert!(matches!(err, Error::Protocol { .. }), "{err:?}");
    assert_eq!(err.to_string(), "protocol error: session already has a master");
    handle.shutdown().await;
}

async fn connect_when_free(url: &str) -> MasterClient {
    let deadline = Instant::now() + WAIT;
    loop {
        match MasterClient::connect(url).await {
            Ok(master) => return master,
            Err(e) => assert!(Instant::now() < deadline, "coordinator stayed busy: {e}"),
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn finished_master_frees_the_coordinator_for_the_next_one() {
    let handle = spawn_coordinator(test_config()).await.unwrap();
    let url = handle.url();
    let endpoint = Arc::new(InMemoryEndpoint::new());
    let _w = start_worker(&url, endpoint.clone(), 2).await;
    wait_for_workers(&handle, 1).await;

    let mut first = MasterClient::connect(&url).await.unwrap();
    let first_session = first.session_id();
    first.submit_batch(tasks(&["a.png"])).await.unwrap();
    collect_until_complete(&mut first).await;
    first.close().await;

    let started = Instant::now();
    let mut second = connect_when_free(&url).await;
    assert!(started.elapsed() < Duration::from_secs(2), "no grace hold for a finished batch");
    assert_ne!(second.session_id(), first_session);

    let (_, stats) = handle.snapshot().await.unwrap();
    assert_eq!(stats.worker_count, 1, "workers carry over to the next session");

    second.submit_batch(tasks(&["b.png"])).await.unwrap();
    let seen = collect_until_complete(&mut second).await;
    assert_eq!(progress_results(&seen).len(), 1);
    second.close().await;

    let err = MasterClient::resume(&url, first_session)
        .await
        .err()
        .expect("old session is gone");
    assert!(err.to_string().contains("unknown session"), "{err}");
    handle.shutdown().await;
}

#[tokio::test]
async fn master_resumes_within_grace_and_gets_backlog() {
    let handle = spawn_coordinator(test_config()).await.unwrap();
    let url = handle.url();
    let endpoint = Arc::new(InMemoryEndpoint::new());

    let mut master = MasterClient::connect(&url).await.unwrap();
    let session_id = master.session_id();
    let batch = tasks(&["x.png"]);
    let task_id = batch[0].0.task_id;
    master.submit_batch(batch).await.unwrap();
    match next_message(&mut master).await {
        Some(Message::TasksSubmitted { count: 1, .. }) => {}
        other => panic!("expected tasksSubmitted, got {other:?}"),
    }
    master.close().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let _w = start_worker(&url, endpoint.clone(), 2).await;
    let deadline = Instant::now() + WAIT;
    while endpoint.uploaded_filenames().await.is_empty() {
        assert!(Instant::now() < deadline, "upload never happened");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let err = MasterClient::connect(&url).await.err().expect("held session");
    assert!(matches!(err, Error::Protocol { .. }));

    let mut master = MasterClient::resume(&url, session_id).await.unwrap();
    assert_eq!(master.session_id(), session_id);
    let seen = collect_until_complete(&mut master).await;
    assert_eq!(progress_results(&seen), vec![(task_id, true)]);
    handle.shutdown().await;
}

#[tokio::test]
async fn master_grace_expiry_dismisses_workers_and_starts_new_session() {
    let mut config = test_config();
    config.master_grace = Duration::from_millis(500);
    let handle = spawn_coordinator(config).await.unwrap();
    let url = handle.url();
    let endpoint = Arc::new(InMemoryEndpoint::new());

    let mut master = MasterClient::connect(&url).await.unwrap();
    let old_session = master.session_id();
    master.submit_batch(tasks(&["held.png"])).await.unwrap();
    match next_message(&mut master).await {
        Some(Message::TasksSubmitted { count: 1, .. }) => {}
        other => panic!("expected tasksSubmitted, got {other:?}"),
    }
    master.close().await;

    let worker = start_worker(&url, endpoint, 2).await;

    let exit = tokio::time::timeout(WAIT, worker.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(exit, WorkerExit::Dismissed { .. }), "{exit:?}");

    let (session_id, stats) = handle.snapshot().await.unwrap();
    assert_ne!(session_id, old_session);
    assert_eq!(stats.worker_count, 0);

    let fresh = MasterClient::connect(&url).await.unwrap();
    assert_eq!(fresh.session_id(), session_id);
    handle.shutdown().await;
}

#[tokio::test]
async fn overflowing_submission_is_rejected() {
    let mut config = test_config();
    config.max_queue_len = Some(2);
    let handle = spawn_coordinator(config).await.unwrap();

    let (mut ws, _) = connect_async(handle.url()).await.unwrap();
    ws.send(WsMessage::Text(
        r#"{"type":"register","role":"master"}"#.to_string(),
    ))
    .await
    .unwrap();
    ws.next().await.unwrap().unwrap();

    let headers: Vec<TaskHeader> = tasks(&["a.png", "b.png", "c.png"])
        .into_iter()
        .map(|(h, _)| h)
        .collect();
    let submit = Message::SubmitTasks { tasks: headers }.encode().unwrap();
    ws.send(WsMessage::Text(submit)).await.unwrap();

    let reply = tokio::time::timeout(WAIT, ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match Message::decode(reply.to_text().unwrap()).unwrap() {
        Message::Error { message } => assert!(message.contains("queue full")),
        other => panic!("expected error, got {other:?}"),
    }
    handle.shutdown().await;
}

#[tokio::test]
async fn messages_before_register_are_protocol_errors() {
    let handle = spawn_coordinator(test_config()).await.unwrap();
    let (mut ws, _) = connect_async(handle.url()).await.unwrap();
    ws.send(WsMessage::Text(r#"{"type":"getStats"}"#.to_string()))
        .await
        .unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    match Message::decode(reply.to_text().unwrap()).unwrap() {
        Message::Error { message } => assert!(message.contains("expected register")),
        other => panic!("expected error, got {other:?}"),
    }
    handle.shutdown().await;
}

#[tokio::test]
async fn get_stats_reports_registered_workers() {
    let handle = spawn_coordinator(test_config()).await.unwrap();
    let url = handle.url();
    let _w = start_worker(&url, Arc::new(InMemoryEndpoint::new()), 2).await;
    wait_for_workers(&handle, 1).await;

    let mut master = MasterClient::connect(&url).await.unwrap();
    master.request_stats().await.unwrap();
    match next_message(&mut master).await {
        Some(Message::Stats { server_stats }) => {
            assert_eq!(server_stats.worker_count, 1);
            assert_eq!(server_stats.idle_workers, 1);
        }
        other => panic!("expected stats, got {other:?}"),
    }
    handle.shutdown().await;
}
