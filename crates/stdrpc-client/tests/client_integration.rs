use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use stdrpc_client::{CallMode, ClientConfig, ClientState, Error, RpcClient, StderrMode};
use tokio::time::{sleep, timeout};

const DOUBLE: &str = env!("CARGO_BIN_EXE_stdrpc-double");

/// Upper bound for anything that must not hang.
const NO_HANG: Duration = Duration::from_secs(10);

fn double() -> ClientConfig {
    ClientConfig::new(DOUBLE).with_shutdown_grace(Duration::from_secs(2))
}

fn replying(line: &str) -> ClientConfig {
    double().args(["--reply", line])
}

async fn spawn(config: ClientConfig) -> RpcClient {
    RpcClient::spawn(config).await.expect("spawn double")
}

fn assert_terminated(result: stdrpc_client::Result<Value>) {
    match result {
        Err(Error::ProcessTerminated) => {}
        other => panic!("expected ProcessTerminated, got {:?}", other),
    }
}

fn assert_malformed(result: stdrpc_client::Result<Value>) {
    match result {
        Err(Error::MalformedResponse { .. }) => {}
        other => panic!("expected MalformedResponse, got {:?}", other),
    }
}

#[tokio::test]
async fn test_echo_scenario() {
    let client = spawn(replying(r#"{"jsonrpc":"2.0","id":1,"result":"hello"}"#)).await;
    assert_eq!(client.state(), ClientState::Ready);

    let result = client.call("echo", vec![json!("hello")]).await.unwrap();
    assert_eq!(result, json!("hello"));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_error_scenario() {
    let client = spawn(replying(
        r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"method not found"}}"#,
    ))
    .await;

    match client.call("nope", vec![]).await {
        Err(Error::Remote { code, message, data }) => {
            assert_eq!(code, -32601);
            assert_eq!(message, "method not found");
            assert!(data.is_none());
        }
        other => panic!("expected Remote, got {:?}", other),
    }

    // A remote error leaves the session usable
    assert_eq!(client.state(), ClientState::Ready);
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_child_exits_without_response() {
    for mode in [CallMode::Concurrent, CallMode::Sequential] {
        let client = spawn(double().arg("--exit").with_mode(mode)).await;

        let result = timeout(NO_HANG, client.call("echo", vec![json!("hello")]))
            .await
            .expect("call must not hang");
        assert_terminated(result);
        assert_eq!(client.state(), ClientState::Closed);

        // Closed fails immediately
        assert_terminated(client.call("echo", vec![]).await);
    }
}

#[tokio::test]
async fn test_round_trip_reproduces_id_and_method() {
    let client = spawn(double()).await;

    let first = client.call("request", vec![json!("a")]).await.unwrap();
    let second = client.call("request", vec![json!(1), json!({"k": [true]})]).await.unwrap();

    assert_eq!(first["jsonrpc"], "2.0");
    assert_eq!(first["method"], "request");
    assert_eq!(first["params"], json!(["a"]));
    assert_eq!(second["params"], json!([1, {"k": [true]}]));
    assert!(second["id"].as_u64().unwrap() > first["id"].as_u64().unwrap());

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_error_with_data() {
    let client = spawn(double()).await;

    match client
        .call("fail", vec![json!(-32000), json!("tour not found"), json!({"tour": "t1"})])
        .await
    {
        Err(Error::Remote { code, message, data }) => {
            assert_eq!(code, -32000);
            assert_eq!(message, "tour not found");
            assert_eq!(data, Some(json!({"tour": "t1"})));
        }
        other => panic!("expected Remote, got {:?}", other),
    }

    assert!(matches!(
        client.call("unknown_method", vec![]).await,
        Err(Error::Remote { code: -32601, .. })
    ));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_calls_get_distinct_ids_and_own_results() {
    const N: usize = 8;
    let client = Arc::new(spawn(double()).await);

    // The double answers only once all N arrived, in reverse order.
    let mut handles = Vec::new();
    for i in 0..N {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client
                .call("collect", vec![json!(N), json!(format!("call-{}", i))])
                .await
                .map(|result| (i, result))
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        let (i, result) = timeout(NO_HANG, handle)
            .await
            .expect("collect must not hang")
            .unwrap()
            .unwrap();
        assert_eq!(result["value"], json!(format!("call-{}", i)));
        assert!(ids.insert(result["id"].as_u64().unwrap()));
    }
    assert_eq!(ids.len(), N);
    assert_eq!(client.pending_calls(), 0);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_crash_fails_all_outstanding_calls() {
    const K: usize = 5;
    let client = Arc::new(spawn(double()).await);

    let mut handles = Vec::new();
    for _ in 0..K {
        let client = client.clone();
        handles.push(tokio::spawn(async move { client.call("hold", vec![]).await }));
    }

    let mut waited = Duration::ZERO;
    while client.pending_calls() < K && waited < NO_HANG {
        sleep(Duration::from_millis(10)).await;
        waited += Duration::from_millis(10);
    }
    assert_eq!(client.pending_calls(), K);

    assert_terminated(client.call("crash", vec![]).await);
    for handle in handles {
        let result = timeout(NO_HANG, handle).await.expect("held call must not hang").unwrap();
        assert_terminated(result);
    }

    assert_eq!(client.state(), ClientState::Closed);
    assert_eq!(client.pending_calls(), 0);
    assert_terminated(client.call("echo", vec![]).await);

    let status = client.try_exit_status().await.unwrap();
    assert!(status.map_or(true, |s| !s.success()));
}

/// True once `/proc` no longer lists the process, i.e. it has been reaped.
#[cfg(target_os = "linux")]
fn reaped(pid: u32) -> bool {
    !std::path::Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_crashed_child_is_reaped_without_shutdown() {
    for mode in [CallMode::Concurrent, CallMode::Sequential] {
        let client = spawn(double().with_mode(mode)).await;
        let pid = client.process_id().unwrap();

        assert_terminated(client.call("crash", vec![]).await);
        assert_eq!(client.state(), ClientState::Closed);

        let mut waited = Duration::ZERO;
        while !reaped(pid) && waited < NO_HANG {
            sleep(Duration::from_millis(20)).await;
            waited += Duration::from_millis(20);
        }
        assert!(reaped(pid), "child {} left unreaped in {:?} mode", pid, mode);

        // Shutdown after the teardown reports the recorded status.
        let status = client.shutdown().await.unwrap();
        assert!(!status.success());
    }
}

#[tokio::test]
async fn test_overlong_line_closes_session() {
    for mode in [CallMode::Concurrent, CallMode::Sequential] {
        let mut config = double().with_mode(mode);
        config.max_line_length = 1024;
        let client = spawn(config).await;

        let result = timeout(NO_HANG, client.call("echo", vec![json!("x".repeat(4000))]))
            .await
            .expect("call must not hang");
        assert_terminated(result);
        assert_eq!(client.state(), ClientState::Closed);
        assert_terminated(client.call("echo", vec![json!(1)]).await);

        client.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_malformed_lines_do_not_break_session() {
    for mode in [CallMode::Concurrent, CallMode::Sequential] {
        let client = spawn(double().with_mode(mode)).await;

        assert_malformed(client.call("garbage", vec![]).await);
        assert_malformed(client.call("no_id", vec![]).await);
        match client.call("both", vec![]).await {
            Err(Error::MalformedResponse { id: Some(_), .. }) => {}
            other => panic!("expected MalformedResponse with id, got {:?}", other),
        }

        assert_eq!(client.state(), ClientState::Ready);
        let result = client.call("echo", vec![json!("still here")]).await.unwrap();
        assert_eq!(result, json!("still here"));

        client.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_blank_lines_are_ignored() {
    let client = spawn(double()).await;
    assert_eq!(client.call("blank", vec![json!(5)]).await.unwrap(), json!(5));
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sequential_id_mismatch_is_malformed() {
    let client = spawn(
        replying(r#"{"jsonrpc":"2.0","id":99,"result":"stray"}"#).with_mode(CallMode::Sequential),
    )
    .await;

    match client.call("echo", vec![json!("hello")]).await {
        Err(Error::MalformedResponse { id, .. }) => assert_eq!(id, Some(99)),
        other => panic!("expected MalformedResponse, got {:?}", other),
    }

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sequential_calls_in_order() {
    let client = Arc::new(spawn(double().with_mode(CallMode::Sequential)).await);
    assert_eq!(client.mode(), CallMode::Sequential);

    // Concurrent callers queue behind each other.
    let mut handles = Vec::new();
    for i in 0..4 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client.call("echo", vec![json!(i)]).await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap().unwrap(), json!(i));
    }

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_timeout_releases_call_and_drops_late_response() {
    for mode in [CallMode::Concurrent, CallMode::Sequential] {
        let config = double()
            .with_mode(mode)
            .with_call_timeout(Duration::from_millis(100));
        let client = spawn(config).await;

        match client.call("sleep", vec![json!(400), json!("late")]).await {
            Err(Error::Timeout { method, timeout_ms }) => {
                assert_eq!(method, "sleep");
                assert_eq!(timeout_ms, 100);
            }
            other => panic!("expected Timeout, got {:?}", other),
        }
        assert_eq!(client.pending_calls(), 0);
        assert_eq!(client.state(), ClientState::Ready);

        // Let the late response arrive; it must not reach the next caller.
        sleep(Duration::from_millis(600)).await;
        let result = client.call("echo", vec![json!("fresh")]).await.unwrap();
        assert_eq!(result, json!("fresh"));

        client.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_abandoned_call_is_removed() {
    let client = spawn(double()).await;

    let abandoned = timeout(Duration::from_millis(50), client.call("hold", vec![])).await;
    assert!(abandoned.is_err());
    assert_eq!(client.pending_calls(), 0);

    assert_eq!(client.call("echo", vec![json!(1)]).await.unwrap(), json!(1));
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_typed_call() {
    let client = spawn(double()).await;

    let params: Vec<String> = client
        .call_typed("params", vec![json!("a"), json!("b")])
        .await
        .unwrap();
    assert_eq!(params, vec!["a".to_string(), "b".to_string()]);

    let mismatch = client.call_typed::<u64>("echo", vec![json!("text")]).await;
    assert!(matches!(mismatch, Err(Error::Json(_))));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_closes() {
    let client = spawn(double()).await;
    assert!(client.process_id().is_some());
    client.call("echo", vec![json!(1)]).await.unwrap();

    let first = client.shutdown().await.unwrap();
    assert!(first.success());
    let second = client.shutdown().await.unwrap();
    assert_eq!(first, second);

    assert_eq!(client.state(), ClientState::Closed);
    assert_terminated(client.call("echo", vec![]).await);
}

#[tokio::test]
async fn test_shutdown_kills_lingering_child() {
    let config = double()
        .arg("--linger")
        .with_shutdown_grace(Duration::from_millis(200));
    let client = spawn(config).await;
    client.call("echo", vec![json!(1)]).await.unwrap();

    let status = timeout(NO_HANG, client.shutdown())
        .await
        .expect("shutdown must not hang")
        .unwrap();
    assert!(!status.success());
}

#[tokio::test]
async fn test_stderr_modes_do_not_disturb_calls() {
    for stderr in [StderrMode::Log, StderrMode::Null] {
        let client = spawn(double().with_stderr(stderr)).await;
        let result = client.call("stderr", vec![json!("diagnostic")]).await.unwrap();
        assert_eq!(result, json!("diagnostic"));
        client.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_spawn_error() {
    let result = RpcClient::spawn(ClientConfig::new("/nonexistent/stdrpc-missing-program")).await;
    assert!(matches!(result, Err(Error::Spawn { .. })));
}
