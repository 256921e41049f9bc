use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::task::JoinHandle;

use amqp_rpc::{
    //
    CallArgs,
    CallOptions,
    ConnectionMode,
    Handler,
    JsonCodec,
    MemoryHub,
    Result,
    RpcClient,
    RpcConfig,
    RpcError,
    RpcServerBuilder,
    ShutdownHandle,
};

struct TestServer {
    // ---
    stop: ShutdownHandle,
    handle: JoinHandle<Result<()>>,
}

impl TestServer {
    // ---
    /// Build and run the server, returning once every queue has a consumer.
    async fn start(hub: &MemoryHub, builder: RpcServerBuilder) -> Self {
        // ---
        let mut server = builder.factory(Arc::new(hub.clone())).build().expect("build failed");
        let queues = server.queue_names();
        let stop = server.shutdown_handle();

        let handle = tokio::spawn(async move { server.run().await });
        wait_for_consumers(hub, &queues).await;

        Self { stop, handle }
    }

    async fn shutdown(self) -> Result<()> {
        // ---
        self.stop.stop();
        self.handle.await.expect("server task panicked")
    }
}

async fn wait_for_consumers(hub: &MemoryHub, queues: &[String]) {
    // ---
    eventually(|| queues.iter().all(|q| hub.prefetch_of(q).is_some())).await;
}

async fn eventually(mut check: impl FnMut() -> bool) {
    // ---
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn server_config() -> RpcConfig {
    RpcConfig::memory()
}

async fn client(hub: &MemoryHub) -> RpcClient {
    // ---
    let config = RpcConfig::memory().with_poll_interval(Duration::from_millis(2));
    RpcClient::with_factory(Arc::new(hub.clone()), config)
        .await
        .expect("client connect failed")
}

fn math_server() -> RpcServerBuilder {
    // ---
    RpcServerBuilder::new(server_config())
        .register("echo", |a| Ok(a.get(0).cloned().unwrap_or(Value::Null)))
        .register("greet", |a| {
            let name = a.named("name").and_then(Value::as_str).unwrap_or("nobody");
            Ok(json!(format!("hello {name}")))
        })
        .register("slow", |_| {
            std::thread::sleep(Duration::from_millis(400));
            Ok(json!("late"))
        })
        .register("fail", |_| Err("bad input".into()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn call_round_trip() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let server = TestServer::start(&hub, math_server()).await;
    let client = client(&hub).await;

    let out = client.function("echo").arg(42).kwarg("name", "a").timeout(5.0).invoke().await?;
    assert_eq!(out, json!(42));

    let greeting: String = client.function("greet").kwarg("name", "ada").invoke_as().await?;
    assert_eq!(greeting, "hello ada");

    let out = client
        .call("echo", CallArgs::new().arg("x"), CallOptions::new().with_timeout("5"))
        .await?;
    assert_eq!(out, json!("x"));

    client.close().await?;
    server.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeout_then_late_reply_is_dropped() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let server = TestServer::start(&hub, math_server()).await;
    let client = client(&hub).await;

    let started = Instant::now();
    let err = client.function("slow").timeout(0.1).invoke().await.unwrap_err();
    let elapsed = started.elapsed();

    match err {
        RpcError::Timeout { function } => assert_eq!(function, "slow"),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(350), "took {elapsed:?}");
    assert_eq!(client.pending_count(), 0);

    // Let the late reply land; the next call must not see it.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let out = client.function("echo").arg(7).timeout(5.0).invoke().await?;
    assert_eq!(out, json!(7));

    server.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_function_reports_not_found() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let server = TestServer::start(&hub, math_server()).await;
    let client = client(&hub).await;

    let err = client.function("missing").timeout(5.0).invoke().await.unwrap_err();
    match err {
        RpcError::RemoteFunction(msg) => assert_eq!(msg, "Function 'missing' not found."),
        other => panic!("unexpected {other:?}"),
    }

    eventually(|| hub.unacked_count() == 0).await;
    server.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn default_handler_catches_unknown_names() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let builder = RpcServerBuilder::new(server_config()).register("default", |_| Ok(json!("fallback")));
    let server = TestServer::start(&hub, builder).await;
    let client = client(&hub).await;

    let out = client.function("whatever").timeout(5.0).invoke().await?;
    assert_eq!(out, json!("fallback"));

    server.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handler_error_is_replied_and_acked_once() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let server = TestServer::start(&hub, math_server()).await;
    let client = client(&hub).await;

    let before = hub.stats().acked;
    let err = client.function("fail").timeout(5.0).invoke().await.unwrap_err();
    match err {
        RpcError::RemoteFunction(msg) => assert_eq!(msg, "bad input"),
        other => panic!("unexpected {other:?}"),
    }

    eventually(|| hub.unacked_count() == 0).await;
    let stats = hub.stats();
    assert_eq!(stats.acked - before, 1);
    assert_eq!(stats.ack_errors, 0);

    server.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fire_and_forget_runs_without_reply() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    let builder = RpcServerBuilder::new(server_config()).register("record", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Null)
    });
    let server = TestServer::start(&hub, builder).await;
    let client = client(&hub).await;

    let out = client.function("record").arg(1).ignore_result().invoke().await?;
    assert_eq!(out, Value::Null);
    assert!(client.reply_queue_name().is_none());

    eventually(|| hits.load(Ordering::SeqCst) == 1).await;
    eventually(|| hub.unacked_count() == 0).await;

    server.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_from_clones() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let server = TestServer::start(&hub, math_server().num_threads(4)).await;
    let client = client(&hub).await;

    let mut tasks = Vec::new();
    for i in 0..20 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            client.function("echo").arg(i).timeout(5.0).invoke().await
        }));
    }

    for (i, task) in tasks.into_iter().enumerate() {
        let out = task.await.expect("call task panicked")?;
        assert_eq!(out, json!(i));
    }
    assert_eq!(client.pending_count(), 0);

    server.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handlers_on_named_queues() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let builder = RpcServerBuilder::new(server_config())
        .register("echo", |a| Ok(a.get(0).cloned().unwrap_or(Value::Null)))
        .handler(Handler::new("report", |_| Ok(json!("from reports"))).queue("reports"));
    let server = TestServer::start(&hub, builder).await;
    let client = client(&hub).await;

    let out = client
        .function("report")
        .routing_key("reports")
        .timeout(5.0)
        .invoke()
        .await?;
    assert_eq!(out, json!("from reports"));
    assert_eq!(hub.bindings("default", "reports"), ["reports"]);

    server.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn json_argument_handler() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let builder = RpcServerBuilder::new(server_config()).handler(
        Handler::new("sum", |a| {
            let total: i64 = a.args.iter().filter_map(Value::as_i64).sum();
            Ok(json!(total))
        })
        .json_args(),
    );
    let server = TestServer::start(&hub, builder).await;

    let config = RpcConfig::memory()
        .with_poll_interval(Duration::from_millis(2))
        .with_codec(Arc::new(JsonCodec));
    let client = RpcClient::with_factory(Arc::new(hub.clone()), config).await?;

    let total: i64 = client.function("sum").arg(1).arg(2).arg(3).timeout(5.0).invoke_as().await?;
    assert_eq!(total, 6);

    server.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exclusive_conflict_fails_before_declaring() {
    // ---
    let hub = MemoryHub::new();
    let result = RpcServerBuilder::new(server_config())
        .factory(Arc::new(hub.clone()))
        .handler(Handler::new("a", |_| Ok(Value::Null)).queue("solo").exclusive())
        .handler(Handler::new("b", |_| Ok(Value::Null)).queue("solo"))
        .build();

    assert!(matches!(result, Err(RpcError::Configuration(_))));
    assert!(hub.queue_names().is_empty());
    assert_eq!(hub.stats().published, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn event_driven_server_reconnects_after_close() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let server = TestServer::start(&hub, math_server()).await;
    let client = client(&hub).await;

    assert_eq!(client.function("echo").arg(1).timeout(5.0).invoke().await?, json!(1));

    assert_eq!(hub.sever_consumers_of("default"), 1);
    wait_for_consumers(&hub, &["default".to_string()]).await;

    assert_eq!(client.function("echo").arg(2).timeout(5.0).invoke().await?, json!(2));

    server.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocking_server_fails_on_close() {
    // ---
    let hub = MemoryHub::new();
    let builder = RpcServerBuilder::new(server_config().with_mode(ConnectionMode::Blocking))
        .register("echo", |a| Ok(a.get(0).cloned().unwrap_or(Value::Null)));
    let server = TestServer::start(&hub, builder).await;
    let client = client(&hub).await;

    let out = client.function("echo").arg("inline").timeout(5.0).invoke().await.unwrap();
    assert_eq!(out, json!("inline"));

    hub.sever_consumers_of("default");
    let result = server.handle.await.expect("server task panicked");
    assert!(matches!(result, Err(RpcError::ConnectionLost)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocking_server_runs_handlers_inline_one_at_a_time() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (r, p) = (running.clone(), peak.clone());
    let builder = RpcServerBuilder::new(server_config().with_mode(ConnectionMode::Blocking))
        .register("nap", move |_| {
            let now = r.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            r.fetch_sub(1, Ordering::SeqCst);
            Ok(Value::Null)
        });
    let server = TestServer::start(&hub, builder).await;
    let client = client(&hub).await;

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            client.function("nap").timeout(5.0).invoke().await
        }));
    }
    for task in tasks {
        task.await.expect("call task panicked")?;
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);

    server.shutdown().await
}
