use std::time::Duration;

use amqp_rpc::{Handler, MemoryHub, Result, RpcClient, RpcConfig, RpcError, RpcServer};
use serde_json::{json, Value};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt().with_env_filter("info").init();

    let hub = MemoryHub::new();

    let mut server = RpcServer::builder(RpcConfig::memory())
        .factory(Arc::new(hub.clone()))
        .register("echo", |args| Ok(args.get(0).cloned().unwrap_or(Value::Null)))
        .register("add", |args| {
            let a = args.get(0).and_then(Value::as_i64).unwrap_or(0);
            let b = args.named("b").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(a + b))
        })
        .handler(Handler::new("nap", |_| {
            std::thread::sleep(Duration::from_millis(500));
            Ok(Value::Null)
        }))
        .num_threads(4)
        .build()?;

    let stop = server.shutdown_handle();
    let handle = tokio::spawn(async move { server.run().await });

    while hub.prefetch_of("default").is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let client = RpcClient::with_factory(Arc::new(hub.clone()), RpcConfig::memory()).await?;

    let echoed = client.function("echo").arg("hello").timeout(2.0).invoke().await?;
    println!("echo -> {echoed}");

    let sum: i64 = client.function("add").arg(20).kwarg("b", 3).invoke_as().await?;
    println!("20 + 3 = {sum}");

    match client.function("nap").timeout(0.1).invoke().await {
        Err(RpcError::Timeout { function }) => println!("{function} timed out"),
        other => println!("nap -> {other:?}"),
    }

    match client.function("missing").invoke().await {
        Err(RpcError::RemoteFunction(msg)) => println!("missing -> {msg}"),
        other => println!("missing -> {other:?}"),
    }

    client.close().await?;
    stop.stop();
    handle.await.map_err(|e| RpcError::transport(e.to_string()))?
}
