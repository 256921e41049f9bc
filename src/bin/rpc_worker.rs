use amqp_rpc::{cli, Handler};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

fn handlers() -> Vec<Handler> {
    // ---
    vec![
        Handler::new("echo", |args| Ok(args.get(0).cloned().unwrap_or(Value::Null))),
        Handler::new("ping", |_| Ok(json!("pong"))),
    ]
}

#[tokio::main]
async fn main() {
    // ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let code = cli::run_worker(std::env::args_os(), &handlers()).await;
    std::process::exit(code);
}
