//! Demo server: a small module with echo, arithmetic, and value signing,
//! served over HTTP routes and the `WebSocket` transport.

use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use http::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;
use switchyard_core::signing::{sign, unsign};
use switchyard_core::{
    to_values, EventKind, ExecutionContext, Module, OperationTree, ProcedureError, Reply,
    ServerEvent, UpgradeData, UpgradeDerivation,
};
use switchyard_server::{standard_middleware, NetworkConfig, Server, ServiceConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "switchyard-demo", about = "Serve the switchyard demo module")]
struct Args {
    #[arg(long, env = "SWITCHYARD_HOST", default_value = "127.0.0.1")]
    host: String,
    #[arg(long, env = "SWITCHYARD_PORT", default_value_t = 8080)]
    port: u16,
    #[arg(long, env = "SWITCHYARD_WS_PATH", default_value = "/ws")]
    ws_path: String,
    /// Key for the signing operations.
    #[arg(long, env = "SWITCHYARD_SECRET", default_value = "switchyard-demo")]
    secret: String,
    #[arg(long, env = "SWITCHYARD_TIMEOUT_MS", default_value_t = 30_000)]
    timeout_ms: u64,
    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

#[derive(Debug, Deserialize)]
struct AddInput {
    a: f64,
    b: f64,
}

#[derive(Debug, Serialize)]
struct AddOutput {
    sum: f64,
}

#[derive(Debug, Deserialize)]
struct SignInput {
    value: String,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,switchyard_server=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn connected_at() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

fn signing_module(secret: String) -> Module {
    let unsign_secret = secret.clone();
    Module::new("signing").procedures(move |f| {
        let secret = secret.clone();
        let unsign_secret = unsign_secret.clone();
        OperationTree::new()
            .operation(
                "sign",
                f.operation().method(Method::POST).handle(
                    move |input: SignInput, _ctx: ExecutionContext| {
                        let signed = sign(&input.value, &secret);
                        async move { Ok::<_, ProcedureError>(json!({ "signed": signed })) }
                    },
                ),
            )
            .operation(
                "unsign",
                f.operation().method(Method::POST).handle(
                    move |input: SignInput, _ctx: ExecutionContext| {
                        let result = unsign(&input.value, &unsign_secret)
                            .map(|value| json!({ "value": value }))
                            .ok_or_else(|| ProcedureError::bad_request("signature mismatch"));
                        async move { result }
                    },
                ),
            )
    })
}

fn demo_module(args: &Args) -> Module {
    let service = ServiceConfig {
        default_operation_timeout_ms: args.timeout_ms,
        ..ServiceConfig::default()
    };

    let api = Module::new("api")
        .derive_fn(|ctx| {
            let request_id = ctx.request().and_then(|meta| meta.request_id.clone());
            Ok(to_values(json!({ "requestId": request_id })))
        })
        .procedures(|f| {
            OperationTree::new()
                .operation(
                    "echo",
                    f.operation()
                        .path("/echo")
                        .handler_raw(|inv| async move { Ok(Reply::Value(inv.input)) }),
                )
                .operation(
                    "whoami",
                    f.operation().method(Method::GET).handler_raw(|inv| async move {
                        Ok(Reply::Value(json!({
                            "requestId": inv.ctx.get("requestId"),
                            "connectedAt": inv.ctx.get("connectedAt"),
                        })))
                    }),
                )
                .branch(
                    "math",
                    OperationTree::new().operation(
                        "add",
                        f.operation().method(Method::POST).handle(
                            |input: AddInput, _ctx: ExecutionContext| async move {
                                Ok::<_, ProcedureError>(AddOutput {
                                    sum: input.a + input.b,
                                })
                            },
                        ),
                    ),
                )
        });

    Module::new("demo")
        .with(standard_middleware(&service))
        .upgrade(UpgradeDerivation::from_fn(|_ctx| {
            Ok(UpgradeData {
                data: to_values(json!({ "connectedAt": connected_at() })),
                ..UpgradeData::default()
            })
        }))
        .on(EventKind::Error, |event| {
            if let ServerEvent::Error { operation, error } = event {
                error!(operation = ?operation, error = %error, "operation failed");
            }
        })
        .on(EventKind::Open, |event| info!(?event, "connection opened"))
        .on(EventKind::Close, |event| info!(?event, "connection closed"))
        .with(&api)
        .with(signing_module(args.secret.clone()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let module = demo_module(&args);
    let config = NetworkConfig {
        host: args.host.clone(),
        port: args.port,
        ws_path: args.ws_path.clone(),
        ..NetworkConfig::default()
    };

    let mut server = Server::new(&module, config)?;
    info!(manifest = %serde_json::to_string(&server.compiled().manifest())?, "module compiled");
    let address = server.start().await?;
    info!(%address, "switchyard demo listening");

    server
        .serve(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to listen for ctrl-c");
            }
        })
        .await
}
