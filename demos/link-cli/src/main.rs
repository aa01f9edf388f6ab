//! Collector link CLI
//!
//! Issue requests, watch live topics or drive a local collector from the
//! command line.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use collector_link_client::{
    BridgeConfig, ClientConfig, ConnectionConfig, ControlClient, Credential, EventKind,
    HandlerError, Method, Operation, RecordConsumer, ReconnectLimit, StreamRecord,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "collector-link", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send one request to the server and print the JSON result.
    Call {
        #[command(flatten)]
        server: ServerArgs,
        /// HTTP method.
        #[arg(long, default_value = "get", value_parser = parse_method)]
        method: Method,
        /// Request path, e.g. /api/v1/hunts.
        path: String,
        /// JSON request body.
        #[arg(long)]
        body: Option<String>,
        /// Request deadline in seconds.
        #[arg(long)]
        deadline: Option<u64>,
    },
    /// Subscribe to live topics and print events until interrupted.
    Watch {
        #[command(flatten)]
        server: ServerArgs,
        /// Topics to subscribe to.
        #[arg(required = true)]
        topics: Vec<String>,
    },
    /// Run the local collector and stream its records.
    Local {
        /// Collector executable (looked up on PATH).
        #[arg(long, env = "COLLECTOR_EXECUTABLE")]
        collector: String,
        /// Seconds between SIGTERM and the forced kill.
        #[arg(long, default_value_t = 5)]
        grace: u64,
        /// Arguments for this invocation.
        #[arg(trailing_var_arg = true, required = true)]
        args: Vec<String>,
    },
}

#[derive(Args)]
struct ServerArgs {
    /// Server base address.
    #[arg(long, env = "COLLECTOR_SERVER")]
    server: String,
    /// API key.
    #[arg(long, env = "COLLECTOR_API_KEY", hide_env_values = true, conflicts_with = "user")]
    api_key: Option<String>,
    /// Basic auth user.
    #[arg(long, env = "COLLECTOR_USER", requires = "password")]
    user: Option<String>,
    /// Basic auth password.
    #[arg(long, env = "COLLECTOR_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    /// Consecutive reconnect attempts before giving up (0 = unbounded).
    #[arg(long, default_value_t = 10)]
    reconnect_attempts: u32,
}

impl ServerArgs {
    fn client(&self) -> Result<ControlClient> {
        let credential = match (&self.api_key, &self.user, &self.password) {
            (Some(key), _, _) => Credential::api_key(key.as_str()),
            (None, Some(user), Some(password)) => {
                Credential::basic(user.as_str(), password.as_str())
            }
            _ => bail!("either --api-key or --user/--password is required"),
        };
        let limit = match self.reconnect_attempts {
            0 => ReconnectLimit::Unbounded,
            n => ReconnectLimit::MaxAttempts(n),
        };
        let config = ConnectionConfig::builder(self.server.as_str())
            .credential(credential)
            .reconnect_limit(limit)
            .build()?;
        Ok(ControlClient::new(ClientConfig::remote(config))?)
    }
}

fn parse_method(raw: &str) -> Result<Method, String> {
    match raw.to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::Get),
        "POST" => Ok(Method::Post),
        "PUT" => Ok(Method::Put),
        "PATCH" => Ok(Method::Patch),
        "DELETE" => Ok(Method::Delete),
        other => Err(format!("unsupported method: {other}")),
    }
}

struct PrintRecords;

#[async_trait]
impl RecordConsumer for PrintRecords {
    async fn on_record(&self, record: StreamRecord) -> Result<(), HandlerError> {
        println!("{}", serde_json::to_string(&record.value)?);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Call {
            server,
            method,
            path,
            body,
            deadline,
        } => {
            let client = server.client()?;
            let mut operation = Operation::new(method, path);
            if let Some(body) = body {
                let body: Value = serde_json::from_str(&body).context("--body is not valid JSON")?;
                operation = operation.with_body(body);
            }
            if let Some(secs) = deadline {
                operation = operation.with_deadline(Duration::from_secs(secs));
            }
            let value = client.call(operation).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            client.close().await;
        }
        Command::Watch { server, topics } => {
            let client = server.client()?;
            let (tx, mut rx) = tokio::sync::mpsc::channel(256);
            for topic in topics {
                let tx = tx.clone();
                client.subscribe_fn(topic, move |event| {
                    tx.try_send(event.clone()).map_err(|e| e.to_string().into())
                });
            }
            drop(tx);
            client.open()?;

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        if let EventKind::ConnectionLost { attempts } = event.kind {
                            client.close().await;
                            let reason = &event.payload["reason"];
                            bail!("connection lost after {attempts} attempts: {reason}");
                        }
                        println!("{} {}", event.topic, event.payload);
                    }
                }
            }
            info!("Closing");
            client.close().await;
        }
        Command::Local {
            collector,
            grace,
            args,
        } => {
            let config = BridgeConfig::builder(collector)
                .grace_period(Duration::from_secs(grace))
                .build()?;
            let client = ControlClient::new(ClientConfig::local(config))?;

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });
            client
                .stream_with_cancel(Operation::local(args), Arc::new(PrintRecords), &cancel)
                .await?;
        }
    }
    Ok(())
}
