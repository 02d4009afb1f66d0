//! Command-line entry point: run an application, issue a call, or stop a
//! running application through its admin endpoint.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;
use wirecall_app::{AppConfig, Application, STOP_PATH};
use wirecall_rpc::{BodyCodec, CallContext, Client, ContentType, MethodRouter, metadata_key};

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Application error
    #[error(transparent)]
    App(#[from] wirecall_app::Error),

    /// RPC error
    #[error(transparent)]
    Rpc(#[from] wirecall_rpc::Error),

    /// Admin endpoint request failed
    #[error("admin request failed: {0}")]
    Admin(#[from] reqwest::Error),

    /// Admin endpoint answered with a non-success status
    #[error("admin endpoint answered {0}")]
    AdminStatus(reqwest::StatusCode),

    /// The configuration has no servers to run
    #[error("config declares no [[server]] blocks")]
    NoServers,
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Run every configured server with the built-in echo service
    Serve {
        /// Path of the TOML configuration file
        #[arg(long, env = "WIRECALL_CONFIG")]
        config: PathBuf,
    },

    /// Issue one call and print the response body
    Call {
        /// Server address (`ip:port`)
        #[arg(long)]
        host: String,

        /// Service object name
        #[arg(long)]
        service: String,

        /// Method name
        #[arg(long)]
        method: String,

        /// Request body
        #[arg(long, default_value = "")]
        data: String,

        /// Body codec announced to the server
        #[arg(long, value_enum, default_value_t = Codec::Json)]
        codec: Codec,

        /// Envelope serialization on the wire
        #[arg(long, value_enum, default_value_t = Codec::Json)]
        wire: Codec,

        /// Request timeout in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },

    /// Ask a running application to stop
    Stop {
        /// Admin endpoint address (`ip:port`)
        #[arg(long, env = "WIRECALL_ADMIN")]
        admin: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Codec {
    Json,
    Proto,
}

impl From<Codec> for BodyCodec {
    fn from(codec: Codec) -> Self {
        match codec {
            Codec::Json => Self::Json,
            Codec::Proto => Self::Proto,
        }
    }
}

impl From<Codec> for ContentType {
    fn from(codec: Codec) -> Self {
        match codec {
            Codec::Json => Self::Json,
            Codec::Proto => Self::Proto,
        }
    }
}

fn echo_service() -> MethodRouter<()> {
    MethodRouter::new(()).raw("Echo", |_, ctx, _, body| async move {
        info!(trace_id = ctx.get(metadata_key::TRACE_ID).unwrap_or_default(), "echo");
        Ok::<_, wirecall_rpc::Error>(body)
    })
}

async fn serve(config: PathBuf) -> Result<(), Error> {
    let config = AppConfig::from_file(&config)?;
    if config.server.is_empty() {
        return Err(Error::NoServers);
    }

    let names: Vec<String> = config.server.iter().map(|s| s.name.clone()).collect();
    let mut app = Application::new(config);
    for name in &names {
        app.add_service(name, echo_service())?;
    }

    app.run().await?;
    Ok(())
}

async fn call(
    host: String,
    service: String,
    method: &str,
    data: String,
    codec: Codec,
    wire: Codec,
    timeout: Duration,
) -> Result<(), Error> {
    let client = Client::builder(service)
        .hosts([host])
        .wire_format(wire.into())
        .request_timeout(timeout)
        .pool_size(1)
        .build()
        .await;

    let result = client
        .call(
            &CallContext::new(),
            None,
            codec.into(),
            method,
            data.into_bytes(),
        )
        .await;
    client.close().await;

    println!("{}", String::from_utf8_lossy(&result?));
    Ok(())
}

async fn stop(admin: &str) -> Result<(), Error> {
    let response = reqwest::Client::new()
        .post(format!("http://{admin}{STOP_PATH}"))
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(Error::AdminStatus(response.status()));
    }

    info!(admin, "stop requested");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Args::parse().command {
        Command::Serve { config } => serve(config).await,
        Command::Call {
            host,
            service,
            method,
            data,
            codec,
            wire,
            timeout_ms,
        } => {
            call(
                host,
                service,
                &method,
                data,
                codec,
                wire,
                Duration::from_millis(timeout_ms),
            )
            .await
        }
        Command::Stop { admin } => stop(&admin).await,
    }
}
