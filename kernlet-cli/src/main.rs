//! kernlet: talk to kernels on a Jupyter server from the command line.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use kernlet::{
    Completion, ConnectionState, ControlPlane, ExecuteOptions, KernelClient, KernelConfig,
    NotebookSession, RestControlPlane,
};

#[derive(Parser, Debug)]
#[command(name = "kernlet", version, about = "Jupyter kernel protocol client")]
struct Cli {
    /// Server base url.
    #[arg(long, env = "JUPYTER_BASE_URL", default_value = "http://localhost:8888/", global = true)]
    base_url: String,

    /// Websocket base url; derived from the base url when unset.
    #[arg(long, env = "JUPYTER_WS_URL", global = true)]
    ws_url: Option<String>,

    /// Server token.
    #[arg(long, env = "JUPYTER_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List running kernels.
    List,
    /// List notebook sessions.
    Sessions,
    /// Start a kernel.
    Start {
        /// Kernel spec name; the server default when omitted.
        #[arg(long)]
        name: Option<String>,
    },
    /// Show a kernel's model.
    Info { id: String },
    /// Run code on a kernel and print its output.
    Exec {
        id: String,
        code: String,
        /// Seconds to wait for the kernel to become ready and finish.
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
    Interrupt { id: String },
    Restart { id: String },
    Shutdown { id: String },
}

/// Initialize tracing with KERNLET_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("KERNLET_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("kernlet={level},kernlet_cli={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

impl Cli {
    fn config(&self) -> KernelConfig {
        let mut config = KernelConfig::new(self.base_url.clone());
        if let Some(ws_url) = &self.ws_url {
            config = config.with_ws_url(ws_url.clone());
        }
        if let Some(token) = &self.token {
            config = config.with_token(token.clone());
        }
        config
    }

    fn control(&self) -> Result<Arc<dyn ControlPlane>> {
        let config = self.config();
        let control = RestControlPlane::new(
            &config.base_url,
            config.token.as_deref(),
            config.http_timeout,
        )
        .context("invalid server url")?;
        Ok(Arc::new(control))
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Render one iopub message for the terminal.
fn print_output(msg_type: &str, content: &serde_json::Map<String, Value>) {
    match msg_type {
        "stream" => {
            let text = content.get("text").and_then(Value::as_str).unwrap_or("");
            if content.get("name").and_then(Value::as_str) == Some("stderr") {
                eprint!("{text}");
            } else {
                print!("{text}");
            }
        }
        "execute_result" | "display_data" => {
            if let Some(text) = content
                .get("data")
                .and_then(|d| d.get("text/plain"))
                .and_then(Value::as_str)
            {
                println!("{text}");
            }
        }
        "error" => {
            let traceback = content
                .get("traceback")
                .and_then(Value::as_array)
                .map(|lines| {
                    lines
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            eprintln!("{traceback}");
        }
        _ => {}
    }
}

async fn exec(cli: &Cli, id: &str, code: &str, timeout: Duration) -> Result<bool> {
    let kernel = cli.control()?.kernel_info(id).await.context("kernel not found")?;
    let client = KernelClient::new(cli.config())?;
    let mut status = client.status_watch();
    client.connect(Some(kernel)).await?;

    tokio::time::timeout(timeout, status.wait_for(|s| *s == ConnectionState::Ready))
        .await
        .context("kernel did not become ready")?
        .context("kernel client stopped")?;

    let options = ExecuteOptions::default()
        .with_silent(false)
        .with_store_history(true);
    let future = client.execute(code, options).await?;
    future.on_output(|msg| print_output(msg.msg_type(), &msg.content));

    let completion = tokio::time::timeout(timeout, future.wait())
        .await
        .context("execution timed out")?;
    if completion != Completion::Done {
        bail!("kernel went away during execution ({})", client.status());
    }

    let ok = future
        .reply()
        .and_then(|reply| reply.content.get("status").and_then(Value::as_str).map(|s| s == "ok"))
        .unwrap_or(false);
    future.dispose();
    client.disconnect()?;
    Ok(ok)
}

async fn run(cli: Cli) -> Result<bool> {
    match &cli.command {
        Command::List => print_json(&KernelClient::list(&cli.config()).await?)?,
        Command::Sessions => print_json(&NotebookSession::list(&cli.config()).await?)?,
        Command::Start { name } => {
            let client = KernelClient::new(cli.config())?;
            if let Some(name) = name {
                client.set_name(name);
            }
            let kernel = client.start(None).await?;
            client.disconnect()?;
            print_json(&kernel)?;
        }
        Command::Info { id } => print_json(&cli.control()?.kernel_info(id).await?)?,
        Command::Exec { id, code, timeout } => {
            return exec(&cli, id, code, Duration::from_secs(*timeout)).await;
        }
        Command::Interrupt { id } => cli.control()?.interrupt_kernel(id).await?,
        Command::Restart { id } => print_json(&cli.control()?.restart_kernel(id).await?)?,
        Command::Shutdown { id } => cli.control()?.shutdown_kernel(id).await?,
    }
    Ok(true)
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            tracing::error!(error = %err, "Command failed");
            eprintln!("error: {err:#}");
            std::process::exit(2);
        }
    }
}
