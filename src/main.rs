use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use crossterm::style::Stylize;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kubectl_lifecycle::cli::Cli;
use kubectl_lifecycle::config::current_context;
use kubectl_lifecycle::kubernetes::client_version;
use kubectl_lifecycle::utils::get_color;
use kubectl_lifecycle::{
    ClientConfig, ExecutionOptions, ExecutionRequest, LifecycleController, LogMessage,
    OutputStream, SystemInvoker,
};

const OUTPUT_BUFFER: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = ClientConfig::load(cli.config.as_deref())?;
    let options = ExecutionOptions::from_generic_info(&cli.generic_info()?)?;
    let variables = cli.variables()?;
    let manifest = read_manifest(&cli.manifest).await?;

    let kubeconfig = config.kubeconfig_path();
    let mut invoker = SystemInvoker::new();
    if kubeconfig.is_file() {
        if let Some(context) = current_context(&kubeconfig) {
            info!("Using kubeconfig context: {}", context);
        }
        invoker = invoker.with_env("KUBECONFIG", kubeconfig.display().to_string());
    } else {
        debug!(
            "Kubeconfig {} not found, kubectl falls back to its own lookup",
            kubeconfig.display()
        );
    }

    let controller = LifecycleController::from_config(Arc::new(invoker.clone()), &config);
    client_version(&invoker, controller.commands()).await;

    let (log_tx, log_rx) = mpsc::channel::<LogMessage>(OUTPUT_BUFFER);
    let printer = tokio::spawn(print_output(log_rx, cli.timestamps));

    let termination = CancellationToken::new();
    let hook = tokio::spawn(cancel_on_signal(termination.clone()));

    let request = ExecutionRequest {
        manifest,
        variables,
        options,
    };
    let outcome = controller.run(request, log_tx, &termination).await;

    hook.abort();
    if let Err(e) = printer.await {
        warn!("Output printer did not finish: {}", e);
    }

    let report = outcome?;
    if let Some(streamed) = &report.streamed {
        debug!("Streamed resource: {}", streamed);
    }
    info!(
        "Execution ({}) finished with {} created resource(s)",
        report.mode,
        report.created.len()
    );
    Ok(())
}

async fn read_manifest(source: &str) -> anyhow::Result<String> {
    if source == "-" {
        let mut content = String::new();
        tokio::io::stdin()
            .read_to_string(&mut content)
            .await
            .context("Failed to read manifest from stdin")?;
        Ok(content)
    } else {
        tokio::fs::read_to_string(source)
            .await
            .with_context(|| format!("Failed to read manifest {}", source))
    }
}

async fn print_output(mut log_rx: mpsc::Receiver<LogMessage>, timestamps: bool) {
    let colored = std::io::stdout().is_terminal();
    while let Some(msg) = log_rx.recv().await {
        let key = format!("{}/{}/{}", msg.namespace, msg.kind, msg.name);
        let prefix = if colored {
            format!("[{}]", key).with(get_color(&key)).to_string()
        } else {
            format!("[{}]", key)
        };
        let line = if timestamps {
            format!("{} {} {}", msg.timestamp.to_rfc3339(), prefix, msg.line)
        } else {
            format!("{} {}", prefix, msg.line)
        };
        match msg.stream {
            OutputStream::Stdout => println!("{}", line),
            OutputStream::Stderr => eprintln!("{}", line),
        }
    }
}

async fn cancel_on_signal(termination: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("Could not install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    warn!("Termination requested, cleaning up");
    termination.cancel();
}
