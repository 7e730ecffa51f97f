//! Autoflow CLI and REST API entry point.
//!
//! Binary name: `autoflow`
//!
//! Parses CLI arguments, initializes tracing, the database and the engine,
//! then dispatches to the command handler or starts the REST API server.

mod cli;
mod http;
mod state;

use clap::Parser;
use clap_complete::generate;

use autoflow_infra::config::resolve_data_dir;
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,autoflow_core=debug,autoflow_infra=debug,autoflow_api=debug",
        _ => "trace",
    };
    autoflow_observe::init_tracing(filter, cli.log_format, cli.otel)
        .map_err(|e| anyhow::anyhow!(e))?;

    let result = dispatch(cli).await;
    autoflow_observe::shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    // Commands that need no database.
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(*shell, &mut cmd, "autoflow", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => return cli::workflow::validate(file, cli.json),
        _ => {}
    }

    let data_dir = cli.data_dir.clone().unwrap_or_else(resolve_data_dir);
    let state = AppState::init(data_dir).await?;
    let json = cli.json;

    match cli.command {
        Commands::Register { file } => cli::workflow::register(&state, &file, json).await?,
        Commands::List => cli::workflow::list(&state, json).await?,
        Commands::Remove { workflow_id } => {
            cli::workflow::remove(&state, &workflow_id, json).await?
        }
        Commands::Generate { query, provider } => {
            cli::workflow::generate(&state, &query, provider.as_deref(), json).await?
        }
        Commands::Run {
            workflow_id,
            input,
            user,
        } => {
            cli::execution::run(&state, &workflow_id, input.as_deref(), user.as_deref(), json)
                .await?
        }
        Commands::Resume {
            execution_id,
            step_id,
        } => cli::execution::resume(&state, execution_id, step_id, json).await?,
        Commands::Trigger { event_type, data } => {
            cli::execution::trigger(&state, &event_type, data.as_deref(), json).await?
        }
        Commands::Status { execution_id } => {
            cli::execution::status(&state, execution_id, json).await?
        }
        Commands::Pending { limit } => cli::execution::pending(&state, limit, json).await?,
        Commands::Cancel { execution_id } => {
            cli::execution::cancel(&state, execution_id, json).await?
        }
        Commands::Serve { port, host } => serve(state, host, port).await?,
        // Handled before the database is opened.
        Commands::Completions { .. } | Commands::Validate { .. } => {}
    }

    Ok(())
}

async fn serve(state: AppState, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(|| state.config.server.host.clone());
    let port = port.unwrap_or(state.config.server.port);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!(
        "  {} Autoflow API listening on {}",
        console::style("*").green().bold(),
        console::style(format!("http://{addr}/api/v1")).cyan()
    );
    println!("  {}", console::style("Press Ctrl+C to stop").dim());
    tracing::info!(%addr, data_dir = %state.data_dir.display(), "server started");

    let engine = state.engine.clone();
    let router = http::router::build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown().await;
    println!("\n  Server stopped.");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
