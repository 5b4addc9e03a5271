// src/main.rs

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use testherd::cli::{self, Command, RunArgs, SelectArgs};
use testherd::config::{ConfigFile, load_and_validate};
use testherd::exec::ProcessLauncher;
use testherd::logging::LogRole;
use testherd::reporter::LineReporter;
use testherd::{RunOptions, list_all_tests, logging, run_all_tests, worker};

/// Exit code for configuration and internal errors.
const EXIT_ERROR: i32 = 2;

#[tokio::main]
async fn main() {
    let code = match run_main().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("testherd error: {err:?}");
            EXIT_ERROR
        }
    };
    std::process::exit(code);
}

async fn run_main() -> anyhow::Result<i32> {
    let args = cli::parse();
    let role = match args.command {
        Command::Worker => LogRole::Worker,
        _ => LogRole::Host,
    };
    logging::init_logging(args.log_level, role)?;

    match args.command {
        Command::Worker => {
            // A terminal Ctrl-C reaches the worker too; the host decides
            // when it stops. Test commands run in their own process groups.
            tokio::spawn(async {
                let _ = tokio::signal::ctrl_c().await;
            });
            worker::run_worker(tokio::io::stdin(), tokio::io::stdout()).await?;
            Ok(0)
        }
        Command::Run(run) => run_tests(run).await,
        Command::List(select) => list_tests(select).await,
    }
}

async fn run_tests(args: RunArgs) -> anyhow::Result<i32> {
    let config = args.apply(load_config(&args.select)?)?;
    let options = RunOptions::new(
        Arc::new(LineReporter::default()),
        Arc::new(ProcessLauncher::current_exe()?),
    )
    .with_interrupt(interrupt_on_ctrl_c());

    let outcome = run_all_tests(config, options).await?;
    Ok(outcome.status.exit_code())
}

async fn list_tests(args: SelectArgs) -> anyhow::Result<i32> {
    let config = load_config(&args)?;
    let options = RunOptions::new(
        Arc::new(LineReporter::listing(Box::new(std::io::stdout()))),
        Arc::new(ProcessLauncher::current_exe()?),
    )
    .with_interrupt(interrupt_on_ctrl_c());

    let outcome = list_all_tests(config, options).await?;
    Ok(outcome.status.exit_code())
}

fn load_config(args: &SelectArgs) -> anyhow::Result<ConfigFile> {
    let config = load_and_validate(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    Ok(config.select_projects(&args.projects)?)
}

/// Ctrl-C cancels the returned token.
fn interrupt_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            return;
        }
        warn!("interrupt received; stopping workers");
        cancel.cancel();
    });
    token
}
