//! netcurfew: applies weekly block/unblock schedules to managed client groups
//! on a network controller.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};

use netcurfew::application::commands::{
    check_impl, config_view_impl, connect_controller, controller_credentials, run_impl,
    save_password_impl, set_override_impl, set_tunables_impl, status_impl, AppState,
};
use netcurfew::infrastructure::error::InfraError;

// ── CLI ─────────────────────────────────────────────────────────────

/// Time-of-day network access scheduler.
#[derive(Parser, Debug)]
#[command(name = "netcurfew", version, about)]
struct Cli {
    /// Workspace holding config/, state/ and logs/.
    #[arg(long, env = "NETCURFEW_WORKSPACE", default_value = ".")]
    workspace: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler until interrupted.
    Run,
    /// Set or clear a manual override for a managed group.
    SetOverride {
        group: String,
        /// block, unblock or use-schedule.
        action: String,
        /// Drop the override when the group's next trigger fires.
        #[arg(long)]
        until_next_trigger: bool,
        /// Filter groups to apply with an unblock override.
        #[arg(long, value_delimiter = ',')]
        filter_groups: Option<Vec<String>>,
    },
    /// Show the resolved state of every managed device.
    Status,
    /// Print the loaded configuration with credentials masked.
    Config,
    /// Validate configuration and compile every schedule.
    Check,
    /// Store the controller password in the OS keyring, read from stdin.
    SetPassword,
    /// Change runtime tunables persisted in the state store.
    Tune {
        #[arg(long)]
        dry_run: Option<bool>,
        #[arg(long)]
        recompute_interval_seconds: Option<u64>,
    },
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "command failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<(), InfraError> {
    let state = AppState::new(cli.workspace)?;
    info!(workspace = %state.workspace_root().display(), "workspace ready");

    match cli.command {
        Command::Run => {
            run_impl(&state, async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    error!(error = %err, "failed to listen for ctrl-c");
                }
                info!("shutdown requested");
            })
            .await
        }
        Command::SetOverride {
            group,
            action,
            until_next_trigger,
            filter_groups,
        } => print_json(&set_override_impl(
            &state,
            group,
            action,
            until_next_trigger,
            filter_groups,
        )?),
        Command::Status => {
            let controller = connect_controller(&state, &controller_credentials(&state))?;
            let status = status_impl(
                &state,
                controller.as_ref(),
                controller.as_ref(),
                chrono::Utc::now(),
            )
            .await?;
            print_json(&status)
        }
        Command::Config => print_json(&config_view_impl(&state)?),
        Command::Check => print_json(&check_impl(&state)?),
        Command::SetPassword => {
            let mut password = String::new();
            std::io::stdin().read_line(&mut password)?;
            save_password_impl(&state, &controller_credentials(&state), password.trim_end())?;
            println!("controller password stored");
            Ok(())
        }
        Command::Tune {
            dry_run,
            recompute_interval_seconds,
        } => print_json(&set_tunables_impl(
            &state,
            dry_run,
            recompute_interval_seconds,
        )?),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), InfraError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
