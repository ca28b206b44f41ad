mod telemetry;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::error;
use vacwatch_core::{env_value, Property};
use vacwatch_notify::{NotifyOutcome, ReportMode, SkipReason};
use vacwatch_storage::RegistryStore;
use vacwatch_sync::data_dir_from_env;

#[derive(Debug, Parser)]
#[command(name = "vacwatch")]
#[command(about = "Tracks SUUMO vacancy counts and mails changes")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Capture every registered property and append a history entry.
    Scrape,
    /// Compare the last two history entries and send the report.
    Notify {
        /// `changes` or `daily`.
        #[arg(long, default_value_t = ReportMode::Changes)]
        mode: ReportMode,
        /// Send even when nothing changed.
        #[arg(long)]
        force: bool,
    },
    /// Register a property by listing URL.
    Add {
        #[arg(long, env = "PROPERTY_NAME")]
        name: Option<String>,
        #[arg(long, env = "PROPERTY_URL")]
        url: Option<String>,
    },
    /// Unregister a property by id or exact name.
    Remove {
        #[arg(long, env = "PROPERTY_IDENTIFIER")]
        identifier: Option<String>,
    },
    List,
    /// Serve the working directory for local preview.
    Serve,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    if let Err(err) = telemetry::init() {
        eprintln!("{err}");
    }

    let cli = Cli::parse();
    match run(cli.command.unwrap_or(Commands::Scrape)).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "command failed");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Scrape => {
            let summary = vacwatch_sync::run_scrape_once_from_env().await?;
            println!(
                "scrape complete: run_id={} succeeded={}/{} history={}",
                summary.run_id, summary.succeeded, summary.attempted, summary.history_len
            );
        }
        Commands::Notify { mode, force } => {
            match vacwatch_notify::run_notify_from_env(mode, force).await? {
                NotifyOutcome::Skipped(SkipReason::NoChanges) => {
                    println!("no changes since the previous run; nothing sent");
                }
                NotifyOutcome::Skipped(SkipReason::NoTargetChange) => {
                    println!("changes found but none for the target move-in month; nothing sent");
                }
                NotifyOutcome::Sent { subject, to } => {
                    println!("sent \"{subject}\" to {to}");
                }
            }
        }
        Commands::Add { name, url } => {
            let (Some(name), Some(url)) = (name, url) else {
                eprintln!("both --name (PROPERTY_NAME) and --url (PROPERTY_URL) are required");
                return Ok(ExitCode::FAILURE);
            };
            let property = registry().add(name.trim(), url.trim()).await?;
            println!("added {} (ID: {})", property.name, property.id);
        }
        Commands::Remove { identifier } => {
            let Some(identifier) = identifier.or_else(|| env_value("PROPERTY_ID")) else {
                eprintln!("--identifier (PROPERTY_IDENTIFIER) is required");
                print_properties(&registry().load_or_empty().await);
                return Ok(ExitCode::FAILURE);
            };
            let property = registry().remove(identifier.trim()).await?;
            println!("removed {} (ID: {})", property.name, property.id);
        }
        Commands::List => {
            let properties = registry()
                .load()
                .await
                .context("reading the property registry")?;
            print_properties(&properties);
        }
        Commands::Serve => vacwatch_web::serve_from_env().await?,
    }
    Ok(ExitCode::SUCCESS)
}

fn registry() -> RegistryStore {
    RegistryStore::in_dir(data_dir_from_env())
}

fn print_properties(properties: &[Property]) {
    if properties.is_empty() {
        println!("no properties registered");
        return;
    }
    println!("registered properties:");
    for property in properties {
        println!("  - {} (ID: {})", property.name, property.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn notify_defaults_to_change_mode() {
        let cli = Cli::parse_from(["vacwatch", "notify"]);
        match cli.command {
            Some(Commands::Notify { mode, force }) => {
                assert_eq!(mode, ReportMode::Changes);
                assert!(!force);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = Cli::parse_from(["vacwatch", "notify", "--mode", "daily", "--force"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Notify {
                mode: ReportMode::Daily,
                force: true
            })
        ));
    }

    #[test]
    fn notify_mode_is_case_insensitive_and_rejects_unknown_values() {
        let cli = Cli::parse_from(["vacwatch", "notify", "--mode", "DAILY"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Notify {
                mode: ReportMode::Daily,
                ..
            })
        ));

        let err = Cli::try_parse_from(["vacwatch", "notify", "--mode", "weekly"]).unwrap_err();
        assert!(err.to_string().contains("unknown report mode 'weekly'"));
    }
}
