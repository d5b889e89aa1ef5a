pub mod output;
pub mod range;

use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use output::{analysis::rank_domains, format_duration, print_shares};
use range::{process_range_command, RangeCommand};
use tracing::level_filters::LevelFilter;

use crate::{
    api::{
        facade::QueryFacade,
        messages::{SyncReply, WebsiteUsage},
    },
    config::Config,
    daemon::{args::Framing, services::TrackerServices, start_daemon},
    fs::{instance::InstanceLock, operations::write_atomic},
    utils::{
        clock::DefaultClock,
        dir::create_application_default_path,
        logging::{enable_logging, CLI_PREFIX},
        percentage::Percentage,
    },
};

#[derive(Parser, Debug)]
#[command(name = "Tabtally", version, long_about = None)]
#[command(about = "Per-domain browsing time tracker", long_about = None)]
struct Args {
    #[command(subcommand)]
    commands: Commands,
    #[arg(
        long,
        global = true,
        help = "Application directory. By default tries to save into $XDG_STATE_HOME or $HOME/.local/state"
    )]
    dir: Option<PathBuf>,
    #[arg(long, global = true, help = "Configuration file. Defaults to config.json in the application directory")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Enable logging")]
    log: bool,
}

#[derive(Subcommand, Debug)]
#[command(version, about, long_about = None)]
enum Commands {
    #[command(about = "Display time spent per domain today")]
    Today {
        #[arg(short = 'p', long = "percentage", help = "Filter domains to have at least specified percentage", default_value_t = Percentage::new_opt(1.).unwrap())]
        min_percentage: Percentage,
        #[arg(long, help = "Print the raw reply as JSON")]
        json: bool,
    },
    #[command(about = "Display time spent per domain over a range of days")]
    Range {
        #[command(flatten)]
        command: RangeCommand,
    },
    #[command(about = "Manage domains that are never tracked")]
    Exclusions {
        #[command(subcommand)]
        command: ExclusionCommand,
    },
    #[command(about = "Export recorded days as JSON")]
    Export {
        #[arg(short, long, help = "Write into a file instead of stdout")]
        output: Option<PathBuf>,
        #[arg(long = "start", help = "First day to export, as YYYY-MM-DD")]
        start_date: Option<String>,
        #[arg(long = "end", help = "Last day to export, as YYYY-MM-DD")]
        end_date: Option<String>,
    },
    #[command(about = "Remove every recorded day")]
    Reset {
        #[arg(long, help = "Confirm the removal")]
        yes: bool,
    },
    #[command(about = "Show how much space the stored data takes")]
    Storage {},
    #[command(about = "Generate a new encryption key and reseal stored data with it")]
    RotateKey {},
    #[command(about = "Push local usage and merge the usage of other devices")]
    Sync {},
    #[command(about = "Display the usage merged from every device during the last sync")]
    Synced {
        #[arg(short = 'p', long = "percentage", help = "Filter domains to have at least specified percentage", default_value_t = Percentage::new_opt(1.).unwrap())]
        min_percentage: Percentage,
    },
    #[command(
        about = "Run a daemon directly in current console. The browser normally starts it through native messaging"
    )]
    Serve {
        #[arg(long, value_enum, default_value_t = Framing::Lines)]
        framing: Framing,
    },
}

#[derive(Subcommand, Debug)]
enum ExclusionCommand {
    #[command(about = "List excluded domains")]
    List {},
    #[command(about = "Exclude a domain, its current tracking stops immediately")]
    Add { domain: String },
    #[command(about = "Stop excluding a domain")]
    Remove { domain: String },
}

impl Commands {
    /// Commands that write into the store. They may not run next to a daemon.
    fn is_mutating(&self) -> bool {
        match self {
            Commands::Exclusions { command } => !matches!(command, ExclusionCommand::List {}),
            Commands::Reset { .. } | Commands::RotateKey {} | Commands::Sync {} => true,
            _ => false,
        }
    }
}

pub async fn run_cli() -> Result<()> {
    let args = Args::parse();

    let app_dir = args.dir.map_or_else(create_application_default_path, Ok)?;
    let logging_level = if args.log {
        Some(LevelFilter::TRACE)
    } else {
        None
    };
    enable_logging(CLI_PREFIX, &app_dir.join("logs"), logging_level, args.log)?;

    let config_path = args
        .config
        .unwrap_or_else(|| Config::default_path(&app_dir));
    let config = Config::load(&config_path).await?;

    if let Commands::Serve { framing } = args.commands {
        return start_daemon(app_dir, config, framing).await;
    }

    let _instance = if args.commands.is_mutating() {
        Some(InstanceLock::try_acquire(&app_dir)?.ok_or_else(|| {
            anyhow!("The daemon is running in {app_dir:?}, close the browser extension first")
        })?)
    } else {
        None
    };

    let services = TrackerServices::open(&app_dir, config, Arc::new(DefaultClock)).await?;
    run_command(args.commands, &services.facade).await
}

async fn run_command(command: Commands, facade: &QueryFacade) -> Result<()> {
    match command {
        Commands::Today {
            min_percentage,
            json,
        } => {
            let today = facade.today_usage().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&today)?);
                return Ok(());
            }
            println!("{}", today.date.format("%x"));
            let (shares, hidden) = rank_domains(&today.websites, today.total_ms, min_percentage);
            print_shares(&shares, hidden, today.total_ms);
        }
        Commands::Range { command } => process_range_command(command, facade).await?,
        Commands::Exclusions { command } => {
            let reply = match command {
                ExclusionCommand::List {} => facade.exclusions().await?,
                ExclusionCommand::Add { domain } => facade.add_exclusion(&domain).await?,
                ExclusionCommand::Remove { domain } => facade.remove_exclusion(&domain).await?,
            };
            for domain in reply.exclusions {
                println!("{domain}");
            }
        }
        Commands::Export {
            output,
            start_date,
            end_date,
        } => {
            let export = facade
                .export(start_date.as_deref(), end_date.as_deref())
                .await?;
            let export = serde_json::to_vec_pretty(&export)?;
            match output {
                Some(path) => {
                    write_atomic(&path, &export).await?;
                    println!("Exported into {path:?}");
                }
                None => println!("{}", String::from_utf8_lossy(&export)),
            }
        }
        Commands::Reset { yes } => {
            if !yes {
                return Err(anyhow!("Every recorded day would be removed, pass --yes to confirm"));
            }
            let reply = facade.reset().await?;
            println!("Removed {} days", reply.removed_days);
        }
        Commands::Storage {} => {
            let usage = facade.storage_usage().await?;
            let suffix = if usage.estimated { " (estimated)" } else { "" };
            println!("Usage\t{} bytes", usage.usage);
            println!("Settings\t{} bytes", usage.settings);
            println!("Cache\t{} bytes", usage.cache);
            println!("Total\t{} bytes{suffix}", usage.total);
        }
        Commands::RotateKey {} => {
            let reply = facade.rotate_key().await?;
            println!(
                "Rotated {} to {}, resealed {} records, discarded {}",
                reply.previous_key, reply.new_key, reply.resealed, reply.discarded
            );
        }
        Commands::Sync {} => print_sync(&facade.sync_now().await?),
        Commands::Synced { min_percentage } => {
            let Some(merged) = facade.synced_usage().await?.merged else {
                println!("Nothing synced yet");
                return Ok(());
            };
            let websites = merged
                .usage
                .ranked_websites()
                .into_iter()
                .map(|(domain, totals)| WebsiteUsage {
                    domain: domain.to_string(),
                    time_spent: totals.total_time,
                    last_visited: totals.last_visited,
                    visit_count: totals.visit_count,
                })
                .collect::<Vec<_>>();
            let total_ms = websites.iter().map(|v| v.time_spent).sum();
            println!(
                "{} devices, merged at {}",
                merged.devices.len(),
                merged.merged_at.format("%x %H:%M")
            );
            let (shares, hidden) = rank_domains(&websites, total_ms, min_percentage);
            print_shares(&shares, hidden, total_ms);
            println!(
                "Longest session total\t{}",
                format_duration(merged.usage.total_session_time)
            );
        }
        Commands::Serve { .. } => return Err(anyhow!("serve runs before the store is opened")),
    }
    Ok(())
}

fn print_sync(reply: &SyncReply) {
    if reply.skipped {
        println!("Another sync is already running");
        return;
    }
    println!(
        "Queue: {} delivered, {} requeued, {} dropped",
        reply.delivered, reply.requeued, reply.dropped
    );
    match &reply.pushed {
        Some(id) => println!("Pushed {id}"),
        None => println!("Nothing pushed, the snapshot was queued"),
    }
    println!(
        "Merged {} devices, discarded {} unreadable documents",
        reply.devices, reply.discarded
    );
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Args, Commands, ExclusionCommand};

    #[test]
    fn test_mutating_commands() {
        let parse = |v: &[&str]| Args::try_parse_from(v).unwrap().commands;
        assert!(!parse(&["tabtally", "today"]).is_mutating());
        assert!(!parse(&["tabtally", "exclusions", "list"]).is_mutating());
        assert!(parse(&["tabtally", "exclusions", "add", "a.com"]).is_mutating());
        assert!(parse(&["tabtally", "reset", "--yes"]).is_mutating());
        assert!(parse(&["tabtally", "rotate-key"]).is_mutating());

        match parse(&["tabtally", "--dir", "/tmp/x", "exclusions", "remove", "b.com"]) {
            Commands::Exclusions {
                command: ExclusionCommand::Remove { domain },
            } => assert_eq!(domain, "b.com"),
            v => panic!("unexpected {v:?}"),
        }
    }
}
