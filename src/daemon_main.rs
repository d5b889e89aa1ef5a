// Browsers start this binary as a native messaging host. It must not open a console on windows.
#![windows_subsystem = "windows"]

use anyhow::Result;
use clap::Parser;
use tabtally::{
    config::Config,
    daemon::{args::DaemonArgs, start_daemon},
    utils::{
        dir::create_application_default_path,
        logging::{enable_logging, DAEMON_PREFIX},
        runtime::single_thread_runtime,
    },
};
use tracing::{debug, error};

fn main() -> Result<()> {
    run(DaemonArgs::parse())
}

fn run(args: DaemonArgs) -> Result<()> {
    let app_dir = args.dir.map_or_else(create_application_default_path, Ok)?;
    enable_logging(DAEMON_PREFIX, &app_dir.join("logs"), args.log, args.log_console)?;
    debug!("Started for {:?}", args.origin);

    let config_path = args
        .config
        .unwrap_or_else(|| Config::default_path(&app_dir));
    let framing = args.framing;
    single_thread_runtime()?
        .block_on(async move {
            let config = Config::load(&config_path).await?;
            start_daemon(app_dir, config, framing).await
        })
        .inspect_err(|e| error!("Daemon failed {e:?}"))
}
