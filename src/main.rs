use clap::Parser;
use sitewatch::app::{self, Options, Services};
use sitewatch::peer::UreqTransport;
use sitewatch::scanner::create_backend;
use sitewatch::storage::MemoryStorage;
use std::panic::{self, PanicHookInfo};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();
}

#[tokio::main]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_logging(options.verbose);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    log::info!("Interrupt received");
                    cancel.cancel();
                }
                Err(e) => log::error!("Unable to listen for shutdown signal: {}", e),
            }
        });
    }

    let services = Services::new(
        create_backend(options.backend),
        Arc::new(MemoryStorage::new()),
        Arc::new(UreqTransport::default()),
    );

    match app::run(options, services, cancel).await {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            log::error!("{}", why);
            eprintln!("error: {}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}
