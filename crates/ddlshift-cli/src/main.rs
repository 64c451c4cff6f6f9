//! ddlshift command-line client
//!
//! Plans, applies and rolls back schema migrations against a local data
//! directory.

mod commands;
mod config;
mod error;
mod formatter;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use commands::Session;
use config::Args;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn main() {
    // Logs go to stderr so command output stays parseable
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ddlshift=info,ddlshift_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let (config, command) = Args::parse().into_config();

    let result = Session::open(config).and_then(|session| {
        let stdin = std::io::stdin();
        let stdout = std::io::stdout();
        session.run(command, &mut stdin.lock(), &mut stdout.lock())
    });

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}
