//! The `envforge` binary.

mod cli;

use clap::Parser;
use envforge::errors::EnvforgeError;
use std::process::ExitCode;
use tracing::error;

/// Exit code for invalid catalogs, manifests or settings.
const EXIT_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    envforge::logging::init(cli.log_format);

    match cli::run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            let configuration = e
                .downcast_ref::<EnvforgeError>()
                .is_some_and(EnvforgeError::is_configuration);
            error!(error = %format!("{e:#}"), "envforge failed");
            eprintln!("error: {e:#}");
            ExitCode::from(if configuration { EXIT_CONFIG } else { 1 })
        }
    }
}
