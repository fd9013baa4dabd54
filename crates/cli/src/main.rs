use std::process::ExitCode;

use clap::Parser;

use queuectl_cli::{run, Cli};
use queuectl_infra::jobs::QueueError;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    queuectl_observability::init(cli.log_format);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            // Caller mistakes exit 2, store or runtime failures exit 1.
            match err.downcast_ref::<QueueError>() {
                Some(QueueError::Validation(_)) => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}
