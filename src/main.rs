use std::process::ExitCode;

use clap::Parser;

use httpcannon::{Cannon, Cli};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut cannon = match Cannon::new(config) {
        Ok(cannon) => cannon,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Ctrl-C closes the done-signal; in-flight requests drain and the
    // partial results are still reported.
    let handle = cannon.cancel_handle();
    ctrlc::set_handler(move || handle.cancel()).expect("failed to set signal handler");

    cannon.run().await;
    cannon.print_stats();

    ExitCode::SUCCESS
}
