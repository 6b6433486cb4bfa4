mod cli;
mod weights;

use clap::Parser;

use crate::cli::CLI;

fn main() {
    tracing_subscriber::fmt::init();

    let cli = CLI::parse();
    if let Err(error) = cli.run() {
        tracing::error!(error = %error, "lookahead weighting failed");
        std::process::exit(1);
    }
}
