use clap::Parser as _;
use snafu::{ResultExt, Snafu};
use talgen::{cli::Cli, logging};

const APP_NAME: &str = "talgen";
const LOG_ENV: &str = "TALGEN_LOG";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to initialize logging"))]
    InitializeLogging { source: logging::Error },

    #[snafu(transparent)]
    Run { source: talgen::cli::Error },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    logging::initialize_logging(LOG_ENV, APP_NAME).context(InitializeLoggingSnafu)?;

    let mut stdout = std::io::stdout().lock();
    cli.run(&mut stdout).await?;
    Ok(())
}
