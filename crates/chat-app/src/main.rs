use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use parley::app::ChatApp;
use parley::settings::SettingsStore;
use tokio::io::BufReader;

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Terminal chat client with persistent sessions", long_about = None)]
struct Cli {
    /// Settings file (defaults to the platform config directory)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Keep sessions in memory for this run only
    #[arg(long)]
    ephemeral: bool,
    /// Log debug output to stderr
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let settings = match cli.config {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::load(),
    };

    let mut app = match ChatApp::build(settings, cli.ephemeral) {
        Ok(app) => app,
        Err(error) => {
            eprintln!("parley: {error}");
            return ExitCode::FAILURE;
        }
    };

    let mut stdout = std::io::stdout().lock();
    if let Err(error) = app.run(BufReader::new(tokio::io::stdin()), &mut stdout).await {
        eprintln!("parley: {error}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
