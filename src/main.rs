use clap::Parser;
use portfolio::app;
use portfolio::config::Config;

/// Portfolio backend HTTP server
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(flatten)]
    config: Config,

    /// Keep everything in memory instead of Google Drive
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    app::run(cli.config, cli.in_memory).await?;

    Ok(())
}
