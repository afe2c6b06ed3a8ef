use clap::{Parser, Subcommand};
use log::{error, info, warn};
use portfolio::config::Config;
use portfolio::google::{GoogleDrive, http_client};
use portfolio::layout::PortfolioStore;
use portfolio::loader::load_portfolio_file;
use portfolio::portfolio::{sanitize_export_name, standard_filename};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Maintenance jobs for portfolio storage
#[derive(Parser, Debug)]
#[command(name = "portfolio-maint", version, about)]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Remove old temporary files (default)
    Cleanup,
    /// Check storage usage
    Monitor,
    /// Check storage usage, then clean up
    Both,
    /// List the temporary files cleanup would remove
    DryRun,
    /// Print a portfolio file in the current document shape
    Normalize { file: PathBuf },
    /// Give an account write access to a storage folder
    Share {
        /// Account to grant, usually the service account
        email: String,
        /// Folder to share; defaults to DRIVE_PARENT_FOLDER_ID
        #[arg(long)]
        folder: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("[Main] Maintenance failed: {}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = cli.config;
    let drive = GoogleDrive::service_account(http_client()?, config.drive_access_token.clone());
    let store = PortfolioStore::new(Arc::new(drive), config.layout());
    let max_age = config.cleanup_max_age();

    let code = match cli.command.unwrap_or(Command::Cleanup) {
        Command::Cleanup => exit_code(store.cleanup_old_temp_files(max_age, false).await?.errors.len()),
        Command::Monitor => {
            store.check_storage_usage().await?;
            ExitCode::SUCCESS
        }
        Command::Both => {
            store.check_storage_usage().await?;
            exit_code(store.cleanup_old_temp_files(max_age, false).await?.errors.len())
        }
        Command::DryRun => {
            let report = store.cleanup_old_temp_files(max_age, true).await?;
            for name in &report.candidates {
                println!("{}", name);
            }
            ExitCode::SUCCESS
        }
        Command::Normalize { file } => {
            let portfolio = load_portfolio_file(&file)?;
            let stem = file.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            let export = standard_filename(&portfolio.personal_info, &sanitize_export_name(stem));
            info!("[Normalize] Standard export name: {}", export);
            for reflection in portfolio.dangling_links() {
                warn!(
                    "[Normalize] Reflection {} links to missing achievement {}",
                    reflection.id,
                    reflection.linked_achievement.as_deref().unwrap_or_default()
                );
            }
            println!("{}", serde_json::to_string_pretty(&portfolio)?);
            ExitCode::SUCCESS
        }
        Command::Share { email, folder } => {
            let folder = folder.unwrap_or_else(|| config.drive_parent_folder_id.clone());
            if folder.is_empty() {
                return Err("no folder given and DRIVE_PARENT_FOLDER_ID is not set".into());
            }
            let report = store.share_folder(&folder, &email).await?;
            println!("Shared \"{}\" ({}) with {}", report.folder_name, report.folder_id, email);
            ExitCode::SUCCESS
        }
    };
    Ok(code)
}

fn exit_code(errors: usize) -> ExitCode {
    if errors > 0 { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}
