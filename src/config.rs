use crate::layout::StorageLayout;
use chrono::Duration;
use clap::Args;
use log::warn;

/// Settings shared by the server and the maintenance tool
///
/// Every option can be passed as a flag or through the environment.
#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Port the HTTP server listens on
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// OAuth client id that ID tokens must be issued for
    #[arg(long, env = "GOOGLE_CLIENT_ID", default_value = "")]
    pub google_client_id: String,

    /// Browser origin allowed by CORS
    #[arg(long, env = "ORIGIN", default_value = "")]
    pub origin: String,

    /// Account with access to the admin endpoints
    #[arg(long, env = "ADMIN_EMAIL", default_value = "")]
    pub admin_email: String,

    /// Folder that holds final storage and legacy exports
    #[arg(long, env = "DRIVE_PARENT_FOLDER_ID", default_value = "")]
    pub drive_parent_folder_id: String,

    #[arg(long, env = "TEMP_FOLDER_NAME", default_value = "portfolio-temp-storage")]
    pub temp_folder_name: String,

    #[arg(long, env = "FINAL_FOLDER_NAME", default_value = "student-portfolios")]
    pub final_folder_name: String,

    /// Temporary files older than this are removed by cleanup
    #[arg(long, env = "CLEANUP_MAX_AGE_HOURS", default_value_t = 24)]
    pub cleanup_max_age_hours: i64,

    /// Fixed storage access token; the metadata server is used when unset
    #[arg(long, env = "DRIVE_ACCESS_TOKEN", hide_env_values = true)]
    pub drive_access_token: Option<String>,
}

impl Config {
    /// Folder naming for the storage backend
    pub fn layout(&self) -> StorageLayout {
        StorageLayout {
            parent_folder_id: non_empty(&self.drive_parent_folder_id),
            temp_folder_name: self.temp_folder_name.clone(),
            final_folder_name: self.final_folder_name.clone(),
        }
    }

    pub fn admin_email(&self) -> String {
        self.admin_email.trim().to_lowercase()
    }

    pub fn cleanup_max_age(&self) -> Duration {
        Duration::hours(self.cleanup_max_age_hours.max(0))
    }

    /// Log every setting the service can start without but should not
    pub fn warn_missing(&self) {
        for (name, value) in [
            ("GOOGLE_CLIENT_ID", &self.google_client_id),
            ("ORIGIN", &self.origin),
            ("DRIVE_PARENT_FOLDER_ID", &self.drive_parent_folder_id),
            ("ADMIN_EMAIL", &self.admin_email),
        ] {
            if value.trim().is_empty() {
                warn!("[config] {} is not set", name);
            }
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            google_client_id: String::new(),
            origin: String::new(),
            admin_email: String::new(),
            drive_parent_folder_id: String::new(),
            temp_folder_name: "portfolio-temp-storage".to_string(),
            final_folder_name: "student-portfolios".to_string(),
            cleanup_max_age_hours: 24,
            drive_access_token: None,
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        config: Config,
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "portfolio",
            "--port",
            "9000",
            "--admin-email",
            " Admin@Example.com ",
            "--drive-parent-folder-id",
            "parent-1",
            "--cleanup-max-age-hours",
            "6",
        ]);
        assert_eq!(cli.config.port, 9000);
        assert_eq!(cli.config.admin_email(), "admin@example.com");
        assert_eq!(cli.config.cleanup_max_age(), Duration::hours(6));

        let layout = cli.config.layout();
        assert_eq!(layout.parent_folder_id.as_deref(), Some("parent-1"));
        assert_eq!(layout.final_folder_name, "student-portfolios");
    }

    #[test]
    fn blank_parent_means_root() {
        let config = Config::default();
        assert_eq!(config.layout().parent_folder_id, None);
        assert_eq!(config.layout().temp_folder_name, "portfolio-temp-storage");
    }
}
