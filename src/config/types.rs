use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            import: ImportConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Which `ListingStore` adapter the binary wires up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Mongodb,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default = "default_uri")]
    pub uri: String,
    #[serde(default = "default_database_name")]
    pub name: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub auth_source: Option<String>,
    #[serde(default = "default_server_selection_timeout")]
    pub server_selection_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Stamp `created_at`/`updated_at` on every write made through the repository.
    #[serde(default)]
    pub record_timestamps: bool,
    /// Restricted application user created by `bootstrap`.
    #[serde(default)]
    pub app_user: Option<AppUser>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            uri: default_uri(),
            name: default_database_name(),
            collection: default_collection(),
            username: None,
            password: None,
            auth_source: None,
            server_selection_timeout_secs: default_server_selection_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            record_timestamps: false,
            app_user: None,
        }
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct AppUser {
    pub username: String,
    pub password: String,
    #[serde(default = "default_app_roles")]
    pub roles: Vec<String>,
}

impl std::fmt::Debug for AppUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppUser")
            .field("username", &self.username)
            .field("password", &"****")
            .field("roles", &self.roles)
            .finish()
    }
}

/// What the importer does with a row that still violates the listing schema
/// after cleaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidRowPolicy {
    #[default]
    Skip,
    Abort,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImportConfig {
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    /// 0 imports every row.
    #[serde(default)]
    pub sample_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub keep_all_columns: bool,
    #[serde(default)]
    pub on_invalid: InvalidRowPolicy,
    #[serde(default = "default_source")]
    pub source: String,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            sample_size: 0,
            batch_size: default_batch_size(),
            keep_all_columns: false,
            on_invalid: InvalidRowPolicy::default(),
            source: default_source(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_uri() -> String {
    "mongodb://localhost:27018/".into()
}

fn default_database_name() -> String {
    "airbnb_madrid".into()
}

fn default_collection() -> String {
    "listings".into()
}

fn default_server_selection_timeout() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_app_roles() -> Vec<String> {
    vec!["readWrite".into()]
}

fn default_data_path() -> PathBuf {
    PathBuf::from("./data/raw")
}

fn default_batch_size() -> usize {
    1000
}

fn default_source() -> String {
    "csv_import".into()
}
