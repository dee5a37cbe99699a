use std::path::{Path, PathBuf};

use config::{Config, File, FileFormat};
use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;

use crate::errors::Result;

/// Connection parameters for the coordinating database.
///
/// Sourced, in order of precedence, from `POSTGRES_*` environment variables
/// and an INI file at `~/.config/pdoflow/db.conf`:
///
/// ```ini
/// [pdoflow]
/// database_name = flow
/// username = flow
/// password = hunter2
/// host = db.internal
/// port = 5432
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    pub database_name: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    pdoflow: DbConfig,
}

const ENV_OVERRIDES: [(&str, &str); 5] = [
    ("POSTGRES_DB", "pdoflow.database_name"),
    ("POSTGRES_USER", "pdoflow.username"),
    ("POSTGRES_PASSWORD", "pdoflow.password"),
    ("POSTGRES_HOST", "pdoflow.host"),
    ("POSTGRES_PORT", "pdoflow.port"),
];

impl DbConfig {
    /// The well-known per-user configuration path.
    pub fn default_path() -> PathBuf {
        let config_home = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
            .unwrap_or_else(|| PathBuf::from(".config"));
        config_home.join("pdoflow").join("db.conf")
    }

    /// Loads from the default path plus environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Loads from an explicit file path plus environment overrides. The file
    /// may be absent as long as the environment supplies the required keys.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("pdoflow.host", default_host())?
            .set_default("pdoflow.port", i64::from(default_port()))?;

        if path.exists() {
            builder = builder.add_source(
                File::new(&path.to_string_lossy(), FileFormat::Ini),
            );
        }

        // Environment wins over the file.
        for (env, key) in ENV_OVERRIDES {
            if let Ok(value) = std::env::var(env) {
                builder = builder.set_override(key, value)?;
            }
        }

        let parsed: ConfigFile = builder.build()?.try_deserialize()?;
        Ok(parsed.pdoflow)
    }

    /// Renders these parameters into sqlx connect options.
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .password(&self.password)
            .database(&self.database_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_conf(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("db.conf");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    fn env_is_clean() -> bool {
        ENV_OVERRIDES
            .iter()
            .all(|(env, _)| std::env::var(env).is_err())
    }

    #[test]
    fn loads_ini_with_defaults() {
        if !env_is_clean() {
            // POSTGRES_* overrides would shadow the file under test.
            return;
        }

        let dir = std::env::temp_dir().join(format!("pdoflow-conf-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_conf(
            &dir,
            "[pdoflow]\ndatabase_name = flow\nusername = flow\npassword = secret\n",
        );

        let config = DbConfig::load_from(&path).unwrap();
        assert_eq!(config.database_name, "flow");
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 5432);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_without_env_is_an_error() {
        let path = Path::new("/nonexistent/pdoflow/db.conf");
        // POSTGRES_* not set in the test environment for the required keys.
        if std::env::var("POSTGRES_DB").is_err() {
            assert!(DbConfig::load_from(path).is_err());
        }
    }
}
