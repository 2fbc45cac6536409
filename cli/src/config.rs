use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub struct Config {
    /// Local record store.
    pub db_path: PathBuf,
    /// Document store backing `tally serve`.
    pub server_db_path: PathBuf,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "tally").context("Could not determine home directory")?;
        Self::in_dir(proj_dirs.data_dir())
    }

    pub fn in_dir(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        Ok(Config {
            db_path: data_dir.join("tally.db"),
            server_db_path: data_dir.join("server.db"),
            data_dir: data_dir.to_path_buf(),
        })
    }

    fn api_key_path(&self) -> PathBuf {
        self.data_dir.join("api_key")
    }

    /// The stored API key, if `tally serve` has generated one.
    pub fn read_api_key(&self) -> Result<Option<String>> {
        let path = self.api_key_path();
        if !path.exists() {
            return Ok(None);
        }
        let key = std::fs::read_to_string(&path).context("Failed to read API key file")?;
        let key = key.trim();
        Ok((!key.is_empty()).then(|| key.to_string()))
    }

    /// Load the API key from disk, or generate a new one.
    ///
    /// Returns `(key, newly_created)` where `newly_created` is true when a
    /// fresh key was just generated (first run).
    pub fn load_or_create_api_key(&self) -> Result<(String, bool)> {
        use rand::Rng;
        use std::fmt::Write;

        if let Some(key) = self.read_api_key()? {
            return Ok((key, false));
        }

        let path = self.api_key_path();
        let bytes: [u8; 32] = rand::rng().random();
        let key = bytes
            .iter()
            .fold(String::with_capacity(64), |mut acc: String, b| {
                let _ = write!(acc, "{b:02x}");
                acc
            });
        std::fs::write(&path, &key).context("Failed to write API key file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to set API key file permissions")?;
        }
        eprintln!("Generated new API key: {key}");
        eprintln!("Clients pick it up from the data directory or TALLY_API_KEY");
        Ok((key, true))
    }
}
