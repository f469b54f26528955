use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

const SECRET_FILE: &str = "jwt_secret";

pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "kundelik").context("Could not determine home directory")?;
        Self::from_data_dir(proj_dirs.data_dir())
    }

    pub fn from_data_dir(data_dir: &Path) -> Result<Self> {
        let data_dir = data_dir.to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let db_path = data_dir.join("kundelik.db");

        Ok(Config { db_path, data_dir })
    }

    fn secret_path(&self) -> PathBuf {
        self.data_dir.join(SECRET_FILE)
    }

    /// Load the token signing secret from disk, generating one on first run.
    pub fn load_or_create_jwt_secret(&self) -> Result<String> {
        let path = self.secret_path();

        if path.exists() {
            let secret =
                std::fs::read_to_string(&path).context("Failed to read JWT secret file")?;
            let secret = secret.trim().to_string();
            if !secret.is_empty() {
                return Ok(secret);
            }
        }

        let secret = generate_secret();
        write_secret(&path, &secret)?;
        tracing::info!(path = %path.display(), "generated new JWT signing secret");
        Ok(secret)
    }

    /// Overwrite the stored secret. Every previously issued token stops verifying.
    pub fn rotate_jwt_secret(&self) -> Result<String> {
        let path = self.secret_path();
        let secret = generate_secret();
        write_secret(&path, &secret)?;
        tracing::info!(path = %path.display(), "rotated JWT signing secret");
        Ok(secret)
    }
}

/// 256 random bits, hex encoded.
fn generate_secret() -> String {
    use rand::Rng;
    use std::fmt::Write;

    let bytes: [u8; 32] = rand::rng().random();
    bytes
        .iter()
        .fold(String::with_capacity(64), |mut acc: String, b| {
            let _ = write!(acc, "{b:02x}");
            acc
        })
}

fn write_secret(path: &Path, secret: &str) -> Result<()> {
    std::fs::write(path, secret).context("Failed to write JWT secret file")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .context("Failed to set JWT secret file permissions")?;
    }
    Ok(())
}
