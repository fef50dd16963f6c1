//! Named-credential storage for adapter API keys and the admin token.
//!
//! Tries the OS keyring first, falling back to a mode-0600 file under the
//! config directory when no keyring backend is available (CI containers,
//! headless servers) — one named-credential store so the pipeline's
//! LLM/STT/TTS adapters and the admin token share the same storage path
//! instead of bespoke copies per secret.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

const SERVICE_NAME: &str = "voicebridge";

fn credential_file_path(name: &str) -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("dev", "voicebridge", "voicebridge")
        .context("failed to resolve project directories")?;
    let dir = base.config_dir().join("credentials");
    fs::create_dir_all(&dir).context("failed to create credentials directory")?;
    Ok(dir.join(format!("{name}.txt")))
}

fn write_file(path: &PathBuf, value: &str) -> Result<()> {
    fs::write(path, value).context("failed to write credential file")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .context("failed to set credential file permissions")?;
    }
    Ok(())
}

/// Stores `value` under `name`, trying the OS keyring first and always
/// keeping a file-backed copy as a fallback read path.
pub fn set_credential(name: &str, value: &str) -> Result<()> {
    if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, name) {
        let _ = entry.set_password(value);
    }
    write_file(&credential_file_path(name)?, value)
}

/// Reads `name`, preferring the keyring entry over the file fallback.
pub fn get_credential(name: &str) -> Result<String> {
    if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, name) {
        if let Ok(value) = entry.get_password() {
            return Ok(value);
        }
    }
    let path = credential_file_path(name)?;
    let value = fs::read_to_string(&path)
        .with_context(|| format!("credential '{name}' is not set"))?;
    Ok(value.trim().to_string())
}

pub fn delete_credential(name: &str) -> Result<()> {
    if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, name) {
        let _ = entry.delete_credential();
    }
    let path = credential_file_path(name)?;
    if path.exists() {
        fs::remove_file(&path).context("failed to delete credential file")?;
    }
    Ok(())
}

pub fn has_credential(name: &str) -> bool {
    if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, name) {
        if entry.get_password().is_ok() {
            return true;
        }
    }
    credential_file_path(name).map(|p| p.exists()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_file_path_is_stable_per_name() {
        let a = credential_file_path("llm-api-key").unwrap();
        let b = credential_file_path("llm-api-key").unwrap();
        assert_eq!(a, b);
        assert!(a.ends_with("llm-api-key.txt"));
    }
}
