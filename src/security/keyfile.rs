//! Master key storage.
//!
//! The master key is read from an environment variable or from a key file
//! in the data directory (`~/.local/share/warden/master.key` on Linux,
//! 0600 permissions on Unix). A key file is only ever generated on explicit
//! operator request: losing it makes every value encrypted under it
//! unrecoverable, so nothing creates one implicitly.
//!
//! # Key Management
//!
//! - **Generation**: [`ensure_master_key_file`] writes 32 random bytes from
//!   the OS CSPRNG, and only when `acknowledge` is set.
//! - **Lookup order**: environment variable first, then the key file.
//! - **Permissions**: created 0600 on Unix. A key file readable by group or
//!   others is still used, with a warning.

use anyhow::{Context, Result};
use rand::RngExt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};
use zeroize::Zeroizing;

use super::encryption::{KEY_LEN, MasterKey};

/// Create the master key file if it does not exist.
///
/// Returns `true` when a new key was written. Refuses to generate a key
/// unless `acknowledge` is set.
pub fn ensure_master_key_file(path: &Path, acknowledge: bool) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if !acknowledge {
        anyhow::bail!(
            "No master key at {}. Generating one requires explicit acknowledgement \
             (`warden key init --acknowledge`): back it up, since values encrypted \
             under it cannot be recovered without it",
            path.display()
        );
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    rand::rng().fill(&mut key[..]);

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to create master key file {}", path.display()))?;
    file.write_all(&key[..])
        .context("Failed to write master key")?;
    file.sync_all().context("Failed to sync master key")?;

    info!("Generated master key at {}", path.display());
    Ok(true)
}

/// Read the master key file.
pub fn read_master_key_file(path: &Path) -> Result<MasterKey> {
    let bytes = fs::read(path)
        .with_context(|| format!("Failed to read master key {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = fs::metadata(path)
            && meta.permissions().mode() & 0o077 != 0
        {
            warn!(
                "Master key file {} is accessible by other users; run `chmod 600` on it",
                path.display()
            );
        }
    }

    MasterKey::new(bytes).with_context(|| format!("Invalid master key in {}", path.display()))
}

/// Resolve the master key: environment variable first, then the key file.
///
/// Returns `Ok(None)` when neither source provides one.
pub fn load_master_key(env_var: &str, file: Option<&Path>) -> Result<Option<MasterKey>> {
    if let Some(key) = MasterKey::from_env(env_var)
        .with_context(|| format!("Invalid master key in ${}", env_var))?
    {
        return Ok(Some(key));
    }
    match file {
        Some(path) if path.exists() => read_master_key_file(path).map(Some),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_without_acknowledgement() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("master.key");
        let err = ensure_master_key_file(&path, false).unwrap_err();
        assert!(err.to_string().contains("acknowledge"));
        assert!(!path.exists());
    }

    #[test]
    fn generates_once() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state/master.key");
        assert!(ensure_master_key_file(&path, true).unwrap());
        let first = fs::read(&path).unwrap();
        assert_eq!(first.len(), KEY_LEN);

        assert!(!ensure_master_key_file(&path, true).unwrap());
        assert_eq!(fs::read(&path).unwrap(), first);

        // Existing key needs no acknowledgement.
        assert!(!ensure_master_key_file(&path, false).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("master.key");
        ensure_master_key_file(&path, true).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn read_rejects_short_key() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("master.key");
        fs::write(&path, b"short").unwrap();
        assert!(read_master_key_file(&path).is_err());
    }

    #[test]
    fn load_falls_back_to_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("master.key");
        let var = "WARDEN_TEST_KEYFILE_UNSET_VAR";

        assert!(load_master_key(var, Some(&path)).unwrap().is_none());
        ensure_master_key_file(&path, true).unwrap();
        assert!(load_master_key(var, Some(&path)).unwrap().is_some());
        assert!(load_master_key(var, None).unwrap().is_none());
    }
}
