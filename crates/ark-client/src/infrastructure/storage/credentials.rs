//! Credential files (`<user>.arkpass`) in the cache directory.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use ark_core::Credential;
use tracing::{debug, warn};

use crate::application::authenticate::{CredentialVault, StoredCredential};

const EXTENSION: &str = "arkpass";

/// [`CredentialVault`] storing one JSON file per user.
///
/// The vault id of a credential is its file name.
#[derive(Debug, Clone)]
pub struct FileCredentialVault {
    dir: PathBuf,
}

impl FileCredentialVault {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path the credential for `user_id` is written to.
    pub fn path_for(&self, user_id: &str) -> PathBuf {
        let safe: String = user_id
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.{EXTENSION}"))
    }

    fn read_one(path: &Path) -> Option<(SystemTime, StoredCredential)> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable credential file");
                return None;
            }
        };
        let credential = match Credential::parse(&text) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping credential file");
                return None;
            }
        };
        let modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let id = path.file_name()?.to_string_lossy().into_owned();
        Some((modified, StoredCredential { id, credential }))
    }
}

impl CredentialVault for FileCredentialVault {
    fn store(&self, credential: &Credential) -> io::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&credential.user_id);
        std::fs::write(&path, credential.to_json())?;
        debug!(path = %path.display(), "credential written");
        Ok(path)
    }

    fn load_all(&self) -> Vec<StoredCredential> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(dir = %self.dir.display(), error = %e, "cannot list credential directory");
                }
                return Vec::new();
            }
        };

        let mut found: Vec<(SystemTime, StoredCredential)> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == EXTENSION))
            .filter_map(|p| Self::read_one(&p))
            .collect();
        found.sort_by(|a, b| b.0.cmp(&a.0));
        found.into_iter().map(|(_, c)| c).collect()
    }

    fn discard(&self, id: &str) -> io::Result<()> {
        if id.contains(|c| c == '/' || c == '\\') || id == ".." {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid credential id '{id}'"),
            ));
        }
        std::fs::remove_file(self.dir.join(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_then_load_all() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let vault = FileCredentialVault::new(dir.path());
        let mut cred = Credential::new("doctor", "k-1");
        cred.server_port = Some(9999);

        // Act
        let path = vault.store(&cred).unwrap();
        let loaded = vault.load_all();

        // Assert
        assert_eq!(path.file_name().unwrap(), "doctor.arkpass");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "doctor.arkpass");
        assert_eq!(loaded[0].credential, cred);
    }

    #[test]
    fn test_load_all_reads_legacy_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.arkpass"), "old:key-0").unwrap();
        std::fs::write(dir.path().join("broken.arkpass"), "nonsense").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "a:b").unwrap();
        let vault = FileCredentialVault::new(dir.path());

        let loaded = vault.load_all();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].credential.user_id, "old");
    }

    #[test]
    fn test_discard_removes_file_and_rejects_paths() {
        let dir = tempfile::tempdir().unwrap();
        let vault = FileCredentialVault::new(dir.path());
        vault.store(&Credential::new("doctor", "k")).unwrap();

        vault.discard("doctor.arkpass").unwrap();

        assert!(vault.load_all().is_empty());
        assert!(vault.discard("../escape.arkpass").is_err());
    }

    #[test]
    fn test_user_id_is_sanitized_for_file_name() {
        let vault = FileCredentialVault::new("/tmp/creds");

        assert_eq!(
            vault.path_for("a/b c"),
            PathBuf::from("/tmp/creds/a_b_c.arkpass")
        );
    }

    #[test]
    fn test_missing_directory_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let vault = FileCredentialVault::new(dir.path().join("absent"));

        assert!(vault.load_all().is_empty());
    }
}
