//! # Credential Handling
//!
//! Repository passphrases and provider configs are stored encrypted; the
//! implementation of the symmetric cipher lives outside the core and is
//! injected through [`Encryptor`]. Decrypted material is held in
//! task-local, zeroizing containers and scrubbed on every exit path: the
//! passphrase in a `SecretString`, key material in a 0600 temp file that is
//! removed when the guard drops.

use std::io::Write;
use std::path::Path;

use secrecy::{ExposeSecret, SecretString};
use tempfile::NamedTempFile;
use zeroize::Zeroize;

use crate::errors::{BorgitoryError, BorgitoryResult};
use crate::models::RepositoryRow;

/// Symmetric decryption seam. The concrete cipher is owned by the
/// configuration subsystem; tests inject [`PassthroughEncryptor`].
pub trait Encryptor: Send + Sync + std::fmt::Debug {
    fn decrypt(&self, blob: &[u8]) -> BorgitoryResult<Vec<u8>>;
}

/// Identity "cipher" for tests and development databases that store
/// plaintext blobs.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughEncryptor;

impl Encryptor for PassthroughEncryptor {
    fn decrypt(&self, blob: &[u8]) -> BorgitoryResult<Vec<u8>> {
        Ok(blob.to_vec())
    }
}

/// A secret materialized on disk with 0600 permissions, deleted on drop
#[derive(Debug)]
pub struct SecretFile {
    file: NamedTempFile,
}

impl SecretFile {
    /// Write `content` into a fresh 0600 temp file under `dir`. The buffer
    /// is zeroized before this returns.
    pub fn create(dir: &Path, mut content: Vec<u8>) -> BorgitoryResult<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(".borgitory-key-");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            builder.permissions(std::fs::Permissions::from_mode(0o600));
        }
        let mut file = builder
            .tempfile_in(dir)
            .map_err(BorgitoryError::Io)?;
        let result = file.write_all(&content).and_then(|_| file.flush());
        content.zeroize();
        result.map_err(BorgitoryError::Io)?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Decrypted repository credentials, valid for one task execution
#[derive(Debug)]
pub struct RepositoryCredentials {
    pub repository_path: String,
    pub passphrase: SecretString,
    pub keyfile: Option<SecretFile>,
}

impl RepositoryCredentials {
    /// Decrypt the repository's secrets into task-local memory. Key
    /// material, when present, lands in a 0600 temp file under `temp_dir`.
    pub fn decrypt(
        row: &RepositoryRow,
        encryptor: &dyn Encryptor,
        temp_dir: &Path,
    ) -> BorgitoryResult<Self> {
        let passphrase_bytes = encryptor.decrypt(&row.enc_passphrase)?;
        let passphrase = String::from_utf8(passphrase_bytes)
            .map_err(|_| BorgitoryError::Encryption("passphrase is not valid UTF-8".into()))?;

        let keyfile = match &row.enc_keyfile {
            Some(blob) => Some(SecretFile::create(temp_dir, encryptor.decrypt(blob)?)?),
            None => None,
        };

        Ok(Self {
            repository_path: row.path.clone(),
            passphrase: SecretString::from(passphrase),
            keyfile,
        })
    }

    /// Environment variables the external tool expects. The passphrase goes
    /// in `BORG_PASSPHRASE`; a decrypted keyfile path, when present, in
    /// `BORG_KEY_FILE`.
    pub fn child_env(&self) -> Vec<(String, String)> {
        let mut env = vec![(
            "BORG_PASSPHRASE".to_string(),
            self.passphrase.expose_secret().to_string(),
        )];
        if let Some(keyfile) = &self.keyfile {
            env.push((
                "BORG_KEY_FILE".to_string(),
                keyfile.path().display().to_string(),
            ));
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repository_row(keyfile: Option<Vec<u8>>) -> RepositoryRow {
        RepositoryRow {
            id: 1,
            name: "test".to_string(),
            path: "/repos/test".to_string(),
            enc_passphrase: b"hunter2".to_vec(),
            enc_keyfile: keyfile,
        }
    }

    #[test]
    fn test_decrypt_passphrase_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let creds = RepositoryCredentials::decrypt(
            &repository_row(None),
            &PassthroughEncryptor,
            dir.path(),
        )
        .expect("decrypt");

        let env = creds.child_env();
        assert_eq!(env.len(), 1);
        assert_eq!(env[0], ("BORG_PASSPHRASE".to_string(), "hunter2".to_string()));
    }

    #[test]
    fn test_keyfile_is_0600_and_removed_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let creds = RepositoryCredentials::decrypt(
            &repository_row(Some(b"key material".to_vec())),
            &PassthroughEncryptor,
            dir.path(),
        )
        .expect("decrypt");

        let path = creds.keyfile.as_ref().expect("keyfile").path().to_path_buf();
        assert!(path.exists());
        assert_eq!(
            std::fs::read(&path).expect("readable"),
            b"key material".to_vec()
        );
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).expect("meta").permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        drop(creds);
        assert!(!path.exists());
    }
}
