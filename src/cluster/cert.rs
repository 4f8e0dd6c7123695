//! TLS material requested from the control plane.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// PEM certificate/key pair delivered by the `request-cert` RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertKeyPair {
    pub cert: String,
    pub key: String,
}

impl CertKeyPair {
    /// Write the pair under `dir` as `cert.pem` and `key.pem`, keeping the
    /// key unreadable to other users (dir 0700, files 0600).
    pub fn save_as_files(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        if !dir.exists() {
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                std::fs::DirBuilder::new().mode(0o700).create(dir)?;
            }
            #[cfg(not(unix))]
            std::fs::create_dir(dir)?;
        }
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        write_private(&cert_path, self.cert.as_bytes())?;
        write_private(&key_path, self.key.as_bytes())?;
        Ok((cert_path, key_path))
    }
}

fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    std::fs::write(path, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
