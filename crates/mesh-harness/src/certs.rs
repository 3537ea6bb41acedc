//! Key and certificate material for TLS meshes.
//!
//! Each test case gets its own `certs-XXXXXX` directory under the harness
//! base dir, so parallel tests never overwrite each other's keys. The
//! directory is read-only once the mesh starts and is removed on drop.
//! Generation shells out to `openssl`.

use crate::error::{HarnessError, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::debug;

/// Validity of generated certificates.
const CERT_DAYS: &str = "2";
/// Subject alternative names every generated certificate carries.
const LOOPBACK_SAN: &str = "subjectAltName=DNS:localhost,IP:127.0.0.1";

/// Paths of a generated key/certificate pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPair {
    pub key: PathBuf,
    pub cert: PathBuf,
}

impl CertPair {
    /// Key path as a string, for embedding into node fragments.
    pub fn key_str(&self) -> String {
        self.key.to_string_lossy().into_owned()
    }

    /// Certificate path as a string, for embedding into node fragments.
    pub fn cert_str(&self) -> String {
        self.cert.to_string_lossy().into_owned()
    }
}

/// Scoped directory of generated TLS material.
#[derive(Debug)]
pub struct CertStore {
    dir: TempDir,
}

impl CertStore {
    /// Allocate a fresh, uniquely named directory under `base`.
    pub fn new(base: &Path) -> Result<Self> {
        std::fs::create_dir_all(base)?;
        let dir = tempfile::Builder::new().prefix("certs-").tempdir_in(base)?;
        debug!(dir = %dir.path().display(), "Allocated certificate directory");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Self-signed certificate (usable as a CA) for `name`.
    pub async fn generate_cert(&self, name: &str) -> Result<CertPair> {
        let pair = self.pair_for(name)?;
        openssl(&[
            "req",
            "-x509",
            "-newkey",
            "rsa:2048",
            "-nodes",
            "-days",
            CERT_DAYS,
            "-subj",
            &format!("/CN={name}"),
            "-addext",
            LOOPBACK_SAN,
            "-keyout",
            &pair.key_str(),
            "-out",
            &pair.cert_str(),
        ])
        .await?;
        Ok(pair)
    }

    /// Certificate for `name` signed by `ca`.
    pub async fn generate_cert_with_ca(&self, name: &str, ca: &CertPair) -> Result<CertPair> {
        let pair = self.pair_for(name)?;
        let csr = self.path().join(format!("{name}.csr"));
        let ext = self.path().join(format!("{name}.ext"));
        tokio::fs::write(&ext, format!("{LOOPBACK_SAN}\n")).await?;

        openssl(&[
            "req",
            "-new",
            "-newkey",
            "rsa:2048",
            "-nodes",
            "-subj",
            &format!("/CN={name}"),
            "-keyout",
            &pair.key_str(),
            "-out",
            &csr.to_string_lossy(),
        ])
        .await?;
        openssl(&[
            "x509",
            "-req",
            "-in",
            &csr.to_string_lossy(),
            "-CA",
            &ca.cert_str(),
            "-CAkey",
            &ca.key_str(),
            "-CAcreateserial",
            "-days",
            CERT_DAYS,
            "-extfile",
            &ext.to_string_lossy(),
            "-out",
            &pair.cert_str(),
        ])
        .await?;
        Ok(pair)
    }

    fn pair_for(&self, name: &str) -> Result<CertPair> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(HarnessError::Certificate(format!(
                "invalid certificate name {name:?}"
            )));
        }
        Ok(CertPair {
            key: self.path().join(format!("{name}.key")),
            cert: self.path().join(format!("{name}.crt")),
        })
    }
}

async fn openssl(args: &[&str]) -> Result<()> {
    let output = Command::new("openssl")
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| HarnessError::Certificate(format!("cannot run openssl: {e}")))?;
    if !output.status.success() {
        return Err(HarnessError::Certificate(format!(
            "openssl {} failed ({}): {}",
            args.first().copied().unwrap_or_default(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
