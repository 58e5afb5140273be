//! Fingerprint markers certifying stage artifacts.
//!
//! Each artifact `x.json` may have a co-located marker `x.json.sha256`
//! holding the fingerprint of the content that produced it. The marker is
//! written only after the artifact itself is on disk, and only through
//! [`FingerprintStore`].

use std::path::{Path, PathBuf};

use tracing::debug;
use xaio_shared::{Fingerprint, Result, XaioError};

use crate::artifacts::write_atomic;

const MARKER_SUFFIX: &str = ".sha256";

/// Reads and writes fingerprint markers next to stage artifacts.
#[derive(Debug, Clone, Copy, Default)]
pub struct FingerprintStore;

impl FingerprintStore {
    pub fn new() -> Self {
        Self
    }

    /// Deterministic content hash.
    pub fn fingerprint(&self, content: &[u8]) -> Fingerprint {
        Fingerprint::of_bytes(content)
    }

    /// Marker path for an artifact: `<artifact>.sha256`.
    pub fn marker_path(&self, artifact: &Path) -> PathBuf {
        let mut name = artifact.as_os_str().to_owned();
        name.push(MARKER_SUFFIX);
        PathBuf::from(name)
    }

    /// Token stored in the artifact's marker, if readable.
    pub fn read_marker(&self, artifact: &Path) -> Option<Fingerprint> {
        let token = std::fs::read_to_string(self.marker_path(artifact)).ok()?;
        Fingerprint::from_token(&token)
    }

    /// True iff the artifact exists, its marker exists, and the marker
    /// holds `expected`.
    pub fn is_fresh(&self, artifact: &Path, expected: &Fingerprint) -> bool {
        if !artifact.is_file() {
            return false;
        }
        self.read_marker(artifact).as_ref() == Some(expected)
    }

    /// Certify `artifact` as produced from `token`. The caller must have
    /// finished writing the artifact; a missing artifact is an error and
    /// no marker is written.
    pub fn mark_fresh(&self, artifact: &Path, token: &Fingerprint) -> Result<()> {
        if !artifact.is_file() {
            return Err(XaioError::validation(format!(
                "refusing to mark missing artifact {} as fresh",
                artifact.display()
            )));
        }
        let marker = self.marker_path(artifact);
        write_atomic(&marker, token.as_str().as_bytes())?;
        debug!(marker = %marker.display(), fingerprint = %short(token), "marked fresh");
        Ok(())
    }

    /// Remove the artifact's marker so nothing certifies the artifact
    /// while it is being rewritten.
    pub fn invalidate(&self, artifact: &Path) -> Result<()> {
        let marker = self.marker_path(artifact);
        match std::fs::remove_file(&marker) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(XaioError::io(marker, e)),
        }
    }
}

/// First 12 hex chars, for log lines.
pub(crate) fn short(fp: &Fingerprint) -> &str {
    let s = fp.as_str();
    &s[..s.len().min(12)]
}
