//! Per-connection upload state machine.
//!
//! A session is either idle or armed with the metadata of the upload whose
//! payload arrives in the next binary frame. An open destination without
//! metadata cannot be represented.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::messages::UploadMetadata;

/// Summary of the last upload a connection completed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CompletedUpload {
    /// Declared filename.
    pub filename: String,
    /// Bytes written.
    pub size: u64,
}

/// Upload failures.
#[derive(Debug, Error)]
pub enum UploadError {
    /// A payload arrived with no upload armed.
    #[error("no upload metadata received")]
    NotArmed,
    /// The filename is not a single plain path component.
    #[error("invalid upload filename {0:?}")]
    InvalidFilename(String),
    /// The destination could not be created.
    #[error("failed to open {path}: {source}")]
    Open {
        /// Destination path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Writing or flushing the payload failed.
    #[error("failed to write {path}: {source}")]
    Write {
        /// Destination path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl UploadError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotArmed => "not_armed",
            Self::InvalidFilename(_) => "invalid_filename",
            Self::Open { .. } => "open",
            Self::Write { .. } => "write",
        }
    }
}

/// Upload state for one connection.
#[derive(Debug, Default)]
pub enum UploadSession {
    /// Waiting for upload metadata.
    #[default]
    Idle,
    /// Metadata received, destination open, waiting for the payload.
    Armed {
        /// Metadata the payload belongs to.
        metadata: UploadMetadata,
        /// Open destination.
        file: File,
        /// Where `file` lives.
        path: PathBuf,
    },
}

impl UploadSession {
    /// Whether a payload is expected.
    pub fn is_armed(&self) -> bool {
        matches!(self, Self::Armed { .. })
    }

    /// Open the destination for `metadata` under `upload_dir` and arm.
    ///
    /// A previously armed destination is abandoned first. On failure the
    /// session is left idle.
    pub async fn arm(&mut self, upload_dir: &Path, metadata: UploadMetadata) -> Result<(), UploadError> {
        let _ = self.abandon();

        let path = destination(upload_dir, &metadata.filename)?;
        fs::create_dir_all(upload_dir)
            .await
            .map_err(|source| UploadError::Open {
                path: upload_dir.to_path_buf(),
                source,
            })?;
        let file = File::create(&path)
            .await
            .map_err(|source| UploadError::Open {
                path: path.clone(),
                source,
            })?;

        debug!(path = %path.display(), "upload destination opened");
        *self = Self::Armed {
            metadata,
            file,
            path,
        };
        Ok(())
    }

    /// Write `payload` to the armed destination, close it, and return to idle.
    ///
    /// The session is idle afterwards whether or not the write succeeded.
    pub async fn consume(&mut self, payload: &[u8]) -> Result<CompletedUpload, UploadError> {
        let Self::Armed {
            metadata,
            mut file,
            path,
        } = std::mem::take(self)
        else {
            return Err(UploadError::NotArmed);
        };

        let written = async {
            file.write_all(payload).await?;
            file.flush().await
        }
        .await;

        match written {
            Ok(()) => Ok(CompletedUpload {
                filename: metadata.filename,
                size: payload.len() as u64,
            }),
            Err(source) => Err(UploadError::Write { path, source }),
        }
    }

    /// Close an armed destination without finalizing it.
    ///
    /// The partial file stays on disk. Returns its path, if one was armed.
    pub fn abandon(&mut self) -> Option<PathBuf> {
        match std::mem::take(self) {
            Self::Idle => None,
            Self::Armed { path, .. } => {
                warn!(path = %path.display(), "abandoning unfinished upload");
                Some(path)
            }
        }
    }
}

/// Resolve `filename` under `upload_dir`, accepting only a single plain
/// file-name component.
fn destination(upload_dir: &Path, filename: &str) -> Result<PathBuf, UploadError> {
    let mut components = Path::new(filename).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) if name == OsStr::new(filename) => {
            Ok(upload_dir.join(name))
        }
        _ => Err(UploadError::InvalidFilename(filename.to_owned())),
    }
}
