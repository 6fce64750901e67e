use std::path::{Path, PathBuf};

use serde::Serialize;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Success,
    Error,
}

/// A file queued for upload and its progress.
#[derive(Serialize, Debug, Clone)]
pub struct UploadTask {
    source: PathBuf,
    size: u64,
    transferred: u64,
    status: UploadStatus,
    error: Option<String>,
}

impl UploadTask {
    pub fn new(source: impl Into<PathBuf>, size: u64) -> Self {
        UploadTask {
            source: source.into(),
            size,
            transferred: 0,
            status: UploadStatus::Pending,
            error: None,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// The name the file is uploaded under.
    pub fn file_name(&self) -> String {
        self.source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn status(&self) -> UploadStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Percentage of bytes sent, 100 for empty files once done.
    pub fn percent(&self) -> u8 {
        if self.size == 0 {
            return if self.status == UploadStatus::Success { 100 } else { 0 };
        }
        ((self.transferred.min(self.size) * 100) / self.size) as u8
    }

    pub fn start(&mut self) {
        if self.status == UploadStatus::Pending {
            self.status = UploadStatus::Uploading;
        }
    }

    /// Record `bytes` more bytes sent. Ignored unless uploading.
    pub fn advance(&mut self, bytes: u64) {
        if self.status == UploadStatus::Uploading {
            self.transferred = self.transferred.saturating_add(bytes).min(self.size);
        }
    }

    pub fn succeed(&mut self) {
        if self.status == UploadStatus::Uploading {
            self.transferred = self.size;
            self.status = UploadStatus::Success;
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        if matches!(self.status, UploadStatus::Pending | UploadStatus::Uploading) {
            self.status = UploadStatus::Error;
            self.error = Some(reason.into());
        }
    }
}
