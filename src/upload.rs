//! Raw email uploads: validation of the multipart form, ownership of the
//! temporary files and the status-partitioned archive.

use crate::error::{GatekeeperError, Result};
use std::path::{Path, PathBuf};

/// A file the host's multipart parser already wrote to disk.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub content_type: String,
    pub files: Vec<UploadedFile>,
    /// Browser without JavaScript: answer with a redirect instead of JSON.
    pub noscript: bool,
}

/// Owns a temporary upload and deletes it when dropped, on every exit path.
#[derive(Debug)]
pub struct TempUpload {
    file: UploadedFile,
}

impl TempUpload {
    pub fn new(file: UploadedFile) -> Self {
        Self { file }
    }

    pub fn path(&self) -> &Path {
        &self.file.path
    }

    pub fn size(&self) -> u64 {
        self.file.size
    }

    pub async fn read(&self) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(&self.file.path).await?)
    }
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.file.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!(
                    "Failed to delete temp upload {}: {e}",
                    self.file.path.display()
                );
            }
        }
    }
}

impl UploadRequest {
    /// Check the form before any verification work. All temp files are taken
    /// over immediately so rejected uploads are cleaned up too.
    pub fn into_single_file(self) -> Result<TempUpload> {
        let mut uploads: Vec<TempUpload> = self.files.into_iter().map(TempUpload::new).collect();
        if !self.content_type.starts_with("multipart/form-data") {
            return Err(GatekeeperError::conflict(
                403,
                format!("Invalid HTTP header \"Content-Type: {}\"", self.content_type),
            ));
        }
        if uploads.len() > 1 {
            return Err(GatekeeperError::conflict(
                403,
                "Multiple files are not accepted",
            ));
        }
        let upload = uploads
            .pop()
            .ok_or_else(|| GatekeeperError::Validation("No file received".to_string()))?;
        if upload.size() == 0 {
            return Err(GatekeeperError::Validation("Empty file received".to_string()));
        }
        Ok(upload)
    }
}

/// Raw emails that passed DKIM verification, stored as
/// `<dir>/<status>/<uuid>`.
#[derive(Debug, Clone)]
pub struct RawEmailArchive {
    dir: PathBuf,
}

impl RawEmailArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, uuid: &str, status: &str) -> PathBuf {
        self.dir.join(status).join(uuid)
    }

    pub async fn save(&self, uuid: &str, status: &str, raw_email: &[u8]) -> Result<PathBuf> {
        let path = self.path_for(uuid, status);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, raw_email).await?;
        log::debug!("Saved raw email to {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(dir: &Path, name: &str, content: &[u8]) -> UploadedFile {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content).unwrap();
        UploadedFile {
            path,
            size: content.len() as u64,
        }
    }

    #[test]
    fn test_single_file_accepted_and_deleted_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let file = temp_file(dir.path(), "a.eml", b"From: a\r\n\r\n");
        let path = file.path.clone();
        let request = UploadRequest {
            content_type: "multipart/form-data; boundary=x".into(),
            files: vec![file],
            noscript: false,
        };
        let upload = request.into_single_file().unwrap();
        assert!(path.exists());
        drop(upload);
        assert!(!path.exists());
    }

    #[test]
    fn test_multiple_files_rejected_and_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let a = temp_file(dir.path(), "a.eml", b"x");
        let b = temp_file(dir.path(), "b.eml", b"y");
        let paths = [a.path.clone(), b.path.clone()];
        let err = UploadRequest {
            content_type: "multipart/form-data".into(),
            files: vec![a, b],
            noscript: false,
        }
        .into_single_file()
        .unwrap_err();
        assert_eq!(err.status_code(), 403);
        assert!(paths.iter().all(|p| !p.exists()));
    }

    #[test]
    fn test_empty_file_and_bad_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let empty = temp_file(dir.path(), "e.eml", b"");
        let err = UploadRequest {
            content_type: "multipart/form-data".into(),
            files: vec![empty],
            noscript: false,
        }
        .into_single_file()
        .unwrap_err();
        assert_eq!(err.to_string(), "Empty file received");

        let file = temp_file(dir.path(), "f.eml", b"x");
        let err = UploadRequest {
            content_type: "application/json".into(),
            files: vec![file],
            noscript: false,
        }
        .into_single_file()
        .unwrap_err();
        assert_eq!(err.status_code(), 403);

        let err = UploadRequest {
            content_type: "multipart/form-data".into(),
            files: vec![],
            noscript: false,
        }
        .into_single_file()
        .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_archive_partitions_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let archive = RawEmailArchive::new(dir.path());
        let path = archive.save("u-1", "success", b"raw").await.unwrap();
        assert_eq!(path, dir.path().join("success").join("u-1"));
        assert_eq!(std::fs::read(path).unwrap(), b"raw");
    }
}
