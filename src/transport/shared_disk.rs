//! SHARED_DISK transport: large bodies on a shared RWX volume.
//!
//! The producer appends to `<dir>/<task_id>`, the consumer streams the file
//! to the engine, and the file is removed after the verdict regardless of
//! outcome. The filename is the task id, so concurrent tasks never collide.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::core::{ScanError, TaskMode};
use crate::transport::DataProvider;

/// Read granularity when feeding the file to the engine.
const READ_CHUNK: usize = 64 * 1024;

/// Provider backed by a file on the shared scan volume.
pub struct SharedDiskProvider {
    dir: PathBuf,
    file_name: String,
    writer: Option<File>,
    reader: Option<File>,
}

impl SharedDiskProvider {
    /// Creates a provider for `<dir>/<file_name>`.
    pub fn new(dir: PathBuf, file_name: String) -> Self {
        Self {
            dir,
            file_name,
            writer: None,
            reader: None,
        }
    }

    /// Full path of the backing file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    async fn open_writer(dir: &Path, path: &Path) -> Result<File, ScanError> {
        tokio::fs::create_dir_all(dir).await?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(file)
    }
}

#[async_trait]
impl DataProvider for SharedDiskProvider {
    fn mode(&self) -> TaskMode {
        TaskMode::Path
    }

    fn content_ref(&self) -> String {
        // The header carries only the filename; the consumer joins it with
        // its own view of the shared mount.
        self.file_name.clone()
    }

    async fn push_chunk(&mut self, chunk: &[u8]) -> Result<(), ScanError> {
        if self.writer.is_none() {
            let path = self.path();
            self.writer = Some(Self::open_writer(&self.dir, &path).await?);
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(chunk).await?;
        }
        Ok(())
    }

    async fn finalize_push(&mut self) -> Result<(), ScanError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
            writer.sync_all().await?;
        } else {
            // Zero-length body: materialize an empty file so the consumer
            // still finds something to scan.
            let path = self.path();
            Self::open_writer(&self.dir, &path).await?;
        }
        Ok(())
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ScanError> {
        if self.reader.is_none() {
            self.reader = Some(File::open(self.path()).await?);
        }
        if let Some(reader) = self.reader.as_mut() {
            let mut buf = vec![0u8; READ_CHUNK];
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            buf.truncate(n);
            return Ok(Some(buf));
        }
        Ok(None)
    }

    async fn finalize(&mut self, _success: bool, _is_virus: bool) -> Result<(), ScanError> {
        self.reader = None;
        match tokio::fs::remove_file(self.path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(provider: &mut SharedDiskProvider) -> Vec<u8> {
        let mut body = Vec::new();
        while let Some(chunk) = provider.next_chunk().await.unwrap() {
            body.extend_from_slice(&chunk);
        }
        body
    }

    #[tokio::test]
    async fn test_write_read_delete_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

        let mut writer =
            SharedDiskProvider::new(dir.path().to_path_buf(), "task-1".to_string());
        for chunk in payload.chunks(70_000) {
            writer.push_chunk(chunk).await.unwrap();
        }
        writer.finalize_push().await.unwrap();
        assert_eq!(writer.content_ref(), "task-1");

        let mut reader =
            SharedDiskProvider::new(dir.path().to_path_buf(), "task-1".to_string());
        assert_eq!(drain(&mut reader).await, payload);

        reader.finalize(true, false).await.unwrap();
        assert!(!reader.path().exists());
    }

    #[tokio::test]
    async fn test_file_removed_after_infected_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            SharedDiskProvider::new(dir.path().to_path_buf(), "task-2".to_string());
        writer.push_chunk(b"payload").await.unwrap();
        writer.finalize_push().await.unwrap();

        let mut reader =
            SharedDiskProvider::new(dir.path().to_path_buf(), "task-2".to_string());
        drain(&mut reader).await;
        reader.finalize(true, true).await.unwrap();
        assert!(!reader.path().exists());
    }

    #[tokio::test]
    async fn test_zero_length_body_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            SharedDiskProvider::new(dir.path().to_path_buf(), "task-3".to_string());
        writer.finalize_push().await.unwrap();

        let mut reader =
            SharedDiskProvider::new(dir.path().to_path_buf(), "task-3".to_string());
        assert_eq!(reader.next_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_finalize_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider =
            SharedDiskProvider::new(dir.path().to_path_buf(), "never-written".to_string());
        provider.finalize(false, false).await.unwrap();
    }
}
