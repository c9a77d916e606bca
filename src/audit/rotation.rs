//! Size-rotated append-only file.
//!
//! Layout: `audit.log` is the active segment, `audit.log.1` the newest rotated
//! one, up to `audit.log.{max_files - 1}`. The active segment counts toward
//! `max_files`, so disk use never exceeds `max_size * max_files`.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

pub struct RotatingFile {
    path: PathBuf,
    max_size: u64,
    max_files: usize,
    file: Option<File>,
    size: u64,
}

impl RotatingFile {
    pub fn new(path: impl Into<PathBuf>, max_size: u64, max_files: usize) -> Self {
        Self {
            path: path.into(),
            max_size: max_size.max(1),
            max_files: max_files.max(1),
            file: None,
            size: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of rotated segment `n` (1 = newest).
    pub fn segment_path(&self, n: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    async fn open(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            self.size = file.metadata().await?.len();
            self.file = Some(file);
        }
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(io::Error::new(io::ErrorKind::Other, "audit file unavailable")),
        }
    }

    /// Append one record, rotating first if it would overflow the active
    /// segment. Records larger than a whole segment are cut to fit, keeping
    /// a trailing newline.
    pub async fn append(&mut self, record: &[u8]) -> io::Result<()> {
        let limit = usize::try_from(self.max_size).unwrap_or(usize::MAX);
        let (body, newline) = match record.strip_suffix(b"\n") {
            Some(body) => (body, true),
            None => (record, false),
        };
        let body = &body[..body.len().min(limit - usize::from(newline))];
        let len = (body.len() + usize::from(newline)) as u64;

        self.open().await?;
        if self.size > 0 && self.size + len > self.max_size {
            self.rotate().await?;
        }
        let file = self.open().await?;
        file.write_all(body).await?;
        if newline {
            file.write_all(b"\n").await?;
        }
        self.size += len;
        Ok(())
    }

    /// Shift segments up by one, dropping the oldest, and start a fresh
    /// active segment.
    pub async fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }

        let keep = self.max_files - 1;
        if keep == 0 {
            remove_if_exists(&self.path).await?;
        } else {
            remove_if_exists(&self.segment_path(keep)).await?;
            for n in (1..keep).rev() {
                let from = self.segment_path(n);
                if fs::try_exists(&from).await? {
                    fs::rename(&from, self.segment_path(n + 1)).await?;
                }
            }
            if fs::try_exists(&self.path).await? {
                fs::rename(&self.path, self.segment_path(1)).await?;
            }
        }

        self.size = 0;
        tracing::debug!(path = %self.path.display(), "audit log rotated");
        Ok(())
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush().await?;
            file.sync_data().await?;
        }
        Ok(())
    }
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
