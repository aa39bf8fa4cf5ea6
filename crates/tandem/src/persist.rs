//! Persistence of received files
//!
//! Invoked once per completed incoming transfer with the reassembled bytes
//! and the remote-supplied file name.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

/// Persistence errors
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid file name: {0}")]
    InvalidName(String),
}

/// Sink for completed transfers
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Store a completed file and return where it went
    async fn persist(&self, bytes: &[u8], filename: &str) -> Result<PathBuf, PersistError>;
}

/// Reduce a remote-supplied name to a single path component
pub fn sanitize_filename(name: &str) -> Result<String, PersistError> {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .trim_start_matches('.');
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && *c != ':')
        .collect();
    if cleaned.is_empty() {
        return Err(PersistError::InvalidName(name.to_string()));
    }
    Ok(cleaned)
}

/// Candidate name for the n-th collision: `report (1).pdf`
fn numbered(name: &str, n: u32) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{} ({}){}", &name[..dot], n, &name[dot..]),
        _ => format!("{} ({})", name, n),
    }
}

/// Writes files into a download directory, never overwriting
pub struct DirectoryPersistence {
    dir: PathBuf,
}

impl DirectoryPersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl Persistence for DirectoryPersistence {
    async fn persist(&self, bytes: &[u8], filename: &str) -> Result<PathBuf, PersistError> {
        let name = sanitize_filename(filename)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut n = 0;
        loop {
            let candidate = if n == 0 {
                name.clone()
            } else {
                numbered(&name, n)
            };
            let path = self.dir.join(&candidate);
            // create_new refuses existing files
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    use tokio::io::AsyncWriteExt;
                    file.write_all(bytes).await?;
                    file.flush().await?;
                    info!("[Persist] wrote {} bytes to {}", bytes.len(), path.display());
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Keeps completed files in memory
#[derive(Default)]
pub struct MemoryPersistence {
    files: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files persisted so far, in completion order
    pub fn files(&self) -> Vec<(String, Vec<u8>)> {
        self.files.lock().map(|f| f.clone()).unwrap_or_default()
    }

    pub fn get(&self, filename: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .ok()?
            .iter()
            .find(|(name, _)| name == filename)
            .map(|(_, bytes)| bytes.clone())
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn persist(&self, bytes: &[u8], filename: &str) -> Result<PathBuf, PersistError> {
        let name = sanitize_filename(filename)?;
        let mut files = self
            .files
            .lock()
            .map_err(|_| PersistError::Io(std::io::Error::other("store poisoned")))?;
        files.push((name.clone(), bytes.to_vec()));
        Ok(PathBuf::from(format!("memory://{}", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_strips_paths() {
        assert_eq!(sanitize_filename("report.pdf").unwrap(), "report.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\x\\a.txt").unwrap(), "a.txt");
        assert_eq!(sanitize_filename(".hidden").unwrap(), "hidden");
        assert!(sanitize_filename("../").is_err());
        assert!(sanitize_filename("").is_err());
    }

    #[test]
    fn test_numbered_names() {
        assert_eq!(numbered("report.pdf", 1), "report (1).pdf");
        assert_eq!(numbered("archive.tar.gz", 2), "archive.tar (2).gz");
        assert_eq!(numbered("README", 3), "README (3)");
    }

    #[tokio::test]
    async fn test_directory_never_overwrites() {
        let tmp = TempDir::new().unwrap();
        let persist = DirectoryPersistence::new(tmp.path().join("downloads"));

        let first = persist.persist(b"one", "report.pdf").await.unwrap();
        let second = persist.persist(b"two", "report.pdf").await.unwrap();

        assert_eq!(first.file_name().unwrap(), "report.pdf");
        assert_eq!(second.file_name().unwrap(), "report (1).pdf");
        assert_eq!(std::fs::read(&first).unwrap(), b"one");
        assert_eq!(std::fs::read(&second).unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_directory_stays_inside() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("downloads");
        let persist = DirectoryPersistence::new(&dir);

        let path = persist.persist(b"x", "../escape.txt").await.unwrap();
        assert_eq!(path.parent().unwrap(), dir.as_path());
        assert!(!tmp.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn test_memory_persistence() {
        let persist = MemoryPersistence::new();
        persist.persist(b"abc", "a.txt").await.unwrap();
        assert_eq!(persist.get("a.txt").unwrap(), b"abc");
        assert_eq!(persist.files().len(), 1);
    }
}
