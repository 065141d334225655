//! File sources for outgoing transfers and destinations for incoming ones.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info};

use lanbeam_shared::types::FileManifestEntry;

/// Decides where a received file goes. `None` discards it.
pub trait SaveTarget: Send + Sync {
    fn destination_for(&self, file_name: &str) -> Option<PathBuf>;
}

/// Saves every received file into one directory.
#[derive(Debug, Clone)]
pub struct DirectoryTarget {
    dir: PathBuf,
}

impl DirectoryTarget {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl SaveTarget for DirectoryTarget {
    fn destination_for(&self, file_name: &str) -> Option<PathBuf> {
        // Only the final component: a peer cannot pick a directory.
        let base = Path::new(file_name).file_name()?;
        Some(self.dir.join(base))
    }
}

/// Discards every received file.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardTarget;

impl SaveTarget for DiscardTarget {
    fn destination_for(&self, _file_name: &str) -> Option<PathBuf> {
        None
    }
}

/// Write `data` to `path`, creating parent directories.
///
/// Failures are logged and reported as `false`; nothing is rolled back.
pub async fn persist(path: &Path, data: &[u8]) -> bool {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            error!(path = %path.display(), error = %e, "Failed to create destination directory");
            return false;
        }
    }

    match tokio::fs::write(path, data).await {
        Ok(()) => {
            info!(path = %path.display(), bytes = data.len(), "File saved");
            true
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to write file");
            false
        }
    }
}

/// Bytes read from the head of a file for magic-number detection.
const SNIFF_LEN: usize = 8192;

/// MIME type from magic bytes, if `infer` recognises them.
fn sniff_mime_type(head: &[u8]) -> Option<&'static str> {
    infer::get(head).map(|kind| kind.mime_type())
}

async fn read_head(path: &Path) -> std::io::Result<Vec<u8>> {
    let file = tokio::fs::File::open(path).await?;
    let mut head = Vec::with_capacity(SNIFF_LEN);
    file.take(SNIFF_LEN as u64).read_to_end(&mut head).await?;
    Ok(head)
}

/// Manifest entry for `name`: content detection first, then the extension
/// table for text and other formats without magic bytes.
fn manifest_entry(name: String, size: u64, head: &[u8]) -> FileManifestEntry {
    match sniff_mime_type(head) {
        Some(mime) => FileManifestEntry::with_mime_type(name, size, mime),
        None => FileManifestEntry::new(name, size),
    }
}

/// Where the bytes of an outgoing file come from.
#[derive(Debug, Clone)]
pub enum FileSource {
    Path(PathBuf),
    Memory(Bytes),
}

impl FileSource {
    pub async fn load(&self) -> std::io::Result<Bytes> {
        match self {
            FileSource::Path(path) => tokio::fs::read(path).await.map(Bytes::from),
            FileSource::Memory(bytes) => Ok(bytes.clone()),
        }
    }
}

/// One file queued for sending: its manifest entry and its content source.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub entry: FileManifestEntry,
    pub source: FileSource,
}

impl OutgoingFile {
    /// Describe a file on disk. Size comes from its metadata.
    pub async fn from_path(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let meta = tokio::fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        let head = match read_head(&path).await {
            Ok(head) => head,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Could not sniff file type");
                Vec::new()
            }
        };

        Ok(Self {
            entry: manifest_entry(name, meta.len(), &head),
            source: FileSource::Path(path),
        })
    }

    pub fn in_memory(name: impl Into<String>, data: Bytes) -> Self {
        let head = &data[..data.len().min(SNIFF_LEN)];
        Self {
            entry: manifest_entry(name.into(), data.len() as u64, head),
            source: FileSource::Memory(data),
        }
    }
}

/// Manifest entries in send order.
pub fn manifest(files: &[OutgoingFile]) -> Vec<FileManifestEntry> {
    files.iter().map(|f| f.entry.clone()).collect()
}
