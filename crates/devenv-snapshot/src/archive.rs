//! Snapshot archives
//!
//! An archive is a plain tar whose entry names are object keys relative to
//! the Velero bucket, plus an optional post-restore manifest template at
//! [`POST_RESTORE_KEY`]. Tar encoding and decoding run on a blocking thread
//! fed through a bounded channel, so the async side only moves bytes
//! between the object store and that thread.

use std::io::{Read, Write};
use std::path::Path;

use bytes::Bytes;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tracing::{debug, info};

use devenv_common::{Error, Result};

use crate::digest::HashingWriter;
use crate::store::ObjectStore;

/// Archive entry holding the post-restore manifest template
pub const POST_RESTORE_KEY: &str = "post-restore/manifests.yaml";

/// Entries in flight between the async side and the tar thread
const ENTRY_BUFFER: usize = 8;

/// Mode recorded for every archived object
const ENTRY_MODE: u32 = 0o755;

struct Entry {
    name: String,
    data: Bytes,
}

/// A finished archive on local disk
#[derive(Debug)]
pub struct Archive {
    /// Temporary file holding the tar; removed on drop
    pub file: NamedTempFile,
    /// Base64 MD5 of the file contents
    pub digest: String,
    /// Size in bytes
    pub size: u64,
}

impl Archive {
    /// Path of the archive on disk
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

fn join_error(context: &str, e: tokio::task::JoinError) -> Error {
    Error::internal_with_context(context, format!("archive task failed: {}", e))
}

fn write_entries(file: std::fs::File, mut rx: mpsc::Receiver<Entry>) -> Result<String> {
    let mut builder = tar::Builder::new(HashingWriter::new(file));
    let mtime = chrono::Utc::now().timestamp().max(0) as u64;

    while let Some(entry) = rx.blocking_recv() {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(entry.data.len() as u64);
        header.set_mode(ENTRY_MODE);
        header.set_mtime(mtime);
        builder.append_data(&mut header, &entry.name, entry.data.as_ref())?;
    }

    let (mut file, digest) = builder.into_inner()?.finish();
    file.flush()?;
    Ok(digest)
}

/// Archive every object in `source`, plus the post-restore template if given.
///
/// The digest is computed over the exact byte stream written to disk.
pub async fn build_archive(source: &dyn ObjectStore, post_restore: Option<&Path>) -> Result<Archive> {
    let tmp = tempfile::Builder::new()
        .prefix("devenv-snapshot-")
        .suffix(".tar")
        .tempfile()?;
    let file = tmp.reopen()?;

    let (tx, rx) = mpsc::channel(ENTRY_BUFFER);
    let writer = tokio::task::spawn_blocking(move || write_entries(file, rx));

    let produced: Result<usize> = async {
        let mut count = 0;
        for obj in source.list("").await? {
            if obj.key.is_empty() {
                continue;
            }
            let data = source.get(&obj.key).await?;
            debug!(key = %obj.key, size = data.len(), "Archiving object");
            tx.send(Entry {
                name: obj.key,
                data,
            })
            .await
            .map_err(|_| Error::internal_with_context("build_archive", "archive writer stopped"))?;
            count += 1;
        }

        if let Some(path) = post_restore {
            let data = Bytes::from(tokio::fs::read(path).await?);
            tx.send(Entry {
                name: POST_RESTORE_KEY.to_string(),
                data,
            })
            .await
            .map_err(|_| Error::internal_with_context("build_archive", "archive writer stopped"))?;
        }
        Ok(count)
    }
    .await;
    drop(tx);

    let written = writer.await.map_err(|e| join_error("build_archive", e))?;
    let count = produced?;
    let digest = written?;
    let size = tokio::fs::metadata(tmp.path()).await?.len();

    info!(objects = count, size, digest = %digest, "Created snapshot archive");
    Ok(Archive {
        file: tmp,
        digest,
        size,
    })
}

fn read_entries(path: &Path, tx: mpsc::Sender<Entry>) -> Result<()> {
    let file = std::fs::File::open(path)?;
    let mut archive = tar::Archive::new(file);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let kind = entry.header().entry_type();
        if kind.is_dir() || !kind.is_file() {
            continue;
        }

        let name = entry
            .path()?
            .to_string_lossy()
            .trim_start_matches("./")
            .to_string();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;

        if tx
            .blocking_send(Entry {
                name,
                data: Bytes::from(data),
            })
            .is_err()
        {
            // Consumer failed and stopped listening
            break;
        }
    }
    Ok(())
}

/// Write every regular file in the archive at `path` into `dest`.
///
/// Directory entries are skipped and a leading `./` is trimmed from entry
/// names. Returns the keys written, in archive order.
pub async fn extract_archive(path: &Path, dest: &dyn ObjectStore) -> Result<Vec<String>> {
    let (tx, mut rx) = mpsc::channel(ENTRY_BUFFER);
    let archive_path = path.to_path_buf();
    let reader = tokio::task::spawn_blocking(move || read_entries(&archive_path, tx));

    let consumed: Result<Vec<String>> = async {
        let mut keys = Vec::new();
        while let Some(entry) = rx.recv().await {
            debug!(key = %entry.name, size = entry.data.len(), "Extracting object");
            dest.put(&entry.name, entry.data).await?;
            keys.push(entry.name);
        }
        Ok(keys)
    }
    .await;
    drop(rx);

    let read = reader.await.map_err(|e| join_error("extract_archive", e))?;
    let keys = consumed?;
    read?;
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::content_md5;
    use crate::store::MemoryStore;

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new("velero");
        store
            .put("backups/snap/velero-backup.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        store
            .put("restic/devenv/data", Bytes::from_static(b"volume bytes"))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_digest_covers_archive_file() {
        let source = seeded().await;
        let archive = build_archive(&source, None).await.unwrap();

        let bytes = std::fs::read(archive.path()).unwrap();
        assert_eq!(archive.digest, content_md5(&bytes));
        assert_eq!(archive.size, bytes.len() as u64);
    }

    #[tokio::test]
    async fn test_archive_then_extract_preserves_objects() {
        let source = seeded().await;
        let template = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(template.path(), "kind: ConfigMap\n").unwrap();

        let archive = build_archive(&source, Some(template.path())).await.unwrap();

        let dest = MemoryStore::new("velero-restore");
        let keys = extract_archive(archive.path(), &dest).await.unwrap();
        assert_eq!(keys.len(), 3);

        let contents = dest.contents().unwrap();
        assert_eq!(
            contents["restic/devenv/data"],
            Bytes::from_static(b"volume bytes")
        );
        assert_eq!(
            contents[POST_RESTORE_KEY],
            Bytes::from_static(b"kind: ConfigMap\n")
        );
    }

    #[tokio::test]
    async fn test_extract_skips_directories_and_trims_prefix() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        {
            let mut builder = tar::Builder::new(tmp.reopen().unwrap());
            let mut dir = tar::Header::new_gnu();
            dir.set_entry_type(tar::EntryType::Directory);
            dir.set_size(0);
            dir.set_mode(0o755);
            builder.append_data(&mut dir, "./backups/", &[][..]).unwrap();

            let mut file = tar::Header::new_gnu();
            file.set_size(3);
            file.set_mode(0o644);
            builder
                .append_data(&mut file, "./backups/a.json", &b"abc"[..])
                .unwrap();
            builder.finish().unwrap();
        }

        let dest = MemoryStore::new("velero-restore");
        let keys = extract_archive(tmp.path(), &dest).await.unwrap();
        assert_eq!(keys, vec!["backups/a.json".to_string()]);
    }

    #[tokio::test]
    async fn test_extract_rejects_garbage() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), vec![0xffu8; 1024]).unwrap();
        let dest = MemoryStore::new("velero-restore");
        assert!(extract_archive(tmp.path(), &dest).await.is_err());
    }
}
