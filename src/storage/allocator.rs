//! File pre-allocation and offset-mapped I/O.
//!
//! All backing files are created and truncated to their final size before the
//! first peer is dialed, so block writes are plain positional writes. Blocks
//! never overlap, which is the only thing that keeps concurrent writers safe.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::error::Error;
use crate::torrent::Metainfo;

/// One backing file with its position in the global byte space
#[derive(Debug, Clone)]
struct MappedFile {
    path: PathBuf,
    offset: u64,
    length: u64,
}

/// The pre-allocated file set, addressed by global content offset
#[derive(Debug)]
pub struct FileMap {
    files: Vec<MappedFile>,
    total_len: u64,
}

impl FileMap {
    /// Pre-create and truncate the torrent's file set under `dest_dir`.
    ///
    /// Single-file torrents get one file named after the torrent; multi-file
    /// torrents get a root directory of that name with each file at its
    /// declared sub-path.
    pub async fn allocate(meta: &Metainfo, dest_dir: &Path) -> Result<Self, Error> {
        fs::create_dir_all(dest_dir).await.map_err(|e| {
            Error::storage_full(
                "failed to create download directory",
                dest_dir.display().to_string(),
                e.to_string(),
            )
        })?;

        let mut files = Vec::new();
        let mut offset = 0u64;

        if let Some(entries) = &meta.files {
            let root = dest_dir.join(&meta.name);
            info!("allocating {} files under {}", entries.len(), root.display());
            for entry in entries {
                let mut path = root.clone();
                for part in &entry.path {
                    path.push(part);
                }
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await.map_err(|e| {
                        Error::storage_full(
                            "failed to create directory",
                            parent.display().to_string(),
                            e.to_string(),
                        )
                    })?;
                }
                create_truncate(&path, entry.length).await?;
                files.push(MappedFile {
                    path,
                    offset,
                    length: entry.length,
                });
                offset += entry.length;
            }
        } else {
            let path = dest_dir.join(&meta.name);
            let length = meta.length.unwrap_or(0);
            info!("allocating {} ({} bytes)", path.display(), length);
            create_truncate(&path, length).await?;
            files.push(MappedFile {
                path,
                offset: 0,
                length,
            });
            offset = length;
        }

        Ok(Self {
            files,
            total_len: offset,
        })
    }

    /// Total mapped length in bytes
    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    /// Write `data` at the global content offset, spanning file boundaries
    /// as needed
    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
        if offset + data.len() as u64 > self.total_len {
            return Err(Error::storage("write past end of content"));
        }
        let mut remaining = data;
        let mut position = offset;

        for file in &self.files {
            let file_end = file.offset + file.length;
            if file_end <= position {
                continue;
            }

            let in_file = position - file.offset;
            let chunk = remaining
                .len()
                .min((file.length - in_file) as usize);
            if chunk > 0 {
                debug!(
                    "writing {} bytes to {} at offset {}",
                    chunk,
                    file.path.display(),
                    in_file
                );
                let mut handle = fs::OpenOptions::new()
                    .write(true)
                    .open(&file.path)
                    .await
                    .map_err(|e| {
                        Error::storage_full(
                            "failed to open file for writing",
                            file.path.display().to_string(),
                            e.to_string(),
                        )
                    })?;
                handle
                    .seek(std::io::SeekFrom::Start(in_file))
                    .await
                    .map_err(|e| {
                        Error::storage_full(
                            "failed to seek",
                            file.path.display().to_string(),
                            e.to_string(),
                        )
                    })?;
                handle.write_all(&remaining[..chunk]).await.map_err(|e| {
                    Error::storage_full(
                        "failed to write",
                        file.path.display().to_string(),
                        e.to_string(),
                    )
                })?;
                handle.flush().await.map_err(|e| {
                    Error::storage_full(
                        "failed to flush",
                        file.path.display().to_string(),
                        e.to_string(),
                    )
                })?;

                remaining = &remaining[chunk..];
                position += chunk as u64;
            }

            if remaining.is_empty() {
                break;
            }
        }
        Ok(())
    }

    /// Read `length` bytes at the global content offset
    pub async fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>, Error> {
        if offset + length as u64 > self.total_len {
            return Err(Error::storage("read past end of content"));
        }
        let mut buffer = Vec::with_capacity(length);
        let mut remaining = length;
        let mut position = offset;

        for file in &self.files {
            let file_end = file.offset + file.length;
            if file_end <= position {
                continue;
            }

            let in_file = position - file.offset;
            let chunk = remaining.min((file.length - in_file) as usize);
            if chunk > 0 {
                let mut handle = fs::File::open(&file.path).await.map_err(|e| {
                    Error::storage_full(
                        "failed to open file for reading",
                        file.path.display().to_string(),
                        e.to_string(),
                    )
                })?;
                handle
                    .seek(std::io::SeekFrom::Start(in_file))
                    .await
                    .map_err(|e| {
                        Error::storage_full(
                            "failed to seek",
                            file.path.display().to_string(),
                            e.to_string(),
                        )
                    })?;
                let mut part = vec![0u8; chunk];
                handle.read_exact(&mut part).await.map_err(|e| {
                    Error::storage_full(
                        "failed to read",
                        file.path.display().to_string(),
                        e.to_string(),
                    )
                })?;
                buffer.extend_from_slice(&part);

                remaining -= chunk;
                position += chunk as u64;
            }

            if remaining == 0 {
                break;
            }
        }
        Ok(buffer)
    }
}

async fn create_truncate(path: &Path, length: u64) -> Result<(), Error> {
    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .open(path)
        .await
        .map_err(|e| {
            Error::storage_full(
                "failed to create file",
                path.display().to_string(),
                e.to_string(),
            )
        })?;
    file.set_len(length).await.map_err(|e| {
        Error::storage_full(
            "failed to truncate file",
            path.display().to_string(),
            e.to_string(),
        )
    })?;
    file.sync_all().await.map_err(|e| {
        Error::storage_full(
            "failed to sync file",
            path.display().to_string(),
            e.to_string(),
        )
    })?;
    Ok(())
}
