//! On-disk frame log
//!
//! One file per frame under `log/`, named by zero-padded hex position,
//! plus an atomically replaced `position` marker recording the last
//! durable position. Frame files are written to a temporary name and
//! renamed into place after fsync, so a crash never leaves a partial
//! frame at a live name.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use mirrorfs_core::types::TransactionFrame;
use mirrorfs_core::{Error, Result};

const LOG_DIR: &str = "log";
const MARKER_FILE: &str = "position";
const FRAME_EXT: &str = "frame";

/// Frame storage for one database
#[derive(Debug)]
pub struct FrameLog {
    dir: PathBuf,
    marker_path: PathBuf,
}

impl FrameLog {
    pub fn new(db_dir: &Path) -> Self {
        Self {
            dir: db_dir.join(LOG_DIR),
            marker_path: db_dir.join(MARKER_FILE),
        }
    }

    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    pub fn frame_path(&self, position: u64) -> PathBuf {
        self.dir.join(format!("{position:016x}.{FRAME_EXT}"))
    }

    /// Durably store an encoded frame at its position
    pub async fn append(&self, position: u64, encoded: &[u8]) -> Result<()> {
        let tmp = self.dir.join(format!("{position:016x}.tmp"));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(encoded).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, self.frame_path(position)).await?;
        Ok(())
    }

    /// Raw bytes of the frame at `position`, or `None` when not retained
    pub async fn read(&self, position: u64) -> Result<Option<Bytes>> {
        match fs::read(self.frame_path(position)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Decode and verify the frame at `position`
    pub async fn read_frame(&self, position: u64) -> Result<Option<TransactionFrame>> {
        let Some(data) = self.read(position).await? else {
            return Ok(None);
        };
        let (frame, _) = TransactionFrame::decode(&data)?;
        if frame.position != position {
            return Err(Error::InvalidFrame(format!(
                "frame file {position:016x} holds position {}",
                frame.position
            )));
        }
        Ok(Some(frame))
    }

    pub async fn remove(&self, position: u64) -> Result<()> {
        match fs::remove_file(self.frame_path(position)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically record the last durable position
    pub async fn write_marker(&self, position: u64) -> Result<()> {
        let tmp = self.marker_path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(format!("{position}\n").as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &self.marker_path).await?;
        Ok(())
    }

    pub async fn read_marker(&self) -> Result<Option<u64>> {
        let content = match fs::read_to_string(&self.marker_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let position = content
            .trim()
            .parse::<u64>()
            .map_err(|e| Error::Internal(format!("corrupt position marker: {e}")))?;
        Ok(Some(position))
    }

    /// Lowest and highest retained positions, or `None` when the log is
    /// empty
    pub async fn bounds(&self) -> Result<Option<(u64, u64)>> {
        let mut min: Option<u64> = None;
        let mut max: Option<u64> = None;
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(position) = parse_frame_name(&entry.file_name().to_string_lossy()) else {
                continue;
            };
            min = Some(min.map_or(position, |m| m.min(position)));
            max = Some(max.map_or(position, |m| m.max(position)));
        }
        Ok(min.zip(max))
    }

    /// Delete every frame below `floor`; returns the number removed
    pub async fn trim_below(&self, floor: u64) -> Result<u64> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(position) = parse_frame_name(&name) else {
                continue;
            };
            if position < floor {
                if let Err(e) = fs::remove_file(entry.path()).await {
                    warn!(frame = %name, error = %e, "failed to remove frame file");
                    continue;
                }
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Drop every retained frame and reset the marker. Used when a
    /// snapshot replaces local history.
    pub async fn reset(&self, position: u64) -> Result<()> {
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Err(e) = fs::remove_file(entry.path()).await {
                warn!(error = %e, "failed to remove frame file during reset");
            }
        }
        self.write_marker(position).await
    }
}

fn parse_frame_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(&format!(".{FRAME_EXT}"))?;
    u64::from_str_radix(stem, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorfs_core::types::FramePage;
    use tempfile::TempDir;

    async fn test_log() -> (TempDir, FrameLog) {
        let dir = TempDir::new().unwrap();
        let log = FrameLog::new(dir.path());
        log.init().await.unwrap();
        (dir, log)
    }

    fn frame(position: u64) -> TransactionFrame {
        TransactionFrame::new(
            position,
            vec![FramePage::new(0, vec![position as u8; 16])],
        )
    }

    #[tokio::test]
    async fn test_append_and_read_roundtrip() {
        let (_dir, log) = test_log().await;
        let f = frame(1);
        log.append(1, &f.encode()).await.unwrap();
        let loaded = log.read_frame(1).await.unwrap().unwrap();
        assert_eq!(loaded, f);
    }

    #[tokio::test]
    async fn test_read_missing_returns_none() {
        let (_dir, log) = test_log().await;
        assert!(log.read(42).await.unwrap().is_none());
        assert!(log.read_frame(42).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_marker_roundtrip() {
        let (_dir, log) = test_log().await;
        assert_eq!(log.read_marker().await.unwrap(), None);
        log.write_marker(7).await.unwrap();
        assert_eq!(log.read_marker().await.unwrap(), Some(7));
        log.write_marker(8).await.unwrap();
        assert_eq!(log.read_marker().await.unwrap(), Some(8));
    }

    #[tokio::test]
    async fn test_bounds_and_trim() {
        let (_dir, log) = test_log().await;
        assert_eq!(log.bounds().await.unwrap(), None);
        for pos in 1..=5 {
            log.append(pos, &frame(pos).encode()).await.unwrap();
        }
        assert_eq!(log.bounds().await.unwrap(), Some((1, 5)));

        let removed = log.trim_below(4).await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(log.bounds().await.unwrap(), Some((4, 5)));
        assert!(log.read(2).await.unwrap().is_none());
        assert!(log.read(4).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reset_clears_frames() {
        let (_dir, log) = test_log().await;
        for pos in 1..=3 {
            log.append(pos, &frame(pos).encode()).await.unwrap();
        }
        log.reset(10).await.unwrap();
        assert_eq!(log.bounds().await.unwrap(), None);
        assert_eq!(log.read_marker().await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_corrupt_frame_file_rejected() {
        let (_dir, log) = test_log().await;
        let mut encoded = frame(3).encode().to_vec();
        encoded[encoded.len() / 2] ^= 0xff;
        log.append(3, &encoded).await.unwrap();
        assert!(log.read_frame(3).await.is_err());
    }

    #[tokio::test]
    async fn test_mismatched_position_rejected() {
        let (_dir, log) = test_log().await;
        // frame carrying position 9 stored under the name for 3
        log.append(3, &frame(9).encode()).await.unwrap();
        assert!(matches!(
            log.read_frame(3).await,
            Err(Error::InvalidFrame(_))
        ));
    }
}
