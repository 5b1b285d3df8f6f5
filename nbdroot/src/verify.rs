//! Readability check of the attached device.
//!
//! A handshake can succeed against an export that then fails every read
//! (wrong export, server-side I/O error). Reading the first block before the
//! root mount turns that into a clear error here instead of an opaque mount
//! failure later.

use async_trait::async_trait;
use nbdroot_shared::errors::NbdrootError;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::outcome::{Stage, StageOutcome};
use crate::report::Diagnostics;

/// Raw block device reads.
#[async_trait]
pub trait BlockReader: Send + Sync {
    /// Read exactly `len` bytes from offset zero.
    async fn read_head(&self, path: &Path, len: usize) -> io::Result<Vec<u8>>;
}

/// Reads the device through the filesystem.
pub struct FileReader;

#[async_trait]
impl BlockReader for FileReader {
    async fn read_head(&self, path: &Path, len: usize) -> io::Result<Vec<u8>> {
        let path = path.to_path_buf();
        let (tx, rx) = oneshot::channel();
        // Detached: a read stuck in the kernel must not block runtime shutdown
        std::thread::Builder::new()
            .name("nbdroot-read".into())
            .spawn(move || {
                let _ = tx.send(read_exact_at_start(&path, len));
            })?;
        rx.await
            .map_err(|_| io::Error::other("read thread exited without a result"))?
    }
}

fn read_exact_at_start(path: &Path, len: usize) -> io::Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

pub struct ReadabilityVerifier<'a> {
    reader: &'a dyn BlockReader,
    settle: Duration,
    read_size: usize,
    timeout: Duration,
}

impl<'a> ReadabilityVerifier<'a> {
    pub fn new(
        reader: &'a dyn BlockReader,
        settle: Duration,
        read_size: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            reader,
            settle,
            // A zero-length read proves nothing about the device
            read_size: read_size.max(1),
            timeout,
        }
    }

    /// Wait for the device to settle, then read its first block.
    pub async fn verify(&self, device: &Path, diag: &mut Diagnostics) -> StageOutcome<()> {
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }

        let path: PathBuf = device.to_path_buf();
        let read =
            tokio::time::timeout(self.timeout, self.reader.read_head(&path, self.read_size)).await;

        let data = match read {
            Ok(Ok(data)) => data,
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return StageOutcome::Fatal(NbdrootError::unreadable(
                    path,
                    format!("short read, expected {} bytes", self.read_size),
                ));
            }
            Ok(Err(e)) => return StageOutcome::Fatal(NbdrootError::unreadable(path, e.to_string())),
            Err(_) => {
                return StageOutcome::Fatal(NbdrootError::unreadable(
                    path,
                    format!("no data within {}s", self.timeout.as_secs()),
                ));
            }
        };

        if data.len() < self.read_size {
            return StageOutcome::Fatal(NbdrootError::unreadable(
                path,
                format!("short read: {} of {} bytes", data.len(), self.read_size),
            ));
        }

        // Blank volumes are legitimate (filesystem created later)
        if data.iter().all(|b| *b == 0) {
            diag.info(
                Stage::Verify,
                format!("{} readable; first block is all zeroes", device.display()),
            );
        } else {
            diag.info(
                Stage::Verify,
                format!("{} readable ({} bytes)", device.display(), data.len()),
            );
        }
        StageOutcome::Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Stalled;

    #[async_trait]
    impl BlockReader for Stalled {
        async fn read_head(&self, _path: &Path, _len: usize) -> io::Result<Vec<u8>> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_file_reader_reads_head() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("disk");
        std::fs::write(&path, vec![0xAB; 8192]).unwrap();

        let data = FileReader.read_head(&path, 4096).await.unwrap();
        assert_eq!(data.len(), 4096);
        assert!(data.iter().all(|b| *b == 0xAB));
    }

    #[tokio::test]
    async fn test_short_device_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("disk");
        std::fs::write(&path, vec![1u8; 100]).unwrap();
        let mut diag = Diagnostics::default();

        let outcome = ReadabilityVerifier::new(&FileReader, Duration::ZERO, 4096, Duration::from_secs(10))
            .verify(&path, &mut diag)
            .await;

        match outcome {
            StageOutcome::Fatal(e) => assert!(e.to_string().contains("short read")),
            other => panic!("expected fatal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_device_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut diag = Diagnostics::default();

        let outcome = ReadabilityVerifier::new(&FileReader, Duration::ZERO, 4096, Duration::from_secs(10))
            .verify(&dir.path().join("nbd0"), &mut diag)
            .await;

        assert!(matches!(
            outcome,
            StageOutcome::Fatal(NbdrootError::DeviceUnreadable { .. })
        ));
    }

    #[tokio::test]
    async fn test_zeroed_block_is_readable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("disk");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        let mut diag = Diagnostics::default();

        let outcome = ReadabilityVerifier::new(&FileReader, Duration::ZERO, 4096, Duration::from_secs(10))
            .verify(&path, &mut diag)
            .await;

        assert!(matches!(outcome, StageOutcome::Ok(())));
        assert!(diag.lines()[0].message.contains("all zeroes"));
    }

    #[tokio::test]
    async fn test_zero_read_size_still_reads_a_byte() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("disk");
        std::fs::write(&path, b"").unwrap();
        let mut diag = Diagnostics::default();

        let outcome = ReadabilityVerifier::new(&FileReader, Duration::ZERO, 0, Duration::from_secs(10))
            .verify(&path, &mut diag)
            .await;

        assert!(matches!(
            outcome,
            StageOutcome::Fatal(NbdrootError::DeviceUnreadable { .. })
        ));
        assert!(diag.lines().is_empty());
    }

    #[test]
    fn test_runtime_drops_while_read_is_stalled() {
        use nix::sys::stat::Mode;

        // Opening a FIFO with no writer blocks, like a wedged nbd device
        let dir = TempDir::new().unwrap();
        let fifo = dir.path().join("nbd0");
        nix::unistd::mkfifo(&fifo, Mode::S_IRUSR | Mode::S_IWUSR).unwrap();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let outcome = runtime.block_on(async {
            let mut diag = Diagnostics::default();
            ReadabilityVerifier::new(&FileReader, Duration::ZERO, 4096, Duration::from_millis(200))
                .verify(&fifo, &mut diag)
                .await
        });
        match outcome {
            StageOutcome::Fatal(e) => assert!(e.to_string().contains("no data within")),
            other => panic!("expected fatal, got {:?}", other),
        }

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            drop(runtime);
            let _ = done_tx.send(());
        });
        let dropped = done_rx.recv_timeout(Duration::from_secs(5));

        // Release the reader still parked in open()
        let _ = std::fs::OpenOptions::new().write(true).open(&fifo);
        assert!(dropped.is_ok(), "runtime drop waited on the stalled read");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_read_times_out_after_settle() {
        let mut diag = Diagnostics::default();
        let started = tokio::time::Instant::now();

        let outcome = ReadabilityVerifier::new(
            &Stalled,
            Duration::from_millis(2000),
            4096,
            Duration::from_secs(10),
        )
        .verify(Path::new("/dev/nbd0"), &mut diag)
        .await;

        match outcome {
            StageOutcome::Fatal(e) => assert!(e.to_string().contains("no data within 10s")),
            other => panic!("expected fatal, got {:?}", other),
        }
        assert_eq!(started.elapsed(), Duration::from_secs(12));
    }
}
