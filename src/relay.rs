//! Interaction transcript relays
//!
//! When interaction logging is requested, each validator↔submission channel
//! is split in two and a relay copies every byte through verbatim while
//! appending it, tagged with a direction marker at each line start, to a
//! shared transcript. Forwarding happens before annotation and both sides
//! are flushed per chunk, so the transcript preserves real-time ordering.

use anyhow::{Context, Result};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Marker for bytes flowing submission → validator.
pub(crate) const TEAM_MARKER: u8 = b'>';
/// Marker for bytes flowing validator → submission.
pub(crate) const VALIDATOR_MARKER: u8 = b'<';

/// Append-only transcript shared by the two relays of a pass.
#[derive(Clone)]
pub(crate) struct Transcript {
    file: Arc<Mutex<File>>,
}

impl Transcript {
    pub(crate) async fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open transcript {}", path.display()))?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Pass separator written between multi-pass rounds.
    pub(crate) async fn separator(&self) -> Result<()> {
        let mut file = self.file.lock().await;
        file.write_all(b"---\n").await?;
        file.flush().await?;
        Ok(())
    }

    async fn append(&self, bytes: &[u8]) {
        let mut file = self.file.lock().await;
        file.write_all(bytes).await.ok();
        file.flush().await.ok();
    }
}

/// Create one unidirectional byte channel, widened to 1 MiB where supported.
pub(crate) fn channel() -> Result<(OwnedFd, OwnedFd)> {
    // Close-on-exec so a child spawned after this pipe is created does not
    // inherit the other end: each `Stdio::from` dup2's the intended slot
    // post-fork, while any leaked copy is closed at exec. Without this the
    // write end lingers in an unrelated child and the reader never sees EOF.
    let (read, write) =
        nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).context("Failed to create pipe")?;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        use nix::fcntl::{fcntl, FcntlArg};
        // Best effort; the default size only costs throughput.
        let _ = fcntl(write.as_raw_fd(), FcntlArg::F_SETPIPE_SZ(1 << 20));
    }
    Ok((read, write))
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
        .context("Failed to set pipe non-blocking")?;
    Ok(())
}

/// Start a relay copying `source` to `sink`, mirroring annotated bytes into
/// the transcript. Ends at EOF or once the sink's reader is gone.
pub(crate) fn spawn(
    source: OwnedFd,
    sink: OwnedFd,
    transcript: Transcript,
    marker: u8,
) -> Result<JoinHandle<()>> {
    set_nonblocking(&source)?;
    set_nonblocking(&sink)?;
    let rx = pipe::Receiver::from_owned_fd(source).context("Failed to wrap relay source")?;
    let tx = pipe::Sender::from_owned_fd(sink).context("Failed to wrap relay sink")?;
    Ok(tokio::spawn(run(rx, tx, transcript, marker)))
}

async fn run(mut rx: pipe::Receiver, mut tx: pipe::Sender, transcript: Transcript, marker: u8) {
    let mut buf = [0u8; 4096];
    let mut at_line_start = true;
    loop {
        let n = match rx.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if tx.write_all(&buf[..n]).await.is_err() {
            break;
        }
        tx.flush().await.ok();

        let mut annotated = Vec::with_capacity(n + 16);
        for &byte in &buf[..n] {
            if at_line_start {
                annotated.push(marker);
            }
            annotated.push(byte);
            at_line_start = byte == b'\n';
        }
        transcript.append(&annotated).await;
    }
}
