/// Output Collector - Bounded Concurrent Stream Capture
///
/// **Core Responsibility:**
/// Drain a child's stdout and stderr on two independent tasks so a program
/// that floods one stream while the other is unread can never stall.
///
/// **Capture Rules:**
/// - At most `limit` bytes are kept per stream
/// - Bytes past the limit are still read (the child keeps running) but dropped
/// - Ordering holds within one stream only, never across the two
/// - Captured text is readable at any time, so a timeout can report what
///   arrived before the kill

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use tutor_common::types::CapturedStream;

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug)]
struct StreamBuffer {
    bytes: Vec<u8>,
    limit: usize,
    total: u64,
    truncated: bool,
}

impl StreamBuffer {
    fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            total: 0,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        let room = self.limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    /// Kept bytes, minus a character the cap split in half.
    fn kept_len(&self) -> usize {
        if !self.truncated {
            return self.bytes.len();
        }
        match std::str::from_utf8(&self.bytes) {
            // `error_len() == None` means the input ended mid-character.
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            _ => self.bytes.len(),
        }
    }

    fn snapshot(&self) -> CapturedStream {
        CapturedStream {
            text: String::from_utf8_lossy(&self.bytes[..self.kept_len()]).into_owned(),
            truncated: self.truncated,
            total_bytes: self.total,
        }
    }
}

type SharedBuffer = Arc<Mutex<StreamBuffer>>;

fn lock(buffer: &SharedBuffer) -> MutexGuard<'_, StreamBuffer> {
    // A reader panicking mid-push leaves the bytes consistent enough to report.
    buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Everything captured from both streams of one subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
}

/// Readers attached to one child's stdout and stderr.
#[derive(Debug)]
pub struct OutputCollector {
    stdout: SharedBuffer,
    stderr: SharedBuffer,
    readers: Vec<JoinHandle<()>>,
}

impl OutputCollector {
    /// Start draining both streams. Either may be `None` when it was not piped.
    pub fn attach<O, E>(stdout: Option<O>, stderr: Option<E>, limit: usize) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let stdout_buf = Arc::new(Mutex::new(StreamBuffer::new(limit)));
        let stderr_buf = Arc::new(Mutex::new(StreamBuffer::new(limit)));
        let mut readers = Vec::with_capacity(2);

        if let Some(stream) = stdout {
            readers.push(tokio::spawn(drain(stream, stdout_buf.clone(), "stdout")));
        }
        if let Some(stream) = stderr {
            readers.push(tokio::spawn(drain(stream, stderr_buf.clone(), "stderr")));
        }

        Self {
            stdout: stdout_buf,
            stderr: stderr_buf,
            readers,
        }
    }

    /// Copy of what has been captured so far; readers keep running.
    pub fn snapshot(&self) -> CapturedOutput {
        CapturedOutput {
            stdout: lock(&self.stdout).snapshot(),
            stderr: lock(&self.stderr).snapshot(),
        }
    }

    /// Wait up to `drain` for both readers to hit EOF, then stop them.
    ///
    /// A reader can outlive the child when an escaped descendant still holds
    /// the pipe open; such a reader is aborted and the capture taken as-is.
    pub async fn finish(mut self, drain: Duration) -> CapturedOutput {
        let readers = std::mem::take(&mut self.readers);
        let aborts: Vec<_> = readers.iter().map(|r| r.abort_handle()).collect();

        let joined = tokio::time::timeout(drain, async {
            for reader in readers {
                let _ = reader.await;
            }
        })
        .await;

        if joined.is_err() {
            warn!(drain_ms = drain.as_millis() as u64, "Output readers did not reach EOF, aborting");
            for abort in aborts {
                abort.abort();
            }
        }

        let output = self.snapshot();
        if output.stdout.truncated || output.stderr.truncated {
            debug!(
                stdout_bytes = output.stdout.total_bytes,
                stderr_bytes = output.stderr.total_bytes,
                "Captured output truncated"
            );
        }
        output
    }
}

impl Drop for OutputCollector {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

async fn drain<R>(mut stream: R, buffer: SharedBuffer, name: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => lock(&buffer).push(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(stream = name, error = %e, "Stream read failed, stopping capture");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const NO_STREAM: Option<&'static [u8]> = None;

    #[test]
    fn test_buffer_caps_and_counts() {
        let mut buffer = StreamBuffer::new(5);
        buffer.push(b"abc");
        buffer.push(b"defgh");
        buffer.push(b"ij");

        let captured = buffer.snapshot();
        assert_eq!(captured.text, "abcde");
        assert!(captured.truncated);
        assert_eq!(captured.total_bytes, 10);
    }

    #[test]
    fn test_cap_never_splits_a_character() {
        let mut buffer = StreamBuffer::new(5);
        buffer.push("abcdé!".as_bytes());

        let captured = buffer.snapshot();
        assert_eq!(captured.text, "abcd");
        assert!(captured.truncated);
        assert_eq!(captured.total_bytes, 7);
    }

    #[test]
    fn test_buffer_exact_fit_not_truncated() {
        let mut buffer = StreamBuffer::new(4);
        buffer.push(b"abcd");
        assert!(!buffer.snapshot().truncated);
    }

    #[tokio::test]
    async fn test_collects_both_streams() {
        let stdout: &'static [u8] = b"Hello, Kotlin!";
        let stderr: &'static [u8] = b"warning: deprecated";

        let collector = OutputCollector::attach(Some(stdout), Some(stderr), 1024);
        let output = collector.finish(Duration::from_secs(1)).await;

        assert_eq!(output.stdout.text, "Hello, Kotlin!");
        assert_eq!(output.stderr.text, "warning: deprecated");
        assert!(!output.stdout.truncated);
    }

    #[tokio::test]
    async fn test_keeps_draining_past_limit() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let collector = OutputCollector::attach(Some(reader), NO_STREAM, 16);

        // Far more than the duplex buffer: this only completes if the reader keeps draining.
        let payload = vec![b'x'; 64 * 1024];
        writer.write_all(&payload).await.unwrap();
        drop(writer);

        let output = collector.finish(Duration::from_secs(5)).await;
        assert_eq!(output.stdout.text.len(), 16);
        assert!(output.stdout.truncated);
        assert_eq!(output.stdout.total_bytes, 64 * 1024);
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_while_stream_open() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let collector = OutputCollector::attach(Some(reader), NO_STREAM, 1024);

        writer.write_all(b"partial").await.unwrap();
        writer.flush().await.unwrap();

        let mut seen = String::new();
        for _ in 0..50 {
            seen = collector.snapshot().stdout.text;
            if !seen.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen, "partial");

        // Writer still open: finish must give up after the drain window.
        let output = collector.finish(Duration::from_millis(50)).await;
        assert_eq!(output.stdout.text, "partial");
        drop(writer);
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_lossy() {
        let stdout: &'static [u8] = b"ok \xff\xfe done";
        let collector = OutputCollector::attach(Some(stdout), NO_STREAM, 1024);
        let output = collector.finish(Duration::from_secs(1)).await;
        assert!(output.stdout.text.starts_with("ok "));
        assert!(output.stdout.text.ends_with(" done"));
    }
}
