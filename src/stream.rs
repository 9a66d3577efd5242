//! Chunked forwarding of child-process output to a session.
//!
//! Each child stream is drained by a pump task that yields decoded text
//! chunks into a bounded channel. A single forwarder consumes that channel
//! and writes every chunk, rendered, to the session's [`Output`]. Both hops
//! are bounded, so a slow client eventually blocks the child on its pipe
//! instead of growing memory without limit.

use std::char::REPLACEMENT_CHARACTER;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Instant};
use tracing::{debug, warn};

const READ_BUF_SIZE: usize = 8192;

/// Which child stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub kind: StreamKind,
    pub text: String,
}

/// Outbound text channel of one session.
#[derive(Debug, Clone)]
pub struct Output {
    tx: mpsc::Sender<String>,
}

impl Output {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Send `text` to the client. Returns `false` once the client is gone.
    pub async fn emit(&self, text: impl Into<String>) -> bool {
        self.tx.send(text.into()).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Incremental UTF-8 decoder that holds back a character split across reads.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut start = 0;

        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(s) => {
                    out.push_str(s);
                    start = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid_end = start + e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[start..valid_end]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(REPLACEMENT_CHARACTER);
                            start = valid_end + len;
                        }
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            start = valid_end;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..start);
        out
    }

    /// Flush whatever is still held back.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

/// Drain `reader` into `tx` until EOF.
pub fn pump<R>(mut reader: R, kind: StreamKind, tx: mpsc::Sender<Chunk>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        let mut decoder = Utf8Decoder::default();
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let text = decoder.decode(&buf[..n]);
                    if text.is_empty() {
                        continue;
                    }
                    if tx.send(Chunk { kind, text }).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(?kind, error = %e, "Stream read failed");
                    break;
                }
            }
        }
        let text = decoder.finish();
        if !text.is_empty() {
            let _ = tx.send(Chunk { kind, text }).await;
        }
    })
}

/// Forwards the chunks of one child process and captures a bounded prefix of
/// everything it forwarded.
pub struct Forwarder {
    pumps: Vec<JoinHandle<()>>,
    task: JoinHandle<String>,
    forwarded: Arc<AtomicU64>,
}

impl Forwarder {
    pub fn spawn<O, E, F>(
        stdout: Option<O>,
        stderr: Option<E>,
        output: Output,
        capacity: usize,
        capture_limit: usize,
        render: F,
    ) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
        F: Fn(&Chunk) -> String + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = stdout {
            pumps.push(pump(stdout, StreamKind::Stdout, tx.clone()));
        }
        if let Some(stderr) = stderr {
            pumps.push(pump(stderr, StreamKind::Stderr, tx.clone()));
        }
        drop(tx);

        let forwarded = Arc::new(AtomicU64::new(0));
        let counter = forwarded.clone();
        let task = tokio::spawn(async move {
            let mut captured = String::new();
            let mut client_gone = false;
            while let Some(chunk) = rx.recv().await {
                capture(&mut captured, &chunk.text, capture_limit);
                // Keep draining after the client is gone so the child never
                // stalls on a full pipe.
                if !client_gone && !output.emit(render(&chunk)).await {
                    debug!("Client gone; discarding further output");
                    client_gone = true;
                }
                counter.fetch_add(1, Ordering::Relaxed);
            }
            captured
        });

        Self {
            pumps,
            task,
            forwarded,
        }
    }

    /// Wait until every stream hit EOF and all chunks were forwarded.
    ///
    /// Once nothing has been forwarded for `idle`, or `limit` has passed, the
    /// pipes are abandoned: a process outside the child's group may hold them
    /// open indefinitely. Returns the captured text.
    pub async fn finish(mut self, idle: Duration, limit: Duration) -> String {
        let deadline = Instant::now() + limit;
        let mut seen = self.forwarded.load(Ordering::Relaxed);
        loop {
            let wait = idle.min(deadline.saturating_duration_since(Instant::now()));
            if let Ok(joined) = time::timeout(wait, &mut self.task).await {
                return Self::captured(joined);
            }
            let now = self.forwarded.load(Ordering::Relaxed);
            if now == seen || Instant::now() >= deadline {
                break;
            }
            seen = now;
        }

        let open = self.pumps.iter().filter(|p| !p.is_finished()).count();
        warn!(open, "Output pipes still open after the process ended; closing them");
        for pump in &self.pumps {
            pump.abort();
        }
        match time::timeout(idle, &mut self.task).await {
            Ok(joined) => Self::captured(joined),
            Err(_) => {
                self.task.abort();
                String::new()
            }
        }
    }

    fn captured(joined: Result<String, JoinError>) -> String {
        match joined {
            Ok(captured) => captured,
            Err(e) => {
                warn!(error = %e, "Output forwarder failed");
                String::new()
            }
        }
    }
}

fn capture(captured: &mut String, text: &str, limit: usize) {
    let room = limit.saturating_sub(captured.len());
    let mut end = text.len().min(room);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    captured.push_str(&text[..end]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const IDLE: Duration = Duration::from_millis(200);
    const LIMIT: Duration = Duration::from_secs(2);

    #[test]
    fn test_decoder_joins_split_character() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "héllo".as_bytes();
        assert_eq!(decoder.decode(&bytes[..2]), "h");
        assert_eq!(decoder.decode(&bytes[2..]), "éllo");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn test_decoder_flushes_dangling_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"ok\xe2\x82"), "ok");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn test_capture_respects_limit_on_char_boundary() {
        let mut captured = String::new();
        capture(&mut captured, "ab", 3);
        capture(&mut captured, "éz", 3);
        assert_eq!(captured, "ab");
        capture(&mut captured, "c", 4);
        assert_eq!(captured, "abc");
    }

    #[tokio::test]
    async fn test_forwarder_renders_and_captures() {
        let (output, mut rx) = Output::channel(8);
        let stdout: &'static [u8] = b"hello\n";
        let stderr: &'static [u8] = b"oops\n";

        let forwarder = Forwarder::spawn(Some(stdout), Some(stderr), output, 4, 1024, |chunk| {
            match chunk.kind {
                StreamKind::Stdout => chunk.text.clone(),
                StreamKind::Stderr => format!("Error: {}", chunk.text),
            }
        });
        let captured = forwarder.finish(IDLE, LIMIT).await;

        let mut received = Vec::new();
        while let Ok(text) = rx.try_recv() {
            received.push(text);
        }
        received.sort();
        assert_eq!(received, vec!["Error: oops\n", "hello\n"]);
        assert!(captured.contains("hello\n"));
        assert!(captured.contains("oops\n"));
    }

    #[tokio::test]
    async fn test_forwarder_drains_after_client_left() {
        let (output, rx) = Output::channel(1);
        drop(rx);
        assert!(output.is_closed());

        let stdout: &'static [u8] = b"ignored";
        let forwarder = Forwarder::spawn(
            Some(stdout),
            None::<&'static [u8]>,
            output,
            1,
            16,
            |chunk| chunk.text.clone(),
        );
        assert_eq!(forwarder.finish(IDLE, LIMIT).await, "ignored");
    }

    #[tokio::test]
    async fn test_finish_abandons_pipe_that_never_closes() {
        let (output, mut rx) = Output::channel(8);
        // Holding the writer keeps the reader from ever seeing EOF.
        let (mut writer, reader) = tokio::io::duplex(64);
        writer.write_all(b"early\n").await.unwrap();

        let forwarder = Forwarder::spawn(
            Some(reader),
            None::<&'static [u8]>,
            output,
            4,
            64,
            |chunk| chunk.text.clone(),
        );
        let started = Instant::now();
        let captured = time::timeout(Duration::from_secs(10), forwarder.finish(IDLE, LIMIT))
            .await
            .expect("finish should give up on the open pipe");

        assert!(started.elapsed() < LIMIT + IDLE * 2);
        assert_eq!(captured, "early\n");
        assert_eq!(rx.recv().await.as_deref(), Some("early\n"));
        drop(writer);
    }

    #[tokio::test]
    async fn test_finish_stops_chatty_pipe_at_limit() {
        let (output, mut rx) = Output::channel(8);
        let (mut writer, reader) = tokio::io::duplex(64);
        let chatter = tokio::spawn(async move {
            while writer.write_all(b"x\n").await.is_ok() {
                time::sleep(Duration::from_millis(10)).await;
            }
        });
        let sink = tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let forwarder = Forwarder::spawn(
            Some(reader),
            None::<&'static [u8]>,
            output,
            4,
            1024,
            |chunk| chunk.text.clone(),
        );
        let started = Instant::now();
        let captured = time::timeout(Duration::from_secs(10), forwarder.finish(IDLE, LIMIT))
            .await
            .expect("finish should stop at its limit");

        assert!(started.elapsed() >= LIMIT);
        assert!(captured.starts_with("x\n"), "{captured:?}");
        // The reader is gone, so the writer fails and stops.
        time::timeout(Duration::from_secs(5), chatter)
            .await
            .expect("writer should see the closed pipe")
            .unwrap();
        sink.abort();
    }
}
