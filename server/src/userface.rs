use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub const ANSI_BLUE: &str = "\x1b[34m";
pub const ANSI_RED: &str = "\x1b[31m";
pub const ANSI_GREEN: &str = "\x1b[32m";
pub const ANSI_YELLOW: &str = "\x1b[33m";
pub const ANSI_RESET: &str = "\x1b[0m";

/// Write-through buffer between a judgement task and the user's terminal.
///
/// Everything written is appended to an in-memory buffer that is persisted
/// with the submission; while a live terminal is attached the same bytes are
/// forwarded to it in write order.
#[derive(Debug, Clone, Default)]
pub struct UserFace {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    buf: Vec<u8>,
    live: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl UserFace {
    pub fn from_bytes(buf: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { buf, live: None })),
        }
    }

    /// Attaches a live terminal. Returns everything buffered so far plus a
    /// receiver for subsequent writes; taken together under the lock so no
    /// write is lost or duplicated. Any previously attached receiver stops
    /// getting updates.
    pub fn attach(&self) -> (Vec<u8>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("user face lock poisoned");
        inner.live = Some(tx);
        (inner.buf.clone(), rx)
    }

    pub fn write(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().expect("user face lock poisoned");
        inner.buf.extend_from_slice(bytes);
        if let Some(live) = &inner.live {
            if live.send(bytes.to_vec()).is_err() {
                // Terminal went away; keep buffering for the replay.
                inner.live = None;
            }
        }
    }

    pub fn writeln(&self, line: &str) {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.write(&bytes);
    }

    /// Writes a chunk wrapped in an ANSI color, used by the live step tee.
    pub fn write_colored(&self, color: &str, bytes: &[u8]) {
        let mut out = Vec::with_capacity(bytes.len() + color.len() + ANSI_RESET.len());
        out.extend_from_slice(color.as_bytes());
        out.extend_from_slice(bytes);
        out.extend_from_slice(ANSI_RESET.as_bytes());
        self.write(&out);
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner
            .lock()
            .expect("user face lock poisoned")
            .buf
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_accumulate_in_order() {
        let face = UserFace::default();
        face.writeln("X");
        face.writeln("Y");
        face.write(b"exit code: 0");
        assert_eq!(face.contents(), b"X\nY\nexit code: 0");
    }

    #[tokio::test]
    async fn attached_terminal_sees_history_and_live_writes() {
        let face = UserFace::default();
        face.writeln("before attach");

        let (history, mut rx) = face.attach();
        assert_eq!(history, b"before attach\n");

        face.writeln("X");
        face.writeln("Y");

        assert_eq!(rx.recv().await.unwrap(), b"X\n");
        assert_eq!(rx.recv().await.unwrap(), b"Y\n");
        assert_eq!(face.contents(), b"before attach\nX\nY\n");
    }

    #[test]
    fn dropped_terminal_does_not_lose_the_buffer() {
        let face = UserFace::default();
        let (_, rx) = face.attach();
        drop(rx);
        face.writeln("still recorded");
        assert_eq!(face.contents(), b"still recorded\n");
    }

    #[test]
    fn colored_chunks_are_wrapped() {
        let face = UserFace::default();
        face.write_colored(ANSI_BLUE, b"out");
        assert_eq!(face.contents(), b"\x1b[34mout\x1b[0m");
    }
}
