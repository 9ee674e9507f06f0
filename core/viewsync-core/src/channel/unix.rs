//! Newline-delimited JSON push channel over a Unix domain socket.
//!
//! Each line in either direction is one frame, `{"event": ..., "payload": ...}`.
//! The server is expected to send `ping` heartbeats; a socket that stays
//! silent past the liveness timeout is treated as dead.

use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};
use viewsync_protocol::{ClientFrame, RawFrame, HEARTBEAT_EVENT, MAX_FRAME_BYTES};

use super::transport::{Inbound, InboundSender, Link, Transport};
use crate::error::TransportError;

pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct UnixSocketTransport {
    path: PathBuf,
    liveness_timeout: Duration,
}

impl UnixSocketTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
        }
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Transport for UnixSocketTransport {
    fn open(
        &self,
        timeout: Duration,
        inbound: InboundSender,
    ) -> Result<Arc<dyn Link>, TransportError> {
        let stream = UnixStream::connect(&self.path).map_err(|err| match err.kind() {
            ErrorKind::NotFound | ErrorKind::ConnectionRefused => {
                TransportError::Refused(format!("{}: {}", self.path.display(), err))
            }
            _ => TransportError::Io(err),
        })?;
        // A zero timeout is rejected by the socket; treat it as "none".
        stream.set_write_timeout(Some(timeout).filter(|t| !t.is_zero()))?;
        stream.set_read_timeout(Some(self.liveness_timeout).filter(|t| !t.is_zero()))?;

        let reader = stream.try_clone()?;
        thread::Builder::new()
            .name("viewsync-unix-reader".to_string())
            .spawn(move || read_frames(reader, inbound))?;

        debug!(path = %self.path.display(), "Unix socket channel opened");
        Ok(Arc::new(UnixLink {
            stream: Mutex::new(stream),
            write_timeout: timeout,
        }))
    }
}

struct UnixLink {
    stream: Mutex<UnixStream>,
    write_timeout: Duration,
}

impl Link for UnixLink {
    fn emit(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        let mut line = serde_json::to_vec(frame)
            .map_err(|err| TransportError::Closed(format!("unencodable frame: {err}")))?;
        line.push(b'\n');
        let mut stream = self
            .stream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        stream
            .write_all(&line)
            .and_then(|()| stream.flush())
            .map_err(|err| match err.kind() {
                ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                    TransportError::Timeout(self.write_timeout)
                }
                _ => TransportError::Io(err),
            })
    }

    fn close(&self) {
        let stream = self
            .stream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // NotConnected after the first shutdown is expected.
        let _ = stream.shutdown(Shutdown::Both);
    }
}

fn read_frames(stream: UnixStream, inbound: InboundSender) {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    let reason = loop {
        match read_line_capped(&mut reader, &mut line) {
            Ok(LineRead::Eof) => break "server closed the connection".to_string(),
            Ok(LineRead::Oversized) => {
                warn!(limit = MAX_FRAME_BYTES, "Dropping oversized frame");
                continue;
            }
            Ok(LineRead::Line) => {}
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                break "liveness timeout".to_string();
            }
            Err(err) => break format!("read failed: {err}"),
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match RawFrame::parse_line(&line) {
            Ok(frame) if frame.event == HEARTBEAT_EVENT => {}
            Ok(frame) => {
                if inbound.send(Inbound::Frame(frame)).is_err() {
                    // Manager has moved on to another session.
                    return;
                }
            }
            Err(err) => warn!(error = %err, "Dropping unparseable frame"),
        }
    };
    let _ = inbound.send(Inbound::Closed(reason));
}

#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Line,
    Oversized,
    Eof,
}

/// Reads one newline-terminated line into `line`, never buffering more than
/// `MAX_FRAME_BYTES` plus the terminator. The tail of an oversized line is
/// discarded up to and including its newline.
fn read_line_capped<R: BufRead>(reader: &mut R, line: &mut Vec<u8>) -> io::Result<LineRead> {
    line.clear();
    let limit = MAX_FRAME_BYTES as u64 + 1;
    if reader.by_ref().take(limit).read_until(b'\n', line)? == 0 {
        return Ok(LineRead::Eof);
    }
    if line.last() == Some(&b'\n') || line.len() <= MAX_FRAME_BYTES {
        return Ok(LineRead::Line);
    }

    line.clear();
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            return Ok(LineRead::Oversized);
        }
        match buf.iter().position(|byte| *byte == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(LineRead::Oversized);
            }
            None => {
                let len = buf.len();
                reader.consume(len);
            }
        }
    }
}
