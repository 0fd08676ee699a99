// src/conn.rs
//
// One accepted socket: read buffer + parser + staged response. Exactly
// one actor mutates a Connection at a time; the dispatcher enforces
// that by moving the Box through the task queue and completion channel
// rather than by locking.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::Path;

use hearth_store::StorePool;

use crate::buf::{READ_BUF_SIZE, ReadBuf, WRITE_BUF_SIZE, WriteBuf, WriteOverflow};
use crate::config::TriggerMode;
use crate::metrics::ServerMetrics;
use crate::parse::{ParseOutcome, RequestParser};
use crate::response::{self, ResponseKind};
use crate::routes;
use crate::syscalls::{self, MappedFile};

/// Why a read step failed; every variant tears the connection down.
#[derive(Debug)]
pub enum FillError {
    /// Peer closed (or, level-triggered, produced nothing to read).
    Closed,
    /// The request outgrew the read buffer.
    BufferFull,
    Io(io::Error),
}

/// Result of a parse+build step.
#[derive(Debug, PartialEq, Eq)]
pub enum ProcessResult {
    /// Request still incomplete; await more bytes.
    NeedMore,
    /// A response is staged; await write readiness.
    ResponseReady,
    /// No response can be produced; close.
    Teardown,
}

/// Result of one send step.
#[derive(Debug)]
pub enum SendOutcome {
    /// Socket would block; re-arm write readiness.
    Retry { written: usize },
    /// Response fully sent. On keep-alive the connection has already
    /// been reset for the next request.
    Done { keep_alive: bool, written: usize },
}

pub struct Connection {
    fd: RawFd,
    peer: SocketAddr,
    trigger: TriggerMode,
    read_buf: ReadBuf,
    parser: RequestParser,
    write_buf: WriteBuf,
    file: Option<MappedFile>,
    bytes_queued: usize,
    bytes_sent: usize,
    staged_keep_alive: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .field("trigger", &self.trigger)
            .field("bytes_queued", &self.bytes_queued)
            .field("bytes_sent", &self.bytes_sent)
            .field("staged_keep_alive", &self.staged_keep_alive)
            .finish()
    }
}

impl Connection {
    pub fn new(fd: RawFd, peer: SocketAddr, trigger: TriggerMode) -> Box<Self> {
        Box::new(Self {
            fd,
            peer,
            trigger,
            read_buf: ReadBuf::new(READ_BUF_SIZE),
            parser: RequestParser::new(),
            write_buf: WriteBuf::new(WRITE_BUF_SIZE),
            file: None,
            bytes_queued: 0,
            bytes_sent: 0,
            staged_keep_alive: false,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Drain the socket into the read buffer under the configured
    /// discipline: one recv (level) or recv-until-EAGAIN (edge).
    pub fn fill_read_buffer(&mut self) -> Result<(), FillError> {
        if self.read_buf.is_full() {
            return Err(FillError::BufferFull);
        }
        match self.trigger {
            TriggerMode::Level => {
                match syscalls::read_nonblocking(self.fd, self.read_buf.spare_mut()) {
                    Ok(0) => Err(FillError::Closed),
                    Ok(n) => {
                        self.read_buf.advance_read(n);
                        Ok(())
                    }
                    Err(e) => Err(FillError::Io(e)),
                }
            }
            TriggerMode::Edge => loop {
                if self.read_buf.is_full() {
                    return Err(FillError::BufferFull);
                }
                match syscalls::read_nonblocking(self.fd, self.read_buf.spare_mut()) {
                    Ok(0) => return Err(FillError::Closed),
                    Ok(n) => self.read_buf.advance_read(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(FillError::Io(e)),
                }
            },
        }
    }

    /// Parse the buffered bytes and, on a complete request, stage the
    /// response. Protocol errors stage a 400 that closes after sending.
    pub fn process(
        &mut self,
        doc_root: &Path,
        store: &StorePool,
        metrics: &ServerMetrics,
    ) -> ProcessResult {
        match self.parser.advance(&mut self.read_buf) {
            ParseOutcome::Incomplete => ProcessResult::NeedMore,
            ParseOutcome::Complete => {
                metrics.inc_req();
                let keep_alive = self.parser.request.keep_alive;
                let kind = routes::resolve(&self.parser.request, doc_root, store);
                tracing::info!(
                    peer = %self.peer,
                    target = %self.parser.request.target,
                    status = kind_code(&kind),
                    "request resolved"
                );
                self.stage(kind, keep_alive)
            }
            ParseOutcome::Malformed => {
                tracing::info!(peer = %self.peer, "protocol error");
                self.stage(ResponseKind::BadRequest, false)
            }
        }
    }

    fn stage(&mut self, kind: ResponseKind, keep_alive: bool) -> ProcessResult {
        self.write_buf.clear();
        self.file = None;
        self.bytes_sent = 0;
        match response::build(kind, keep_alive, &mut self.write_buf) {
            Ok(file) => {
                self.bytes_queued =
                    self.write_buf.len() + file.as_ref().map(MappedFile::len).unwrap_or(0);
                self.file = file;
                self.staged_keep_alive = keep_alive;
                ProcessResult::ResponseReady
            }
            Err(WriteOverflow) => {
                tracing::error!(peer = %self.peer, "response overflowed the write buffer");
                ProcessResult::Teardown
            }
        }
    }

    /// Push the staged segments out with writev until done or blocked.
    pub fn send_response(&mut self) -> io::Result<SendOutcome> {
        let mut written_now = 0usize;
        loop {
            if self.bytes_sent >= self.bytes_queued {
                let keep_alive = self.staged_keep_alive;
                self.file = None;
                if keep_alive {
                    self.reset();
                } else {
                    self.write_buf.clear();
                    self.bytes_queued = 0;
                    self.bytes_sent = 0;
                }
                return Ok(SendOutcome::Done {
                    keep_alive,
                    written: written_now,
                });
            }

            let header = self.write_buf.as_slice();
            let sent = self.bytes_sent;
            let result = if sent < header.len() {
                match &self.file {
                    Some(map) => {
                        syscalls::writev_nonblocking(self.fd, &[&header[sent..], map.as_slice()])
                    }
                    None => syscalls::writev_nonblocking(self.fd, &[&header[sent..]]),
                }
            } else {
                let offset = sent - header.len();
                match &self.file {
                    Some(map) => {
                        syscalls::writev_nonblocking(self.fd, &[&map.as_slice()[offset..]])
                    }
                    None => Err(io::Error::other("send progress out of sync")),
                }
            };

            match result {
                Ok(0) => {
                    return Ok(SendOutcome::Retry {
                        written: written_now,
                    });
                }
                Ok(n) => {
                    self.bytes_sent += n;
                    written_now += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(SendOutcome::Retry {
                        written: written_now,
                    });
                }
                Err(e) => {
                    self.file = None;
                    return Err(e);
                }
            }
        }
    }

    /// Back to the initial parser/buffer state for the next keep-alive
    /// request. The socket and peer identity stay.
    pub fn reset(&mut self) {
        self.read_buf.reset();
        self.parser.reset();
        self.write_buf.clear();
        self.file = None;
        self.bytes_queued = 0;
        self.bytes_sent = 0;
        self.staged_keep_alive = false;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.fd >= 0 {
            syscalls::close_fd(self.fd);
        }
    }
}

fn kind_code(kind: &ResponseKind) -> u16 {
    match kind {
        ResponseKind::File(_, _) => 200,
        ResponseKind::BadRequest => 400,
        ResponseKind::Forbidden => 403,
        ResponseKind::NoResource => 404,
        ResponseKind::InternalError => 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_store::MemoryBackend;
    use std::fs;
    use std::io::{Read, Write};
    use std::net::SocketAddr;
    use std::os::fd::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn peer() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn doc_root() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("judge.html"), b"<html>judge</html>").unwrap();
        fs::write(dir.path().join("logError.html"), b"<html>bad login</html>").unwrap();
        dir
    }

    fn store() -> StorePool {
        StorePool::new(Arc::new(MemoryBackend::with_users([("alice", "secret")])), 2).unwrap()
    }

    /// A connection over one end of a socketpair, plus the client end.
    fn pair(trigger: TriggerMode) -> (Box<Connection>, UnixStream) {
        let (server, client) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        (Connection::new(server.into_raw_fd(), peer(), trigger), client)
    }

    fn read_response(client: &mut UnixStream) -> String {
        let mut data = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match client.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    data.extend_from_slice(&chunk[..n]);
                    let text = String::from_utf8_lossy(&data);
                    if let Some(head_end) = text.find("\r\n\r\n") {
                        let content_length = text
                            .lines()
                            .find_map(|l| l.strip_prefix("Content-Length: "))
                            .and_then(|v| v.trim().parse::<usize>().ok())
                            .unwrap_or(0);
                        if data.len() >= head_end + 4 + content_length {
                            break;
                        }
                    }
                }
                Err(_) => break,
            }
        }
        String::from_utf8_lossy(&data).into_owned()
    }

    #[test]
    fn serves_the_landing_page_and_keeps_alive() {
        let root = doc_root();
        let store = store();
        let metrics = ServerMetrics::new();
        let (mut conn, mut client) = pair(TriggerMode::Edge);

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        conn.fill_read_buffer().unwrap();
        assert_eq!(
            conn.process(root.path(), &store, &metrics),
            ProcessResult::ResponseReady
        );
        match conn.send_response().unwrap() {
            SendOutcome::Done { keep_alive, .. } => assert!(keep_alive),
            other => panic!("unexpected: {:?}", other),
        }

        let response = read_response(&mut client);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Connection: keep-alive\r\n"));
        assert!(response.ends_with("<html>judge</html>"));

        // The connection reset: a second request parses independently.
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        conn.fill_read_buffer().unwrap();
        assert_eq!(
            conn.process(root.path(), &store, &metrics),
            ProcessResult::ResponseReady
        );
    }

    #[test]
    fn missing_file_gets_404_and_close() {
        let root = doc_root();
        let store = store();
        let metrics = ServerMetrics::new();
        let (mut conn, mut client) = pair(TriggerMode::Level);

        client
            .write_all(b"GET /nofile.html HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        conn.fill_read_buffer().unwrap();
        assert_eq!(
            conn.process(root.path(), &store, &metrics),
            ProcessResult::ResponseReady
        );
        match conn.send_response().unwrap() {
            SendOutcome::Done { keep_alive, .. } => assert!(!keep_alive),
            other => panic!("unexpected: {:?}", other),
        }

        let response = read_response(&mut client);
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(response.contains("Connection: close\r\n"));
        assert!(response.ends_with(response::ERROR_404_BODY));
    }

    #[test]
    fn malformed_request_gets_400_and_close() {
        let root = doc_root();
        let store = store();
        let metrics = ServerMetrics::new();
        let (mut conn, mut client) = pair(TriggerMode::Edge);

        client
            .write_all(b"BREW /pot HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        conn.fill_read_buffer().unwrap();
        assert_eq!(
            conn.process(root.path(), &store, &metrics),
            ProcessResult::ResponseReady
        );
        match conn.send_response().unwrap() {
            // A protocol error always closes, keep-alive or not.
            SendOutcome::Done { keep_alive, .. } => assert!(!keep_alive),
            other => panic!("unexpected: {:?}", other),
        }
        let response = read_response(&mut client);
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn request_split_across_reads_parses_like_one() {
        let root = doc_root();
        let store = store();
        let metrics = ServerMetrics::new();
        let (mut conn, mut client) = pair(TriggerMode::Edge);

        client.write_all(b"GET / HTTP/1.1\r\n").unwrap();
        conn.fill_read_buffer().unwrap();
        assert_eq!(
            conn.process(root.path(), &store, &metrics),
            ProcessResult::NeedMore
        );

        client.write_all(b"Host: x\r\n\r\n").unwrap();
        conn.fill_read_buffer().unwrap();
        assert_eq!(
            conn.process(root.path(), &store, &metrics),
            ProcessResult::ResponseReady
        );
    }

    #[test]
    fn peer_close_fails_the_fill() {
        let (mut conn, client) = pair(TriggerMode::Edge);
        drop(client);
        assert!(matches!(conn.fill_read_buffer(), Err(FillError::Closed)));
    }

    #[test]
    fn level_fill_with_no_data_fails() {
        let (mut conn, _client) = pair(TriggerMode::Level);
        assert!(matches!(conn.fill_read_buffer(), Err(FillError::Io(_))));
    }

    #[test]
    fn post_login_failure_serves_the_error_page() {
        let root = doc_root();
        let store = store();
        let metrics = ServerMetrics::new();
        let (mut conn, mut client) = pair(TriggerMode::Edge);

        let body = b"user=alice&passwd=wrong";
        let request = format!(
            "POST /2check HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        client.write_all(request.as_bytes()).unwrap();
        client.write_all(body).unwrap();

        conn.fill_read_buffer().unwrap();
        assert_eq!(
            conn.process(root.path(), &store, &metrics),
            ProcessResult::ResponseReady
        );
        conn.send_response().unwrap();

        let response = read_response(&mut client);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("<html>bad login</html>"));
    }
}
