// src/parse.rs
//
// Request scanner: consumes the lines the buffer's scanner extracts and
// drives the RequestLine -> Headers -> Body phase machine.

use crate::buf::{ReadBuf, Scan};

/// A bare `/` target is rewritten to the landing page.
pub const DEFAULT_LANDING_PAGE: &str = "/judge.html";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsePhase {
    RequestLine,
    Headers,
    Body,
}

/// Overall result of one parse pass over the buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Need more bytes; re-arm read readiness.
    Incomplete,
    /// A full request is captured in [`Request`].
    Complete,
    /// Protocol error; answer 400 and close.
    Malformed,
}

#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub target: String,
    pub host: Option<String>,
    pub content_length: usize,
    pub keep_alive: bool,
    pub has_body: bool,
    pub body: Vec<u8>,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: Method::Get,
            target: String::new(),
            host: None,
            content_length: 0,
            keep_alive: false,
            has_body: false,
            body: Vec::new(),
        }
    }
}

enum HeaderLine {
    More,
    BodyNext,
    Done,
    Bad,
}

pub struct RequestParser {
    phase: ParsePhase,
    pub request: Request,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            phase: ParsePhase::RequestLine,
            request: Request::default(),
        }
    }

    pub fn phase(&self) -> ParsePhase {
        self.phase
    }

    pub fn reset(&mut self) {
        self.phase = ParsePhase::RequestLine;
        self.request = Request::default();
    }

    /// Consume as much of the buffer as possible. Incremental: feeding
    /// the same bytes in any number of chunks yields the same result.
    pub fn advance(&mut self, buf: &mut ReadBuf) -> ParseOutcome {
        loop {
            if self.phase() == ParsePhase::Body {
                if !buf.body_ready(self.request.content_length) {
                    return ParseOutcome::Incomplete;
                }
                self.request.body = buf.body(self.request.content_length).to_vec();
                tracing::info!(bytes = self.request.body.len(), "request body captured");
                return ParseOutcome::Complete;
            }

            match buf.scan_line() {
                Scan::Incomplete => return ParseOutcome::Incomplete,
                Scan::Malformed => {
                    tracing::info!("malformed line terminator");
                    return ParseOutcome::Malformed;
                }
                Scan::Line { start, end } => {
                    let line = buf.slice(start, end);
                    tracing::info!(line = %String::from_utf8_lossy(line), "parsed line");
                    match self.phase() {
                        ParsePhase::RequestLine => {
                            if !self.parse_request_line(line) {
                                return ParseOutcome::Malformed;
                            }
                        }
                        ParsePhase::Headers => match self.parse_header(line) {
                            HeaderLine::More => {}
                            HeaderLine::BodyNext => self.phase = ParsePhase::Body,
                            HeaderLine::Done => return ParseOutcome::Complete,
                            HeaderLine::Bad => return ParseOutcome::Malformed,
                        },
                        ParsePhase::Body => unreachable!("body bytes are not line-scanned"),
                    }
                }
            }
        }
    }

    /// `METHOD TARGET VERSION`, separated by spaces or tabs.
    fn parse_request_line(&mut self, line: &[u8]) -> bool {
        let Ok(text) = std::str::from_utf8(line) else {
            return false;
        };
        let mut parts = text.split([' ', '\t']).filter(|s| !s.is_empty());
        let (Some(method), Some(target), Some(version)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return false;
        };

        if method.eq_ignore_ascii_case("GET") {
            self.request.method = Method::Get;
        } else if method.eq_ignore_ascii_case("POST") {
            self.request.method = Method::Post;
            self.request.has_body = true;
        } else {
            return false;
        }

        if !version.eq_ignore_ascii_case("HTTP/1.1") {
            return false;
        }

        // Absolute-form targets: drop the scheme and host.
        let mut path = target;
        if let Some(rest) = strip_prefix_ci(path, "http://") {
            let Some(slash) = rest.find('/') else {
                return false;
            };
            path = &rest[slash..];
        } else if let Some(rest) = strip_prefix_ci(path, "https://") {
            let Some(slash) = rest.find('/') else {
                return false;
            };
            path = &rest[slash..];
        }
        if !path.starts_with('/') {
            return false;
        }

        self.request.target = if path == "/" {
            DEFAULT_LANDING_PAGE.to_string()
        } else {
            path.to_string()
        };
        self.phase = ParsePhase::Headers;
        true
    }

    fn parse_header(&mut self, line: &[u8]) -> HeaderLine {
        if line.is_empty() {
            // Blank line ends the header block.
            if self.request.content_length != 0 {
                return HeaderLine::BodyNext;
            }
            return HeaderLine::Done;
        }

        let Ok(text) = std::str::from_utf8(line) else {
            tracing::info!("unrecognized header (non-UTF-8)");
            return HeaderLine::More;
        };

        if let Some(value) = strip_prefix_ci(text, "Connection:") {
            self.request.keep_alive = value.trim().eq_ignore_ascii_case("keep-alive");
        } else if let Some(value) = strip_prefix_ci(text, "Content-Length:") {
            match value.trim().parse::<usize>() {
                Ok(n) => self.request.content_length = n,
                Err(_) => {
                    tracing::info!(value = value.trim(), "invalid Content-Length");
                    return HeaderLine::Bad;
                }
            }
        } else if let Some(value) = strip_prefix_ci(text, "Host:") {
            self.request.host = Some(value.trim().to_string());
        } else {
            // Headers are otherwise opaque.
            tracing::info!(header = text, "unrecognized header");
        }
        HeaderLine::More
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}
