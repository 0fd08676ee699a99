// src/response.rs
//
// Response formatting and static-file resolution. A response is at most
// two send segments: the formatted header buffer and, for non-empty
// files, a read-only mapping of the file itself.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::buf::{WriteBuf, WriteOverflow};
use crate::syscalls::{self, MappedFile};

pub const ERROR_400_BODY: &str =
    "Your request has bad syntax or is inherently impossible to satisfy.\n";
pub const ERROR_403_BODY: &str =
    "You do not have permission to get file from this server.\n";
pub const ERROR_404_BODY: &str = "The requested file was not found on this server.\n";
pub const ERROR_500_BODY: &str = "There was an unusual problem serving the requested file.\n";
const EMPTY_FILE_BODY: &str = "<html><body></body></html>";

/// What a completed request resolved to, before formatting.
#[derive(Debug, PartialEq, Eq)]
pub enum ResponseKind {
    /// A world-readable regular file of the given size.
    File(PathBuf, u64),
    NoResource,
    Forbidden,
    BadRequest,
    InternalError,
}

/// Resolve `target` under the document root: missing -> 404 kind,
/// not world-readable -> 403, directory -> 400, else the file.
pub fn resolve_file(doc_root: &Path, target: &str) -> ResponseKind {
    let path = doc_root.join(target.trim_start_matches('/'));
    match syscalls::stat_path(&path) {
        Err(_) => {
            tracing::info!(path = %path.display(), "resource not found");
            ResponseKind::NoResource
        }
        Ok(st) if !st.world_readable() => {
            tracing::info!(path = %path.display(), "resource not world-readable");
            ResponseKind::Forbidden
        }
        Ok(st) if st.is_dir() => {
            tracing::info!(path = %path.display(), "resource is a directory");
            ResponseKind::BadRequest
        }
        Ok(st) => ResponseKind::File(path, st.size),
    }
}

/// Format the response for `kind` into `wbuf` and return the mapped
/// file segment, if any. An unmappable file degrades to a 500.
pub fn build(
    kind: ResponseKind,
    keep_alive: bool,
    wbuf: &mut WriteBuf,
) -> Result<Option<MappedFile>, WriteOverflow> {
    match kind {
        ResponseKind::File(path, size) if size > 0 => {
            match MappedFile::open(&path, size as usize) {
                Ok(map) => {
                    status_line(wbuf, 200, "OK")?;
                    common_headers(wbuf, map.len(), keep_alive)?;
                    Ok(Some(map))
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "mmap failed");
                    inline(wbuf, 500, "Internal Error", ERROR_500_BODY, keep_alive)?;
                    Ok(None)
                }
            }
        }
        ResponseKind::File(_, _) => {
            // Zero-length file: nothing to map, send a stub body.
            inline(wbuf, 200, "OK", EMPTY_FILE_BODY, keep_alive)?;
            Ok(None)
        }
        ResponseKind::NoResource => {
            inline(wbuf, 404, "Not Found", ERROR_404_BODY, keep_alive)?;
            Ok(None)
        }
        ResponseKind::Forbidden => {
            inline(wbuf, 403, "Forbidden", ERROR_403_BODY, keep_alive)?;
            Ok(None)
        }
        ResponseKind::BadRequest => {
            inline(wbuf, 400, "Bad Request", ERROR_400_BODY, keep_alive)?;
            Ok(None)
        }
        ResponseKind::InternalError => {
            inline(wbuf, 500, "Internal Error", ERROR_500_BODY, keep_alive)?;
            Ok(None)
        }
    }
}

fn status_line(wbuf: &mut WriteBuf, code: u16, title: &str) -> Result<(), WriteOverflow> {
    write!(wbuf, "HTTP/1.1 {} {}\r\n", code, title).map_err(|_| WriteOverflow)
}

fn common_headers(
    wbuf: &mut WriteBuf,
    content_length: usize,
    keep_alive: bool,
) -> Result<(), WriteOverflow> {
    write!(
        wbuf,
        "Date: {}\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n",
        httpdate::fmt_http_date(SystemTime::now()),
        content_length,
        if keep_alive { "keep-alive" } else { "close" },
    )
    .map_err(|_| WriteOverflow)
}

fn inline(
    wbuf: &mut WriteBuf,
    code: u16,
    title: &str,
    body: &str,
    keep_alive: bool,
) -> Result<(), WriteOverflow> {
    status_line(wbuf, code, title)?;
    common_headers(wbuf, body.len(), keep_alive)?;
    wbuf.push_bytes(body.as_bytes())
}
