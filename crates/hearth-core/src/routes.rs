// src/routes.rs
//
// URL rewrite table and the login/registration branch. The store pool is
// acquired only here, for the two dynamic targets, and released when the
// guard drops.

use std::path::Path;

use hearth_store::StorePool;

use crate::parse::Request;
use crate::response::{self, ResponseKind};

pub const REGISTER_PAGE: &str = "/register.html";
pub const LOGIN_PAGE: &str = "/log.html";
pub const WELCOME_PAGE: &str = "/welcome.html";
pub const LOGIN_ERROR_PAGE: &str = "/logError.html";
pub const REGISTER_ERROR_PAGE: &str = "/registerError.html";
pub const PICTURE_PAGE: &str = "/picture.html";
pub const VIDEO_PAGE: &str = "/video.html";
pub const FANS_PAGE: &str = "/fans.html";

/// Map a completed request to a concrete response: rewrite-table lookup
/// on the first path character, credential work for the dynamic
/// targets, then static-file resolution of whatever target remains.
pub fn resolve(req: &Request, doc_root: &Path, store: &StorePool) -> ResponseKind {
    let flag = req.target.chars().nth(1);
    let target: &str = match flag {
        Some('2') if req.has_body => check_login(req, store),
        Some('3') if req.has_body => check_registration(req, store),
        Some('0') => REGISTER_PAGE,
        Some('1') => LOGIN_PAGE,
        Some('5') => PICTURE_PAGE,
        Some('6') => VIDEO_PAGE,
        Some('7') => FANS_PAGE,
        _ => req.target.as_str(),
    };
    if target != req.target {
        tracing::info!(from = %req.target, to = target, "target rewritten");
    }
    response::resolve_file(doc_root, target)
}

fn check_login(req: &Request, store: &StorePool) -> &'static str {
    let Some((user, passwd)) = parse_credentials(&req.body) else {
        tracing::info!("login request without parsable credentials");
        return LOGIN_ERROR_PAGE;
    };
    let conn = match store.acquire() {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!(error = %e, "credential store unavailable");
            return LOGIN_ERROR_PAGE;
        }
    };
    match conn.verify(&user, &passwd) {
        Ok(true) => {
            tracing::info!(user = %user, "login accepted");
            WELCOME_PAGE
        }
        Ok(false) => {
            tracing::info!(user = %user, "login rejected");
            LOGIN_ERROR_PAGE
        }
        Err(e) => {
            tracing::error!(user = %user, error = %e, "credential lookup failed");
            LOGIN_ERROR_PAGE
        }
    }
}

fn check_registration(req: &Request, store: &StorePool) -> &'static str {
    let Some((user, passwd)) = parse_credentials(&req.body) else {
        tracing::info!("registration request without parsable credentials");
        return REGISTER_ERROR_PAGE;
    };
    let conn = match store.acquire() {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!(error = %e, "credential store unavailable");
            return REGISTER_ERROR_PAGE;
        }
    };
    match conn.register(&user, &passwd) {
        Ok(true) => {
            tracing::info!(user = %user, "user registered");
            LOGIN_PAGE
        }
        Ok(false) => {
            tracing::info!(user = %user, "username already taken");
            REGISTER_ERROR_PAGE
        }
        Err(e) => {
            tracing::error!(user = %user, error = %e, "registration insert failed");
            REGISTER_ERROR_PAGE
        }
    }
}

/// Body format: `user=<name>&passwd=<password>`.
fn parse_credentials(body: &[u8]) -> Option<(String, String)> {
    let text = std::str::from_utf8(body).ok()?;
    let mut user = None;
    let mut passwd = None;
    for field in text.split('&') {
        if let Some(v) = field.strip_prefix("user=") {
            user = Some(v.to_string());
        } else if let Some(v) = field.strip_prefix("passwd=") {
            passwd = Some(v.to_string());
        }
    }
    Some((user?, passwd?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::Method;
    use hearth_store::MemoryBackend;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    const PAGES: &[&str] = &[
        "judge.html",
        "register.html",
        "log.html",
        "welcome.html",
        "logError.html",
        "registerError.html",
        "picture.html",
        "video.html",
        "fans.html",
        "plain.html",
    ];

    fn doc_root() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for page in PAGES {
            fs::write(dir.path().join(page), format!("<html>{}</html>", page)).unwrap();
        }
        dir
    }

    fn store() -> StorePool {
        StorePool::new(
            Arc::new(MemoryBackend::with_users([("alice", "secret")])),
            2,
        )
        .unwrap()
    }

    fn request(method: Method, target: &str, body: &[u8]) -> Request {
        Request {
            method,
            target: target.to_string(),
            has_body: method == Method::Post,
            body: body.to_vec(),
            ..Request::default()
        }
    }

    fn resolved_page(kind: ResponseKind) -> PathBuf {
        match kind {
            ResponseKind::File(path, _) => path,
            other => panic!("expected a file, got {:?}", other),
        }
    }

    #[test]
    fn static_rewrite_table() {
        let root = doc_root();
        let store = store();
        for (flag, page) in [
            ("/0", "register.html"),
            ("/1", "log.html"),
            ("/5", "picture.html"),
            ("/6", "video.html"),
            ("/7", "fans.html"),
        ] {
            let req = request(Method::Get, flag, b"");
            let path = resolved_page(resolve(&req, root.path(), &store));
            assert!(path.ends_with(page), "{} -> {:?}", flag, path);
        }
    }

    #[test]
    fn literal_targets_bypass_the_table() {
        let root = doc_root();
        let store = store();
        let req = request(Method::Get, "/plain.html", b"");
        let path = resolved_page(resolve(&req, root.path(), &store));
        assert!(path.ends_with("plain.html"));
    }

    #[test]
    fn get_on_a_check_target_is_literal() {
        // Without a body the `2`/`3` flags are ordinary paths.
        let root = doc_root();
        let store = store();
        let req = request(Method::Get, "/2whatever", b"");
        assert_eq!(resolve(&req, root.path(), &store), ResponseKind::NoResource);
    }

    #[test]
    fn login_success_and_failure_pages() {
        let root = doc_root();
        let store = store();

        let ok = request(Method::Post, "/2check", b"user=alice&passwd=secret");
        assert!(resolved_page(resolve(&ok, root.path(), &store)).ends_with("welcome.html"));

        let bad = request(Method::Post, "/2check", b"user=alice&passwd=wrong");
        assert!(resolved_page(resolve(&bad, root.path(), &store)).ends_with("logError.html"));

        let garbled = request(Method::Post, "/2check", b"not-credentials");
        assert!(resolved_page(resolve(&garbled, root.path(), &store)).ends_with("logError.html"));
    }

    #[test]
    fn registration_inserts_once() {
        let root = doc_root();
        let store = store();

        let new = request(Method::Post, "/3check", b"user=bob&passwd=hunter2");
        assert!(resolved_page(resolve(&new, root.path(), &store)).ends_with("log.html"));

        // Second registration of the same name conflicts.
        assert!(
            resolved_page(resolve(&new, root.path(), &store)).ends_with("registerError.html")
        );

        // And the new user can now log in.
        let login = request(Method::Post, "/2check", b"user=bob&passwd=hunter2");
        assert!(resolved_page(resolve(&login, root.path(), &store)).ends_with("welcome.html"));
    }

    #[test]
    fn store_handles_are_released_after_resolution() {
        let root = doc_root();
        let store = store();
        for _ in 0..8 {
            let req = request(Method::Post, "/2check", b"user=alice&passwd=secret");
            let _ = resolve(&req, root.path(), &store);
        }
        // More resolutions than handles: all of them came back.
        assert_eq!(store.free_handles(), store.size());
    }
}
