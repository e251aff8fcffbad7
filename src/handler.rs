//! The request processor seam.
//!
//! The ingestion core hands a terminal request (fully assembled, or cut
//! short by an error status) to a [`Handler`], which produces the response
//! bytes. [`DefaultHandler`] covers what the original server did out of the
//! box: static files with index resolution, redirects, per-location method
//! enforcement and configured error pages. CGI mappings travel in the
//! [`Policy`] but executing interpreters is out of scope here.

use std::{io::ErrorKind, path::PathBuf};

use http::StatusCode;
use tracing::debug;

use crate::{
    config::Policy,
    response::Response,
    types::{Method, Request},
};

pub trait Handler {
    /// Produce a response for a terminal request. `status` is the outcome
    /// the ingestion state machine recorded (200 when parsing was clean);
    /// handlers must honor error statuses rather than re-interpret the
    /// request.
    fn handle(&mut self, req: &Request, status: StatusCode, policy: &Policy) -> Response;
}

impl<F> Handler for F
where
    F: FnMut(&Request, StatusCode, &Policy) -> Response,
{
    fn handle(&mut self, req: &Request, status: StatusCode, policy: &Policy) -> Response {
        self(req, status, policy)
    }
}

#[derive(Default)]
pub struct DefaultHandler;

impl Handler for DefaultHandler {
    fn handle(&mut self, req: &Request, status: StatusCode, policy: &Policy) -> Response {
        if status.is_client_error() || status.is_server_error() {
            return error_response(status, policy);
        }

        if let Some(target) = &policy.redirect {
            let mut res = Response::with_status(StatusCode::MOVED_PERMANENTLY);
            res.headers
                .append("location".into(), target.as_bytes().to_vec());
            return res;
        }

        if !policy.allows(&req.method) {
            let mut res = error_response(StatusCode::METHOD_NOT_ALLOWED, policy);
            res.headers.append("allow".into(), allow_value(policy));
            return res;
        }

        match req.method {
            Method::Get | Method::Head => serve_file(req, policy),
            Method::Post | Method::Put => echo(req),
            Method::Delete => delete_file(req, policy),
            Method::Options => {
                let mut res = Response::with_status(StatusCode::NO_CONTENT);
                res.headers.append("allow".into(), allow_value(policy));
                res
            }
            // ingestion already recorded 501 for these
            Method::Other(_) => error_response(StatusCode::NOT_IMPLEMENTED, policy),
        }
    }
}

fn allow_value(policy: &Policy) -> Vec<u8> {
    policy
        .allow_methods
        .iter()
        .map(|m| m.as_str())
        .collect::<Vec<_>>()
        .join(", ")
        .into_bytes()
}

/// Map the request path under the document root, rejecting traversal
fn resolve_path(req: &Request, policy: &Policy) -> Option<PathBuf> {
    let path = req.path();
    if path.split('/').any(|segment| segment == "..") {
        return None;
    }
    Some(policy.root.join(path.trim_start_matches('/')))
}

fn serve_file(req: &Request, policy: &Policy) -> Response {
    let Some(mut file_path) = resolve_path(req, policy) else {
        return error_response(StatusCode::FORBIDDEN, policy);
    };

    if file_path.is_dir() {
        match policy
            .index
            .iter()
            .map(|index| file_path.join(index))
            .find(|candidate| candidate.is_file())
        {
            Some(candidate) => file_path = candidate,
            None => return error_response(StatusCode::NOT_FOUND, policy),
        }
    }

    match std::fs::read(&file_path) {
        Ok(contents) => {
            let mut res = Response::with_status(StatusCode::OK);
            res.headers
                .append("content-type".into(), content_type(&file_path).into());
            if req.method == Method::Head {
                res.headers
                    .append("content-length".into(), contents.len().to_string().into_bytes());
            } else {
                res.body = contents;
            }
            res
        }
        Err(err) => {
            debug!(path = %file_path.display(), ?err, "could not serve file");
            error_response(io_status(&err), policy)
        }
    }
}

fn delete_file(req: &Request, policy: &Policy) -> Response {
    let Some(file_path) = resolve_path(req, policy) else {
        return error_response(StatusCode::FORBIDDEN, policy);
    };

    match std::fs::remove_file(&file_path) {
        Ok(()) => Response::with_status(StatusCode::NO_CONTENT),
        Err(err) => {
            debug!(path = %file_path.display(), ?err, "could not delete file");
            error_response(io_status(&err), policy)
        }
    }
}

/// POST/PUT: answer with the decoded body, which also exercises the body
/// ingestion path end to end
fn echo(req: &Request) -> Response {
    let mut res = Response::with_status(StatusCode::OK);
    let content_type = req
        .headers
        .get("content-type")
        .unwrap_or(&b"application/octet-stream"[..]);
    res.headers.append("content-type".into(), content_type.to_vec());
    res.body = req.body.to_vec();
    res
}

fn io_status(err: &std::io::Error) -> StatusCode {
    match err.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Error responses prefer the configured error page, falling back to the
/// builtin body
fn error_response(status: StatusCode, policy: &Policy) -> Response {
    let mut res = Response::with_status(status);
    res.headers
        .append("content-type".into(), b"text/html".to_vec());
    res.body = policy
        .error_page(status)
        .and_then(|page| std::fs::read(page).ok())
        .unwrap_or_else(|| Response::error_body(status));
    res
}

fn content_type(path: &std::path::Path) -> &'static [u8] {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => b"text/html",
        Some("css") => b"text/css",
        Some("js") => b"text/javascript",
        Some("json") => b"application/json",
        Some("txt") => b"text/plain",
        Some("png") => b"image/png",
        Some("jpg") | Some("jpeg") => b"image/jpeg",
        Some("svg") => b"image/svg+xml",
        _ => b"application/octet-stream",
    }
}
