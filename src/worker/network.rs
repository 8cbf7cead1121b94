use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use strum::{Display, EnumString, IntoStaticStr};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum RequestMode {
    /// Loading a full page document.
    Navigate,
    SameOrigin,
    #[default]
    NoCors,
    Cors,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub url: String,
    pub mode: RequestMode,
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mode: RequestMode::default(),
        }
    }

    pub fn navigate(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mode: RequestMode::Navigate,
        }
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum ResponseType {
    /// Same-origin response with readable headers and body.
    Basic,
    Cors,
    Opaque,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub kind: ResponseType,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn basic(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            kind: ResponseType::Basic,
            headers: vec![("content-type".into(), content_type.into())],
            body: body.into(),
        }
    }

    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Only complete same-origin responses are written to the cache.
    pub fn is_cacheable(&self) -> bool {
        self.status == 200 && self.kind == ResponseType::Basic
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("network unavailable")]
    Offline,

    #[error("{url} is not served by this origin")]
    Unreachable { url: String },

    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub trait Network {
    fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;
}

impl<T: Network + ?Sized> Network for Box<T> {
    fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
        (**self).fetch(request)
    }
}

/// Canonical cache key for `raw`.
///
/// Relative forms (`./x`, `x`, `/x`) collapse to `/x`, `./` to `/`, and
/// absolute URLs on `origin` are reduced to their path. Other absolute
/// URLs are kept whole. Fragments never take part in matching.
pub fn normalize_url(raw: &str, origin: &str) -> String {
    let raw = raw.split('#').next().unwrap_or_default().trim();
    let origin = origin.trim_end_matches('/');
    let local = match raw.strip_prefix(origin) {
        Some(rest) if !origin.is_empty() && (rest.is_empty() || rest.starts_with('/')) => rest,
        _ if raw.contains("://") => return raw.to_string(),
        _ => raw,
    };
    let mut path = local;
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    if path == "." {
        path = "";
    }
    let path = path.trim_start_matches('/');
    format!("/{path}")
}

/// Serves a directory as the page's own origin.
#[derive(Debug, Clone)]
pub struct StaticOrigin {
    origin: String,
    root: PathBuf,
}

impl StaticOrigin {
    pub fn new(origin: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            origin: origin.into(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, url: &str) -> Option<PathBuf> {
        let normalized = normalize_url(url, &self.origin);
        let path = normalized.strip_prefix('/')?;
        let path = path.split('?').next().unwrap_or_default();
        let mut relative = PathBuf::from(path);
        if path.is_empty() || path.ends_with('/') {
            relative.push("index.html");
        }
        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return None;
        }
        Some(self.root.join(relative))
    }
}

impl Network for StaticOrigin {
    fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
        let normalized = normalize_url(&request.url, &self.origin);
        if !normalized.starts_with('/') {
            return Err(NetworkError::Unreachable {
                url: request.url.clone(),
            });
        }
        let Some(path) = self.resolve(&request.url) else {
            return Ok(Response::basic(403, "text/plain", "Forbidden"));
        };
        match fs::read(&path) {
            Ok(body) => Ok(Response::basic(200, content_type(&path), body)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Ok(Response::basic(404, "text/plain", "Not Found"))
            }
            Err(source) => Err(NetworkError::Io { path, source }),
        }
    }
}

/// A network that is never reachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineNetwork;

impl Network for OfflineNetwork {
    fn fetch(&self, _request: &Request) -> Result<Response, NetworkError> {
        Err(NetworkError::Offline)
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("webmanifest") => "application/manifest+json",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}
