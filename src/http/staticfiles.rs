use std::path::{Component, Path, PathBuf};

use crate::http::{Body, HeaderValue, Response, StatusCode, header};
use crate::*;

/// Fallback file server for requests that match no proxied service.
#[derive(Debug, Clone)]
pub struct StaticServer {
	root: PathBuf,
}

impl StaticServer {
	pub fn new(root: PathBuf) -> StaticServer {
		StaticServer { root }
	}

	pub async fn serve(&self, path: &str) -> Response {
		let Some(relative) = sanitize(path) else {
			return not_found();
		};
		let mut target = self.root.join(relative);
		if target.is_dir() {
			target = target.join("index.html");
		}
		match tokio::fs::read(&target).await {
			Ok(contents) => {
				let mut resp = ::http::Response::builder()
					.status(StatusCode::OK)
					.body(Body::from(contents))
					.expect("static response must build");
				resp
					.headers_mut()
					.insert(header::CONTENT_TYPE, content_type(&target));
				resp
			},
			Err(e) => {
				debug!(path = %target.display(), err = %e, "static file not served");
				not_found()
			},
		}
	}
}

/// Strip the leading slash and refuse any path that tries to escape the
/// static root.
fn sanitize(path: &str) -> Option<PathBuf> {
	let trimmed = path.trim_start_matches('/');
	let relative = Path::new(trimmed);
	for component in relative.components() {
		match component {
			Component::Normal(_) => {},
			_ => return None,
		}
	}
	Some(relative.to_path_buf())
}

fn content_type(path: &Path) -> HeaderValue {
	let ext = path
		.extension()
		.and_then(|e| e.to_str())
		.unwrap_or_default();
	HeaderValue::from_static(match ext {
		"html" | "htm" => "text/html; charset=utf-8",
		"css" => "text/css",
		"js" => "application/javascript",
		"json" => "application/json",
		"png" => "image/png",
		"svg" => "image/svg+xml",
		"ico" => "image/x-icon",
		"txt" => "text/plain; charset=utf-8",
		_ => "application/octet-stream",
	})
}

fn not_found() -> Response {
	::http::Response::builder()
		.status(StatusCode::NOT_FOUND)
		.body(Body::empty())
		.expect("static response must build")
}
