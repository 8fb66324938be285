pub mod challenge;
pub mod cors;
pub mod ratelimit;
pub mod staticfiles;

pub type Error = axum_core::Error;
pub type Body = axum_core::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;
pub use ::http::uri::{Authority, Scheme};
pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, uri};

use crate::proxy::ProxyError;

pub const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// gRPC requests are detected by their content type; the value may carry a
/// codec suffix such as `application/grpc+proto`.
pub fn is_grpc(headers: &HeaderMap) -> bool {
	headers
		.get(header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.starts_with(GRPC_CONTENT_TYPE))
		.unwrap_or(false)
}

pub fn get_host(req: &Request) -> Result<&str, ProxyError> {
	// We expect a normalized request, so this will always be in the URI
	let host = req.uri().host().ok_or(ProxyError::InvalidRequest)?;
	Ok(strip_port(host))
}

pub fn modify_req_uri(
	req: &mut Request,
	f: impl FnOnce(&mut uri::Parts) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
	let nreq = std::mem::take(req);
	let (mut head, body) = nreq.into_parts();
	let mut parts = head.uri.into_parts();
	f(&mut parts)?;
	head.uri = Uri::from_parts(parts)?;
	*req = Request::from_parts(head, body);
	Ok(())
}

// copied from private `http` method
fn strip_port(auth: &str) -> &str {
	let host_port = auth
		.rsplit('@')
		.next()
		.expect("split always has at least 1 item");

	if host_port.as_bytes()[0] == b'[' {
		let i = host_port
			.find(']')
			.expect("parsing should validate brackets");
		&host_port[0..i + 1]
	} else {
		host_port
			.split(':')
			.next()
			.expect("split always has at least 1 item")
	}
}

// The http library will not put the authority into req.uri().authority for
// HTTP/1. Normalize so the rest of the code doesn't need to worry about it.
pub fn normalize_uri(req: &mut Request) -> anyhow::Result<()> {
	if let ::http::Version::HTTP_10 | ::http::Version::HTTP_11 = req.version() {
		if req.uri().authority().is_none() {
			let host = req
				.headers()
				.get(header::HOST)
				.and_then(|h| h.to_str().ok())
				.and_then(|h| h.parse::<Authority>().ok())
				.ok_or_else(|| anyhow::anyhow!("no authority or host"))?;
			req.headers_mut().remove(header::HOST);
			modify_req_uri(req, |parts| {
				parts.authority = Some(host);
				if parts.scheme.is_none() {
					parts.scheme = Some(Scheme::HTTP);
				}
				if parts.path_and_query.is_none() {
					parts.path_and_query = Some(uri::PathAndQuery::from_static("/"));
				}
				Ok(())
			})?;
		}
	}
	Ok(())
}
