use crate::http::{Body, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, header};

const ALLOW_ORIGIN: HeaderValue = HeaderValue::from_static("*");
const ALLOW_METHODS: HeaderValue = HeaderValue::from_static("GET, POST, OPTIONS, PUT, DELETE");
const ALLOW_HEADERS: HeaderValue = HeaderValue::from_static("*");

/// Browser clients must be able to read challenges and rate-limit hints, so
/// every response the proxy synthesizes carries the permissive CORS set.
pub fn apply(headers: &mut HeaderMap) {
	headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, ALLOW_ORIGIN);
	headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, ALLOW_METHODS);
}

pub fn is_preflight(req: &Request) -> bool {
	req.method() == Method::OPTIONS
		&& req.headers().contains_key(header::ORIGIN)
		&& req
			.headers()
			.contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
}

pub fn preflight_response() -> Response {
	let mut resp = ::http::Response::builder()
		.status(StatusCode::OK)
		.header(header::ACCESS_CONTROL_ALLOW_HEADERS, ALLOW_HEADERS)
		.body(Body::empty())
		.expect("static response must build");
	apply(resp.headers_mut());
	resp
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn preflight_detection() {
		let req = ::http::Request::builder()
			.method(Method::OPTIONS)
			.uri("http://svc/foo")
			.header(header::ORIGIN, "https://app.example.com")
			.header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
			.body(Body::empty())
			.unwrap();
		assert!(is_preflight(&req));

		let plain_options = ::http::Request::builder()
			.method(Method::OPTIONS)
			.uri("http://svc/foo")
			.body(Body::empty())
			.unwrap();
		assert!(!is_preflight(&plain_options));
	}

	#[test]
	fn preflight_allows_all_methods() {
		let resp = preflight_response();
		assert_eq!(resp.status(), StatusCode::OK);
		assert_eq!(
			resp
				.headers()
				.get(header::ACCESS_CONTROL_ALLOW_METHODS)
				.unwrap(),
			"GET, POST, OPTIONS, PUT, DELETE"
		);
		assert_eq!(
			resp
				.headers()
				.get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
				.unwrap(),
			"*"
		);
	}
}
