use crate::http::{
	Body, GRPC_CONTENT_TYPE, HeaderValue, Response, StatusCode, cors, header,
};

pub const GRPC_STATUS: &str = "grpc-status";
pub const GRPC_MESSAGE: &str = "grpc-message";

// INTERNAL; what L402-aware gRPC clients expect alongside the challenge.
const GRPC_CODE_PAYMENT_REQUIRED: &str = "13";
// UNAVAILABLE; the retryable code we settled on for throttled calls.
const GRPC_CODE_RATE_LIMITED: &str = "14";

const RATE_LIMITED_BODY: &str = "rate limit exceeded\n";

/// A 402 challenge carrying a fresh token and invoice. gRPC clients cannot
/// surface a 402, so they get a trailers-only response instead: a single
/// header block with the status in `grpc-status` and the challenge in the
/// initial metadata.
pub fn payment_required(challenge: HeaderValue, grpc: bool) -> Response {
	let mut resp = if grpc {
		trailers_only(GRPC_CODE_PAYMENT_REQUIRED, "payment required")
	} else {
		::http::Response::builder()
			.status(StatusCode::PAYMENT_REQUIRED)
			.body(Body::empty())
			.expect("static response must build")
	};
	resp.headers_mut().insert(header::WWW_AUTHENTICATE, challenge);
	cors::apply(resp.headers_mut());
	resp
}

pub fn rate_limited(retry_after_secs: u64, grpc: bool) -> Response {
	let mut resp = if grpc {
		trailers_only(GRPC_CODE_RATE_LIMITED, "rate limit exceeded")
	} else {
		::http::Response::builder()
			.status(StatusCode::TOO_MANY_REQUESTS)
			.body(Body::from(RATE_LIMITED_BODY))
			.expect("static response must build")
	};
	if let Ok(v) = HeaderValue::try_from(retry_after_secs.to_string()) {
		resp.headers_mut().insert(header::RETRY_AFTER, v);
	}
	cors::apply(resp.headers_mut());
	resp
}

/// A gRPC trailers-only response: HTTP 200 with the gRPC status carried in
/// the same header block and no message body.
fn trailers_only(code: &'static str, message: &'static str) -> Response {
	::http::Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, GRPC_CONTENT_TYPE)
		.header(GRPC_STATUS, code)
		.header(GRPC_MESSAGE, message)
		.body(Body::empty())
		.expect("static response must build")
}
