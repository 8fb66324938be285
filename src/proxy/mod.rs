pub mod gateway;
pub mod httpproxy;

use crate::http::{Body, HeaderValue, Response, StatusCode, challenge, cors};
use crate::*;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("blocked")]
	Blocked,
	#[error("service not found")]
	ServiceNotFound,
	#[error("rate limit exceeded")]
	RateLimited { retry_after: Duration },
	#[error("payment required")]
	PaymentRequired { challenge: HeaderValue },
	#[error("challenge construction failed: {0}")]
	MintFailed(String),
	#[error("upstream call failed: {0}")]
	BackendUnavailable(String),
	#[error("invalid request")]
	InvalidRequest,
}

impl ProxyError {
	/// Terminal encoding of the pipeline outcome. gRPC clients get the
	/// trailers-only shapes; everyone else gets plain status codes. Either
	/// way the response is readable from a browser.
	pub fn into_response(self, grpc: bool) -> Response {
		match self {
			ProxyError::PaymentRequired { challenge } => {
				return challenge::payment_required(challenge, grpc);
			},
			ProxyError::RateLimited { retry_after } => {
				return challenge::rate_limited(
					crate::http::ratelimit::retry_after_secs(retry_after),
					grpc,
				);
			},
			_ => {},
		}

		let status = match &self {
			ProxyError::Blocked => StatusCode::FORBIDDEN,
			ProxyError::ServiceNotFound => StatusCode::NOT_FOUND,
			ProxyError::MintFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
			ProxyError::BackendUnavailable(_) => StatusCode::BAD_GATEWAY,
			ProxyError::InvalidRequest => StatusCode::BAD_REQUEST,
			ProxyError::PaymentRequired { .. } | ProxyError::RateLimited { .. } => {
				unreachable!("handled above")
			},
		};

		let mut resp = if grpc && matches!(self, ProxyError::BackendUnavailable(_)) {
			// gRPC clients need the failure in the grpc-status trailer, not an
			// HTTP status they will ignore.
			::http::Response::builder()
				.status(StatusCode::OK)
				.header(::http::header::CONTENT_TYPE, crate::http::GRPC_CONTENT_TYPE)
				.header(challenge::GRPC_STATUS, "14")
				.header(challenge::GRPC_MESSAGE, "upstream unavailable")
				.body(Body::empty())
				.expect("static response must build")
		} else {
			::http::Response::builder()
				.status(status)
				.body(Body::from(format!("{self}\n")))
				.expect("static response must build")
		};
		cors::apply(resp.headers_mut());
		resp
	}
}
