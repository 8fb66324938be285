use arc_swap::ArcSwap;
use ipnet::IpNet;

use crate::auth::{Authenticator, l402};
use crate::http::staticfiles::StaticServer;
use crate::http::{HeaderName, HeaderValue, Request, Response, Scheme, cors, header};
use crate::proxy::ProxyError;
use crate::types::service::{CompileOpts, Service, ServiceRegistry, ServiceSerde};
use crate::*;

#[cfg(test)]
#[path = "httpproxy_test.rs"]
mod tests;

/// Everything the request handlers share. The registry is a snapshot behind
/// an atomic swap: `update_services` replaces it wholesale while in-flight
/// requests keep the snapshot they loaded.
pub struct ProxyInputs {
	registry: ArcSwap<ServiceRegistry>,
	compile_opts: CompileOpts,
	pub authenticator: Arc<dyn Authenticator>,
	pub blocklist: Vec<IpNet>,
	pub static_server: Option<StaticServer>,
}

impl ProxyInputs {
	pub fn new(
		registry: ServiceRegistry,
		compile_opts: CompileOpts,
		authenticator: Arc<dyn Authenticator>,
		blocklist: Vec<IpNet>,
		static_server: Option<StaticServer>,
	) -> ProxyInputs {
		ProxyInputs {
			registry: ArcSwap::from_pointee(registry),
			compile_opts,
			authenticator,
			blocklist,
			static_server,
		}
	}

	/// Validate and atomically install a new service set.
	pub fn update_services(&self, raw: Vec<ServiceSerde>) -> anyhow::Result<()> {
		let compiled = ServiceRegistry::compile(raw, &self.compile_opts)?;
		self.registry.store(Arc::new(compiled));
		Ok(())
	}

	pub fn registry(&self) -> Arc<ServiceRegistry> {
		self.registry.load_full()
	}
}

#[derive(Clone)]
pub struct HttpProxy {
	inputs: Arc<ProxyInputs>,
}

impl HttpProxy {
	pub fn new(inputs: Arc<ProxyInputs>) -> HttpProxy {
		HttpProxy { inputs }
	}

	/// Run one request through the admission pipeline and encode the outcome.
	/// This never retries; retrying a denied or failed request is the
	/// client's call.
	pub async fn handle(&self, peer: IpAddr, req: Request) -> Response {
		let start = Instant::now();
		let grpc = crate::http::is_grpc(req.headers());
		let method = req.method().clone();
		let path = req.uri().path().to_string();

		let result = self.handle_internal(peer, req).await;
		let error = result.as_ref().err().map(|e| e.to_string());
		let resp = match result {
			Ok(resp) => resp,
			Err(e) => e.into_response(grpc),
		};
		tracing::event!(
			target: "request",
			tracing::Level::INFO,
			src = %peer,
			http.method = %method,
			http.path = %path,
			http.status = resp.status().as_u16(),
			grpc = grpc,
			error = error.as_deref(),
			duration = ?start.elapsed(),
		);
		resp
	}

	async fn handle_internal(&self, peer: IpAddr, mut req: Request) -> Result<Response, ProxyError> {
		crate::http::normalize_uri(&mut req).map_err(|_| ProxyError::InvalidRequest)?;

		if self.inputs.blocklist.iter().any(|net| net.contains(&peer)) {
			return Err(ProxyError::Blocked);
		}

		let host = crate::http::get_host(&req)?.to_string();
		let path = req.uri().path().to_string();

		let registry = self.inputs.registry();
		let Some(svc) = registry.match_service(&host, &path) else {
			if let Some(static_server) = &self.inputs.static_server {
				return Ok(static_server.serve(&path).await);
			}
			return Err(ProxyError::ServiceNotFound);
		};
		debug!(service = %svc.name, %host, %path, "matched service");

		// Browsers probe with a preflight before ever sending a token; answer
		// it here so the challenge below stays reachable for them.
		if cors::is_preflight(&req) {
			return Ok(cors::preflight_response());
		}

		if svc.is_whitelisted(&path) {
			return self.forward(&svc, req).await;
		}

		let identity = l402::client_identity(req.headers());
		if let Err(delay) = svc.check_rate_limit(&path, &identity) {
			return Err(ProxyError::RateLimited { retry_after: delay });
		}

		if svc.auth.enabled() {
			let accepted = self
				.inputs
				.authenticator
				.accept(req.headers(), &svc.name)
				.await;
			if !accepted {
				// A freebie quota admits tokenless clients until it runs dry;
				// after that they get the normal challenge.
				let free_ride = svc
					.freebie
					.as_ref()
					.map(|store| store.try_consume(peer))
					.unwrap_or(false);
				if !free_ride {
					return Err(self.challenge(&svc, &path).await);
				}
				debug!(service = %svc.name, %peer, "freebie admitted");
			}
		}

		self.forward(&svc, req).await
	}

	/// Mint a fresh challenge for the denied request. Pricing failures fail
	/// the challenge itself; nothing is forwarded.
	async fn challenge(&self, svc: &Service, path: &str) -> ProxyError {
		let price = if svc.skips_invoice(path) {
			0
		} else {
			match svc.pricer.get_price(path).await {
				Ok(price) => price,
				Err(e) => return ProxyError::MintFailed(e.to_string()),
			}
		};
		let target = svc.mint_target(price);
		let challenge = match self.inputs.authenticator.fresh_challenge(&target).await {
			Ok(ch) => ch,
			Err(e) => return ProxyError::MintFailed(e.to_string()),
		};
		match challenge.to_header_value() {
			Ok(header) => ProxyError::PaymentRequired { challenge: header },
			Err(e) => ProxyError::MintFailed(e.to_string()),
		}
	}

	async fn forward(&self, svc: &Service, mut req: Request) -> Result<Response, ProxyError> {
		direct(svc, &mut req)?;
		let call = crate::client::call(svc, req);
		match svc.timeout {
			Some(deadline) => tokio::time::timeout(deadline, call)
				.await
				.map_err(|_| ProxyError::BackendUnavailable("request timed out".to_string()))?,
			None => call.await,
		}
	}
}

// Hop-by-hop headers. These are removed when sent to the backend.
static HOP_HEADERS: [HeaderName; 9] = [
	header::CONNECTION,
	// non-standard but still sent by libcurl and rejected by e.g. google
	HeaderName::from_static("proxy-connection"),
	HeaderName::from_static("keep-alive"),
	header::PROXY_AUTHENTICATE,
	header::PROXY_AUTHORIZATION,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
	header::UPGRADE,
];

/// Rewrite the request for its backend: scheme and authority from the
/// service, configured headers overwriting whatever the client sent, and the
/// client's `Authorization` stripped. A service that wants the header
/// upstream injects its own via `headers`.
fn direct(svc: &Service, req: &mut Request) -> Result<(), ProxyError> {
	let scheme = match svc.protocol {
		crate::types::service::Protocol::Https => Scheme::HTTPS,
		crate::types::service::Protocol::Http => Scheme::HTTP,
	};
	let authority = svc
		.address
		.parse::<crate::http::Authority>()
		.map_err(|_| ProxyError::BackendUnavailable(format!("invalid address {}", svc.address)))?;
	crate::http::modify_req_uri(req, |parts| {
		parts.scheme = Some(scheme);
		parts.authority = Some(authority);
		if parts.path_and_query.is_none() {
			parts.path_and_query = Some(crate::http::uri::PathAndQuery::from_static("/"));
		}
		Ok(())
	})
	.map_err(|_| ProxyError::InvalidRequest)?;

	// gRPC needs `te: trailers` to survive the hop-by-hop sweep
	let te_trailers = req
		.headers()
		.get(header::TE)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.contains("trailers"))
		.unwrap_or(false);
	for h in HOP_HEADERS.iter() {
		req.headers_mut().remove(h);
	}
	if te_trailers {
		req
			.headers_mut()
			.insert(header::TE, HeaderValue::from_static("trailers"));
	}

	req.headers_mut().remove(header::AUTHORIZATION);
	for (name, value) in &svc.headers {
		req.headers_mut().insert(name.clone(), value.clone());
	}
	Ok(())
}
