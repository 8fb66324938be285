use std::convert::Infallible;

use bitcoin_hashes::sha256;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use ipnet::IpNet;
use macaroon::Format;
use regex::Regex;

use super::*;
use crate::*;
use crate::auth::l402::Preimage;
use crate::auth::{
	AuthError, Challenge, InvoiceChecker, InvoiceStatus, L402Authenticator, Minter, MockAuthenticator,
};
use crate::http::ratelimit::RateLimitSerde;
use crate::http::{Body, StatusCode, challenge};
use crate::mint::{InvoiceIssuer, MacaroonMinter};
use crate::types::service::{AuthLevel, Protocol};

const PEER: &str = "203.0.113.9";
const BACKEND_BODY: &str = "HTTP Hello";

async fn spawn_backend() -> SocketAddr {
	spawn_backend_with_delay(Duration::ZERO).await
}

/// Minimal echo backend: replies with a fixed body and mirrors a few request
/// details into response headers so tests can observe what was forwarded.
async fn spawn_backend_with_delay(delay: Duration) -> SocketAddr {
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else {
				break;
			};
			tokio::spawn(async move {
				let service = hyper::service::service_fn(
					move |req: ::http::Request<hyper::body::Incoming>| async move {
						if !delay.is_zero() {
							tokio::time::sleep(delay).await;
						}
						let auth = req
							.headers()
							.get("authorization")
							.and_then(|v| v.to_str().ok())
							.unwrap_or("none")
							.to_string();
						let injected = req
							.headers()
							.get("x-injected")
							.and_then(|v| v.to_str().ok())
							.unwrap_or("none")
							.to_string();
						let resp = ::http::Response::builder()
							.status(StatusCode::OK)
							.header("x-echo-path", req.uri().path())
							.header("x-echo-auth", auth)
							.header("x-echo-injected", injected)
							.body(Full::new(Bytes::from(BACKEND_BODY)))
							.unwrap();
						Ok::<_, Infallible>(resp)
					},
				);
				let _ = hyper::server::conn::http1::Builder::new()
					.serve_connection(TokioIo::new(stream), service)
					.await;
			});
		}
	});
	addr
}

fn service_for(backend: SocketAddr) -> ServiceSerde {
	ServiceSerde {
		name: "test-service".to_string(),
		address: backend.to_string(),
		protocol: Protocol::Http,
		tls_cert_path: None,
		host_regexp: Regex::new("^proxy.test$").unwrap(),
		path_regexp: None,
		auth: AuthLevel::On,
		auth_whitelist_paths: vec![],
		auth_skip_invoice_creation_paths: vec![],
		headers: HashMap::new(),
		timeout: None,
		capabilities: vec![],
		constraints: HashMap::new(),
		price: 100,
		dynamic_price: None,
		rate_limits: vec![],
	}
}

fn proxy_with(raw: Vec<ServiceSerde>, authenticator: Arc<dyn Authenticator>) -> HttpProxy {
	proxy_with_blocklist(raw, authenticator, vec![])
}

fn proxy_with_blocklist(
	raw: Vec<ServiceSerde>,
	authenticator: Arc<dyn Authenticator>,
	blocklist: Vec<IpNet>,
) -> HttpProxy {
	let opts = CompileOpts::default();
	let registry = ServiceRegistry::compile(raw, &opts).unwrap();
	HttpProxy::new(Arc::new(ProxyInputs::new(
		registry,
		opts,
		authenticator,
		blocklist,
		None,
	)))
}

fn request(uri: &str, headers: &[(&str, &str)]) -> Request {
	let mut rb = ::http::Request::builder().method(::http::Method::GET).uri(uri);
	for (name, value) in headers {
		rb = rb.header(*name, *value);
	}
	rb.body(Body::empty()).unwrap()
}

fn peer() -> IpAddr {
	PEER.parse().unwrap()
}

async fn body_string(resp: Response) -> String {
	let bytes = resp.into_body().collect().await.unwrap().to_bytes();
	String::from_utf8(bytes.to_vec()).unwrap()
}

fn header<'a>(resp: &'a Response, name: &str) -> &'a str {
	resp
		.headers()
		.get(name)
		.map(|v| v.to_str().unwrap())
		.unwrap_or("")
}

struct FakeIssuer {
	payment_hash: sha256::Hash,
}

#[async_trait::async_trait]
impl InvoiceIssuer for FakeIssuer {
	async fn add_invoice(&self, _memo: &str, _amount_sat: u64) -> anyhow::Result<(String, Vec<u8>)> {
		use bitcoin_hashes::Hash;
		Ok((
			"lnbcrt1fakeinvoice".to_string(),
			self.payment_hash.into_inner().to_vec(),
		))
	}
}

/// An invoice checker whose lookups always fail, as when the node is
/// unreachable or the invoice is unknown.
struct FailingChecker;

#[async_trait::async_trait]
impl InvoiceChecker for FailingChecker {
	async fn verify_invoice_status(
		&self,
		_payment_hash: sha256::Hash,
		_expected: InvoiceStatus,
		_timeout: Duration,
	) -> Result<(), AuthError> {
		Err(AuthError::InvoiceNotSettled("nope".to_string()))
	}
}

async fn l402_header(minter: &MacaroonMinter, preimage: &Preimage) -> String {
	let target = crate::auth::MintTarget {
		service: "test-service".to_string(),
		price: 100,
		capabilities: vec![],
		constraints: HashMap::new(),
	};
	let (mac, _) = minter.mint_l402(&target).await.unwrap();
	format!(
		"LSAT {}:{}",
		mac.serialize(Format::V2).unwrap(),
		preimage.to_hex()
	)
}

#[tokio::test]
async fn whitelisted_path_forwards_without_auth() {
	let backend = spawn_backend().await;
	let mut svc = service_for(backend);
	svc.auth_whitelist_paths = vec![Regex::new("^/http/white.*$").unwrap()];
	let proxy = proxy_with(vec![svc], Arc::new(MockAuthenticator));

	let resp = proxy
		.handle(peer(), request("http://proxy.test/http/white", &[]))
		.await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(body_string(resp).await, BACKEND_BODY);
}

#[tokio::test]
async fn missing_token_gets_a_challenge() {
	let backend = spawn_backend().await;
	let proxy = proxy_with(vec![service_for(backend)], Arc::new(MockAuthenticator));

	let resp = proxy
		.handle(peer(), request("http://proxy.test/http/test", &[]))
		.await;
	assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
	let www = header(&resp, "www-authenticate").to_string();
	assert!(www.starts_with("LSAT macaroon="));
	assert!(Challenge::parse_header(&www).is_some());
	assert_eq!(header(&resp, "access-control-allow-origin"), "*");
	assert_eq!(body_string(resp).await, "");
}

#[tokio::test]
async fn valid_token_is_forwarded_without_its_authorization_header() {
	let backend = spawn_backend().await;
	let mut svc = service_for(backend);
	svc.headers = HashMap::from([("X-Injected".to_string(), "from-config".to_string())]);
	let proxy = proxy_with(vec![svc], Arc::new(MockAuthenticator));

	let mac_header = {
		let preimage = Preimage([5u8; 32]);
		let minter = MacaroonMinter::new(
			[7u8; 32],
			"tollgate".to_string(),
			Arc::new(FakeIssuer {
				payment_hash: preimage.payment_hash(),
			}),
		);
		l402_header(&minter, &preimage).await
	};
	let resp = proxy
		.handle(
			peer(),
			request(
				"http://proxy.test/http/test",
				&[
					("authorization", mac_header.as_str()),
					("x-injected", "from-client"),
				],
			),
		)
		.await;
	assert_eq!(resp.status(), StatusCode::OK);
	// stripped before forwarding, and config headers overwrite the client's
	assert_eq!(header(&resp, "x-echo-auth"), "none");
	assert_eq!(header(&resp, "x-echo-injected"), "from-config");
	assert_eq!(header(&resp, "x-echo-path"), "/http/test");
}

#[tokio::test]
async fn second_request_within_window_is_rate_limited() {
	let backend = spawn_backend().await;
	let mut svc = service_for(backend);
	svc.auth = AuthLevel::Off;
	svc.rate_limits = vec![RateLimitSerde {
		path_regex: Regex::new("^/http/limited.*$").unwrap(),
		requests: 1,
		per: Duration::from_millis(500),
		burst: 1,
	}];
	let proxy = proxy_with(vec![svc], Arc::new(MockAuthenticator));
	let uri = "http://proxy.test/http/limited";

	let resp = proxy.handle(peer(), request(uri, &[])).await;
	assert_eq!(resp.status(), StatusCode::OK);

	let resp = proxy.handle(peer(), request(uri, &[])).await;
	assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
	assert_eq!(header(&resp, "retry-after"), "1");
	assert_eq!(header(&resp, "access-control-allow-origin"), "*");
	assert_eq!(body_string(resp).await, "rate limit exceeded\n");

	// other paths on the same service are not throttled
	let resp = proxy
		.handle(peer(), request("http://proxy.test/http/other", &[]))
		.await;
	assert_eq!(resp.status(), StatusCode::OK);

	// once the window passes, the path admits again
	tokio::time::sleep(Duration::from_millis(600)).await;
	let resp = proxy.handle(peer(), request(uri, &[])).await;
	assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn identities_are_rate_limited_independently() {
	let backend = spawn_backend().await;
	let mut svc = service_for(backend);
	svc.rate_limits = vec![RateLimitSerde {
		path_regex: Regex::new("^/http/limited.*$").unwrap(),
		requests: 1,
		per: Duration::from_secs(5),
		burst: 1,
	}];
	let proxy = proxy_with(vec![svc], Arc::new(MockAuthenticator));
	let uri = "http://proxy.test/http/limited";

	let preimage_a = Preimage([0xaa; 32]);
	let preimage_b = Preimage([0xbb; 32]);
	let minter_for = |preimage: &Preimage| {
		MacaroonMinter::new(
			[7u8; 32],
			"tollgate".to_string(),
			Arc::new(FakeIssuer {
				payment_hash: preimage.payment_hash(),
			}),
		)
	};
	let header_a = l402_header(&minter_for(&preimage_a), &preimage_a).await;
	let header_b = l402_header(&minter_for(&preimage_b), &preimage_b).await;

	for auth in [&header_a, &header_b] {
		let resp = proxy
			.handle(peer(), request(uri, &[("authorization", auth.as_str())]))
			.await;
		assert_eq!(resp.status(), StatusCode::OK, "first call per identity");
	}
	for auth in [&header_a, &header_b] {
		let resp = proxy
			.handle(peer(), request(uri, &[("authorization", auth.as_str())]))
			.await;
		assert_eq!(
			resp.status(),
			StatusCode::TOO_MANY_REQUESTS,
			"second call per identity"
		);
	}
}

#[tokio::test]
async fn grpc_rate_limit_is_a_trailers_only_response() {
	let backend = spawn_backend().await;
	let mut svc = service_for(backend);
	svc.auth = AuthLevel::Off;
	svc.rate_limits = vec![RateLimitSerde {
		path_regex: Regex::new(".*").unwrap(),
		requests: 1,
		per: Duration::from_secs(2),
		burst: 1,
	}];
	let proxy = proxy_with(vec![svc], Arc::new(MockAuthenticator));
	let grpc_headers = [("content-type", "application/grpc")];
	let uri = "http://proxy.test/helloworld.Greeter/SayHello";

	let resp = proxy.handle(peer(), request(uri, &grpc_headers)).await;
	assert_eq!(resp.status(), StatusCode::OK);

	let resp = proxy.handle(peer(), request(uri, &grpc_headers)).await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(header(&resp, challenge::GRPC_STATUS), "14");
	assert_eq!(header(&resp, challenge::GRPC_MESSAGE), "rate limit exceeded");
	assert_eq!(header(&resp, "access-control-allow-origin"), "*");
}

#[tokio::test]
async fn grpc_challenge_carries_the_status_in_metadata() {
	let backend = spawn_backend().await;
	let proxy = proxy_with(vec![service_for(backend)], Arc::new(MockAuthenticator));

	let resp = proxy
		.handle(
			peer(),
			request(
				"http://proxy.test/helloworld.Greeter/SayHello",
				&[("content-type", "application/grpc")],
			),
		)
		.await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(header(&resp, challenge::GRPC_STATUS), "13");
	assert_eq!(header(&resp, challenge::GRPC_MESSAGE), "payment required");
	assert!(header(&resp, "www-authenticate").starts_with("LSAT macaroon="));
}

#[tokio::test]
async fn unsettled_invoice_demotes_to_a_fresh_challenge() {
	let backend = spawn_backend().await;
	let preimage = Preimage([5u8; 32]);
	let minter = Arc::new(MacaroonMinter::new(
		[7u8; 32],
		"tollgate".to_string(),
		Arc::new(FakeIssuer {
			payment_hash: preimage.payment_hash(),
		}),
	));
	let auth_header = l402_header(&minter, &preimage).await;
	let authenticator = L402Authenticator::new(minter, Arc::new(FailingChecker));
	let proxy = proxy_with(vec![service_for(backend)], Arc::new(authenticator));

	// the token itself is valid; the settlement check saying "nope" still
	// demotes it to a deny with a new challenge
	let resp = proxy
		.handle(
			peer(),
			request(
				"http://proxy.test/http/test",
				&[("authorization", auth_header.as_str())],
			),
		)
		.await;
	assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
	assert!(header(&resp, "www-authenticate").starts_with("LSAT macaroon="));
}

#[tokio::test]
async fn blocklisted_client_is_rejected() {
	let backend = spawn_backend().await;
	let blocklist = vec![format!("{PEER}/32").parse().unwrap()];
	let proxy = proxy_with_blocklist(
		vec![service_for(backend)],
		Arc::new(MockAuthenticator),
		blocklist,
	);

	let resp = proxy
		.handle(peer(), request("http://proxy.test/http/test", &[]))
		.await;
	assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unmatched_host_is_not_found() {
	let backend = spawn_backend().await;
	let proxy = proxy_with(vec![service_for(backend)], Arc::new(MockAuthenticator));

	let resp = proxy
		.handle(peer(), request("http://unknown.test/anything", &[]))
		.await;
	assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn auth_off_forwards_anonymous_requests() {
	let backend = spawn_backend().await;
	let mut svc = service_for(backend);
	svc.auth = AuthLevel::Off;
	let proxy = proxy_with(vec![svc], Arc::new(MockAuthenticator));

	let resp = proxy
		.handle(peer(), request("http://proxy.test/open", &[]))
		.await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(body_string(resp).await, BACKEND_BODY);
}

#[tokio::test]
async fn freebie_quota_admits_then_challenges() {
	let backend = spawn_backend().await;
	let mut svc = service_for(backend);
	svc.auth = AuthLevel::Freebie(1);
	let proxy = proxy_with(vec![svc], Arc::new(MockAuthenticator));
	let uri = "http://proxy.test/http/test";

	let resp = proxy.handle(peer(), request(uri, &[])).await;
	assert_eq!(resp.status(), StatusCode::OK);

	let resp = proxy.handle(peer(), request(uri, &[])).await;
	assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
}

#[tokio::test]
async fn preflight_is_answered_directly() {
	let backend = spawn_backend().await;
	let proxy = proxy_with(vec![service_for(backend)], Arc::new(MockAuthenticator));

	let mut req = request(
		"http://proxy.test/http/test",
		&[
			("origin", "https://app.example.com"),
			("access-control-request-method", "POST"),
		],
	);
	*req.method_mut() = ::http::Method::OPTIONS;
	let resp = proxy.handle(peer(), req).await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(
		header(&resp, "access-control-allow-methods"),
		"GET, POST, OPTIONS, PUT, DELETE"
	);
}

#[tokio::test]
async fn slow_backend_times_out_as_bad_gateway() {
	let backend = spawn_backend_with_delay(Duration::from_secs(2)).await;
	let mut svc = service_for(backend);
	svc.auth = AuthLevel::Off;
	svc.timeout = Some(1);
	let proxy = proxy_with(vec![svc], Arc::new(MockAuthenticator));

	let resp = proxy
		.handle(peer(), request("http://proxy.test/slow", &[]))
		.await;
	assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn unreachable_backend_is_bad_gateway() {
	// a port nothing listens on
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	drop(listener);

	let mut svc = service_for(addr);
	svc.auth = AuthLevel::Off;
	let proxy = proxy_with(vec![svc], Arc::new(MockAuthenticator));

	let resp = proxy
		.handle(peer(), request("http://proxy.test/http/test", &[]))
		.await;
	assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn update_services_swaps_the_registry() {
	let backend = spawn_backend().await;
	let opts = CompileOpts::default();
	let registry = ServiceRegistry::compile(vec![service_for(backend)], &opts).unwrap();
	let inputs = Arc::new(ProxyInputs::new(
		registry,
		opts,
		Arc::new(MockAuthenticator),
		vec![],
		None,
	));
	let proxy = HttpProxy::new(inputs.clone());

	let mut replacement = service_for(backend);
	replacement.host_regexp = Regex::new("^other.test$").unwrap();
	replacement.auth = AuthLevel::Off;
	inputs.update_services(vec![replacement]).unwrap();

	// the old host no longer matches, the new one does
	let resp = proxy
		.handle(peer(), request("http://proxy.test/http/test", &[]))
		.await;
	assert_eq!(resp.status(), StatusCode::NOT_FOUND);
	let resp = proxy
		.handle(peer(), request("http://other.test/http/test", &[]))
		.await;
	assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn static_fallback_serves_unmatched_hosts() {
	use std::io::Write;
	let dir = tempfile::tempdir().unwrap();
	let mut f = std::fs::File::create(dir.path().join("index.html")).unwrap();
	f.write_all(b"<h1>static</h1>").unwrap();
	drop(f);

	let backend = spawn_backend().await;
	let opts = CompileOpts::default();
	let registry = ServiceRegistry::compile(vec![service_for(backend)], &opts).unwrap();
	let inputs = Arc::new(ProxyInputs::new(
		registry,
		opts,
		Arc::new(MockAuthenticator),
		vec![],
		Some(crate::http::staticfiles::StaticServer::new(
			dir.path().to_path_buf(),
		)),
	));
	let proxy = HttpProxy::new(inputs);

	let resp = proxy
		.handle(peer(), request("http://unknown.test/index.html", &[]))
		.await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(body_string(resp).await, "<h1>static</h1>");
}
