use std::path::Path;

use anyhow::Context as _;
use base64::Engine;
use bitcoin_hashes::sha256;
use http_body_util::BodyExt;
use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::auth::{AuthError, InvoiceChecker, InvoiceStatus};
use crate::config::LndConfig;
use crate::http::{Body, HeaderValue, Method, StatusCode, Uri, header};
use crate::mint::InvoiceIssuer;
use crate::*;

const INVOICE_EXPIRY_SECS: u64 = 60 * 10;
const LOOKUP_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Handle on the lnd node that issues our invoices and knows their
/// settlement state. Talks to lnd's REST gateway over the same
/// hyper/rustls plumbing the proxy uses for its backends, authenticated by
/// the node's admin macaroon.
#[derive(Clone)]
pub struct Client {
	address: String,
	macaroon_hex: String,
	tls: Arc<rustls::ClientConfig>,
}

impl Debug for Client {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Client").field("address", &self.address).finish()
	}
}

/// The subset of `GET /v1/getinfo` we surface at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeInfo {
	#[serde(default)]
	pub alias: String,
	#[serde(default)]
	pub version: String,
}

#[derive(Debug, Deserialize)]
struct AddInvoiceResponse {
	payment_request: String,
	r_hash: String,
}

#[derive(Debug, Deserialize)]
struct InvoiceResponse {
	#[serde(default)]
	state: String,
}

impl Client {
	pub async fn connect(cfg: &LndConfig) -> anyhow::Result<Client> {
		let macaroon = std::fs::read(&cfg.macaroon_path)
			.with_context(|| format!("failed to read macaroon {}", cfg.macaroon_path))?;
		// lnd serves REST with its own self-signed cert; trust exactly that.
		let tls = crate::client::backend_tls(Some(Path::new(&cfg.tls_path)), false)?;
		let address = cfg
			.host
			.trim_start_matches("https://")
			.trim_start_matches("http://")
			.trim_end_matches('/')
			.to_string();
		Ok(Client {
			address,
			macaroon_hex: hex::encode(macaroon),
			tls,
		})
	}

	/// Basic node info, used as a startup connectivity check.
	pub async fn get_info(&self) -> anyhow::Result<NodeInfo> {
		let body = self.rest_call(Method::GET, "/v1/getinfo", None).await?;
		Ok(serde_json::from_slice(&body).context("unexpected getinfo response")?)
	}

	async fn lookup_invoice(&self, payment_hash: &sha256::Hash) -> anyhow::Result<InvoiceResponse> {
		use bitcoin_hashes::Hash;
		let path = format!("/v1/invoice/{}", hex::encode(payment_hash.into_inner()));
		let body = self.rest_call(Method::GET, &path, None).await?;
		Ok(serde_json::from_slice(&body).context("unexpected invoice response")?)
	}

	async fn rest_call(
		&self,
		method: Method,
		path: &str,
		body: Option<serde_json::Value>,
	) -> anyhow::Result<Bytes> {
		let host = self
			.address
			.rsplit_once(':')
			.map(|(h, _)| h)
			.unwrap_or(self.address.as_str())
			.trim_start_matches('[')
			.trim_end_matches(']');
		let server_name =
			ServerName::try_from(host.to_string()).context("invalid lnd host name")?;
		let stream = TcpStream::connect(&self.address)
			.await
			.with_context(|| format!("failed to dial lnd at {}", self.address))?;
		let stream = TlsConnector::from(self.tls.clone())
			.connect(server_name, stream)
			.await
			.context("lnd tls handshake failed")?;

		let uri: Uri = format!("https://{}{}", self.address, path)
			.parse()
			.context("invalid lnd url")?;
		let mut req = ::http::Request::builder()
			.method(method)
			.uri(uri)
			.header("grpc-metadata-macaroon", self.macaroon_hex.clone())
			.body(match &body {
				Some(v) => Body::from(v.to_string()),
				None => Body::empty(),
			})
			.expect("request must build");
		if body.is_some() {
			req
				.headers_mut()
				.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
		}

		let resp = crate::client::request_h1(stream, req)
			.await
			.map_err(|e| anyhow::anyhow!("lnd call failed: {e}"))?;
		let status = resp.status();
		let bytes = resp
			.into_body()
			.collect()
			.await
			.map_err(|e| anyhow::anyhow!("lnd response read failed: {e}"))?
			.to_bytes();
		if status != StatusCode::OK {
			anyhow::bail!(
				"lnd returned {status}: {}",
				String::from_utf8_lossy(&bytes)
			);
		}
		Ok(bytes)
	}
}

#[async_trait::async_trait]
impl InvoiceIssuer for Client {
	async fn add_invoice(&self, memo: &str, amount_sat: u64) -> anyhow::Result<(String, Vec<u8>)> {
		// int64 fields ride as strings through the REST gateway
		let payload = serde_json::json!({
			"memo": memo,
			"value": amount_sat.to_string(),
			"expiry": INVOICE_EXPIRY_SECS.to_string(),
		});
		let body = self
			.rest_call(Method::POST, "/v1/invoices", Some(payload))
			.await
			.context("failed to generate invoice")?;
		let resp: AddInvoiceResponse =
			serde_json::from_slice(&body).context("unexpected addinvoice response")?;
		let r_hash = base64::engine::general_purpose::STANDARD
			.decode(&resp.r_hash)
			.context("addinvoice returned bad payment hash")?;
		Ok((resp.payment_request, r_hash))
	}
}

fn status_of(invoice: &InvoiceResponse) -> InvoiceStatus {
	match invoice.state.as_str() {
		"SETTLED" => InvoiceStatus::Settled,
		"CANCELED" => InvoiceStatus::Canceled,
		_ => InvoiceStatus::Open,
	}
}

#[async_trait::async_trait]
impl InvoiceChecker for Client {
	async fn verify_invoice_status(
		&self,
		payment_hash: sha256::Hash,
		expected: InvoiceStatus,
		timeout: Duration,
	) -> Result<(), AuthError> {
		let deadline = Instant::now() + timeout;
		// Settlement can land moments after the client presents the preimage;
		// poll until the state matches or the window closes.
		loop {
			let state = self
				.lookup_invoice(&payment_hash)
				.await
				.map(|inv| status_of(&inv));
			match state {
				Ok(state) if state == expected => return Ok(()),
				Ok(InvoiceStatus::Canceled) if expected != InvoiceStatus::Canceled => {
					return Err(AuthError::InvoiceNotSettled("invoice canceled".to_string()));
				},
				Ok(_) => {},
				Err(e) => {
					debug!(err = %e, "invoice lookup failed");
					return Err(AuthError::InvoiceNotSettled(e.to_string()));
				},
			}
			if Instant::now() >= deadline {
				return Err(AuthError::InvoiceNotSettled(
					"timed out waiting for settlement".to_string(),
				));
			}
			tokio::time::sleep(LOOKUP_POLL_INTERVAL).await;
		}
	}
}
