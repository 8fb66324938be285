pub mod freebie;
pub mod l402;

use bitcoin_hashes::sha256;
use macaroon::Macaroon;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::http::{HeaderMap, HeaderValue};
use crate::*;

/// How long we give the settlement lookup before treating the invoice as
/// unpaid and re-challenging the client.
pub const INVOICE_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

static CRYPTO_INIT: std::sync::Once = std::sync::Once::new();

/// The macaroon library wants its crypto primitives initialized once per
/// process before any mint or verify.
pub(crate) fn init_crypto() {
	CRYPTO_INIT.call_once(|| {
		if let Err(e) = macaroon::initialize() {
			warn!("macaroon crypto initialization failed: {e:?}");
		}
	});
}

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
	#[error("no token present")]
	MissingToken,
	#[error("invalid token: {0}")]
	InvalidToken(&'static str),
	#[error("macaroon verification failed")]
	VerificationFailed,
	#[error("preimage does not match payment hash")]
	PreimageMismatch,
	#[error("invoice not settled: {0}")]
	InvoiceNotSettled(String),
}

#[derive(thiserror::Error, Debug)]
#[error("challenge construction failed: {0}")]
pub struct MintError(pub anyhow::Error);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceStatus {
	Open,
	Settled,
	Canceled,
}

/// What a freshly minted token is scoped to.
#[derive(Debug, Clone)]
pub struct MintTarget {
	pub service: String,
	pub price: u64,
	pub capabilities: Vec<String>,
	pub constraints: HashMap<String, String>,
}

/// Everything needed to check a presented token.
pub struct VerificationParams<'a> {
	pub macaroon: &'a Macaroon,
	pub preimage: Option<l402::Preimage>,
	pub target_service: &'a str,
}

/// The outcome of macaroon verification. `settlement` carries the payment
/// hash that must be settled before the token is honored; free tokens have
/// nothing to settle.
#[derive(Debug)]
pub struct VerifiedToken {
	pub settlement: Option<sha256::Hash>,
}

#[async_trait::async_trait]
pub trait Minter: Send + Sync {
	/// Mint a macaroon for the target and return it alongside the payment
	/// request the client must settle. A zero price mints a free token with
	/// an empty payment request.
	async fn mint_l402(&self, target: &MintTarget) -> Result<(Macaroon, String), MintError>;

	/// Check signature, caveats, and the preimage commitment.
	fn verify_l402(&self, params: &VerificationParams) -> Result<VerifiedToken, AuthError>;
}

#[async_trait::async_trait]
pub trait InvoiceChecker: Send + Sync {
	/// Poll the invoice state until it reaches `expected` or the timeout
	/// elapses.
	async fn verify_invoice_status(
		&self,
		payment_hash: sha256::Hash,
		expected: InvoiceStatus,
		timeout: Duration,
	) -> Result<(), AuthError>;
}

/// The pluggable authentication capability consulted by the admission
/// pipeline. Which variant backs it is decided once, at startup.
#[async_trait::async_trait]
pub trait Authenticator: Send + Sync {
	/// Whether the request carries a token good for `service`. Failures are
	/// indistinguishable from missing tokens: the caller answers both with a
	/// fresh challenge.
	async fn accept(&self, headers: &HeaderMap, service: &str) -> bool;

	/// Mint a fresh challenge for `target`.
	async fn fresh_challenge(&self, target: &MintTarget) -> Result<Challenge, MintError>;
}

/// A minted challenge, ready to be encoded into a `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
	pub macaroon: String,
	pub payment_request: String,
}

static CHALLENGE_FORMAT: Lazy<Regex> =
	Lazy::new(|| Regex::new(r#"^LSAT macaroon="([^"]*)", invoice="([^"]*)"$"#).expect("static regex"));

impl Challenge {
	pub fn to_header_value(&self) -> Result<HeaderValue, MintError> {
		HeaderValue::from_str(&format!(
			r#"LSAT macaroon="{}", invoice="{}""#,
			self.macaroon, self.payment_request
		))
		.map_err(|e| MintError(e.into()))
	}

	/// Parse the header shape emitted by `to_header_value`.
	pub fn parse_header(raw: &str) -> Option<Challenge> {
		let caps = CHALLENGE_FORMAT.captures(raw)?;
		Some(Challenge {
			macaroon: caps.get(1)?.as_str().to_string(),
			payment_request: caps.get(2)?.as_str().to_string(),
		})
	}
}

/// The production authenticator: macaroons verified by the minter, payment
/// proven by a settled invoice.
pub struct L402Authenticator {
	minter: Arc<dyn Minter>,
	checker: Arc<dyn InvoiceChecker>,
}

impl L402Authenticator {
	pub fn new(minter: Arc<dyn Minter>, checker: Arc<dyn InvoiceChecker>) -> L402Authenticator {
		L402Authenticator { minter, checker }
	}

	async fn check(&self, headers: &HeaderMap, service: &str) -> Result<(), AuthError> {
		let token = l402::from_headers(headers)?;
		let params = VerificationParams {
			macaroon: &token.mac,
			preimage: token.preimage,
			target_service: service,
		};
		let verified = self.minter.verify_l402(&params)?;
		if let Some(payment_hash) = verified.settlement {
			self
				.checker
				.verify_invoice_status(payment_hash, InvoiceStatus::Settled, INVOICE_CHECK_TIMEOUT)
				.await?;
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl Authenticator for L402Authenticator {
	async fn accept(&self, headers: &HeaderMap, service: &str) -> bool {
		match self.check(headers, service).await {
			Ok(()) => true,
			Err(e) => {
				debug!(service, err = %e, "token rejected");
				false
			},
		}
	}

	async fn fresh_challenge(&self, target: &MintTarget) -> Result<Challenge, MintError> {
		let (mac, payment_request) = self.minter.mint_l402(target).await?;
		let macaroon = mac
			.serialize(macaroon::Format::V2)
			.map_err(|e| MintError(anyhow::anyhow!("macaroon serialization failed: {e:?}")))?;
		Ok(Challenge {
			macaroon,
			payment_request,
		})
	}
}

/// Development-only authenticator: admits any well-formed token and hands out
/// a fixed dummy invoice.
pub struct MockAuthenticator;

const MOCK_INVOICE: &str = "lnbcrt20n1mockinvoice";

#[async_trait::async_trait]
impl Authenticator for MockAuthenticator {
	async fn accept(&self, headers: &HeaderMap, _service: &str) -> bool {
		l402::from_headers(headers).is_ok()
	}

	async fn fresh_challenge(&self, target: &MintTarget) -> Result<Challenge, MintError> {
		use bitcoin_hashes::Hash;
		init_crypto();
		let key = macaroon::MacaroonKey::generate(&sha256::Hash::hash(b"mock authenticator".as_slice()));
		let mac = Macaroon::create(
			Some("tollgate".to_string()),
			&key,
			format!("mock-{}", target.service).into(),
		)
		.map_err(|e| MintError(anyhow::anyhow!("macaroon creation failed: {e:?}")))?;
		let macaroon = mac
			.serialize(macaroon::Format::V2)
			.map_err(|e| MintError(anyhow::anyhow!("macaroon serialization failed: {e:?}")))?;
		Ok(Challenge {
			macaroon,
			payment_request: MOCK_INVOICE.to_string(),
		})
	}
}
