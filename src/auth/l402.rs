use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bitcoin_hashes::{Hash, sha256};
use macaroon::Macaroon;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::auth::AuthError;
use crate::http::HeaderMap;
use crate::*;

// Both the historical LSAT scheme name and its L402 successor appear in the
// wild; accept either on the way in. Challenges are emitted with LSAT.
static AUTH_HEADER_FORMAT: Lazy<Regex> =
	Lazy::new(|| Regex::new("^(?:LSAT|L402) (.*?):([a-f0-9]{64})$").expect("static regex"));

/// The token carriers we accept, in precedence order.
pub enum Carrier {
	/// `Authorization: LSAT <macaroon_b64>:<preimage_hex>`; REST clients.
	Authorization,
	/// `Grpc-Metadata-Macaroon: <macaroon_hex>`; certain REST and gRPC clients.
	MacaroonMeta,
	/// `Macaroon: <macaroon_hex>`; lnd-style gRPC clients.
	Macaroon,
}

impl Carrier {
	pub fn as_str(&self) -> &'static str {
		match self {
			Carrier::Authorization => "authorization",
			Carrier::MacaroonMeta => "grpc-metadata-macaroon",
			Carrier::Macaroon => "macaroon",
		}
	}
}

/// 32-byte invoice preimage, presented as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Preimage(pub [u8; 32]);

impl Preimage {
	pub fn from_hex(hex_str: &str) -> Result<Preimage, AuthError> {
		let bytes = hex::decode(hex_str).map_err(|_| AuthError::InvalidToken("bad preimage hex"))?;
		let arr: [u8; 32] = bytes
			.try_into()
			.map_err(|_| AuthError::InvalidToken("preimage must be 32 bytes"))?;
		Ok(Preimage(arr))
	}

	/// The payment hash this preimage commits to.
	pub fn payment_hash(&self) -> sha256::Hash {
		sha256::Hash::hash(&self.0)
	}

	pub fn to_hex(&self) -> String {
		hex::encode(self.0)
	}
}

impl Debug for Preimage {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		// preimages are proof of payment; keep them out of logs
		write!(f, "Preimage(..)")
	}
}

/// A parsed inbound token: the macaroon plus, when the client presented one,
/// the preimage proving payment.
pub struct Token {
	pub mac: Macaroon,
	pub preimage: Option<Preimage>,
}

/// Extract a token from any of the supported carriers.
pub fn from_headers(headers: &HeaderMap) -> Result<Token, AuthError> {
	crate::auth::init_crypto();
	if let Some(auth) = headers.get(Carrier::Authorization.as_str()) {
		let auth = auth
			.to_str()
			.map_err(|_| AuthError::InvalidToken("authorization header is not ascii"))?;
		let caps = AUTH_HEADER_FORMAT
			.captures(auth)
			.ok_or(AuthError::InvalidToken("malformed authorization header"))?;
		let (mac_b64, preimage_hex) = (
			caps.get(1).expect("group 1 always present").as_str(),
			caps.get(2).expect("group 2 always present").as_str(),
		);
		let mac = Macaroon::deserialize(mac_b64)
			.map_err(|_| AuthError::InvalidToken("undecodable macaroon"))?;
		let preimage = Preimage::from_hex(preimage_hex)?;
		return Ok(Token {
			mac,
			preimage: Some(preimage),
		});
	}

	let raw = headers
		.get(Carrier::MacaroonMeta.as_str())
		.or_else(|| headers.get(Carrier::Macaroon.as_str()))
		.ok_or(AuthError::MissingToken)?;
	// The macaroon-only carriers are hex encoded binary macaroons.
	let raw = raw
		.to_str()
		.map_err(|_| AuthError::InvalidToken("macaroon header is not ascii"))?;
	let bytes = hex::decode(raw).map_err(|_| AuthError::InvalidToken("bad macaroon hex"))?;
	let mac = Macaroon::deserialize(&URL_SAFE_NO_PAD.encode(bytes))
		.map_err(|_| AuthError::InvalidToken("undecodable macaroon"))?;
	// With no separate header field, the preimage rides as a caveat the
	// client attenuated onto its own macaroon.
	let preimage = preimage_from_caveats(&mac);
	Ok(Token { mac, preimage })
}

fn preimage_from_caveats(mac: &Macaroon) -> Option<Preimage> {
	mac.caveats().iter().find_map(|c| {
		if let macaroon::Caveat::FirstParty(p) = c {
			let predicate = p.predicate().to_string();
			if let Some(hex_str) = predicate.strip_prefix("preimage=") {
				return Preimage::from_hex(hex_str).ok();
			}
		}
		None
	})
}

/// Macaroons circulate in both the url-safe and standard base64 alphabets;
/// decode whichever one was used.
pub fn b64_decode_any(raw: &str) -> Option<Vec<u8>> {
	use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE};
	URL_SAFE_NO_PAD
		.decode(raw)
		.or_else(|_| URL_SAFE.decode(raw))
		.or_else(|_| STANDARD.decode(raw))
		.or_else(|_| STANDARD_NO_PAD.decode(raw))
		.ok()
}

/// The opaque identity a request limits under: the presented preimage, the
/// macaroon identifier as a fallback, or the empty string for anonymous
/// traffic (which shares the global bucket).
pub fn client_identity(headers: &HeaderMap) -> String {
	match from_headers(headers) {
		Ok(Token {
			preimage: Some(preimage),
			..
		}) => preimage.to_hex(),
		Ok(Token { mac, .. }) => hex::encode(mac.identifier()),
		Err(_) => String::new(),
	}
}
