use bitcoin_hashes::{Hash, sha256};
use itertools::Itertools;
use macaroon::{ByteString, Macaroon, MacaroonKey, Verifier};

use crate::auth::{AuthError, MintError, MintTarget, Minter, VerificationParams, VerifiedToken};
use crate::*;

const ID_VERSION: u16 = 0;
const TOKEN_ID_SIZE: usize = 32;
// version || payment hash || token id
const ENCODED_ID_SIZE: usize = 2 + 32 + TOKEN_ID_SIZE;

/// Token identifier baked into every macaroon we mint. Committing to the
/// payment hash here ties the token to exactly one invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenId {
	pub version: u16,
	pub payment_hash: sha256::Hash,
	pub token_id: [u8; TOKEN_ID_SIZE],
}

impl TokenId {
	pub fn new(payment_hash: sha256::Hash) -> TokenId {
		use rand::Rng;
		TokenId {
			version: ID_VERSION,
			payment_hash,
			token_id: rand::rng().random(),
		}
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(ENCODED_ID_SIZE);
		out.extend_from_slice(&self.version.to_be_bytes());
		out.extend_from_slice(&self.payment_hash.into_inner());
		out.extend_from_slice(&self.token_id);
		out
	}

	pub fn decode(raw: &[u8]) -> Result<TokenId, AuthError> {
		if raw.len() != ENCODED_ID_SIZE {
			return Err(AuthError::InvalidToken("token identifier has wrong length"));
		}
		let version = u16::from_be_bytes([raw[0], raw[1]]);
		if version != ID_VERSION {
			return Err(AuthError::InvalidToken("unknown token identifier version"));
		}
		let payment_hash = sha256::Hash::from_slice(&raw[2..34])
			.map_err(|_| AuthError::InvalidToken("bad payment hash"))?;
		let token_id: [u8; TOKEN_ID_SIZE] = raw[34..]
			.try_into()
			.expect("length checked above");
		Ok(TokenId {
			version,
			payment_hash,
			token_id,
		})
	}

	/// Free tokens commit to an all-zero hash; there is no invoice to settle.
	pub fn is_free(&self) -> bool {
		self.payment_hash.into_inner() == [0u8; 32]
	}
}

/// Issues the invoices our tokens are paid through. Implemented by the lnd
/// client; tests substitute their own.
#[async_trait::async_trait]
pub trait InvoiceIssuer: Send + Sync {
	/// Returns the payment request and its payment hash.
	async fn add_invoice(&self, memo: &str, amount_sat: u64) -> anyhow::Result<(String, Vec<u8>)>;
}

/// Mints and verifies macaroons. Per-token secrets are derived from the root
/// key and the token identifier, so verification needs no token store; a
/// restart with a new root key simply invalidates outstanding tokens.
pub struct MacaroonMinter {
	root_key: [u8; 32],
	location: String,
	issuer: Arc<dyn InvoiceIssuer>,
}

impl MacaroonMinter {
	pub fn new(root_key: [u8; 32], location: String, issuer: Arc<dyn InvoiceIssuer>) -> MacaroonMinter {
		crate::auth::init_crypto();
		MacaroonMinter {
			root_key,
			location,
			issuer,
		}
	}

	fn derive_secret(&self, id_bytes: &[u8]) -> MacaroonKey {
		let mut seed = Vec::with_capacity(self.root_key.len() + id_bytes.len());
		seed.extend_from_slice(&self.root_key);
		seed.extend_from_slice(id_bytes);
		MacaroonKey::generate(&sha256::Hash::hash(&seed))
	}
}

// Caveats other than the service binding are metadata (capabilities,
// constraints); their enforcement happens at the backends they describe.
fn metadata_caveat(caveat: &ByteString) -> bool {
	!caveat.0.starts_with(b"service=")
}

#[async_trait::async_trait]
impl Minter for MacaroonMinter {
	async fn mint_l402(&self, target: &MintTarget) -> Result<(Macaroon, String), MintError> {
		let (payment_request, payment_hash) = if target.price > 0 {
			let (payment_request, hash_bytes) = self
				.issuer
				.add_invoice(&format!("{} token", target.service), target.price)
				.await
				.map_err(MintError)?;
			let hash = sha256::Hash::from_slice(&hash_bytes)
				.map_err(|e| MintError(anyhow::anyhow!("issuer returned bad payment hash: {e}")))?;
			(payment_request, hash)
		} else {
			(String::new(), sha256::Hash::from_inner([0u8; 32]))
		};

		let id = TokenId::new(payment_hash);
		let id_bytes = id.encode();
		let secret = self.derive_secret(&id_bytes);

		let mut mac = Macaroon::create(
			Some(self.location.clone()),
			&secret,
			hex::encode(&id_bytes).into(),
		)
		.map_err(|e| MintError(anyhow::anyhow!("macaroon creation failed: {e:?}")))?;

		mac.add_first_party_caveat(format!("service={}", target.service).into());
		if !target.capabilities.is_empty() {
			mac.add_first_party_caveat(
				format!("capabilities={}", target.capabilities.iter().join(",")).into(),
			);
		}
		for (cond, val) in target.constraints.iter().sorted_by_key(|(k, _)| *k) {
			mac.add_first_party_caveat(format!("{cond}={val}").into());
		}

		Ok((mac, payment_request))
	}

	fn verify_l402(&self, params: &VerificationParams) -> Result<VerifiedToken, AuthError> {
		let id_bytes = hex::decode(params.macaroon.identifier())
			.map_err(|_| AuthError::InvalidToken("token identifier is not hex"))?;
		let id = TokenId::decode(&id_bytes)?;
		let secret = self.derive_secret(&id_bytes);

		let mut verifier = Verifier::default();
		verifier.satisfy_exact(format!("service={}", params.target_service).into());
		verifier.satisfy_general(metadata_caveat);
		verifier
			.verify(params.macaroon, &secret, Default::default())
			.map_err(|_| AuthError::VerificationFailed)?;

		if id.is_free() {
			return Ok(VerifiedToken { settlement: None });
		}

		let preimage = params.preimage.ok_or(AuthError::PreimageMismatch)?;
		if preimage.payment_hash() != id.payment_hash {
			return Err(AuthError::PreimageMismatch);
		}
		Ok(VerifiedToken {
			settlement: Some(id.payment_hash),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::auth::l402::Preimage;

	struct FakeIssuer {
		payment_hash: sha256::Hash,
	}

	#[async_trait::async_trait]
	impl InvoiceIssuer for FakeIssuer {
		async fn add_invoice(&self, _memo: &str, _amount_sat: u64) -> anyhow::Result<(String, Vec<u8>)> {
			Ok((
				"lnbcrt210n1fakeinvoice".to_string(),
				self.payment_hash.into_inner().to_vec(),
			))
		}
	}

	fn minter_for(preimage: &Preimage) -> MacaroonMinter {
		let issuer = FakeIssuer {
			payment_hash: preimage.payment_hash(),
		};
		MacaroonMinter::new([9u8; 32], "tollgate".to_string(), Arc::new(issuer))
	}

	fn paid_target() -> MintTarget {
		MintTarget {
			service: "svc".to_string(),
			price: 21,
			capabilities: vec!["add".to_string(), "subtract".to_string()],
			constraints: HashMap::from([("valid_for".to_string(), "1h".to_string())]),
		}
	}

	#[test]
	fn token_id_round_trips() {
		let id = TokenId::new(sha256::Hash::hash(b"invoice".as_slice()));
		let decoded = TokenId::decode(&id.encode()).unwrap();
		assert_eq!(decoded, id);
		assert!(!id.is_free());
		assert!(TokenId::new(sha256::Hash::from_inner([0u8; 32])).is_free());
	}

	#[test]
	fn token_id_rejects_garbage() {
		assert!(TokenId::decode(b"short").is_err());
		let mut raw = TokenId::new(sha256::Hash::hash(b"x".as_slice())).encode();
		raw[0] = 0xff; // unknown version
		assert!(TokenId::decode(&raw).is_err());
	}

	#[tokio::test]
	async fn minted_token_verifies_with_its_preimage() {
		let preimage = Preimage([3u8; 32]);
		let minter = minter_for(&preimage);
		let (mac, payment_request) = minter.mint_l402(&paid_target()).await.unwrap();
		assert!(payment_request.starts_with("lnbcrt"));

		let verified = minter
			.verify_l402(&VerificationParams {
				macaroon: &mac,
				preimage: Some(preimage),
				target_service: "svc",
			})
			.unwrap();
		assert_eq!(verified.settlement, Some(preimage.payment_hash()));
	}

	#[tokio::test]
	async fn wrong_preimage_or_service_is_rejected() {
		let preimage = Preimage([3u8; 32]);
		let minter = minter_for(&preimage);
		let (mac, _) = minter.mint_l402(&paid_target()).await.unwrap();

		let err = minter
			.verify_l402(&VerificationParams {
				macaroon: &mac,
				preimage: Some(Preimage([4u8; 32])),
				target_service: "svc",
			})
			.unwrap_err();
		assert!(matches!(err, AuthError::PreimageMismatch));

		let err = minter
			.verify_l402(&VerificationParams {
				macaroon: &mac,
				preimage: Some(preimage),
				target_service: "other",
			})
			.unwrap_err();
		assert!(matches!(err, AuthError::VerificationFailed));
	}

	#[tokio::test]
	async fn missing_preimage_is_rejected_for_paid_tokens() {
		let preimage = Preimage([3u8; 32]);
		let minter = minter_for(&preimage);
		let (mac, _) = minter.mint_l402(&paid_target()).await.unwrap();

		let err = minter
			.verify_l402(&VerificationParams {
				macaroon: &mac,
				preimage: None,
				target_service: "svc",
			})
			.unwrap_err();
		assert!(matches!(err, AuthError::PreimageMismatch));
	}

	#[tokio::test]
	async fn free_tokens_need_no_settlement() {
		let minter = minter_for(&Preimage([0u8; 32]));
		let target = MintTarget {
			price: 0,
			..paid_target()
		};
		let (mac, payment_request) = minter.mint_l402(&target).await.unwrap();
		assert!(payment_request.is_empty());

		let verified = minter
			.verify_l402(&VerificationParams {
				macaroon: &mac,
				preimage: None,
				target_service: "svc",
			})
			.unwrap();
		assert!(verified.settlement.is_none());
	}

	#[tokio::test]
	async fn foreign_root_key_is_rejected() {
		let preimage = Preimage([3u8; 32]);
		let minter = minter_for(&preimage);
		let (mac, _) = minter.mint_l402(&paid_target()).await.unwrap();

		let other = MacaroonMinter::new(
			[1u8; 32],
			"tollgate".to_string(),
			Arc::new(FakeIssuer {
				payment_hash: preimage.payment_hash(),
			}),
		);
		let err = other
			.verify_l402(&VerificationParams {
				macaroon: &mac,
				preimage: Some(preimage),
				target_service: "svc",
			})
			.unwrap_err();
		assert!(matches!(err, AuthError::VerificationFailed));
	}
}
