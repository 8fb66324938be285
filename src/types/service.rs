use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use base64::Engine;
use regex::Regex;

use crate::auth::MintTarget;
use crate::auth::freebie::FreebieDb;
use crate::http::ratelimit::{RateLimitPolicy, RateLimitSerde};
use crate::http::{HeaderName, HeaderValue};
use crate::pricer::{GrpcPricer, Pricer, StaticPricer};
use crate::*;

#[cfg(test)]
#[path = "service_test.rs"]
mod tests;

/// Prices are satoshis; cap at 100k BTC to catch unit mistakes in configs.
pub const MAX_SERVICE_PRICE: i64 = 100_000 * 100_000_000;

/// A backend service as it appears in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSerde {
	pub name: String,
	pub address: String,
	#[serde(default)]
	pub protocol: Protocol,
	#[serde(rename = "tlscertpath", default)]
	pub tls_cert_path: Option<PathBuf>,
	#[serde(rename = "hostregexp", with = "serde_regex")]
	pub host_regexp: Regex,
	#[serde(rename = "pathregexp", default, with = "serde_regex")]
	pub path_regexp: Option<Regex>,
	#[serde(default)]
	pub auth: AuthLevel,
	#[serde(rename = "authwhitelistpaths", default, with = "serde_regex")]
	pub auth_whitelist_paths: Vec<Regex>,
	#[serde(rename = "authskipinvoicecreationpaths", default, with = "serde_regex")]
	pub auth_skip_invoice_creation_paths: Vec<Regex>,
	#[serde(default)]
	pub headers: HashMap<String, String>,
	/// Upstream deadline in seconds.
	#[serde(default)]
	pub timeout: Option<u64>,
	#[serde(default)]
	pub capabilities: Vec<String>,
	#[serde(default)]
	pub constraints: HashMap<String, String>,
	#[serde(default)]
	pub price: i64,
	#[serde(rename = "dynamicprice", default)]
	pub dynamic_price: Option<DynamicPriceSerde>,
	#[serde(rename = "ratelimits", default)]
	pub rate_limits: Vec<RateLimitSerde>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DynamicPriceSerde {
	#[serde(default)]
	pub enabled: bool,
	#[serde(rename = "grpcaddress", default)]
	pub grpc_address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
	#[default]
	Http,
	Https,
}

/// Authentication posture of a service: token required, wide open, or a
/// per-client quota of free requests before the challenge flow kicks in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthLevel {
	#[default]
	On,
	Off,
	Freebie(u64),
}

impl AuthLevel {
	pub fn enabled(&self) -> bool {
		!matches!(self, AuthLevel::Off)
	}
}

impl FromStr for AuthLevel {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"on" | "true" => Ok(AuthLevel::On),
			"off" | "false" => Ok(AuthLevel::Off),
			other => {
				let Some(rest) = other.strip_prefix("freebie") else {
					anyhow::bail!("unknown auth level {other:?}");
				};
				let rest = rest.trim();
				if rest.is_empty() {
					anyhow::bail!("auth level freebie requires a count");
				}
				let count: u64 = rest
					.parse()
					.with_context(|| format!("invalid freebie count {rest:?}"))?;
				Ok(AuthLevel::Freebie(count))
			},
		}
	}
}

impl Display for AuthLevel {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			AuthLevel::On => write!(f, "on"),
			AuthLevel::Off => write!(f, "off"),
			AuthLevel::Freebie(n) => write!(f, "freebie {n}"),
		}
	}
}

impl Serialize for AuthLevel {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_string())
	}
}

impl<'de> Deserialize<'de> for AuthLevel {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		struct LevelVisitor;

		impl serde::de::Visitor<'_> for LevelVisitor {
			type Value = AuthLevel;

			fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
				f.write_str("\"on\", \"off\", or \"freebie N\"")
			}

			// YAML dialects differ on whether a bare `on` is a bool or a
			// string; take either.
			fn visit_bool<E: serde::de::Error>(self, v: bool) -> Result<Self::Value, E> {
				Ok(if v { AuthLevel::On } else { AuthLevel::Off })
			}

			fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
				v.parse().map_err(serde::de::Error::custom)
			}
		}

		deserializer.deserialize_any(LevelVisitor)
	}
}

#[derive(Debug, Clone, Default)]
pub struct CompileOpts {
	/// Skip upstream certificate verification.
	pub insecure: bool,
}

/// A fully compiled service: regexes built, header references resolved,
/// pricer wired, rate-limit buckets allocated. Immutable once compiled;
/// `update_services` swaps whole registry snapshots instead of mutating.
pub struct Service {
	pub name: String,
	pub address: String,
	pub protocol: Protocol,
	pub auth: AuthLevel,
	host_regexp: Regex,
	path_regexp: Option<Regex>,
	whitelist: Vec<Regex>,
	skip_invoice: Vec<Regex>,
	pub headers: Vec<(HeaderName, HeaderValue)>,
	pub timeout: Option<Duration>,
	pub capabilities: Vec<String>,
	pub constraints: HashMap<String, String>,
	pub pricer: Arc<dyn Pricer>,
	pub freebie: Option<FreebieDb>,
	pub rate_limits: Vec<RateLimitPolicy>,
	pub backend_tls: Option<Arc<rustls::ClientConfig>>,
}

impl Debug for Service {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Service")
			.field("name", &self.name)
			.field("address", &self.address)
			.field("protocol", &self.protocol)
			.field("auth", &self.auth)
			.finish()
	}
}

impl Service {
	fn compile(raw: ServiceSerde, opts: &CompileOpts) -> anyhow::Result<Service> {
		if raw.price < 0 {
			anyhow::bail!("service {} has negative price {}", raw.name, raw.price);
		}
		if raw.price > MAX_SERVICE_PRICE {
			anyhow::bail!(
				"service {} price {} exceeds maximum {}",
				raw.name,
				raw.price,
				MAX_SERVICE_PRICE
			);
		}
		if raw.tls_cert_path.is_some() && raw.protocol != Protocol::Https {
			anyhow::bail!("service {} sets tlscertpath without protocol https", raw.name);
		}

		let headers = raw
			.headers
			.iter()
			.map(|(name, value)| {
				let name = HeaderName::from_str(name)
					.with_context(|| format!("service {}: invalid header name {name:?}", raw.name))?;
				let value = resolve_header_value(value)
					.with_context(|| format!("service {}: header {name:?}", raw.name))?;
				let value = HeaderValue::from_str(&value)
					.with_context(|| format!("service {}: invalid header value", raw.name))?;
				Ok((name, value))
			})
			.collect::<anyhow::Result<Vec<_>>>()?;

		let rate_limits = raw
			.rate_limits
			.into_iter()
			.map(|r| {
				RateLimitPolicy::try_from(r)
					.with_context(|| format!("service {}: invalid rate limit", raw.name))
			})
			.collect::<anyhow::Result<Vec<_>>>()?;

		let pricer: Arc<dyn Pricer> = match &raw.dynamic_price {
			Some(dp) if dp.enabled => {
				if dp.grpc_address.is_empty() {
					anyhow::bail!("service {} enables dynamicprice without grpcaddress", raw.name);
				}
				Arc::new(
					GrpcPricer::connect(&dp.grpc_address)
						.with_context(|| format!("service {}: pricer", raw.name))?,
				)
			},
			_ => Arc::new(StaticPricer::new(raw.price as u64)),
		};

		let backend_tls = match raw.protocol {
			Protocol::Https => Some(crate::client::backend_tls(
				raw.tls_cert_path.as_deref(),
				opts.insecure,
			)?),
			Protocol::Http => None,
		};

		let freebie = match raw.auth {
			AuthLevel::Freebie(n) => Some(FreebieDb::new(n)),
			_ => None,
		};

		Ok(Service {
			name: raw.name,
			address: raw.address,
			protocol: raw.protocol,
			auth: raw.auth,
			host_regexp: raw.host_regexp,
			path_regexp: raw.path_regexp,
			whitelist: raw.auth_whitelist_paths,
			skip_invoice: raw.auth_skip_invoice_creation_paths,
			headers,
			timeout: raw.timeout.map(Duration::from_secs),
			capabilities: raw.capabilities,
			constraints: raw.constraints,
			pricer,
			freebie,
			rate_limits,
			backend_tls,
		})
	}

	pub fn matches(&self, host: &str, path: &str) -> bool {
		if !self.host_regexp.is_match(host) {
			return false;
		}
		match &self.path_regexp {
			Some(re) => re.is_match(path),
			None => true,
		}
	}

	pub fn is_whitelisted(&self, path: &str) -> bool {
		self.whitelist.iter().any(|re| re.is_match(path))
	}

	pub fn skips_invoice(&self, path: &str) -> bool {
		self.skip_invoice.iter().any(|re| re.is_match(path))
	}

	/// Consult every matching rule; the strictest denial wins.
	pub fn check_rate_limit(&self, path: &str, identity: &str) -> Result<(), Duration> {
		crate::http::ratelimit::check_all(self.rate_limits.iter(), path, identity)
	}

	pub fn mint_target(&self, price: u64) -> MintTarget {
		MintTarget {
			service: self.name.clone(),
			price,
			capabilities: self.capabilities.clone(),
			constraints: self.constraints.clone(),
		}
	}
}

/// Header values of the form `!file+hex:PATH` or `!file+base64:PATH` resolve
/// to the encoded contents of PATH; other `!file` shapes are configuration
/// errors.
fn resolve_header_value(raw: &str) -> anyhow::Result<String> {
	if let Some(path) = raw.strip_prefix("!file+hex:") {
		let contents =
			std::fs::read(path).with_context(|| format!("failed to read header file {path}"))?;
		return Ok(hex::encode(contents));
	}
	if let Some(path) = raw.strip_prefix("!file+base64:") {
		let contents =
			std::fs::read(path).with_context(|| format!("failed to read header file {path}"))?;
		return Ok(base64::engine::general_purpose::STANDARD.encode(contents));
	}
	if raw.starts_with("!file") {
		anyhow::bail!("unsupported file reference {raw:?}");
	}
	Ok(raw.to_string())
}

/// The compiled set of backend services, in declared order.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
	services: Vec<Arc<Service>>,
}

impl ServiceRegistry {
	pub fn compile(raw: Vec<ServiceSerde>, opts: &CompileOpts) -> anyhow::Result<ServiceRegistry> {
		let services = raw
			.into_iter()
			.map(|s| Service::compile(s, opts).map(Arc::new))
			.collect::<anyhow::Result<Vec<_>>>()?;
		Ok(ServiceRegistry { services })
	}

	/// First service whose host pattern matches, and whose path pattern (when
	/// set) matches too. Declared order breaks ties.
	pub fn match_service(&self, host: &str, path: &str) -> Option<Arc<Service>> {
		self
			.services
			.iter()
			.find(|s| s.matches(host, path))
			.cloned()
	}

	pub fn services(&self) -> &[Arc<Service>] {
		&self.services
	}
}
