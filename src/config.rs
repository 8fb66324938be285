use std::path::{Path, PathBuf};

use anyhow::Context;
use ipnet::IpNet;

use crate::types::service::ServiceSerde;
use crate::*;

const DEFAULT_LISTEN_ADDR: &str = "[::]:8081";
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// On-disk configuration. Field names match the YAML surface, which uses
/// flat lowercase keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
	#[serde(rename = "listenaddr", default = "default_listen_addr")]
	pub listen_addr: String,
	#[serde(rename = "servername", default)]
	pub server_name: Option<String>,
	#[serde(default)]
	pub autocert: bool,
	#[serde(default)]
	pub insecure: bool,
	#[serde(rename = "staticroot", default)]
	pub static_root: Option<PathBuf>,
	#[serde(rename = "servestatic", default)]
	pub serve_static: bool,
	#[serde(default)]
	pub blocklist: Vec<String>,
	#[serde(default)]
	pub authenticator: Option<AuthenticatorKind>,
	#[serde(default)]
	pub lnd: Option<LndConfig>,
	#[serde(default)]
	pub services: Vec<ServiceSerde>,
	#[serde(rename = "idletimeout", default, with = "serde_dur_option")]
	pub idle_timeout: Option<Duration>,
	#[serde(rename = "readtimeout", default, with = "serde_dur_option")]
	pub read_timeout: Option<Duration>,
	#[serde(rename = "writetimeout", default, with = "serde_dur_option")]
	pub write_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticatorKind {
	Lnd,
	Mock,
}

/// Connection details for the lnd node backing the LSAT authenticator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LndConfig {
	pub host: String,
	#[serde(rename = "tlspath")]
	pub tls_path: String,
	#[serde(rename = "macaroonpath")]
	pub macaroon_path: String,
}

fn default_listen_addr() -> String {
	DEFAULT_LISTEN_ADDR.to_string()
}

impl RawConfig {
	pub fn load(path: &Path) -> anyhow::Result<RawConfig> {
		let contents = std::fs::read_to_string(path)
			.with_context(|| format!("failed to read config file {}", path.display()))?;
		parse_config(&contents)
	}

	pub fn read_timeout(&self) -> Duration {
		self.read_timeout.unwrap_or(DEFAULT_READ_TIMEOUT)
	}

	pub fn write_timeout(&self) -> Duration {
		self.write_timeout.unwrap_or(DEFAULT_WRITE_TIMEOUT)
	}

	pub fn idle_timeout(&self) -> Duration {
		self.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT)
	}

	/// The authenticator variant to wire at startup. An explicit setting wins;
	/// otherwise the presence of an lnd section selects the LSAT authenticator.
	pub fn authenticator_kind(&self) -> AuthenticatorKind {
		match self.authenticator {
			Some(kind) => kind,
			None if self.lnd.is_some() => AuthenticatorKind::Lnd,
			None => AuthenticatorKind::Mock,
		}
	}

	/// Entries are either plain addresses or CIDR ranges.
	pub fn parse_blocklist(&self) -> anyhow::Result<Vec<IpNet>> {
		self
			.blocklist
			.iter()
			.map(|raw| {
				if let Ok(net) = raw.parse::<IpNet>() {
					return Ok(net);
				}
				let ip: IpAddr = raw
					.parse()
					.with_context(|| format!("invalid blocklist entry {raw:?}"))?;
				Ok(IpNet::from(ip))
			})
			.collect()
	}
}

pub fn parse_config(contents: &str) -> anyhow::Result<RawConfig> {
	serde_yaml::from_str(contents).context("failed to parse configuration")
}
