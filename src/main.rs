use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tollgate::auth::{Authenticator, L402Authenticator, MockAuthenticator};
use tollgate::config::{AuthenticatorKind, RawConfig};
use tollgate::http::staticfiles::StaticServer;
use tollgate::mint::MacaroonMinter;
use tollgate::proxy::gateway::Gateway;
use tollgate::proxy::httpproxy::{HttpProxy, ProxyInputs};
use tollgate::types::service::{CompileOpts, ServiceRegistry};
use tollgate::{info, lnd, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tollgate", about = "Authenticating, rate-limiting reverse proxy")]
struct Args {
	/// Path to the YAML configuration file.
	#[arg(long, default_value = "tollgate.yaml")]
	config: PathBuf,
	/// Override the configured listen address.
	#[arg(long)]
	listenaddr: Option<String>,
	/// Serve plaintext instead of TLS and skip upstream cert verification.
	#[arg(long)]
	insecure: bool,
	/// Serve files for requests that match no service.
	#[arg(long)]
	servestatic: bool,
	/// Root directory for static file serving.
	#[arg(long)]
	staticroot: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.init();

	let args = Args::parse();
	let mut cfg = RawConfig::load(&args.config)?;
	if let Some(addr) = args.listenaddr {
		cfg.listen_addr = addr;
	}
	cfg.insecure |= args.insecure;
	cfg.serve_static |= args.servestatic;
	if args.staticroot.is_some() {
		cfg.static_root = args.staticroot;
	}

	let blocklist = cfg.parse_blocklist()?;
	let opts = CompileOpts {
		insecure: cfg.insecure,
	};
	let registry = ServiceRegistry::compile(cfg.services.clone(), &opts)?;
	info!(services = registry.services().len(), "services compiled");

	let authenticator: Arc<dyn Authenticator> = match cfg.authenticator_kind() {
		AuthenticatorKind::Mock => {
			warn!("using the mock authenticator; every well-formed token is admitted");
			Arc::new(MockAuthenticator)
		},
		AuthenticatorKind::Lnd => {
			let lnd_cfg = cfg
				.lnd
				.as_ref()
				.context("the lnd authenticator requires an lnd section")?;
			let node = lnd::Client::connect(lnd_cfg).await?;
			let node_info = node.get_info().await.context("lnd connectivity check")?;
			info!(
				alias = %node_info.alias,
				version = %node_info.version,
				"connected to lnd"
			);

			// Tokens are derived from this key; a restart mints a new one and
			// outstanding tokens stop verifying.
			let root_key: [u8; 32] = {
				use rand::Rng;
				rand::rng().random()
			};
			let location = cfg
				.server_name
				.clone()
				.unwrap_or_else(|| "tollgate".to_string());
			let minter = MacaroonMinter::new(root_key, location, Arc::new(node.clone()));
			Arc::new(L402Authenticator::new(Arc::new(minter), Arc::new(node)))
		},
	};

	let static_server = if cfg.serve_static {
		let root = cfg
			.static_root
			.clone()
			.context("servestatic requires staticroot")?;
		Some(StaticServer::new(root))
	} else {
		None
	};

	let inputs = Arc::new(ProxyInputs::new(
		registry,
		opts,
		authenticator,
		blocklist,
		static_server,
	));
	let proxy = HttpProxy::new(inputs);
	Gateway::new(Arc::new(cfg), proxy)?.run().await
}
