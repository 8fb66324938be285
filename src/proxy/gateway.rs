use std::convert::Infallible;

use anyhow::Context;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::config::RawConfig;
use crate::http::Body;
use crate::proxy::httpproxy::HttpProxy;
use crate::*;

/// Accept loop: one task per connection, HTTP/1.1 and HTTP/2 negotiated by
/// hyper's auto builder (and by ALPN when TLS terminates here).
pub struct Gateway {
	cfg: Arc<RawConfig>,
	proxy: HttpProxy,
	tls: Option<TlsAcceptor>,
}

impl Gateway {
	pub fn new(cfg: Arc<RawConfig>, proxy: HttpProxy) -> anyhow::Result<Gateway> {
		let tls = if cfg.insecure {
			None
		} else {
			if cfg.autocert {
				warn!("ACME provisioning is not built in; serving a self-signed certificate");
			}
			let config = server_tls_config(cfg.server_name.as_deref())?;
			Some(TlsAcceptor::from(Arc::new(config)))
		};
		Ok(Gateway { cfg, proxy, tls })
	}

	pub async fn run(self) -> anyhow::Result<()> {
		let listener = TcpListener::bind(&self.cfg.listen_addr)
			.await
			.with_context(|| format!("failed to bind {}", self.cfg.listen_addr))?;
		info!(
			addr = %self.cfg.listen_addr,
			tls = self.tls.is_some(),
			"listening for requests"
		);

		loop {
			tokio::select! {
				accepted = listener.accept() => {
					let (stream, peer) = match accepted {
						Ok(pair) => pair,
						Err(e) => {
							warn!(err = %e, "accept failed");
							continue;
						},
					};
					let proxy = self.proxy.clone();
					let tls = self.tls.clone();
					let cfg = self.cfg.clone();
					tokio::spawn(async move {
						handle_connection(proxy, tls, cfg, stream, peer).await;
					});
				}
				_ = tokio::signal::ctrl_c() => {
					info!("interrupt received, shutting down");
					return Ok(());
				}
			}
		}
	}
}

async fn handle_connection(
	proxy: HttpProxy,
	tls: Option<TlsAcceptor>,
	cfg: Arc<RawConfig>,
	stream: TcpStream,
	peer: SocketAddr,
) {
	debug!(%peer, "connection opened");
	let service = hyper::service::service_fn(move |req: ::http::Request<hyper::body::Incoming>| {
		let proxy = proxy.clone();
		async move { Ok::<_, Infallible>(proxy.handle(peer.ip(), req.map(Body::new)).await) }
	});

	let builder = server_builder(&cfg);
	let served = match tls {
		Some(acceptor) => match acceptor.accept(stream).await {
			Ok(tls_stream) => {
				builder
					.serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
					.await
			},
			Err(e) => {
				debug!(%peer, err = %e, "tls handshake failed");
				return;
			},
		},
		None => {
			builder
				.serve_connection_with_upgrades(TokioIo::new(stream), service)
				.await
		},
	};
	if let Err(e) = served {
		debug!(%peer, err = %e, "connection closed with error");
	} else {
		debug!(%peer, "connection closed");
	}
}

fn server_builder(cfg: &RawConfig) -> auto::Builder<TokioExecutor> {
	let mut b = auto::Builder::new(TokioExecutor::new());
	b.http1()
		.timer(TokioTimer::new())
		.header_read_timeout(cfg.read_timeout());
	b.http2()
		.timer(TokioTimer::new())
		.keep_alive_interval(cfg.idle_timeout() / 2)
		.keep_alive_timeout(cfg.idle_timeout());
	b
}

/// Listener TLS. ACME provisioning is out of scope; without a provisioned
/// certificate we serve a self-signed one for the configured server name,
/// which is what the `autocert: false` deployments behind an edge LB want.
fn server_tls_config(server_name: Option<&str>) -> anyhow::Result<rustls::ServerConfig> {
	let name = server_name.unwrap_or("localhost");
	let certified = rcgen::generate_simple_self_signed(vec![name.to_string()])
		.context("failed to generate self-signed certificate")?;
	let cert = certified.cert.der().clone();
	let key = rustls_pki_types::PrivateKeyDer::from(rustls_pki_types::PrivatePkcs8KeyDer::from(
		certified.key_pair.serialize_der(),
	));

	let mut config = rustls::ServerConfig::builder_with_provider(crate::client::provider())
		.with_protocol_versions(rustls::ALL_VERSIONS)
		.expect("server config must be valid")
		.with_no_client_auth()
		.with_single_cert(vec![cert], key)
		.context("failed to build server TLS config")?;
	config.alpn_protocols = vec![b"h2".into(), b"http/1.1".into()];
	Ok(config)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn self_signed_config_negotiates_h2() {
		let config = server_tls_config(Some("proxy.example.com")).unwrap();
		assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
	}
}
