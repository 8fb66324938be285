use std::io::Cursor;
use std::path::Path;

use anyhow::Context;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::ClientConfig;
use rustls::crypto::CryptoProvider;
use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::http::{Body, HeaderValue, Request, Response, header, uri};
use crate::proxy::ProxyError;
use crate::types::service::Service;
use crate::*;

pub fn provider() -> Arc<CryptoProvider> {
	Arc::new(rustls::crypto::ring::default_provider())
}

/// Client TLS for one backend: trust is whatever CA pool the service's
/// configured cert assembles (system roots otherwise), and `insecure` skips
/// verification entirely. ALPN offers h2 so HTTPS backends can negotiate
/// HTTP/2.
pub fn backend_tls(cert_path: Option<&Path>, insecure: bool) -> anyhow::Result<Arc<ClientConfig>> {
	let mut roots = rustls::RootCertStore::empty();
	if let Some(path) = cert_path {
		let pem = std::fs::read(path)
			.with_context(|| format!("failed to read backend cert {}", path.display()))?;
		let mut reader = std::io::BufReader::new(Cursor::new(pem));
		let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
		if certs.is_empty() {
			anyhow::bail!("no certificates found in {}", path.display());
		}
		roots.add_parsable_certificates(certs);
	} else {
		for cert in rustls_native_certs::load_native_certs().certs {
			let _ = roots.add(cert);
		}
	}

	let mut config = ClientConfig::builder_with_provider(provider())
		.with_protocol_versions(rustls::ALL_VERSIONS)
		.expect("client config must be valid")
		.with_root_certificates(roots)
		.with_no_client_auth();
	if insecure {
		config
			.dangerous()
			.set_certificate_verifier(Arc::new(danger::NoVerifier));
	}
	config.alpn_protocols = vec![b"h2".into(), b"http/1.1".into()];
	Ok(Arc::new(config))
}

pub mod danger {
	use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
	use rustls::{DigitallySignedStruct, SignatureScheme};
	use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

	/// Accepts any certificate chain; only for explicitly `insecure` configs.
	#[derive(Debug)]
	pub struct NoVerifier;

	impl ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &CertificateDer<'_>,
			_intermediates: &[CertificateDer<'_>],
			_server_name: &ServerName<'_>,
			_ocsp_response: &[u8],
			_now: UnixTime,
		) -> Result<ServerCertVerified, rustls::Error> {
			Ok(ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer<'_>,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer<'_>,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
			super::provider()
				.signature_verification_algorithms
				.supported_schemes()
		}
	}
}

/// Dial the service's backend and exchange the request, streaming both
/// directions. HTTPS backends are attempted over HTTP/2 whenever ALPN
/// negotiates it, which is what gRPC requires.
pub async fn call(svc: &Service, req: Request) -> Result<Response, ProxyError> {
	let address = svc.address.clone();
	let stream = TcpStream::connect(&address).await.map_err(|e| {
		ProxyError::BackendUnavailable(format!("dial {address} failed: {e}"))
	})?;

	let Some(tls) = svc.backend_tls.clone() else {
		return request_h1(stream, req).await;
	};

	let host = address
		.rsplit_once(':')
		.map(|(h, _)| h)
		.unwrap_or(address.as_str())
		.trim_start_matches('[')
		.trim_end_matches(']');
	let server_name = ServerName::try_from(host.to_string())
		.map_err(|_| ProxyError::BackendUnavailable(format!("invalid backend host {host}")))?;
	let tls_stream = TlsConnector::from(tls)
		.connect(server_name, stream)
		.await
		.map_err(|e| ProxyError::BackendUnavailable(format!("tls to {address} failed: {e}")))?;

	let negotiated_h2 = tls_stream.get_ref().1.alpn_protocol() == Some(&b"h2"[..]);
	if negotiated_h2 {
		request_h2(tls_stream, req).await
	} else {
		request_h1(tls_stream, req).await
	}
}

async fn request_h2<T>(io: T, req: Request) -> Result<Response, ProxyError>
where
	T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
	let (mut sender, conn) = hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(io))
		.await
		.map_err(|e| ProxyError::BackendUnavailable(format!("h2 handshake failed: {e}")))?;
	// The connection task ends when the request and response bodies are done
	// with it, including when the downstream client goes away and this
	// request future is dropped.
	tokio::spawn(async move {
		if let Err(e) = conn.await {
			debug!(err = %e, "upstream h2 connection terminated");
		}
	});
	let resp = sender
		.send_request(req)
		.await
		.map_err(|e| ProxyError::BackendUnavailable(format!("upstream call failed: {e}")))?;
	Ok(resp.map(Body::new))
}

pub(crate) async fn request_h1<T>(io: T, mut req: Request) -> Result<Response, ProxyError>
where
	T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
	// HTTP/1.1 wants an origin-form target plus a Host header.
	if let Some(authority) = req.uri().authority().cloned() {
		if let Ok(v) = HeaderValue::from_str(authority.as_str()) {
			req.headers_mut().insert(header::HOST, v);
		}
	}
	let path_and_query = req
		.uri()
		.path_and_query()
		.cloned()
		.unwrap_or_else(|| uri::PathAndQuery::from_static("/"));
	*req.uri_mut() = ::http::Uri::from(path_and_query);

	let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
		.await
		.map_err(|e| ProxyError::BackendUnavailable(format!("handshake failed: {e}")))?;
	tokio::spawn(async move {
		if let Err(e) = conn.await {
			debug!(err = %e, "upstream connection terminated");
		}
	});
	let resp = sender
		.send_request(req)
		.await
		.map_err(|e| ProxyError::BackendUnavailable(format!("upstream call failed: {e}")))?;
	Ok(resp.map(Body::new))
}
