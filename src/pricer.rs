use tonic::codec::ProstCodec;
use tonic::transport::{Channel, Endpoint};

use crate::*;

/// Answers "what does this path cost". Most services carry a static price;
/// services with dynamic pricing delegate to an external gRPC pricer.
#[async_trait::async_trait]
pub trait Pricer: Send + Sync {
	async fn get_price(&self, path: &str) -> anyhow::Result<u64>;

	/// Release any resources held open for pricing.
	async fn close(&self) -> anyhow::Result<()> {
		Ok(())
	}
}

/// The common case: one configured price for every path of the service.
#[derive(Debug, Clone)]
pub struct StaticPricer {
	price: u64,
}

impl StaticPricer {
	pub fn new(price: u64) -> StaticPricer {
		StaticPricer { price }
	}
}

#[async_trait::async_trait]
impl Pricer for StaticPricer {
	async fn get_price(&self, _path: &str) -> anyhow::Result<u64> {
		Ok(self.price)
	}
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetPriceRequest {
	#[prost(string, tag = "1")]
	pub path: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetPriceResponse {
	#[prost(int64, tag = "1")]
	pub price_sats: i64,
}

/// Client for an external per-path pricing service. The channel connects
/// lazily and is shared by every request to the owning service.
pub struct GrpcPricer {
	channel: Channel,
}

impl GrpcPricer {
	pub fn connect(address: &str) -> anyhow::Result<GrpcPricer> {
		let address = if address.contains("://") {
			address.to_string()
		} else {
			format!("http://{address}")
		};
		let channel = Endpoint::from_shared(address)?.connect_lazy();
		Ok(GrpcPricer { channel })
	}
}

impl Debug for GrpcPricer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("GrpcPricer").finish()
	}
}

#[async_trait::async_trait]
impl Pricer for GrpcPricer {
	async fn get_price(&self, path: &str) -> anyhow::Result<u64> {
		let mut grpc = tonic::client::Grpc::new(self.channel.clone());
		grpc
			.ready()
			.await
			.map_err(|e| anyhow::anyhow!("pricer unavailable: {e}"))?;
		let codec: ProstCodec<GetPriceRequest, GetPriceResponse> = ProstCodec::default();
		let rpc = ::http::uri::PathAndQuery::from_static("/pricerrpc.Prices/GetPrice");
		let resp = grpc
			.unary(
				tonic::Request::new(GetPriceRequest {
					path: path.to_string(),
				}),
				rpc,
				codec,
			)
			.await
			.map_err(|status| anyhow::anyhow!("pricer call failed: {status}"))?;
		let price = resp.into_inner().price_sats;
		if price < 0 {
			anyhow::bail!("pricer returned negative price {price}");
		}
		Ok(price as u64)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn static_pricer_ignores_path() {
		let pricer = StaticPricer::new(42);
		assert_eq!(pricer.get_price("/a").await.unwrap(), 42);
		assert_eq!(pricer.get_price("/b").await.unwrap(), 42);
		pricer.close().await.unwrap();
	}

	#[tokio::test]
	async fn grpc_pricer_normalizes_address() {
		assert!(GrpcPricer::connect("127.0.0.1:4000").is_ok());
		assert!(GrpcPricer::connect("https://pricer.example.com").is_ok());
	}
}
