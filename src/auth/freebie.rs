use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::*;

/// Per-service quota of pre-authenticated requests, counted per client
/// network rather than per address so hosts behind one NAT or one v6 prefix
/// share a budget. In-memory only; restarting the proxy resets the counters.
#[derive(Debug)]
pub struct FreebieDb {
	limit: u64,
	counts: Mutex<HashMap<IpNet, u64>>,
}

impl FreebieDb {
	pub fn new(limit: u64) -> FreebieDb {
		FreebieDb {
			limit,
			counts: Mutex::new(HashMap::new()),
		}
	}

	/// Consume one freebie for the client, returning whether it was admitted.
	pub fn try_consume(&self, client: IpAddr) -> bool {
		let key = mask(client);
		let mut counts = self.counts.lock().expect("freebie mutex poisoned");
		let used = counts.entry(key).or_insert(0);
		if *used >= self.limit {
			return false;
		}
		*used += 1;
		true
	}
}

/// IPv4 clients are counted per /24, IPv6 clients per /64.
fn mask(client: IpAddr) -> IpNet {
	match client {
		IpAddr::V4(v4) => Ipv4Net::new(v4, 24)
			.expect("/24 is a valid v4 prefix")
			.trunc()
			.into(),
		IpAddr::V6(v6) => Ipv6Net::new(v6, 64)
			.expect("/64 is a valid v6 prefix")
			.trunc()
			.into(),
	}
}
