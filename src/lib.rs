pub mod auth;
pub mod client;
pub mod config;
pub mod http;
pub mod lnd;
pub mod mint;
pub mod pricer;
pub mod proxy;
pub mod types;

// Common imports, glob-imported throughout the crate as `use crate::*`.
pub use std::collections::HashMap;
pub use std::fmt::{self, Debug, Display};
pub use std::net::{IpAddr, SocketAddr};
pub use std::pin::Pin;
pub use std::sync::{Arc, Mutex};
pub use std::time::{Duration, Instant};

pub use bytes::Bytes;
pub use serde::{Deserialize, Serialize, Serializer};
pub use tracing::{debug, error, info, trace, warn};

pub fn is_default<T: Default + PartialEq>(t: &T) -> bool {
	*t == T::default()
}

/// Serde adapter for human-readable durations ("500ms", "1s", "2min").
pub mod serde_dur {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(t: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&format!("{}ms", t.as_millis()))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		let raw = String::deserialize(deserializer)?;
		duration_str::parse(&raw).map_err(serde::de::Error::custom)
	}
}

pub mod serde_dur_option {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(t: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
		match t {
			Some(t) => super::serde_dur::serialize(t, serializer),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(
		deserializer: D,
	) -> Result<Option<Duration>, D::Error> {
		let raw = Option::<String>::deserialize(deserializer)?;
		raw
			.map(|r| duration_str::parse(&r).map_err(serde::de::Error::custom))
			.transpose()
	}
}
