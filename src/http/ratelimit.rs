use regex::Regex;

use crate::*;

/// A single rate-limit rule as it appears in the service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitSerde {
	#[serde(rename = "pathregex", with = "serde_regex")]
	pub path_regex: Regex,
	pub requests: u64,
	#[serde(default = "default_per", with = "serde_dur")]
	pub per: Duration,
	#[serde(default)]
	pub burst: u64,
}

fn default_per() -> Duration {
	Duration::from_secs(1)
}

/// A compiled rule: one shared bucket for anonymous traffic plus a lazily
/// grown bucket per client identity. The identity map is only touched under
/// the rule mutex; the buckets themselves are internally atomic.
pub struct RateLimitPolicy {
	path_regex: Regex,
	requests: u64,
	per: Duration,
	burst: u64,
	global: Arc<ratelimit::Ratelimiter>,
	by_identity: Mutex<HashMap<String, Arc<ratelimit::Ratelimiter>>>,
}

impl Debug for RateLimitPolicy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RateLimitPolicy")
			.field("path_regex", &self.path_regex.as_str())
			.field("requests", &self.requests)
			.field("per", &self.per)
			.field("burst", &self.burst)
			.finish()
	}
}

impl TryFrom<RateLimitSerde> for RateLimitPolicy {
	type Error = anyhow::Error;

	fn try_from(value: RateLimitSerde) -> Result<Self, Self::Error> {
		if value.requests == 0 {
			anyhow::bail!("rate limit requires requests >= 1");
		}
		if value.per.is_zero() {
			anyhow::bail!("rate limit interval must be positive");
		}
		// An unset burst admits exactly the configured request count.
		let burst = if value.burst == 0 {
			value.requests
		} else {
			value.burst
		};
		if burst < value.requests {
			anyhow::bail!("burst must be at least the request count");
		}
		let global = Arc::new(new_bucket(value.requests, value.per, burst)?);
		Ok(RateLimitPolicy {
			path_regex: value.path_regex,
			requests: value.requests,
			per: value.per,
			burst,
			global,
			by_identity: Mutex::new(HashMap::new()),
		})
	}
}

fn new_bucket(
	requests: u64,
	per: Duration,
	burst: u64,
) -> Result<ratelimit::Ratelimiter, ratelimit::Error> {
	ratelimit::Ratelimiter::builder(requests, per)
		.max_tokens(burst)
		.initial_available(burst)
		.build()
}

impl RateLimitPolicy {
	pub fn matches(&self, path: &str) -> bool {
		self.path_regex.is_match(path)
	}

	/// Consume one token for `identity`. The empty identity shares the global
	/// bucket; every distinct identity gets its own bucket with the same
	/// parameters, created on first use.
	pub fn allow(&self, identity: &str) -> bool {
		self.bucket(identity).try_wait().is_ok()
	}

	/// The delay until `identity` would next be admitted. Never consumes
	/// tokens; repeated calls without an intervening `allow` do not change the
	/// outcome.
	pub fn reserve_delay(&self, identity: &str) -> Duration {
		self.bucket(identity).next_available()
	}

	fn bucket(&self, identity: &str) -> Arc<ratelimit::Ratelimiter> {
		if identity.is_empty() {
			return self.global.clone();
		}
		let mut map = self.by_identity.lock().expect("rate limit mutex poisoned");
		if let Some(bucket) = map.get(identity) {
			return bucket.clone();
		}
		let bucket = Arc::new(
			new_bucket(self.requests, self.per, self.burst)
				.expect("parameters already validated at compile time"),
		);
		map.insert(identity.to_string(), bucket.clone());
		bucket
	}
}

/// Consult every rule matching `path`. Admission requires all of them to
/// allow; on denial the reported delay is the strictest (largest) of the
/// denying rules.
pub fn check_all<'a>(
	rules: impl Iterator<Item = &'a RateLimitPolicy>,
	path: &str,
	identity: &str,
) -> Result<(), Duration> {
	let mut max_delay: Option<Duration> = None;
	for rule in rules.filter(|r| r.matches(path)) {
		if !rule.allow(identity) {
			let delay = rule.reserve_delay(identity);
			max_delay = Some(max_delay.map_or(delay, |d| d.max(delay)));
		}
	}
	match max_delay {
		Some(delay) => Err(delay),
		None => Ok(()),
	}
}

/// Retry-After wants whole seconds: round up, and never advertise zero for a
/// positive delay.
pub fn retry_after_secs(delay: Duration) -> u64 {
	if delay.is_zero() {
		return 0;
	}
	let secs = delay.as_secs();
	if delay.subsec_nanos() > 0 { secs + 1 } else { secs.max(1) }
}

// Adapted from https://github.com/pelikan-io/rustcommon/tree/main/ratelimit:
// lock-free token bucket, reduced to single-token admission plus a pure
// read of the refill schedule.
mod ratelimit {
	use core::sync::atomic::{AtomicU64, Ordering};

	use clocksource::precise::{AtomicInstant, Duration, Instant};
	use thiserror::Error;

	#[derive(Error, Debug, PartialEq, Eq)]
	pub enum Error {
		#[error("available tokens cannot be set higher than max tokens")]
		AvailableTokensTooHigh,
		#[error("max tokens cannot be less than the refill amount")]
		MaxTokensTooLow,
		#[error("refill interval in nanoseconds exceeds maximum u64")]
		RefillIntervalTooLong,
	}

	#[derive(Debug, Clone, Copy, Eq, PartialEq)]
	struct Parameters {
		capacity: u64,
		refill_amount: u64,
		refill_interval: Duration,
	}

	pub struct Ratelimiter {
		available: AtomicU64,
		parameters: Parameters,
		refill_at: AtomicInstant,
	}

	impl Ratelimiter {
		/// Initialize a builder that will construct a `Ratelimiter` that adds
		/// `amount` tokens to the bucket after each `interval` has elapsed.
		pub fn builder(amount: u64, interval: core::time::Duration) -> Builder {
			Builder::new(amount, interval)
		}

		/// Returns the number of tokens currently available.
		pub fn available(&self) -> u64 {
			self.available.load(Ordering::Relaxed)
		}

		/// Returns the time of the next refill.
		pub fn next_refill(&self) -> Instant {
			self.refill_at.load(Ordering::Relaxed)
		}

		/// How long until a token becomes available, as a pure read: no token
		/// is consumed and the refill schedule is left untouched.
		pub fn next_available(&self) -> core::time::Duration {
			if self.available.load(Ordering::Acquire) > 0 {
				return core::time::Duration::ZERO;
			}
			let now = Instant::now();
			let refill_at = self.next_refill();
			if refill_at <= now {
				// A refill is already due; the next `try_wait` will apply it.
				return core::time::Duration::ZERO;
			}
			core::time::Duration::from_nanos((refill_at - now).as_nanos())
		}

		/// Internal function to refill the token bucket. Called as part of
		/// `try_wait()`.
		fn refill(&self, time: Instant) -> Result<(), core::time::Duration> {
			// will hold the number of elapsed refill intervals
			let mut intervals;
			let parameters = self.parameters;

			loop {
				// determine when next refill should occur
				let refill_at = self.next_refill();

				// if this time is before the next refill is due, return
				if time < refill_at {
					return Err(core::time::Duration::from_nanos(
						(refill_at - time).as_nanos(),
					));
				}

				intervals = (time - refill_at).as_nanos() / parameters.refill_interval.as_nanos() + 1;

				// calculate when the following refill would be
				let next_refill =
					refill_at + Duration::from_nanos(intervals * parameters.refill_interval.as_nanos());

				// compare/exchange, if race, loop and check if we still need to
				// refill before trying again
				if self
					.refill_at
					.compare_exchange(refill_at, next_refill, Ordering::AcqRel, Ordering::Acquire)
					.is_ok()
				{
					break;
				}
			}

			let amount = intervals * parameters.refill_amount;
			let available = self.available.load(Ordering::Acquire);

			if available + amount >= parameters.capacity {
				// fill the bucket up to the capacity, dropping the excess
				let to_add = parameters.capacity - available;
				self.available.fetch_add(to_add, Ordering::Release);
			} else {
				self.available.fetch_add(amount, Ordering::Release);
			}

			Ok(())
		}

		/// Non-blocking function to "wait" for a single token. On success, a
		/// single token has been acquired. On failure, a `Duration` hinting at
		/// when the next refill would occur is returned.
		pub fn try_wait(&self) -> Result<(), core::time::Duration> {
			// We have an outer loop that drives the refilling of the token
			// bucket. This will only be repeated if we refill successfully, but
			// somebody else takes the newly available token(s) before we can
			// attempt to acquire them.
			loop {
				let refill_result = self.refill(Instant::now());

				// Note: it does not matter yet whether refill succeeded or
				// failed. We might already have tokens available.

				// The inner loop deals with acquiring tokens. It only repeats
				// if there is a race on the available count.
				loop {
					let available = self.available.load(Ordering::Acquire);

					if available == 0 {
						match refill_result {
							Ok(_) => {
								// Refill succeeded but another caller raced us
								// to the new tokens. Try to refill again.
								break;
							},
							Err(e) => {
								return Err(e);
							},
						}
					}

					if self
						.available
						.compare_exchange(available, available - 1, Ordering::AcqRel, Ordering::Acquire)
						.is_ok()
					{
						return Ok(());
					}

					// Raced on the compare exchange; either there are still
					// tokens to acquire or we break out and refill again.
				}
			}
		}
	}

	pub struct Builder {
		initial_available: u64,
		max_tokens: u64,
		refill_amount: u64,
		refill_interval: core::time::Duration,
	}

	impl Builder {
		fn new(amount: u64, interval: core::time::Duration) -> Self {
			Self {
				initial_available: 0,
				// default of one to prohibit bursts
				max_tokens: 1,
				refill_amount: amount,
				refill_interval: interval,
			}
		}

		/// Set the max tokens the `Ratelimiter` can hold at any time, which
		/// bounds the size of bursts. Cannot be lower than the refill amount.
		pub fn max_tokens(mut self, tokens: u64) -> Self {
			self.max_tokens = tokens;
			self
		}

		/// Set the number of tokens that are initially available.
		pub fn initial_available(mut self, tokens: u64) -> Self {
			self.initial_available = tokens;
			self
		}

		/// Consumes this `Builder` and attempts to construct a `Ratelimiter`.
		pub fn build(self) -> Result<Ratelimiter, Error> {
			if self.max_tokens < self.refill_amount {
				return Err(Error::MaxTokensTooLow);
			}
			if self.initial_available > self.max_tokens {
				return Err(Error::AvailableTokensTooHigh);
			}
			if self.refill_interval.as_nanos() > u64::MAX as u128 {
				return Err(Error::RefillIntervalTooLong);
			}

			let parameters = Parameters {
				capacity: self.max_tokens,
				refill_amount: self.refill_amount,
				refill_interval: Duration::from_nanos(self.refill_interval.as_nanos() as u64),
			};

			Ok(Ratelimiter {
				available: AtomicU64::new(self.initial_available),
				parameters,
				refill_at: AtomicInstant::new(Instant::now() + parameters.refill_interval),
			})
		}
	}

}
