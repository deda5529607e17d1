//! Shared rendezvous keys, either fixed or rotating with a time-based one-time password.
use data_encoding::{Encoding, BASE32_NOPAD};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::{
	sync::{Mutex, PoisonError},
	time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::trace;

use crate::error::{DiscoveryError, Result};

pub const DEFAULT_DIGITS: u32 = 12;
/// Codes are 31-bit values, longer keys are only zero padded
pub const MAX_DIGITS: u32 = 32;

/// RFC 6238 time-based one-time password generator (HMAC-SHA1, no validation window).
#[derive(Clone)]
pub struct Totp {
	mac: Hmac<Sha1>,
	digits: u32,
	interval: u64,
}

impl Totp {
	/// Secret is decoded as base32 (any case, padding optional), or used as raw bytes if not valid base32.
	pub fn new(secret: &str, digits: u32, interval: Duration) -> Result<Self> {
		let interval = interval.as_secs();
		if interval == 0 {
			return Err(DiscoveryError::config("OTP interval must be at least one second"));
		}

		let key = decode_secret(secret)?;
		let mac = Hmac::<Sha1>::new_from_slice(&key)
			.map_err(|error| DiscoveryError::config(error.to_string()))?;
		let digits = if digits == 0 { DEFAULT_DIGITS } else { digits };
		if digits > MAX_DIGITS {
			return Err(DiscoveryError::config(format!(
				"OTP digits must be at most {MAX_DIGITS}, got {digits}"
			)));
		}
		Ok(Self {
			mac,
			digits,
			interval,
		})
	}

	pub fn at(&self, unix_seconds: u64) -> String {
		let counter = unix_seconds / self.interval;
		let mut mac = self.mac.clone();
		mac.update(&counter.to_be_bytes());
		let digest = mac.finalize().into_bytes();

		// dynamic truncation
		let offset = usize::from(digest[digest.len() - 1] & 0x0f);
		let code = u32::from_be_bytes([
			digest[offset] & 0x7f,
			digest[offset + 1],
			digest[offset + 2],
			digest[offset + 3],
		]);
		let code = match 10u64.checked_pow(self.digits) {
			Some(modulus) => u64::from(code) % modulus,
			None => u64::from(code),
		};
		format!("{code:0width$}", width = self.digits as usize)
	}
}

fn decode_secret(secret: &str) -> Result<Vec<u8>> {
	let mut specification = BASE32_NOPAD.specification();
	specification.check_trailing_bits = false;
	let lenient: Encoding = specification
		.encoding()
		.map_err(|error| DiscoveryError::config(error.to_string()))?;

	let normalized = secret.trim_end_matches('=').to_ascii_uppercase();
	Ok(lenient
		.decode(normalized.as_bytes())
		.unwrap_or_else(|_| secret.as_bytes().to_vec()))
}

pub enum RendezvousMode {
	Rotating(Totp),
	Static(String),
}

/// Produces the rendezvous key peers meet under, remembering the last rotating value.
pub struct RendezvousGenerator {
	mode: RendezvousMode,
	last: Mutex<Option<String>>,
}

impl RendezvousGenerator {
	pub fn new(mode: RendezvousMode) -> Self {
		Self {
			mode,
			last: Mutex::new(None),
		}
	}

	pub fn is_rotating(&self) -> bool {
		matches!(self.mode, RendezvousMode::Rotating(_))
	}

	pub fn current(&self) -> String {
		let now = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|elapsed| elapsed.as_secs())
			.unwrap_or_default();
		self.current_at(now)
	}

	pub fn current_at(&self, unix_seconds: u64) -> String {
		match &self.mode {
			RendezvousMode::Static(rendezvous) => rendezvous.clone(),
			RendezvousMode::Rotating(totp) => {
				let rendezvous = totp.at(unix_seconds);
				trace!(%rendezvous, "Generated rotating rendezvous");
				*self.last.lock().unwrap_or_else(PoisonError::into_inner) =
					Some(rendezvous.clone());
				rendezvous
			},
		}
	}

	/// Last value generated in rotating mode, never set in static mode.
	pub fn previous(&self) -> Option<String> {
		self.last
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
	}
}
