//! The in-memory structured configuration the master turns into startup
//! records. Deserializing it from a file is the only config-file concern
//! this crate takes on; the human-facing grammar beyond a straightforward
//! TOML mapping is an external tool's job.

use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use zeroize::Zeroizing;

fn parse_key(raw: &str) -> Result<[u8; 32], String> {
	let bytes = BASE64.decode(raw.trim()).map_err(|err| format!("invalid base64 key: {err}"))?;

	bytes.try_into().map_err(|bytes: Vec<u8>| format!("key is {} bytes, expected 32", bytes.len()))
}

/// A 32-byte secret that is zeroized on drop: the in-memory home for every
/// private key and pre-shared key between the config file and the point
/// each child's startup record is written and forgotten.
#[derive(Clone, Deserialize)]
#[serde(try_from = "String")]
pub struct SecretKey(Zeroizing<[u8; 32]>);

impl SecretKey {
	#[must_use]
	pub fn as_bytes(&self) -> &[u8; 32] {
		&*self.0
	}
}

impl TryFrom<String> for SecretKey {
	type Error = String;

	fn try_from(raw: String) -> Result<Self, Self::Error> {
		Ok(Self(Zeroizing::new(parse_key(&raw)?)))
	}
}

#[derive(Clone, Copy, Deserialize)]
#[serde(try_from = "String")]
pub struct PublicKeyBytes(pub [u8; 32]);

impl TryFrom<String> for PublicKeyBytes {
	type Error = String;

	fn try_from(raw: String) -> Result<Self, Self::Error> {
		Ok(Self(parse_key(&raw)?))
	}
}

#[derive(Clone, Deserialize)]
pub struct CidrAddr {
	pub addr: IpAddr,
	pub prefix_len: u8,
	#[serde(default)]
	pub port: u16,
}

#[derive(Clone, Deserialize)]
pub struct PeerConfig {
	pub public_key: PublicKeyBytes,
	#[serde(default = "default_psk")]
	pub preshared_key: SecretKey,
	#[serde(default)]
	pub endpoint: Option<SocketAddr>,
	#[serde(default)]
	pub allowed_ips: Vec<CidrAddr>,
}

fn default_psk() -> SecretKey {
	SecretKey(Zeroizing::new([0u8; 32]))
}

#[derive(Clone, Deserialize)]
pub struct InterfaceConfig {
	pub private_key: SecretKey,
	/// An already-open tun device descriptor, inherited from whatever
	/// operator tooling created and named the device; this crate never
	/// calls into the tun ioctl surface itself.
	pub tun_fd: RawFd,
	#[serde(default)]
	pub addresses: Vec<CidrAddr>,
	#[serde(default)]
	pub listeners: Vec<CidrAddr>,
	#[serde(default)]
	pub peers: Vec<PeerConfig>,
}

#[derive(Clone, Deserialize)]
pub struct Config {
	#[serde(default)]
	pub background: bool,
	#[serde(default)]
	pub verbose: bool,
	#[serde(default)]
	pub uid: u32,
	#[serde(default)]
	pub gid: u32,
	pub interfaces: Vec<InterfaceConfig>,
}

impl Config {
	pub fn load(path: &str) -> Result<Self, String> {
		let text = std::fs::read_to_string(path).map_err(|err| format!("reading {path}: {err}"))?;
		toml::from_str(&text).map_err(|err| format!("parsing {path}: {err}"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const KEY_A: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

	#[test]
	fn parses_a_minimal_interface() {
		let toml = format!(
			r#"
			[[interfaces]]
			private_key = "{KEY_A}"
			tun_fd = 7

			[[interfaces.peers]]
			public_key = "{KEY_A}"
			allowed_ips = [{{ addr = "10.0.0.2", prefix_len = 32 }}]
			"#
		);

		let cfg: Config = toml::from_str(&toml).unwrap();
		assert_eq!(cfg.interfaces.len(), 1);
		assert_eq!(cfg.interfaces[0].tun_fd, 7);
		assert_eq!(cfg.interfaces[0].peers.len(), 1);
		assert_eq!(cfg.interfaces[0].peers[0].allowed_ips[0].prefix_len, 32);
		// No preshared_key given: defaults to all-zero (WireGuard's "no psk").
		assert_eq!(*cfg.interfaces[0].peers[0].preshared_key.as_bytes(), [0u8; 32]);
	}

	#[test]
	fn rejects_a_short_key() {
		let toml = r#"
			[[interfaces]]
			private_key = "AAAA"
			tun_fd = 7
			"#;

		assert!(toml::from_str::<Config>(toml).is_err());
	}
}
