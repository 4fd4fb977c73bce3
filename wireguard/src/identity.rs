use x25519_dalek::{PublicKey, StaticSecret as SecretKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::mac::Mac1Key;
use crate::noise::Hash;

/// The local static identity of a wireguard interface: its private key, the
/// hash chain seeded from the corresponding public key, and the MAC1 key
/// every inbound packet addressed to this interface is checked against.
pub struct StaticIdentity {
	pub key: SecretKey,
	pub pubkey: PublicKey,
	pub hash: Hash,
	pub mac1: Mac1Key,
}

impl StaticIdentity {
	#[must_use]
	pub fn new(s_key: [u8; 32]) -> Self {
		let key = SecretKey::from(s_key);
		let pubkey = PublicKey::from(&key);

		let mut hash = Hash::default();
		hash.update(pubkey.as_bytes());

		let mac1 = Mac1Key::new(pubkey.as_bytes());

		Self { key, pubkey, hash, mac1 }
	}
}

/// A remote peer's static public key, the precomputed static-static
/// Diffie-Hellman secret and the pre-shared key, held only by the enclave.
/// `mac1` is keyed off the peer's own public key: whichever side writes a
/// handshake message addresses MAC1 to the other party, so the same key
/// serves both the initiation and the response we send this peer.
pub struct PeerIdentity {
	pub pubkey: PublicKey,
	pub preshared: [u8; 32],
	pub s_agree: StaticAgree,
	pub mac1: Mac1Key,
}

/// The precomputed static-static Diffie-Hellman secret. Never copied, always
/// zeroized on drop: this value alone is enough to derive every session key
/// for the peer.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct StaticAgree([u8; 32]);

impl StaticAgree {
	#[must_use]
	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}
}

impl PeerIdentity {
	#[must_use]
	pub fn new(identity: &StaticIdentity, pubkey: PublicKey, preshared: [u8; 32]) -> Self {
		let s_agree = StaticAgree(identity.key.diffie_hellman(&pubkey).to_bytes());
		let mac1 = Mac1Key::new(pubkey.as_bytes());

		Self { pubkey, preshared, s_agree, mac1 }
	}
}
