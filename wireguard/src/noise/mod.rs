pub mod aead;
mod chain;
mod hash;

use std::time::SystemTime;

use blake2::digest::consts::U32;
use blake2::digest::generic_array::GenericArray;
pub use hash::Hash;
use log::warn;
use tai64::Tai64N;
use utils::error::*;
use x25519_dalek::{PublicKey, StaticSecret as SecretKey};

pub use self::chain::Chain;
use crate::identity::{PeerIdentity, StaticIdentity};
use crate::packet::{Initiation, Response};

pub type A32 = GenericArray<u8, U32>;

#[derive(Clone)]
pub struct InitiatorHandshake {
	hash: Hash,
	chain: Chain,
	iek: SecretKey,
}

pub struct ResponderHandshake {
	hash: Hash,
	chain: Chain,
	iek: PublicKey,
}

impl InitiatorHandshake {
	/// Fills in the ephemeral key, encrypted static key and encrypted
	/// timestamp fields of `msg` and returns the in-progress handshake state.
	pub fn create_initiation(now: SystemTime, i: &StaticIdentity, r: &PeerIdentity, msg: &mut Initiation) -> Self {
		let mut hash = r_hash(r);
		let mut chain = Chain::default();

		let iek = SecretKey::random();
		msg.ephemeral = PublicKey::from(&iek);

		hash.update(&msg.ephemeral);
		chain.write(&msg.ephemeral);

		let [k] = chain.kdf(&iek.diffie_hellman(&r.pubkey));

		msg.pubkey.seal(i.pubkey, &k, &mut hash);

		let [k] = chain.kdf(r.s_agree.as_bytes());

		msg.timestamp.seal(Tai64N::from_system_time(&now).into(), &k, &mut hash);

		Self { hash, chain, iek }
	}

	/// Consumes a `Response` message, completing the handshake and returning
	/// the chaining key pair the transport session is derived from.
	pub fn consume_response(self, i: &StaticIdentity, preshared: &[u8; 32], msg: &mut Response) -> Result<Chain> {
		let Self { mut hash, mut chain, iek } = self;

		hash.update(&msg.ephemeral);
		chain.write(&msg.ephemeral);

		chain.write(&iek.diffie_hellman(&msg.ephemeral));
		chain.write(&i.key.diffie_hellman(&msg.ephemeral));

		let [t, k] = chain.kdf(preshared);

		hash.update(&t);
		msg.empty.open(&k, &mut hash)?;

		Ok(chain)
	}
}

impl ResponderHandshake {
	/// Decrypts the sender's static public key out of an `Initiation`
	/// message. The caller is responsible for looking the returned key up in
	/// its own peer table before calling [`Self::verify_timestamp`].
	pub fn open_initiation(r: &StaticIdentity, msg: &mut Initiation) -> Result<(Self, PublicKey)> {
		let mut hash = r.hash.clone();
		let mut chain = Chain::default();

		hash.update(&msg.ephemeral);
		chain.write(&msg.ephemeral);

		let [k] = chain.kdf(&r.key.diffie_hellman(&msg.ephemeral));
		let s_pub = *msg.pubkey.open(&k, &mut hash)?;

		Ok((Self { hash, chain, iek: msg.ephemeral }, s_pub))
	}

	/// Decrypts and validates the initiator's timestamp against the peer's
	/// precomputed static-static secret. Returns the decrypted timestamp so
	/// the caller can enforce monotonicity against the last one seen for
	/// this peer.
	pub fn verify_timestamp(&mut self, peer: &PeerIdentity, msg: &mut Initiation) -> Result<Tai64N> {
		let [k] = self.chain.kdf(peer.s_agree.as_bytes());
		let ts = msg.timestamp.open(&k, &mut self.hash)?;
		Tai64N::try_from(*ts).map_err(|_| warn!("Invalid timestamp on initiation"))
	}

	/// Fills in the response message and returns the chaining key pair for
	/// the new transport session.
	pub fn create_response(self, peer: &PeerIdentity, msg: &mut Response) -> Chain {
		let Self { mut hash, mut chain, iek } = self;

		let re = SecretKey::random();
		msg.ephemeral = PublicKey::from(&re);

		hash.update(&msg.ephemeral);
		chain.write(&msg.ephemeral);

		chain.write(&re.diffie_hellman(&iek));
		chain.write(&re.diffie_hellman(&peer.pubkey));

		let [t, k] = chain.kdf(&peer.preshared);

		hash.update(&t);
		msg.empty.seal((), &k, &mut hash);

		chain
	}
}

fn r_hash(r: &PeerIdentity) -> Hash {
	let mut hash = Hash::default();
	hash.update(r.pubkey.as_bytes());
	hash
}

#[cfg(test)]
mod tests {
	use std::mem::MaybeUninit;

	use super::*;

	fn zeroed<T>() -> T {
		unsafe { MaybeUninit::zeroed().assume_init() }
	}

	#[test]
	fn handshake_round_trip_derives_matching_keys() {
		let i_key = SecretKey::random();
		let r_key = SecretKey::random();

		let i_identity = StaticIdentity::new(i_key.to_bytes());
		let r_identity = StaticIdentity::new(r_key.to_bytes());

		let psk = [0u8; 32];

		let i_view_of_r = PeerIdentity::new(&i_identity, r_identity.pubkey, psk);
		let r_view_of_i = PeerIdentity::new(&r_identity, i_identity.pubkey, psk);

		let mut init: Initiation = zeroed();
		let initiator = InitiatorHandshake::create_initiation(SystemTime::now(), &i_identity, &i_view_of_r, &mut init);

		let (mut responder, s_pub) = ResponderHandshake::open_initiation(&r_identity, &mut init).unwrap();
		assert_eq!(s_pub, i_identity.pubkey);

		responder.verify_timestamp(&r_view_of_i, &mut init).unwrap();

		let mut resp: Response = zeroed();
		let r_chain = responder.create_response(&r_view_of_i, &mut resp);

		let i_chain = initiator.consume_response(&i_identity, &psk, &mut resp).unwrap();

		let (i_send, i_recv) = i_chain.consume();
		let (r_recv, r_send) = r_chain.consume();

		assert_eq!(i_send, r_recv);
		assert_eq!(i_recv, r_send);
	}
}
