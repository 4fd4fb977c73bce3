use std::time::{Duration, Instant};

use blake2::digest::generic_array::sequence::Split;
use blake2::digest::generic_array::GenericArray;
use blake2::digest::typenum::U16;
use blake2::digest::{FixedOutput, FixedOutputReset, KeyInit, Update};
use blake2::{Blake2s256 as Hasher, Blake2sMac};
use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{Tag, XChaCha20Poly1305 as XAead};
use collections::bytes::Cursor;
use log::warn;
use utils::error::*;

const LABEL_MAC1: &[u8] = b"mac1----";
const LABEL_COOKIE: &[u8] = b"cookie--";

type A16 = GenericArray<u8, U16>;
type Mac = Blake2sMac<U16>;

#[derive(Clone, Copy)]
pub struct Mac1(A16);

impl Mac1 {
	/// Reconstructs the MAC1 value from the trailing 16 bytes of a message
	/// that already carries it, so a process that did not compute MAC1
	/// itself (the IFN, applying MAC2 on the enclave's behalf) can still use
	/// it as the cookie-reply AEAD key.
	#[must_use]
	pub fn from_bytes(bytes: [u8; 16]) -> Self {
		Self(A16::clone_from_slice(&bytes))
	}
}

/// Validates and computes MAC1, the per-destination-identity DoS-resistance
/// tag every handshake and cookie-reply message carries. Keyed off whichever
/// static public key the message is addressed to: the local interface's key
/// when checking inbound packets, a peer's key when signing outbound ones.
pub struct Mac1Key(A16);

impl Mac1Key {
	#[must_use]
	pub fn new(dest_pubkey: &[u8; 32]) -> Self {
		let mut hasher = Hasher::default();
		hasher.update(LABEL_MAC1);
		hasher.update(dest_pubkey);

		Self(hasher.finalize_fixed())
	}

	/// Checks the trailing 16-byte MAC1 field against the rest of `bytes`.
	pub fn verify(&self, bytes: &[u8]) -> Result {
		let m1 = bytes.len() - 32;
		let m2 = bytes.len() - 16;

		let mac1 = Mac::new(&self.0).chain(&bytes[..m1]).finalize_fixed();

		if mac1.as_slice() != &bytes[m1..m2] {
			warn!("Packet contains invalid mac1");
			return Err(());
		}

		Ok(())
	}

	/// Writes MAC1 over everything preceding it in `buf`, then zero-fills the
	/// trailing MAC2 slot right after it so the message reserves its full
	/// wire size (the ifn that owns the outbound socket fills MAC2 in place
	/// later, via [`CookieState::write_mac2`]). Returns the MAC1 value for
	/// later use as a cookie-reply AEAD key.
	#[must_use]
	pub fn write(&self, mut buf: Cursor) -> Mac1 {
		let (data, mac1) = buf.fork().rsplit();
		Mac::new(&self.0).chain(&*data).finalize_into(mac1);
		let value = Mac1(*mac1);

		let (_, mac2) = buf.rsplit::<A16>();
		mac2.fill(0);

		value
	}
}

/// Per-destination cookie state. Only the process that owns the outbound
/// socket a packet is written to keeps one of these; the enclave never
/// holds cookie state and always leaves MAC2 zeroed.
pub struct CookieState {
	aead: XAead,
	cached: Option<Tau>,
}

#[derive(Clone, Copy)]
struct Tau {
	value: A16,
	time: Instant,
}

const COOKIE_LIFETIME: Duration = Duration::from_secs(120);

impl CookieState {
	#[must_use]
	pub fn new(dest_pubkey: &[u8; 32]) -> Self {
		let mut hasher = Hasher::default();
		hasher.update(LABEL_COOKIE);
		hasher.update(dest_pubkey);

		Self { aead: XAead::new(&hasher.finalize_fixed()), cached: None }
	}

	/// Decrypts a received cookie-reply payload, keyed by the MAC1 value of
	/// the message it answers, and caches it for MAC2 use.
	pub fn handle_cookie_reply(&mut self, nonce: &[u8; 24], mut cookie: [u8; 32], last_mac1: &Mac1, now: Instant) -> Result {
		let (tau, tag): (&mut GenericArray<u8, U16>, &mut Tag) = <&mut GenericArray<_, _>>::from(&mut cookie).split();

		self.aead
			.decrypt_in_place_detached(nonce.into(), &last_mac1.0, tau, tag)
			.map_err(|_| warn!("Failed to decrypt cookie value"))?;

		self.cached = Some(Tau { value: *tau, time: now });

		Ok(())
	}

	/// Writes MAC2 over the trailing 16 bytes of `buf`, treating everything
	/// before them as the data to authenticate. Takes a plain slice rather
	/// than a [`Cursor`]: unlike MAC1, which the enclave writes while still
	/// assembling a handshake message field by field, MAC2 is applied by
	/// whichever ifn owns the outbound socket, over a complete message it
	/// only received as bytes.
	pub fn write_mac2(&mut self, buf: &mut [u8], now: Instant) {
		let at = buf.len() - 16;
		let (data, mac2) = buf.split_at_mut(at);
		let mac2 = GenericArray::from_mut_slice(mac2);

		match self.live(now) {
			Some(mut core) => {
				core.update(data);
				core.finalize_into(mac2);
			}
			None => mac2.fill(0),
		}
	}

	fn live(&mut self, now: Instant) -> Option<Mac> {
		let tau = self.cached?;

		if now - tau.time >= COOKIE_LIFETIME {
			self.cached = None;
			return None;
		}

		Some(Mac::new_from_slice(&tau.value).expect("Key size is valid"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mac1_write_then_verify() {
		let dest = [7u8; 32];
		let key = Mac1Key::new(&dest);

		let mut buf = vec![0u8; 64];

		Cursor::vec(&mut buf, |mut cursor| {
			let payload: &mut [u8; 32] = cursor.fork().cast();
			payload.copy_from_slice(&[1u8; 32]);

			key.write(cursor);
		});

		key.verify(&buf).unwrap();

		// mac1 reserves the trailing mac2 slot too, zeroed until an ifn fills it in.
		assert_eq!(&buf[48..64], &[0u8; 16]);

		buf[0] ^= 1;
		assert!(key.verify(&buf).is_err());
	}
}
