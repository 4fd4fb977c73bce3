use std::time::{Duration, Instant};

use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305 as Aead, KeyInit, Nonce, Tag};
use collections::bytes::{Cursor, Slice};
use log::warn;
use utils::bytes;
use utils::error::*;

use crate::noise::Chain;
use crate::packet::{self, Data};
use crate::window::Window;

pub const REKEY_AFTER_MESSAGES: u64 = 2u64.pow(60);
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - 2u64.pow(13);

pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);
pub const REKEY_ATTEMPT_TIME: Duration = Duration::from_secs(90);
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);

fn open(key: &Aead, ctr: u64, buf: &mut Slice) -> Result {
	let tag = *buf.rsplit();

	key.decrypt_in_place_detached(&nonce(ctr), &[], buf, &tag)
		.map_err(|_| warn!("Failed to decrypt data payload"))?;
	Ok(())
}

fn nonce(n: u64) -> Nonce {
	let mut nonce = Nonce::default();
	*bytes::cast_mut(&mut nonce[4..]) = n.to_le_bytes();
	nonce
}

#[derive(PartialEq, Eq)]
pub enum Role {
	Initiator,
	Responder,
}

pub struct Simplex {
	key: Aead,
	win: Window,
	time: Instant,
}

impl Simplex {
	fn initiator(now: Instant, key: Aead) -> Self {
		Self { key, win: Window::empty(), time: now }
	}

	fn responder(key: Aead, idx: u64, time: Instant) -> Self {
		Self { key, win: Window::new(idx), time }
	}

	fn open_checked(&mut self, now: Instant, ctr: u64, buf: &mut Slice) -> Result<Duration> {
		let elapsed = now - self.time;

		if elapsed >= REJECT_AFTER_TIME || ctr >= REJECT_AFTER_MESSAGES {
			warn!("Opening key for message has expired (elapsed: {:?}, ctr: {})", elapsed, ctr);
			return Err(());
		}

		self.win.guard(ctr, || open(&self.key, ctr, buf))?;

		Ok(elapsed)
	}

	pub fn open(&mut self, now: Instant, ctr: u64, buf: &mut Slice) -> Result {
		self.open_checked(now, ctr, buf)?;
		Ok(())
	}
}

/// An established transport session: one send key, one receive key, a
/// replay window and the 64-bit send counter.
pub struct Tunnel {
	pub recv: Simplex,
	role: Role,

	send: Aead,
	sctr: u64,
	sidx: u32,
}

impl Tunnel {
	#[must_use]
	pub fn new(now: Instant, chain: Chain, sidx: u32) -> Self {
		let (send, recv) = chain.consume();

		Self {
			recv: Simplex::initiator(now, Aead::new(&recv)),
			role: Role::Initiator,

			send: Aead::new(&send),
			sctr: 0,
			sidx,
		}
	}

	/// Builds a session directly from the raw transport keys carried over
	/// `MSGSESSKEYS`: the ifn never sees the `Chain` the enclave derived
	/// them from, only the two keys it handed out.
	#[must_use]
	pub fn from_keys(now: Instant, send: [u8; 32], recv: [u8; 32], sidx: u32) -> Self {
		Self {
			recv: Simplex::initiator(now, Aead::new_from_slice(&recv).expect("key is 32 bytes")),
			role: Role::Initiator,

			send: Aead::new_from_slice(&send).expect("key is 32 bytes"),
			sctr: 0,
			sidx,
		}
	}

	/// Returns whether a rekey is needed.
	pub fn open(&mut self, now: Instant, ctr: u64, buf: &mut Slice) -> Result<bool> {
		let elapsed = self.recv.open_checked(now, ctr, buf)?;
		let rekey = self.role == Role::Initiator && elapsed >= REJECT_AFTER_TIME - KEEPALIVE_TIMEOUT - REKEY_TIMEOUT;
		Ok(rekey)
	}

	#[must_use]
	pub fn is_send_expired(&self, now: Instant) -> bool {
		now.duration_since(self.recv.time) >= REJECT_AFTER_TIME || self.sctr + 1 >= REJECT_AFTER_MESSAGES
	}

	/// Returns whether a rekey is needed. Assumes [`Self::is_send_expired`]
	/// has been checked to be false.
	pub fn send(&mut self, now: Instant, buf: Cursor, f: impl FnOnce(Cursor)) -> bool {
		let elapsed = now - self.recv.time;

		let ctr = self.sctr;
		self.sctr += 1;

		let rekey = (self.role == Role::Initiator && elapsed >= REKEY_AFTER_TIME) || ctr >= REKEY_AFTER_MESSAGES;

		let mut buf = buf.push(&Data { tag: packet::Tag::DATA, idx: self.sidx, ctr });

		f(buf.rlim(16));
		buf.pad_to(16);

		let (mut data, tag): (_, &mut Tag) = buf.rsplit();

		*tag = self
			.send
			.encrypt_in_place_detached(&nonce(ctr), &[], &mut data)
			.expect("Encrypting should not fail");

		rekey
	}
}

/// The session derived from a `Response` we sent but have not yet received
/// data on: the wheel slot rotates this into [`Tunnel`] on first receive.
pub struct Next {
	pub sidx: u32,
	pub skey: Aead,
	pub rkey: Aead,
	pub time: Instant,
}

impl Next {
	#[must_use]
	pub fn new(now: Instant, chain: Chain, s_idx: u32) -> Self {
		let (recv, send) = chain.consume();

		Self { sidx: s_idx, skey: Aead::new(&send), rkey: Aead::new(&recv), time: now }
	}

	/// Builds a pending session directly from the raw transport keys carried
	/// over `MSGSESSKEYS` for the responder side: the ifn installs this as
	/// "next" and promotes it to [`Tunnel`] on the first successful decrypt.
	#[must_use]
	pub fn from_keys(now: Instant, send: [u8; 32], recv: [u8; 32], s_idx: u32) -> Self {
		Self { sidx: s_idx, skey: Aead::new_from_slice(&send).expect("key is 32 bytes"), rkey: Aead::new_from_slice(&recv).expect("key is 32 bytes"), time: now }
	}

	pub fn recv(&self, ctr: u64, buf: &mut Slice) -> Result<Tunnel> {
		open(&self.rkey, ctr, buf)?;

		Ok(Tunnel {
			recv: Simplex::responder(self.rkey.clone(), ctr, self.time),
			role: Role::Responder,

			send: self.skey.clone(),
			sctr: 0,
			sidx: self.sidx,
		})
	}
}

#[cfg(test)]
mod tests {
	use std::mem::size_of;

	use super::*;

	/// Two tunnels installed from the same `MSGSESSKEYS` exchange, send/recv
	/// keys swapped the way the enclave hands them to each side.
	fn session_pair(now: Instant, a_key: u8, b_key: u8) -> (Tunnel, Tunnel) {
		let a_to_b = [a_key; 32];
		let b_to_a = [b_key; 32];

		(Tunnel::from_keys(now, a_to_b, b_to_a, 0xaaaa), Tunnel::from_keys(now, b_to_a, a_to_b, 0xbbbb))
	}

	fn send(tun: &mut Tunnel, now: Instant, payload: &[u8]) -> (Vec<u8>, bool) {
		let mut raw = vec![0u8; 1500];
		let mut rekey = false;

		Cursor::vec(&mut raw, |cur| {
			rekey = tun.send(now, cur, |body| {
				body.push(payload);
			});
		});

		(raw, rekey)
	}

	/// Splits a `send()`-produced datagram back into its counter and the
	/// ciphertext+tag `Tunnel::open`/`Next::recv` expect.
	fn as_slice(datagram: &[u8]) -> (u64, Slice) {
		let msg: &Data = bytes::cast(&datagram[..size_of::<Data>()]);

		let mut buf = Slice::new(datagram.len() - size_of::<Data>());
		buf.copy_from_slice(&datagram[size_of::<Data>()..]);

		(msg.ctr, buf)
	}

	#[test]
	fn round_trip_delivers_plaintext() {
		let now = Instant::now();
		let (mut a, mut b) = session_pair(now, 1, 2);

		let (datagram, rekey) = send(&mut a, now, b"hello peer");
		assert!(!rekey);

		let (ctr, mut buf) = as_slice(&datagram);
		b.open(now, ctr, &mut buf).unwrap();

		assert_eq!(&buf[..b"hello peer".len()], b"hello peer");
	}

	/// A session established between a different pair of peers must not be
	/// able to open another pair's transport data: the receive key differs,
	/// so the AEAD tag check fails even though the wire framing parses fine.
	#[test]
	fn foreign_session_keys_cannot_open_another_peers_data() {
		let now = Instant::now();
		let (mut a, _b) = session_pair(now, 1, 2);
		let (_, mut mallory) = session_pair(now, 3, 4);

		let (datagram, _) = send(&mut a, now, b"hello peer");
		let (ctr, mut buf) = as_slice(&datagram);

		assert!(mallory.open(now, ctr, &mut buf).is_err());
	}

	#[test]
	fn replayed_transport_counter_is_rejected() {
		let now = Instant::now();
		let (mut a, mut b) = session_pair(now, 1, 2);

		let (datagram, _) = send(&mut a, now, b"one");

		let (ctr, mut buf) = as_slice(&datagram);
		b.open(now, ctr, &mut buf).unwrap();

		let (_, mut replayed) = as_slice(&datagram);
		assert!(b.open(now, ctr, &mut replayed).is_err());
	}

	#[test]
	fn rekey_is_requested_past_the_message_count_threshold() {
		let now = Instant::now();
		let (mut a, _b) = session_pair(now, 1, 2);

		a.sctr = REKEY_AFTER_MESSAGES;

		let (_, rekey) = send(&mut a, now, b"x");
		assert!(rekey);
	}

	#[test]
	fn rekey_is_requested_past_the_time_threshold() {
		let now = Instant::now();
		let (mut a, _b) = session_pair(now, 1, 2);

		let (_, rekey) = send(&mut a, now + REKEY_AFTER_TIME, b"x");
		assert!(rekey);
	}

	#[test]
	fn send_is_not_expired_just_shy_of_the_reject_threshold() {
		let now = Instant::now();
		let (a, _b) = session_pair(now, 1, 2);

		assert!(!a.is_send_expired(now + REJECT_AFTER_TIME - REKEY_TIMEOUT));
		assert!(a.is_send_expired(now + REJECT_AFTER_TIME));
	}
}
