use collections::map::Key;
use proto::ipc::encode_idx;
use tai64::Tai64N;
use wireguard::identity::PeerIdentity;
use wireguard::noise::InitiatorHandshake;
use x25519_dalek::PublicKey;

/// An initiation this interface sent and is waiting on a response for.
pub struct Sent {
	pub state: InitiatorHandshake,
	pub idx: u32,
}

/// One configured peer's handshake state. Session material never lives here
/// past the point it is handed to the owning IFN in `MSGSESSKEYS`.
pub struct Peer {
	pub peerid: u32,
	pub identity: PeerIdentity,
	recvts: Option<Tai64N>,
	pub sent: Option<Sent>,
	idx_cur: u8,
}

impl Peer {
	#[must_use]
	pub fn new(peerid: u32, identity: PeerIdentity) -> Self {
		Self { peerid, identity, recvts: None, sent: None, idx_cur: 0 }
	}

	/// Allocates a new connection index for this peer on interface `ifnid`.
	/// See [`encode_idx`] for the encoding: any process holding the raw
	/// wire index can recover both without a reverse lookup table.
	pub fn new_idx(&mut self, ifnid: u32) -> u32 {
		let ctr = self.idx_cur;
		self.idx_cur = self.idx_cur.wrapping_add(1);
		encode_idx(ifnid, self.peerid, ctr)
	}

	/// Enforces strictly increasing initiation timestamps, the handshake
	/// layer's only replay defense (there is no counter on `Initiation`
	/// messages). Returns `false`, leaving `recvts` untouched, for a replayed
	/// or reordered-and-replayed timestamp.
	pub fn accept_timestamp(&mut self, ts: Tai64N) -> bool {
		if self.recvts.is_some_and(|prev| ts <= prev) {
			return false;
		}

		self.recvts = Some(ts);
		true
	}
}

#[cfg(test)]
mod tests {
	use std::time::{Duration, SystemTime};

	use wireguard::identity::StaticIdentity;
	use x25519_dalek::StaticSecret;

	use super::*;

	fn peer() -> Peer {
		let them = StaticIdentity::new(StaticSecret::random().to_bytes());
		let identity = PeerIdentity::new(&StaticIdentity::new(StaticSecret::random().to_bytes()), them.pubkey, [0u8; 32]);

		Peer::new(1, identity)
	}

	fn ts(secs_from_epoch: u64) -> Tai64N {
		Tai64N::from_system_time(&(SystemTime::UNIX_EPOCH + Duration::from_secs(secs_from_epoch)))
	}

	#[test]
	fn first_timestamp_is_always_accepted() {
		let mut p = peer();
		assert!(p.accept_timestamp(ts(1000)));
	}

	#[test]
	fn replayed_timestamp_is_rejected() {
		let mut p = peer();

		assert!(p.accept_timestamp(ts(1000)));
		assert!(!p.accept_timestamp(ts(1000)));
	}

	#[test]
	fn reordered_older_timestamp_is_rejected() {
		let mut p = peer();

		assert!(p.accept_timestamp(ts(1000)));
		assert!(!p.accept_timestamp(ts(999)));

		// The rejection must not have clobbered the last-accepted value.
		assert!(p.accept_timestamp(ts(1001)));
	}
}

impl Key for Peer {
	type Type = PublicKey;

	fn key(&self) -> &Self::Type {
		&self.identity.pubkey
	}
}
