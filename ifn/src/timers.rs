use std::time::{Duration, Instant};

use collections::map::Index;
use log::{debug, info, trace};
use rand::Rng;
use stakker::{timer_max, Cx, FixedTimerKey, MaxTimerKey, CX};
use wireguard::session::{KEEPALIVE_TIMEOUT, REKEY_ATTEMPT_TIME, REKEY_TIMEOUT};

use crate::{Ifn, MAX_PEERS};

/// The timer state for one peer. Ported from the single-process rekey cycle:
/// the ifn is the only process in this design that carries timers.
pub struct Timers {
	/// When the rekey timer elapses, a new `MSGREQWGINIT` is sent to the
	/// enclave. Used both for the rekey cycle and for response timeouts.
	rekey: MaxTimerKey,
	/// When the keepalive timer elapses, an empty data packet is sent. Equal
	/// to `FixedTimerKey::default()` when no keepalive timer is set.
	keepalive: FixedTimerKey,
	/// Set when a rekey attempt starts; cleared on a completed handshake.
	rekey_start: Option<Instant>,
	idx: Index<MAX_PEERS>,
}

impl Timers {
	pub fn new(idx: Index<MAX_PEERS>) -> Self {
		Self { rekey: MaxTimerKey::default(), keepalive: FixedTimerKey::default(), rekey_start: None, idx }
	}

	pub fn is_rekeying(&self) -> bool {
		self.rekey_start.is_some()
	}

	pub fn rekey_elapsed(&self, cx: CX![Ifn]) -> bool {
		let Some(t) = self.rekey_start.as_ref() else { return false };
		cx.now() - *t >= REKEY_ATTEMPT_TIME
	}

	/// Call when a data packet is sent.
	pub fn send_data(&mut self, cx: &mut Cx<Ifn>, is_keepalive: bool) {
		if !is_keepalive {
			cx.timer_del(self.keepalive);
			self.reset_rekey(cx, KEEPALIVE_TIMEOUT + REKEY_TIMEOUT);
		}

		self.keepalive = FixedTimerKey::default();
	}

	/// Call when a data packet is received on the current session.
	pub fn recv_data(&mut self, cx: &mut Cx<Ifn>, is_keepalive: bool) {
		cx.timer_max_del(self.rekey);

		if !is_keepalive {
			self.reset_keepalive(cx, KEEPALIVE_TIMEOUT);
		} else {
			info!("Received keepalive packet");
		}
	}

	/// Call when `MSGREQWGINIT` is sent to the enclave.
	pub fn send_init(&mut self, cx: &mut Cx<Ifn>) {
		if self.rekey_start.is_none() {
			self.rekey_start = cx.now().into();
		}

		self.reset_rekey(cx, REKEY_TIMEOUT + Self::jitter());
	}

	/// Call when `MSGSESSKEYS` installs a session we initiated.
	pub fn recv_resp(&mut self, cx: &mut Cx<Ifn>) {
		self.rekey_start = None;
		cx.timer_max_del(self.rekey);
		self.reset_keepalive(cx, Duration::ZERO);
	}

	/// Call when `MSGSESSKEYS` installs a session we responded to. No-op:
	/// the responder side never started a rekey timer to begin with.
	pub fn send_resp(&mut self, _: &mut Cx<Ifn>) {}

	fn reset_keepalive(&mut self, cx: &mut Cx<Ifn>, duration: Duration) {
		if self.keepalive == FixedTimerKey::default() {
			debug!("Setting keepalive timeout for {:?}", duration);

			let actor = cx.access_actor().clone();
			let idx = self.idx;

			self.keepalive = cx.after(duration, move |s| actor.apply(s, move |this, cx| this.send_keepalive(cx, idx)));
		}
	}

	fn reset_rekey(&mut self, cx: &mut Cx<Ifn>, duration: Duration) {
		trace!("Setting rekey timeout for {:?}", duration);
		timer_max!(&mut self.rekey, cx.now() + duration, [cx], rekey(self.idx));
	}

	fn jitter() -> Duration {
		Duration::from_millis(rand::thread_rng().gen_range(0..333))
	}
}
