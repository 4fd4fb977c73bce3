use std::collections::VecDeque;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::unix::net::UnixDatagram;
use std::time::Instant;

use collections::bytes::{Cursor, Slice};
use collections::map::{Index, Key};
use log::{info, warn};
use proto::ipc;
use runtime::Io;
use stakker::{fwd_to, CX};
use utils::bytes;
use utils::error::*;
use wireguard::mac::{CookieState, Mac1};
use wireguard::packet::{Cookie, Data};
use wireguard::session::{Next, Simplex, Tunnel};
use x25519_dalek::PublicKey;

use crate::{bind, Ifn, MAX_PEERS};
use crate::timers::Timers;

/// Outbound packets queued per peer while no session is live. Past this,
/// the oldest queued packet is dropped to make room for the newest.
const MAX_QUEUE: usize = 50;

#[derive(Default)]
struct Wheel {
	/// The previous session's receive half, kept only so late-arriving
	/// packets from before a rekey aren't dropped. Keyed by our own index.
	prev: Option<(u32, Simplex)>,
	/// The live session. Keyed by our own index.
	pair: Option<(u32, Tunnel)>,
	/// A response we sent but have not yet received data on. Keyed by our
	/// own index; promoted to `pair` on the first successful decrypt.
	next: Option<(u32, Next)>,
}

#[derive(Default)]
pub struct Stats {
	pub tx_packets: u64,
	pub rx_packets: u64,
	pub last_handshake: Option<Instant>,
}

/// Everything the ifn tracks for one configured peer: its wire socket, its
/// transport sessions and the data queued while neither is ready.
pub struct Peer {
	pub peerid: u32,
	pubkey: PublicKey,
	endpoint: Option<SocketAddr>,
	sock: Option<Io<UdpSocket>>,
	cookie: CookieState,
	/// The index and mac1 of the handshake message we most recently sent,
	/// whichever direction: the key a cookie reply from this peer is
	/// decrypted with. Only one outstanding handshake per peer is ever
	/// tracked (see [`ipc::encode_idx`]).
	pending_mac: Option<(u32, Mac1)>,
	/// A mac2'd handshake message waiting for `sock` to exist.
	pending_hs: Option<Vec<u8>>,
	wheel: Wheel,
	queue: VecDeque<Box<dyn FnOnce(Cursor)>>,
	pub timers: Timers,
	pub stats: Stats,
}

impl Key for Peer {
	type Type = PublicKey;

	fn key(&self) -> &Self::Type {
		&self.pubkey
	}
}

impl Peer {
	#[must_use]
	pub fn new(peerid: u32, pubkey: PublicKey, endpoint: Option<SocketAddr>, idx: Index<MAX_PEERS>) -> Self {
		Self {
			peerid,
			pubkey,
			endpoint,
			sock: None,
			cookie: CookieState::new(pubkey.as_bytes()),
			pending_mac: None,
			pending_hs: None,
			wheel: Wheel::default(),
			queue: VecDeque::new(),
			timers: Timers::new(idx),
			stats: Stats::default(),
		}
	}

	/// Writes a data payload to this peer, rekeying or queuing as needed.
	/// `f` builds the plaintext into the bounded cursor `Tunnel::send` hands
	/// it; it may be boxed and run later if no session is live yet.
	pub fn write(&mut self, cx: CX![Ifn], enclave: &Io<UnixDatagram>, f: impl FnOnce(Cursor) + 'static, is_keepalive: bool) -> Result {
		let now = cx.now();
		let _ = self.ensure_sock(cx, enclave);

		let rekey = match &mut self.wheel.pair {
			Some((_, tun)) if !tun.is_send_expired(now) => {
				let Some(sock) = &self.sock else {
					self.enqueue(Box::new(f));
					return Ok(());
				};

				let rekey = sock.write(move |buf| tun.send(now, buf, f))?;
				self.timers.send_data(cx, is_keepalive);
				self.stats.tx_packets += 1;
				rekey
			}
			_ if !is_keepalive => {
				self.wheel.pair = None;
				self.enqueue(Box::new(f));
				true
			}
			_ => {
				warn!("Failed to send keepalive packet to peer {}", self.peerid);
				return Err(());
			}
		};

		if rekey {
			self.rekey(cx, enclave)?;
		}

		Ok(())
	}

	fn enqueue(&mut self, f: Box<dyn FnOnce(Cursor)>) {
		if self.queue.len() >= MAX_QUEUE {
			self.queue.pop_front();
		}

		self.queue.push_back(f);
	}

	/// Asks the enclave to start (or restart) a handshake, unless one is
	/// already in flight.
	pub fn rekey(&mut self, cx: CX![Ifn], enclave: &Io<UnixDatagram>) -> Result {
		if self.timers.is_rekeying() {
			return Ok(());
		}

		enclave.write(|cur| {
			let msg: &mut ipc::MsgReqWgInit = cur.cast();
			msg.tag = ipc::Tag::REQ_WG_INIT;
			msg.peerid = self.peerid;
		})?;

		self.timers.send_init(cx);

		Ok(())
	}

	/// A handshake message the enclave built on this peer's behalf. Applies
	/// MAC2 (the enclave always leaves it zeroed) and sends or queues it.
	pub fn handle_raw_outbound(&mut self, cx: CX![Ifn], enclave: &Io<UnixDatagram>, mut buf: Vec<u8>) -> Result {
		let now = cx.now();

		if buf.len() < 8 + 16 {
			return Err(warn!("Handshake message from enclave too short"));
		}

		let idx = *bytes::cast::<u32, _>(&buf[4..8]);

		self.cookie.write_mac2(&mut buf, now);

		let mac1: [u8; 16] = buf[buf.len() - 32..buf.len() - 16].try_into().expect("slice is 16 bytes long");
		self.pending_mac = Some((idx, Mac1::from_bytes(mac1)));

		info!("Sending handshake message to peer {} (0x{idx:x})", self.peerid);

		let _ = self.ensure_sock(cx, enclave);

		let Some(sock) = &self.sock else {
			self.pending_hs = Some(buf);
			return Ok(());
		};

		sock.write(|cur| {
			cur.push(&*buf);
		})
	}

	/// Installs a socket proxy-pinned for this peer's flow, replacing any
	/// self-bound one: this is the canonical one, shared with the proxy's
	/// own view of the flow.
	pub fn install_flow_sock(&mut self, cx: CX![Ifn], enclave: &Io<UnixDatagram>, raw: UdpSocket, remote: SocketAddr) -> Result {
		self.endpoint = Some(remote);
		self.install_sock(cx, enclave, raw)
	}

	fn ensure_sock(&mut self, cx: CX![Ifn], enclave: &Io<UnixDatagram>) -> Result {
		if self.sock.is_some() {
			return Ok(());
		}

		let raw = self.bind_to_endpoint()?;
		self.install_sock(cx, enclave, raw)
	}

	fn bind_to_endpoint(&self) -> Result<UdpSocket> {
		let remote = self.endpoint.ok_or_else(|| warn!("No known endpoint for peer {}", self.peerid))?;
		let local = SocketAddr::new(if remote.is_ipv4() { IpAddr::V4(Ipv4Addr::UNSPECIFIED) } else { IpAddr::V6(Ipv6Addr::UNSPECIFIED) }, 0);
		bind(local, Some(remote))
	}

	fn install_sock(&mut self, cx: CX![Ifn], enclave: &Io<UnixDatagram>, raw: UdpSocket) -> Result {
		let peerid = self.peerid;
		let fwd = fwd_to!([cx], recv_peer_wire(peerid) as (Slice));
		self.sock = Some(Io::new(raw, fwd));

		if let Some(bytes) = self.pending_hs.take() {
			if let Some(sock) = &self.sock {
				sock.write(|cur| {
					cur.push(&*bytes);
				})?;
			}
		}

		for f in mem::take(&mut self.queue) {
			self.write(cx, enclave, f, false)?;
		}

		Ok(())
	}

	/// Installs a transport session carried over `MSGSESSKEYS`.
	pub fn install_session(&mut self, cx: CX![Ifn], enclave: &Io<UnixDatagram>, sidx: u32, peer_idx: u32, responder: bool, send_key: [u8; 32], recv_key: [u8; 32]) -> Result {
		let now = cx.now();
		self.stats.last_handshake = Some(now);
		self.pending_mac = None;

		if responder {
			self.wheel.next = Some((sidx, Next::from_keys(now, send_key, recv_key, peer_idx)));
			self.timers.send_resp(cx);

			Ok(())
		} else {
			self.rotate_in(sidx, Tunnel::from_keys(now, send_key, recv_key, peer_idx));
			self.timers.recv_resp(cx);

			for f in mem::take(&mut self.queue) {
				self.write(cx, enclave, f, false)?;
			}

			Ok(())
		}
	}

	fn rotate_in(&mut self, sidx: u32, tun: Tunnel) {
		self.wheel.prev = self.wheel.pair.take().map(|(id, tun)| {
			let Tunnel { recv, .. } = tun;
			(id, recv)
		});
		self.wheel.pair = Some((sidx, tun));
	}

	pub fn handle_data(&mut self, cx: CX![Ifn], enclave: &Io<UnixDatagram>, buf: &mut Slice) -> Result {
		let msg: &Data = buf.split();
		let now = cx.now();

		match &mut self.wheel {
			Wheel { pair: Some((i, tun)), .. } if msg.idx == *i => {
				let rekey = tun.open(now, msg.ctr, buf)?;
				let is_keepalive = buf.is_empty();

				if rekey {
					self.rekey(cx, enclave)?;
				}

				self.timers.recv_data(cx, is_keepalive);
				self.stats.rx_packets += 1;
			}
			// Old session: still accepted so packets in flight during a
			// rekey aren't dropped, but never restarts the timers.
			Wheel { prev: Some((i, simplex)), .. } if msg.idx == *i => {
				simplex.open(now, msg.ctr, buf)?;
				self.stats.rx_packets += 1;
			}
			Wheel { next: Some((i, next)), .. } if msg.idx == *i => {
				info!("Received data on next session for peer {}, rotating", self.peerid);

				let sidx = *i;
				let tun = next.recv(msg.ctr, buf)?;

				self.rotate_in(sidx, tun);
				self.wheel.next = None;
				self.stats.last_handshake = Some(now);
				self.stats.rx_packets += 1;

				for f in mem::take(&mut self.queue) {
					self.write(cx, enclave, f, false)?;
				}
			}
			_ => return Err(warn!("No matching receive session for peer {}", self.peerid)),
		}

		Ok(())
	}

	pub fn handle_cookie(&mut self, msg: &Cookie, now: Instant) -> Result {
		let (idx, mac) = self.pending_mac.ok_or_else(|| warn!("No pending handshake for peer {}", self.peerid))?;

		if msg.idx != idx {
			return Err(warn!("Cookie reply for peer {} does not match the handshake message we sent", self.peerid));
		}

		self.cookie.handle_cookie_reply(&msg.nonce, msg.cookie, &mac, now)
	}

	pub fn log_stats(&self, now: Instant) {
		let age = self.stats.last_handshake.map(|t| now.duration_since(t));
		let sidx = self.wheel.pair.as_ref().map(|(i, _)| *i);

		info!(
			"peer {}: handshake {:?} ago, session {:x?}, tx {} rx {}",
			self.peerid, age, sidx, self.stats.tx_packets, self.stats.rx_packets
		);
	}
}
