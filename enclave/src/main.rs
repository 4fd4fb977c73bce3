//! The enclave: the only process that ever touches a peer's private key,
//! precomputed static-static secret or pre-shared key. It speaks to the
//! outside world only through the proxy and the IFNs, and carries no
//! timers of its own — rekey timing lives in the IFN.

mod peer;

use std::mem::size_of;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::time::SystemTime;

use collections::bytes::Slice;
use collections::map::{Index, Map};
use log::{error, info, warn};
use peer::{Peer, Sent};
use proto::ipc;
use proto::startup::{self, Tag as STag};
use runtime::Io;
use stakker::{actor, fwd_to, ret_nop, CX};
use utils::bytes;
use utils::error::*;
use wireguard::identity::{PeerIdentity, StaticIdentity};
use wireguard::noise::{InitiatorHandshake, ResponderHandshake, A32};
use wireguard::packet::{self, Initiation, Response, MAC_LEN};
use x25519_dalek::PublicKey;

const MAX_PEERS: usize = 1024;

fn fatal(msg: impl std::fmt::Display) -> ! {
	error!("{msg}");
	std::process::exit(1)
}

fn arr32(a: A32) -> [u8; 32] {
	let mut out = [0u8; 32];
	out.copy_from_slice(&a);
	out
}

struct Interface {
	id: StaticIdentity,
	peers: Map<Peer, MAX_PEERS>,
	by_peerid: Vec<Index<MAX_PEERS>>,
	ifn: Io<UnixDatagram>,
}

pub struct Enclave {
	ifaces: Vec<Interface>,
	proxy: Io<UnixDatagram>,
}

impl Enclave {
	pub fn init(cx: CX![], cfg_fd: RawFd, proxy_fd: RawFd, ifn_fds: Vec<RawFd>) -> Option<Self> {
		// SAFETY: inherited from the master across fork + exec.
		let cfg = unsafe { UnixDatagram::from_raw_fd(cfg_fd) };

		let sinit: startup::SInit = startup::recv(&cfg, STag::INIT).ok()?;
		runtime::logger::init(sinit.verbose != 0);

		if sinit.nifns as usize != ifn_fds.len() {
			fatal("SINIT.nifns does not match the number of inherited IFN channels");
		}

		let mut ifaces = Vec::with_capacity(ifn_fds.len());

		for (ifnid, ifn_fd) in ifn_fds.into_iter().enumerate() {
			let sifn: startup::SIfn = startup::recv(&cfg, STag::IFN).ok()?;

			for _ in 0..sifn.nifaddrs {
				let _: startup::SCidrAddr = startup::recv(&cfg, STag::CIDRADDR).ok()?;
			}

			for _ in 0..sifn.nlistenaddrs {
				let _: startup::SCidrAddr = startup::recv(&cfg, STag::CIDRADDR).ok()?;
			}

			let id = StaticIdentity::new(sifn.privkey);
			let mut peers = Map::<Peer, MAX_PEERS>::default();
			let mut by_peerid = Vec::with_capacity(sifn.npeers as usize);

			for _ in 0..sifn.npeers {
				let speer: startup::SPeer = startup::recv(&cfg, STag::PEER).ok()?;

				for _ in 0..speer.nallowedips {
					let _: startup::SCidrAddr = startup::recv(&cfg, STag::CIDRADDR).ok()?;
				}

				let pubkey = PublicKey::from(speer.pubkey);
				let identity = PeerIdentity::new(&id, pubkey, speer.psk);

				let slot = peers.insert_unique(&pubkey);
				let idx = slot.index();
				slot.insert(Peer::new(speer.peerid, identity));

				if by_peerid.len() <= speer.peerid as usize {
					by_peerid.resize(speer.peerid as usize + 1, idx);
				}
				by_peerid[speer.peerid as usize] = idx;
			}

			// SAFETY: inherited from the master across fork + exec.
			let ifn_sock = unsafe { UnixDatagram::from_raw_fd(ifn_fd) };
			if ifn_sock.set_nonblocking(true).is_err() {
				error!("set_nonblocking on ifn {ifnid} channel failed");
				return None;
			}

			let fwd = fwd_to!([cx], recv_ifn(ifnid) as (Slice));
			let ifn = Io::new(ifn_sock, fwd);

			ifaces.push(Interface { id, peers, by_peerid, ifn });
		}

		let _: startup::SEos = startup::recv(&cfg, STag::EOS).ok()?;
		drop(cfg);

		let npeers: u64 = ifaces.iter().map(|iface| iface.by_peerid.len() as u64).sum();
		runtime::sandbox::limit_resources(npeers, 1 + ifaces.len() as u64);
		runtime::sandbox::chroot_and_drop_privileges("/var/empty", sinit.uid, sinit.gid);
		warn!("No syscall-filtering sandbox is applied on this target; relying on rlimit, chroot and the uid/gid drop above");

		// SAFETY: inherited from the master across fork + exec.
		let proxy_sock = unsafe { UnixDatagram::from_raw_fd(proxy_fd) };
		if proxy_sock.set_nonblocking(true).is_err() {
			error!("set_nonblocking on proxy channel failed");
			return None;
		}

		let fwd = fwd_to!([cx], recv_proxy() as (Slice));
		let proxy = Io::new(proxy_sock, fwd);

		info!("Enclave started with {} interface(s)", ifaces.len());

		Some(Self { ifaces, proxy })
	}

	fn recv_ifn(&mut self, _cx: CX![], ifnid: usize, mut buf: Slice) {
		if self.handle_ifn_msg(ifnid, &mut buf).is_err() {
			warn!("Dropped malformed message from ifn {ifnid}");
		}
	}

	fn recv_proxy(&mut self, _cx: CX![], mut buf: Slice) {
		if self.handle_proxy_msg(&mut buf).is_err() {
			warn!("Dropped malformed message from proxy");
		}
	}

	fn handle_ifn_msg(&mut self, ifnid: usize, buf: &mut Slice) -> Result {
		if ifnid >= self.ifaces.len() {
			fatal("Message addressed to an unconfigured ifnid");
		}

		if buf.len() < size_of::<ipc::Tag>() {
			fatal("Undersized message on the trusted ifn channel");
		}

		let tag = *bytes::cast::<ipc::Tag, _>(&buf[..size_of::<ipc::Tag>()]);

		if tag == ipc::Tag::REQ_WG_INIT {
			if buf.len() < size_of::<ipc::MsgReqWgInit>() {
				fatal("Undersized MSGREQWGINIT");
			}

			let peerid = bytes::cast::<ipc::MsgReqWgInit, _>(buf.split_bytes(size_of::<ipc::MsgReqWgInit>())).peerid;
			self.handle_req_wg_init(ifnid, peerid)
		} else if tag == ipc::Tag::RAW_INBOUND {
			if buf.len() < size_of::<ipc::MsgRawInbound>() {
				fatal("Undersized MSGRAWINBOUND");
			}

			buf.split_bytes(size_of::<ipc::MsgRawInbound>());
			self.handle_wg_packet(ifnid, None, buf)
		} else {
			fatal("Unexpected message tag on the trusted ifn channel")
		}
	}

	fn handle_proxy_msg(&mut self, buf: &mut Slice) -> Result {
		if buf.len() < size_of::<ipc::MsgRawInbound>() {
			fatal("Undersized message on the trusted proxy channel");
		}

		let hdr: &ipc::MsgRawInbound = bytes::cast(buf.split_bytes(size_of::<ipc::MsgRawInbound>()));

		if hdr.tag != ipc::Tag::RAW_INBOUND {
			fatal("Unexpected message tag on the trusted proxy channel");
		}

		let ifnid = hdr.ifnid as usize;
		let conn = (hdr.local, hdr.remote);

		if ifnid >= self.ifaces.len() {
			fatal("Message addressed to an unconfigured ifnid");
		}

		self.handle_wg_packet(ifnid, Some(conn), buf)
	}

	fn handle_wg_packet(&mut self, ifnid: usize, conn: Option<(ipc::SockAddr, ipc::SockAddr)>, buf: &mut Slice) -> Result {
		if buf.len() < size_of::<packet::Tag>() {
			return Err(warn!("Wire message too short to carry a tag"));
		}

		let tag = *bytes::cast::<packet::Tag, _>(&buf[..size_of::<packet::Tag>()]);

		match tag {
			packet::Tag::INITIATION => self.handle_initiation(ifnid, conn, buf),
			packet::Tag::RESPONSE => self.handle_response(ifnid, conn, buf),
			_ => Err(warn!("Enclave does not process this wire message type")),
		}
	}

	/// A peer requested a handshake. Builds and sends an `Initiation`,
	/// parking the in-progress state in the peer's `sent` slot until a
	/// matching `Response` arrives.
	fn handle_req_wg_init(&mut self, ifnid: usize, peerid: u32) -> Result {
		let iface = &mut self.ifaces[ifnid];

		let &pidx = iface.by_peerid.get(peerid as usize).ok_or_else(|| warn!("REQ_WG_INIT for unconfigured peerid {peerid}"))?;

		let identity = &iface.id;
		let peer = &mut iface.peers[pidx];
		let idx = peer.new_idx(ifnid as u32);

		iface.ifn.write(|cur| {
			let (hdr, mut rest): (&mut ipc::MsgRawOutbound, _) = cur.split();
			hdr.tag = ipc::Tag::RAW_OUTBOUND;
			hdr.peerid = peerid;

			let msg: &mut Initiation = rest.fork().cast();
			msg.tag = packet::Tag::INITIATION;
			msg.idx = idx;

			let state = InitiatorHandshake::create_initiation(SystemTime::now(), identity, &peer.identity, msg);
			peer.identity.mac1.write(rest);

			peer.sent = Some(Sent { state, idx });
		})?;

		info!("Sent initiation to peer {peerid} on ifn {ifnid} (0x{idx:x})");

		Ok(())
	}

	fn handle_initiation(&mut self, ifnid: usize, conn: Option<(ipc::SockAddr, ipc::SockAddr)>, buf: &mut Slice) -> Result {
		if buf.len() != size_of::<Initiation>() + MAC_LEN {
			return Err(warn!("Initiation packet has the wrong size"));
		}

		let iface = &mut self.ifaces[ifnid];
		iface.id.mac1.verify(buf)?;

		let msg: &mut Initiation = bytes::cast_mut(&mut **buf);
		let (mut state, pubkey) = ResponderHandshake::open_initiation(&iface.id, msg)?;

		let mut entry = iface.peers.find_entry(&pubkey).filled().ok_or_else(|| warn!("Initiation from unknown static key"))?;
		let peer = &mut *entry;

		let ts = state.verify_timestamp(&peer.identity, msg)?;

		if !peer.accept_timestamp(ts) {
			return Err(warn!("Replayed timestamp on initiation"));
		}

		let peerid = peer.peerid;
		let resp_idx = peer.new_idx(ifnid as u32);
		let rcv_idx = msg.idx;
		let identity = &peer.identity;

		let (recv, send) = iface.ifn.write(|cur| {
			let (hdr, mut rest): (&mut ipc::MsgRawOutbound, _) = cur.split();
			hdr.tag = ipc::Tag::RAW_OUTBOUND;
			hdr.peerid = peerid;

			let res: &mut Response = rest.fork().cast();
			res.tag = packet::Tag::RESPONSE;
			res.idx = resp_idx;
			res.rcv_idx = rcv_idx;

			let chain = state.create_response(identity, res);
			identity.mac1.write(rest);

			chain.consume()
		})?;

		drop(entry);

		self.emit_sess_keys(ifnid, peerid, resp_idx, rcv_idx, true, arr32(send), arr32(recv))?;

		if let Some((local, remote)) = conn {
			self.emit_conn_req(ifnid, peerid, local, remote)?;
		}

		info!("Handled initiation from peer {peerid} on ifn {ifnid}, sent response 0x{resp_idx:x}");

		Ok(())
	}

	fn handle_response(&mut self, ifnid: usize, conn: Option<(ipc::SockAddr, ipc::SockAddr)>, buf: &mut Slice) -> Result {
		if buf.len() != size_of::<Response>() + MAC_LEN {
			return Err(warn!("Response packet has the wrong size"));
		}

		let iface = &mut self.ifaces[ifnid];
		iface.id.mac1.verify(buf)?;

		let msg: &mut Response = bytes::cast_mut(&mut **buf);

		let peerid = ipc::idx_peerid(msg.rcv_idx);
		let &pidx = iface.by_peerid.get(peerid as usize).ok_or_else(|| warn!("Response addressed to an unconfigured peerid"))?;

		let peer = &mut iface.peers[pidx];
		let sent = peer.sent.take().filter(|s| s.idx == msg.rcv_idx).ok_or_else(|| warn!("No matching sent state for response"))?;

		let chain = sent.state.consume_response(&iface.id, &peer.identity.preshared, msg)?;
		let (send, recv) = chain.consume();

		self.emit_sess_keys(ifnid, peerid, sent.idx, msg.idx, false, arr32(send), arr32(recv))?;

		if let Some((local, remote)) = conn {
			self.emit_conn_req(ifnid, peerid, local, remote)?;
		}

		info!("Completed handshake with peer {peerid} on ifn {ifnid}, session 0x{:x}", sent.idx);

		Ok(())
	}

	fn emit_sess_keys(&mut self, ifnid: usize, peerid: u32, sidx: u32, peer_idx: u32, responder: bool, send_key: [u8; 32], recv_key: [u8; 32]) -> Result {
		self.ifaces[ifnid].ifn.write(|cur| {
			let msg: &mut ipc::MsgSessKeys = cur.cast();
			msg.tag = ipc::Tag::SESS_KEYS;
			msg.peerid = peerid;
			msg.sidx = sidx;
			msg.peer_idx = peer_idx;
			msg.responder = responder as u8;
			msg.send_key = send_key;
			msg.recv_key = recv_key;
		})
	}

	fn emit_conn_req(&mut self, ifnid: usize, peerid: u32, local: ipc::SockAddr, remote: ipc::SockAddr) -> Result {
		self.proxy.write(|cur| {
			let msg: &mut ipc::MsgConnReq = cur.cast();
			msg.tag = ipc::Tag::CONN_REQ;
			msg.ifnid = ifnid as u32;
			msg.peerid = peerid;
			msg.local = local;
			msg.remote = remote;
		})
	}
}

#[cfg(test)]
mod tests {
	use std::mem::MaybeUninit;

	use collections::bytes::Cursor;
	use x25519_dalek::StaticSecret;

	use super::*;

	fn zeroed<T>() -> T {
		unsafe { MaybeUninit::zeroed().assume_init() }
	}

	/// Replays the exact `Cursor` sequence `handle_req_wg_init` uses to build
	/// a `RAW_OUTBOUND` initiation, without the actor/Io scaffolding, to pin
	/// the on-wire size of what actually goes out to the ifn.
	#[test]
	fn raw_outbound_initiation_is_the_full_wire_size() {
		let i = StaticIdentity::new(StaticSecret::random().to_bytes());
		let r = StaticIdentity::new(StaticSecret::random().to_bytes());
		let i_view_of_r = PeerIdentity::new(&i, r.pubkey, [0u8; 32]);

		let mut raw = vec![0u8; 1500];

		Cursor::vec(&mut raw, |cur| {
			let (hdr, mut rest): (&mut ipc::MsgRawOutbound, _) = cur.split();
			hdr.tag = ipc::Tag::RAW_OUTBOUND;
			hdr.peerid = 7;

			let msg: &mut Initiation = rest.fork().cast();
			msg.tag = packet::Tag::INITIATION;
			msg.idx = 1;

			InitiatorHandshake::create_initiation(SystemTime::now(), &i, &i_view_of_r, msg);
			i_view_of_r.mac1.write(rest);
		});

		assert_eq!(raw.len(), size_of::<ipc::MsgRawOutbound>() + size_of::<Initiation>() + MAC_LEN);
		assert_eq!(raw.len(), size_of::<ipc::MsgRawOutbound>() + 148);
	}

	/// Same for the response side, built the way `handle_initiation` builds
	/// it: a real `ResponderHandshake` opened from a real initiation, so the
	/// mac1 key and message layout match production exactly.
	#[test]
	fn raw_outbound_response_is_the_full_wire_size() {
		let i = StaticIdentity::new(StaticSecret::random().to_bytes());
		let r = StaticIdentity::new(StaticSecret::random().to_bytes());
		let i_view_of_r = PeerIdentity::new(&i, r.pubkey, [0u8; 32]);
		let r_view_of_i = PeerIdentity::new(&r, i.pubkey, [0u8; 32]);

		let mut init: Initiation = zeroed();
		init.tag = packet::Tag::INITIATION;
		init.idx = 1;
		InitiatorHandshake::create_initiation(SystemTime::now(), &i, &i_view_of_r, &mut init);

		let (responder, _) = ResponderHandshake::open_initiation(&r, &mut init).unwrap();

		let mut raw = vec![0u8; 1500];

		Cursor::vec(&mut raw, |cur| {
			let (hdr, mut rest): (&mut ipc::MsgRawOutbound, _) = cur.split();
			hdr.tag = ipc::Tag::RAW_OUTBOUND;
			hdr.peerid = 3;

			let res: &mut Response = rest.fork().cast();
			res.tag = packet::Tag::RESPONSE;
			res.idx = 2;
			res.rcv_idx = init.idx;

			let _ = responder.create_response(&r_view_of_i, res);
			r_view_of_i.mac1.write(rest);
		});

		assert_eq!(raw.len(), size_of::<ipc::MsgRawOutbound>() + size_of::<Response>() + MAC_LEN);
		assert_eq!(raw.len(), size_of::<ipc::MsgRawOutbound>() + 92);

		// The ifn fills mac2 in place on the trailing 16 bytes this reserves;
		// confirm it's zeroed (not overlapping mac1) right up to that point.
		assert_eq!(&raw[raw.len() - 16..], &[0u8; 16]);
	}
}

fn main() {
	let args: Vec<String> = std::env::args().collect();

	let cfg_fd: RawFd = args.get(1).and_then(|s| s.parse().ok()).unwrap_or_else(|| fatal("Enclave requires a config fd argument"));
	let proxy_fd = cfg_fd + 1;

	let nifns: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or_else(|| fatal("Enclave requires an ifn count argument"));
	let ifn_fds: Vec<RawFd> = (0..nifns as RawFd).map(|i| cfg_fd + 2 + i).collect();

	let mut stakker = runtime::rt::init();
	let s = &mut stakker;

	let enclave = actor!(s, Enclave::init(cfg_fd, proxy_fd, ifn_fds), ret_nop!());

	if runtime::rt::exec(s, move || drop(enclave), |_| {}).is_err() {
		std::process::exit(1);
	}
}
