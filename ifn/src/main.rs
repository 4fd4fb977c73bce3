//! The interface-worker (IFN): one process per tunnel device. Owns the
//! device, the per-peer transport session cache and the allowed-IP tables,
//! and is the only process that carries rekey/keepalive timers.

mod peer;
mod timers;

use std::fs::File;
use std::mem::size_of;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram;

use collections::bytes::Slice;
use collections::map::{Index, Map};
use collections::trie::{Ipv4Table, Ipv6Table};
use log::{error, info, warn};
use peer::Peer;
use proto::ipc;
use proto::startup::{self, Tag as STag};
use runtime::{FdIo, Io, TunIo};
use socket2::{Domain, Protocol, Socket, Type};
use stakker::{actor, fwd_to, ret_nop, CX};
use utils::bytes;
use utils::error::*;
use wireguard::packet;
use x25519_dalek::PublicKey;

const MAX_PEERS: usize = 1024;

fn fatal(msg: impl std::fmt::Display) -> ! {
	error!("{msg}");
	std::process::exit(1)
}

/// Binds a UDP socket and, if `connect` is given, connects it: the same
/// self-bind primitive the proxy uses to pin a flow, reused here so the
/// ifn can open its own socket for an outbound-initiated flow without
/// waiting on the proxy.
fn bind(addr: SocketAddr, connect: Option<SocketAddr>) -> Result<UdpSocket> {
	let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
	let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(|err| error!("socket() failed: {err}"))?;

	sock.set_reuse_address(true).map_err(|err| error!("SO_REUSEADDR failed: {err}"))?;
	sock.set_reuse_port(true).map_err(|err| error!("SO_REUSEPORT failed: {err}"))?;
	sock.bind(&addr.into()).map_err(|err| error!("bind({addr}) failed: {err}"))?;

	if let Some(remote) = connect {
		sock.connect(&remote.into()).map_err(|err| error!("connect({remote}) failed: {err}"))?;
	}

	sock.set_nonblocking(true).map_err(|err| error!("set_nonblocking failed: {err}"))?;

	Ok(sock.into())
}

pub struct Ifn {
	ifnid: u32,
	peers: Map<Peer, MAX_PEERS>,
	by_peerid: Vec<Index<MAX_PEERS>>,
	route4: Ipv4Table<Index<MAX_PEERS>>,
	route6: Ipv6Table<Index<MAX_PEERS>>,
	tun: TunIo<File>,
	enclave: Io<UnixDatagram>,
	proxy: FdIo<UnixDatagram>,
}

impl Ifn {
	pub fn init(cx: CX![], cfg_fd: RawFd, enclave_fd: RawFd, proxy_fd: RawFd, ifnid: u32) -> Option<Self> {
		// SAFETY: inherited from the master across fork + exec.
		let cfg = unsafe { UnixDatagram::from_raw_fd(cfg_fd) };

		let sinit: startup::SInit = startup::recv(&cfg, STag::INIT).ok()?;
		runtime::logger::init(sinit.verbose != 0);

		if ifnid >= sinit.nifns {
			fatal("ifnid argument does not name a configured interface");
		}

		let mut peers = Map::<Peer, MAX_PEERS>::default();
		let mut by_peerid = Vec::new();
		let mut route4 = Ipv4Table::new();
		let mut route6 = Ipv6Table::new();
		let mut tun_fd = None;

		for cur_ifnid in 0..sinit.nifns {
			let sifn: startup::SIfn = startup::recv(&cfg, STag::IFN).ok()?;
			let mine = cur_ifnid == ifnid;

			for _ in 0..sifn.nifaddrs {
				let _: startup::SCidrAddr = startup::recv(&cfg, STag::CIDRADDR).ok()?;
			}

			for _ in 0..sifn.nlistenaddrs {
				let _: startup::SCidrAddr = startup::recv(&cfg, STag::CIDRADDR).ok()?;
			}

			for _ in 0..sifn.npeers {
				let speer: startup::SPeer = startup::recv(&cfg, STag::PEER).ok()?;

				let mut allowedips = Vec::with_capacity(speer.nallowedips as usize);
				for _ in 0..speer.nallowedips {
					let rec: startup::SCidrAddr = startup::recv(&cfg, STag::CIDRADDR).ok()?;
					allowedips.push(rec);
				}

				if !mine {
					continue;
				}

				let pubkey = PublicKey::from(speer.pubkey);
				let endpoint = (speer.has_endpoint != 0).then(|| SocketAddr::new(speer.endpoint.addr(), speer.endpoint.port));

				let slot = peers.insert_unique(&pubkey);
				let idx = slot.index();
				slot.insert(Peer::new(speer.peerid, pubkey, endpoint, idx));

				if by_peerid.len() <= speer.peerid as usize {
					by_peerid.resize(speer.peerid as usize + 1, idx);
				}
				by_peerid[speer.peerid as usize] = idx;

				for rec in allowedips {
					match rec.addr() {
						IpAddr::V4(a) => {
							route4.insert(u32::from(a), rec.prefix_len, idx);
						}
						IpAddr::V6(a) => {
							route6.insert(u128::from(a), rec.prefix_len, idx);
						}
					}
				}
			}

			if mine {
				tun_fd = Some(sifn.tun_fd);
			}
		}

		let _: startup::SEos = startup::recv(&cfg, STag::EOS).ok()?;
		drop(cfg);

		let tun_fd = tun_fd.unwrap_or_else(|| fatal("No SIFN record matched our ifnid"));

		// tun + enclave + proxy, plus one connected flow socket per configured peer.
		runtime::sandbox::limit_resources(by_peerid.len() as u64, 3 + by_peerid.len() as u64);

		// SAFETY: inherited from the master across fork + exec.
		let tun_file = unsafe { File::from_raw_fd(tun_fd) };
		let tun_fwd = fwd_to!([cx], recv_tun() as (Slice));
		let tun = TunIo::new(tun_file, tun_fwd);

		// SAFETY: inherited from the master across fork + exec.
		let enclave_sock = unsafe { UnixDatagram::from_raw_fd(enclave_fd) };
		if enclave_sock.set_nonblocking(true).is_err() {
			error!("set_nonblocking on enclave channel failed");
			return None;
		}
		let enclave_fwd = fwd_to!([cx], recv_enclave() as (Slice));
		let enclave = Io::new(enclave_sock, enclave_fwd);

		// SAFETY: inherited from the master across fork + exec.
		let proxy_sock = unsafe { UnixDatagram::from_raw_fd(proxy_fd) };
		if proxy_sock.set_nonblocking(true).is_err() {
			error!("set_nonblocking on proxy channel failed");
			return None;
		}
		let proxy_fwd = fwd_to!([cx], recv_proxy() as (Slice, Option<OwnedFd>));
		let proxy = FdIo::new(proxy_sock, proxy_fwd);

		info!("Ifn {ifnid} started with {} peer(s)", by_peerid.len());

		Some(Self { ifnid, peers, by_peerid, route4, route6, tun, enclave, proxy })
	}

	fn recv_tun(&mut self, cx: CX![Ifn], buf: Slice) {
		if self.handle_tun_packet(cx, buf).is_err() {
			warn!("Dropped unroutable packet from tun device");
		}
	}

	fn handle_tun_packet(&mut self, cx: CX![Ifn], buf: Slice) -> Result {
		let (_, dst) = wireguard::ip::peek(&buf).ok_or_else(|| warn!("Packet from tun device too short to classify"))?;

		let idx = self.route(dst).ok_or_else(|| warn!("No peer route covers {dst}"))?;

		self.peers[idx].write(cx, &self.enclave, move |mut cur| cur.push(&*buf), false)
	}

	fn recv_enclave(&mut self, cx: CX![Ifn], mut buf: Slice) {
		if self.handle_enclave_msg(cx, &mut buf).is_err() {
			warn!("Dropped malformed message from enclave");
		}
	}

	fn handle_enclave_msg(&mut self, cx: CX![Ifn], buf: &mut Slice) -> Result {
		if buf.len() < size_of::<ipc::Tag>() {
			fatal("Undersized message on the trusted enclave channel");
		}

		let tag = *bytes::cast::<ipc::Tag, _>(&buf[..size_of::<ipc::Tag>()]);

		match tag {
			ipc::Tag::SESS_KEYS => self.handle_sess_keys(cx, buf),
			ipc::Tag::RAW_OUTBOUND => self.handle_raw_outbound(cx, buf),
			_ => fatal("Unexpected message tag on the trusted enclave channel"),
		}
	}

	fn handle_sess_keys(&mut self, cx: CX![Ifn], buf: &mut Slice) -> Result {
		if buf.len() < size_of::<ipc::MsgSessKeys>() {
			fatal("Undersized MSGSESSKEYS");
		}

		let msg: &ipc::MsgSessKeys = bytes::cast(buf.split_bytes(size_of::<ipc::MsgSessKeys>()));
		let idx = self.peer_idx(msg.peerid).ok_or_else(|| warn!("SESS_KEYS for unconfigured peerid {}", msg.peerid))?;

		self.peers[idx].install_session(cx, &self.enclave, msg.sidx, msg.peer_idx, msg.responder != 0, msg.send_key, msg.recv_key)
	}

	fn handle_raw_outbound(&mut self, cx: CX![Ifn], buf: &mut Slice) -> Result {
		if buf.len() < size_of::<ipc::MsgRawOutbound>() {
			fatal("Undersized MSGRAWOUTBOUND");
		}

		let hdr: &ipc::MsgRawOutbound = bytes::cast(buf.split_bytes(size_of::<ipc::MsgRawOutbound>()));
		let idx = self.peer_idx(hdr.peerid).ok_or_else(|| warn!("RAW_OUTBOUND for unconfigured peerid {}", hdr.peerid))?;

		let bytes = buf.to_vec();
		self.peers[idx].handle_raw_outbound(cx, &self.enclave, bytes)
	}

	fn recv_proxy(&mut self, cx: CX![Ifn], mut buf: Slice, fd: Option<OwnedFd>) {
		if self.handle_proxy_msg(cx, &mut buf, fd).is_err() {
			warn!("Dropped malformed message from proxy");
		}
	}

	fn handle_proxy_msg(&mut self, cx: CX![Ifn], buf: &mut Slice, fd: Option<OwnedFd>) -> Result {
		if buf.len() < size_of::<ipc::Tag>() {
			fatal("Undersized message on the trusted proxy channel");
		}

		let tag = *bytes::cast::<ipc::Tag, _>(&buf[..size_of::<ipc::Tag>()]);

		match tag {
			ipc::Tag::FLOW_SOCKET => self.handle_flow_socket(cx, buf, fd),
			ipc::Tag::RAW_COOKIE => self.handle_raw_cookie(cx, buf),
			_ => fatal("Unexpected message tag on the trusted proxy channel"),
		}
	}

	fn handle_flow_socket(&mut self, cx: CX![Ifn], buf: &mut Slice, fd: Option<OwnedFd>) -> Result {
		if buf.len() < size_of::<ipc::MsgFlowSocket>() {
			fatal("Undersized MSGFLOWSOCKET");
		}

		let msg: &ipc::MsgFlowSocket = bytes::cast(&buf[..size_of::<ipc::MsgFlowSocket>()]);
		let peerid = msg.peerid;
		let remote = msg.remote.get();

		let fd = fd.ok_or_else(|| warn!("MSGFLOWSOCKET arrived without an attached descriptor"))?;
		let sock = UdpSocket::from(fd);
		sock.set_nonblocking(true).map_err(|err| warn!("set_nonblocking on flow socket failed: {err}"))?;

		let idx = self.peer_idx(peerid).ok_or_else(|| warn!("FLOW_SOCKET for unconfigured peerid {peerid}"))?;
		self.peers[idx].install_flow_sock(cx, &self.enclave, sock, remote)
	}

	fn handle_raw_cookie(&mut self, cx: CX![Ifn], buf: &mut Slice) -> Result {
		if buf.len() < size_of::<ipc::MsgRawCookie>() {
			fatal("Undersized MSGRAWCOOKIE");
		}

		buf.split_bytes(size_of::<ipc::MsgRawCookie>());

		if buf.len() != size_of::<packet::Cookie>() {
			return Err(warn!("Cookie packet has the wrong size"));
		}

		let cookie: &packet::Cookie = bytes::cast(&**buf);
		let peerid = ipc::idx_peerid(cookie.idx);
		let idx = self.peer_idx(peerid).ok_or_else(|| warn!("Cookie reply addressed to an unconfigured peerid"))?;

		self.peers[idx].handle_cookie(cookie, cx.now())
	}

	/// A handshake/response that arrived directly on a peer's own connected
	/// socket never goes through the proxy: forwarded straight to the
	/// enclave, `conn: None`, just like [`proto::ipc::MsgRawInbound`] the
	/// proxy sends for a fresh flow, but without a 5-tuple to pin.
	fn recv_peer_wire(&mut self, cx: CX![Ifn], peerid: u32, mut buf: Slice) {
		if self.handle_peer_wire(cx, peerid, &mut buf).is_err() {
			warn!("Dropped unparseable wire datagram from peer {peerid}");
		}
	}

	fn handle_peer_wire(&mut self, cx: CX![Ifn], peerid: u32, buf: &mut Slice) -> Result {
		if buf.len() < size_of::<packet::Tag>() {
			return Err(warn!("Wire datagram from peer {peerid} too short to carry a tag"));
		}

		let tag = *bytes::cast::<packet::Tag, _>(&buf[..size_of::<packet::Tag>()]);

		match tag {
			packet::Tag::DATA => self.handle_peer_data(cx, peerid, buf),
			packet::Tag::INITIATION | packet::Tag::RESPONSE => self.forward_handshake(buf),
			packet::Tag::COOKIE => self.handle_peer_cookie(cx, peerid, buf),
			_ => Err(warn!("Ifn does not process this wire message type")),
		}
	}

	fn handle_peer_data(&mut self, cx: CX![Ifn], peerid: u32, buf: &mut Slice) -> Result {
		let idx = self.peer_idx(peerid).ok_or_else(|| warn!("Data packet from unconfigured peerid {peerid}"))?;

		self.peers[idx].handle_data(cx, &self.enclave, buf)?;

		if buf.is_empty() {
			return Ok(());
		}

		let (src, _) = wireguard::ip::peek(buf).ok_or_else(|| warn!("Decrypted payload too short to classify"))?;

		if self.route(src) != Some(idx) {
			return Err(warn!("Peer {peerid} sent a packet from an address outside its allowed-ips"));
		}

		self.tun.write(|mut cur| cur.push(&**buf))
	}

	fn handle_peer_cookie(&mut self, cx: CX![Ifn], peerid: u32, buf: &mut Slice) -> Result {
		if buf.len() != size_of::<packet::Cookie>() {
			return Err(warn!("Cookie packet has the wrong size"));
		}

		let idx = self.peer_idx(peerid).ok_or_else(|| warn!("Cookie reply from unconfigured peerid {peerid}"))?;
		let cookie: &packet::Cookie = bytes::cast(&**buf);

		self.peers[idx].handle_cookie(cookie, cx.now())
	}

	fn forward_handshake(&mut self, buf: &mut Slice) -> Result {
		let unspecified = ipc::SockAddr::new(SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0));

		self.enclave.write(|cur| {
			let (hdr, rest): (&mut ipc::MsgRawInbound, _) = cur.split();
			hdr.tag = ipc::Tag::RAW_INBOUND;
			hdr.ifnid = self.ifnid;
			hdr.local = unspecified;
			hdr.remote = unspecified;
			rest.push(&**buf);
		})
	}

	fn rekey(&mut self, cx: CX![Ifn], idx: Index<MAX_PEERS>) {
		let peer = &mut self.peers[idx];

		if peer.timers.rekey_elapsed(cx) {
			warn!("REKEY_ATTEMPT_TIME reached for peer {}", peer.peerid);
		}

		if peer.rekey(cx, &self.enclave).is_err() {
			warn!("Failed to request a handshake");
		}
	}

	fn send_keepalive(&mut self, cx: CX![Ifn], idx: Index<MAX_PEERS>) {
		info!("Sending keepalive packet");

		if self.peers[idx].write(cx, &self.enclave, |_| {}, true).is_err() {
			warn!("Failed to send keepalive packet");
		}
	}

	fn peer_idx(&self, peerid: u32) -> Option<Index<MAX_PEERS>> {
		self.by_peerid.get(peerid as usize).copied()
	}

	fn route(&self, addr: IpAddr) -> Option<Index<MAX_PEERS>> {
		match addr {
			IpAddr::V4(a) => self.route4.lookup(u32::from(a)).copied(),
			IpAddr::V6(a) => self.route6.lookup(u128::from(a)).copied(),
		}
	}

	/// Logs one line per configured peer, triggered by `SIGUSR1`.
	fn dump_stats(&self, cx: CX![Ifn]) {
		let now = cx.now();

		for &idx in &self.by_peerid {
			self.peers[idx].log_stats(now);
		}
	}
}

fn main() {
	let args: Vec<String> = std::env::args().collect();

	let cfg_fd: RawFd = args.get(1).and_then(|s| s.parse().ok()).unwrap_or_else(|| fatal("Ifn requires a config fd argument"));
	let ifnid: u32 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or_else(|| fatal("Ifn requires an ifnid argument"));
	let enclave_fd = cfg_fd + 1;
	let proxy_fd = cfg_fd + 2;

	let mut stakker = runtime::rt::init();
	let s = &mut stakker;

	let ifn = actor!(s, Ifn::init(cfg_fd, enclave_fd, proxy_fd, ifnid), ret_nop!());
	let stats_ifn = ifn.clone();

	if runtime::rt::exec(s, move || drop(ifn), move |s| stats_ifn.apply(s, |this, cx| this.dump_stats(cx))).is_err() {
		std::process::exit(1);
	}
}
