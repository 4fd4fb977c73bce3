//! The proxy: owns every listening UDP socket, classifies inbound
//! handshake/cookie datagrams, and pins accepted flows to their own
//! connected sockets once the enclave asks for it. It never holds a
//! private key, a peer public key or plaintext.

use std::collections::HashMap;
use std::mem::size_of;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram;

use collections::bytes::Slice;
use log::{error, info, warn};
use proto::ipc;
use proto::startup::{self, Tag as STag};
use runtime::{FdIo, Io, Listen};
use socket2::{Domain, Protocol, Socket, Type};
use stakker::{actor, fwd_to, ret_nop, CX};
use utils::bytes;
use utils::error::*;
use wireguard::mac::Mac1Key;
use wireguard::packet::{self, Cookie, Initiation, Response, MAC_LEN};

fn fatal(msg: impl std::fmt::Display) -> ! {
	error!("{msg}");
	std::process::exit(1)
}

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

/// One configured interface: just enough to hand an accepted flow to the
/// ifn that owns it. Peer identities never reach the proxy at all.
struct Iface {
	mac1: Mac1Key,
	to_ifn: FdIo<UnixDatagram>,
}

pub struct Proxy {
	ifaces: Vec<Iface>,
	enclave: Io<UnixDatagram>,
	listeners: Vec<Listen<UdpSocket>>,
	/// Live flow sockets, keyed by the 5-tuple the enclave pinned. There is
	/// no session-teardown signal in this protocol, so entries simply live
	/// for the process lifetime; a repeated `MSGCONNREQ` for the same flow
	/// reuses the socket already here instead of rebinding.
	flows: HashMap<(u32, SocketAddr, SocketAddr), UdpSocket>,
}

impl Proxy {
	pub fn init(cx: CX![], cfg_fd: RawFd, enclave_fd: RawFd, ifn_fds: Vec<RawFd>) -> Option<Self> {
		// SAFETY: inherited from the master across fork + exec.
		let cfg = unsafe { UnixDatagram::from_raw_fd(cfg_fd) };

		let sinit: startup::SInit = startup::recv(&cfg, STag::INIT).ok()?;
		runtime::logger::init(sinit.verbose != 0);

		if sinit.nifns as usize != ifn_fds.len() {
			fatal("SINIT.nifns does not match the number of inherited IFN channels");
		}

		let mut ifaces = Vec::with_capacity(ifn_fds.len());
		let mut listeners = Vec::new();
		let mut npeers = 0u64;

		for (ifnid, ifn_fd) in ifn_fds.into_iter().enumerate() {
			let sifn: startup::SIfn = startup::recv(&cfg, STag::IFN).ok()?;

			for _ in 0..sifn.nifaddrs {
				let _: startup::SCidrAddr = startup::recv(&cfg, STag::CIDRADDR).ok()?;
			}

			for _ in 0..sifn.nlistenaddrs {
				let rec: startup::SCidrAddr = startup::recv(&cfg, STag::CIDRADDR).ok()?;
				let local = SocketAddr::new(rec.addr(), rec.port);

				let sock = bind(local, None).ok()?;
				let fwd = fwd_to!([cx], recv_listen(local) as (Slice, SocketAddr));
				listeners.push(Listen::new(sock, fwd));
			}

			npeers += sifn.npeers as u64;

			for _ in 0..sifn.npeers {
				let speer: startup::SPeer = startup::recv(&cfg, STag::PEER).ok()?;

				for _ in 0..speer.nallowedips {
					let _: startup::SCidrAddr = startup::recv(&cfg, STag::CIDRADDR).ok()?;
				}
			}

			// SAFETY: inherited from the master across fork + exec.
			let ifn_sock = unsafe { UnixDatagram::from_raw_fd(ifn_fd) };
			if ifn_sock.set_nonblocking(true).is_err() {
				error!("set_nonblocking on ifn {ifnid} channel failed");
				return None;
			}

			let fwd = fwd_to!([cx], recv_ifn(ifnid as u32) as (Slice, Option<OwnedFd>));
			let to_ifn = FdIo::new(ifn_sock, fwd);

			ifaces.push(Iface { mac1: Mac1Key::new(&sifn.pubkey), to_ifn });
		}

		let _: startup::SEos = startup::recv(&cfg, STag::EOS).ok()?;
		drop(cfg);

		// enclave + one channel per ifn + one listener per configured local address,
		// plus one connected flow socket per configured peer.
		runtime::sandbox::limit_resources(0, 1 + ifaces.len() as u64 + listeners.len() as u64 + npeers);

		// SAFETY: inherited from the master across fork + exec.
		let enclave_sock = unsafe { UnixDatagram::from_raw_fd(enclave_fd) };
		if enclave_sock.set_nonblocking(true).is_err() {
			error!("set_nonblocking on enclave channel failed");
			return None;
		}

		let fwd = fwd_to!([cx], recv_enclave() as (Slice));
		let enclave = Io::new(enclave_sock, fwd);

		info!("Proxy started with {} interface(s), {} listener(s)", ifaces.len(), listeners.len());

		Some(Self { ifaces, enclave, listeners, flows: HashMap::new() })
	}

	/// The enclave never talks back to the proxy over a per-ifn channel, so
	/// anything arriving here is a protocol violation.
	fn recv_ifn(&mut self, _cx: CX![], ifnid: u32, _buf: Slice, _fd: Option<OwnedFd>) {
		warn!("Unexpected datagram from ifn {ifnid} on its own proxy channel");
	}

	fn recv_enclave(&mut self, _cx: CX![], mut buf: Slice) {
		if self.handle_conn_req(&mut buf).is_err() {
			warn!("Dropped malformed message from enclave");
		}
	}

	fn recv_listen(&mut self, _cx: CX![], local: SocketAddr, mut buf: Slice, remote: SocketAddr) {
		if self.handle_wire_packet(local, remote, &mut buf).is_err() {
			warn!("Dropped unclassifiable datagram from {remote}");
		}
	}

	fn handle_conn_req(&mut self, buf: &mut Slice) -> Result {
		if buf.len() < size_of::<ipc::MsgConnReq>() {
			fatal("Undersized message on the trusted enclave channel");
		}

		let msg: &ipc::MsgConnReq = bytes::cast(buf.split_bytes(size_of::<ipc::MsgConnReq>()));

		if msg.tag != ipc::Tag::CONN_REQ {
			fatal("Unexpected message tag on the trusted enclave channel");
		}

		let ifnid = msg.ifnid;
		let peerid = msg.peerid;
		let local = msg.local.get();
		let remote = msg.remote.get();

		let iface = self.ifaces.get(ifnid as usize).ok_or_else(|| warn!("MSGCONNREQ for an unconfigured ifnid"))?;

		let key = (ifnid, local, remote);

		if !self.flows.contains_key(&key) {
			let sock = bind(local, Some(remote)).map_err(|()| warn!("Failed to pin flow {local} <-> {remote}"))?;
			self.flows.insert(key, sock);
			info!("Pinned new flow socket for peer {peerid} on ifn {ifnid} ({local} <-> {remote})");
		}

		let fd = self.flows[&key].as_raw_fd();

		iface.to_ifn.write_fd(fd, |cur| {
			let msg: &mut ipc::MsgFlowSocket = cur.cast();
			msg.tag = ipc::Tag::FLOW_SOCKET;
			msg.peerid = peerid;
			msg.local = ipc::SockAddr::new(local);
			msg.remote = ipc::SockAddr::new(remote);
		})?;

		Ok(())
	}

	fn handle_wire_packet(&mut self, local: SocketAddr, remote: SocketAddr, buf: &mut Slice) -> Result {
		if buf.len() < size_of::<packet::Tag>() {
			return Err(warn!("Wire datagram too short to carry a tag"));
		}

		let tag = *bytes::cast::<packet::Tag, _>(&buf[..size_of::<packet::Tag>()]);

		match tag {
			packet::Tag::INITIATION | packet::Tag::RESPONSE => self.classify_handshake(local, remote, buf),
			packet::Tag::COOKIE => self.forward_cookie(buf),
			packet::Tag::DATA => Err(warn!("Transport data packet arrived on a listening socket")),
			_ => Err(warn!("Proxy does not forward this wire message type")),
		}
	}

	/// Finds which interface's MAC1 key validates this handshake packet by
	/// linear scan (the set of interfaces is small) and forwards it to the
	/// enclave tagged with the interface it belongs to.
	fn classify_handshake(&mut self, local: SocketAddr, remote: SocketAddr, buf: &mut Slice) -> Result {
		let tag = *bytes::cast::<packet::Tag, _>(&buf[..size_of::<packet::Tag>()]);
		let want = if tag == packet::Tag::INITIATION { size_of::<Initiation>() } else { size_of::<Response>() } + MAC_LEN;

		if buf.len() != want {
			return Err(warn!("Handshake packet has the wrong size"));
		}

		let ifnid = self.ifaces.iter().position(|iface| iface.mac1.verify(&**buf).is_ok());
		let ifnid = ifnid.ok_or_else(|| warn!("No interface's mac1 key validates this handshake packet"))?;

		self.enclave.write(|cur| {
			let (hdr, rest): (&mut ipc::MsgRawInbound, _) = cur.split();
			hdr.tag = ipc::Tag::RAW_INBOUND;
			hdr.ifnid = ifnid as u32;
			hdr.local = ipc::SockAddr::new(local);
			hdr.remote = ipc::SockAddr::new(remote);
			rest.push(&**buf);
		})
	}

	/// The cookie reply's own connection index (see [`ipc::idx_ifnid`]) says
	/// which ifn it answers; no MAC1 check applies to cookie replies.
	fn forward_cookie(&mut self, buf: &mut Slice) -> Result {
		if buf.len() != size_of::<Cookie>() {
			return Err(warn!("Cookie packet has the wrong size"));
		}

		let cookie: &Cookie = bytes::cast(&buf[..size_of::<Cookie>()]);
		let ifnid = ipc::idx_ifnid(cookie.idx);

		let iface = self.ifaces.get(ifnid as usize).ok_or_else(|| warn!("Cookie reply addressed to an unconfigured ifnid"))?;

		iface.to_ifn.write(|cur| {
			let (hdr, rest): (&mut ipc::MsgRawCookie, _) = cur.split();
			hdr.tag = ipc::Tag::RAW_COOKIE;
			rest.push(&**buf);
		})
	}
}

fn main() {
	let args: Vec<String> = std::env::args().collect();

	let cfg_fd: RawFd = args.get(1).and_then(|s| s.parse().ok()).unwrap_or_else(|| fatal("Proxy requires a config fd argument"));
	let enclave_fd = cfg_fd + 1;

	let nifns: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or_else(|| fatal("Proxy requires an ifn count argument"));
	let ifn_fds: Vec<RawFd> = (0..nifns as RawFd).map(|i| cfg_fd + 2 + i).collect();

	let mut stakker = runtime::rt::init();
	let s = &mut stakker;

	let proxy = actor!(s, Proxy::init(cfg_fd, enclave_fd, ifn_fds), ret_nop!());

	if runtime::rt::exec(s, move || drop(proxy), |_| {}).is_err() {
		std::process::exit(1);
	}
}
