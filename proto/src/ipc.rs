//! The runtime messages exchanged between the enclave, the proxy and the
//! interface-workers once the startup-configuration phase (see
//! [`crate::startup`]) has finished. These travel over the same dedicated
//! datagram sockets the master handed out at startup; there is no separate
//! control-plane channel.

use utils::bytes::Cast;

#[derive(Clone, Copy, PartialEq, Eq, Cast)]
#[repr(C)]
pub struct Tag(u32);

impl Tag {
	/// IFN -> enclave: please start (or restart) a handshake with this peer.
	pub const REQ_WG_INIT: Self = Tag(1);
	/// enclave -> IFN: install this transport session.
	pub const SESS_KEYS: Self = Tag(2);
	/// enclave -> proxy: create and connect a flow socket, then hand its fd
	/// to the named IFN.
	pub const CONN_REQ: Self = Tag(3);
	/// proxy -> enclave: an inbound handshake/cookie datagram, forwarded
	/// with the 5-tuple it arrived on so the enclave can validate it and,
	/// on success, trigger flow pinning.
	pub const RAW_INBOUND: Self = Tag(4);
	/// enclave -> IFN: a handshake message the IFN should write to the
	/// peer's wire socket, MAC2 already live if the IFN holds a cookie.
	pub const RAW_OUTBOUND: Self = Tag(5);
	/// proxy -> IFN: a cookie-reply datagram read off a listening socket,
	/// forwarded directly (the enclave never sees cookies at all).
	pub const RAW_COOKIE: Self = Tag(6);
	/// proxy -> IFN: a newly bound-and-connected flow socket for this peer,
	/// carried as `SCM_RIGHTS` ancillary data alongside this header.
	pub const FLOW_SOCKET: Self = Tag(7);
}

/// Connection indices are allocated `(ifnid << 24) | (peerid << 8) | ctr`
/// rather than arbitrary random values, so that any process holding a raw
/// `idx` off the wire — in particular the proxy, which has no peer table —
/// can recover which ifn and peer it belongs to without a lookup. `ctr`
/// wraps at 256; only the single most recent outstanding handshake per peer
/// is ever tracked, so a wrapped collision only matters if 256 handshakes to
/// the same peer are in flight at once, which the enclave never allows.
#[must_use]
pub fn encode_idx(ifnid: u32, peerid: u32, ctr: u8) -> u32 {
	(ifnid << 24) | ((peerid & 0xffff) << 8) | u32::from(ctr)
}

/// Recovers the ifn id a connection index was allocated under.
#[must_use]
pub fn idx_ifnid(idx: u32) -> u32 {
	idx >> 24
}

/// Recovers the peer id a connection index was allocated for.
#[must_use]
pub fn idx_peerid(idx: u32) -> u32 {
	(idx >> 8) & 0xffff
}

/// A minimal address record, reused wherever an inter-process message needs
/// to name a socket endpoint.
#[derive(Clone, Copy, Cast)]
#[repr(C)]
pub struct SockAddr {
	/// 4 or 6.
	pub family: u8,
	pub port: u16,
	pub addr: [u8; 16],
}

impl SockAddr {
	#[must_use]
	pub fn new(addr: std::net::SocketAddr) -> Self {
		match addr {
			std::net::SocketAddr::V4(v4) => {
				let mut bytes = [0u8; 16];
				bytes[..4].copy_from_slice(&v4.ip().octets());
				Self { family: 4, port: v4.port(), addr: bytes }
			}
			std::net::SocketAddr::V6(v6) => Self { family: 6, port: v6.port(), addr: v6.ip().octets() },
		}
	}

	#[must_use]
	pub fn get(&self) -> std::net::SocketAddr {
		match self.family {
			4 => std::net::SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::new(self.addr[0], self.addr[1], self.addr[2], self.addr[3])), self.port),
			_ => std::net::SocketAddr::new(std::net::IpAddr::V6(std::net::Ipv6Addr::from(self.addr)), self.port),
		}
	}
}

/// Carried over the enclave's own dedicated channel to one ifn, so no
/// `ifnid` field is needed: the channel it arrives on says which interface.
#[derive(Cast)]
#[repr(C)]
pub struct MsgReqWgInit {
	pub tag: Tag,
	pub peerid: u32,
}

#[derive(Cast)]
#[repr(C)]
pub struct MsgSessKeys {
	pub tag: Tag,
	pub peerid: u32,
	/// Our own connection index for this session: the value the peer will
	/// stamp on every `MSGWGDATA` it sends us, so the ifn uses this to route
	/// an inbound transport packet back to this session.
	pub sidx: u32,
	/// The peer's own connection index: the value we must stamp on every
	/// `MSGWGDATA` we send it (WireGuard's receiver-index convention — the
	/// index a transport packet carries always names the session as *its
	/// recipient* knows it, never as its sender does).
	pub peer_idx: u32,
	/// 0 = we sent the initiation (`Tunnel` role `Initiator`), 1 = we sent
	/// the response (role `Responder`, installed as the "next" slot).
	pub responder: u8,
	pub send_key: [u8; 32],
	pub recv_key: [u8; 32],
}

#[derive(Cast)]
#[repr(C)]
pub struct MsgConnReq {
	pub tag: Tag,
	pub ifnid: u32,
	pub peerid: u32,
	pub local: SockAddr,
	pub remote: SockAddr,
}

/// Prefixes the raw handshake/cookie bytes the proxy read off a listening
/// socket. The caller appends the packet bytes immediately after this
/// header in the same datagram.
#[derive(Cast)]
#[repr(C)]
pub struct MsgRawInbound {
	pub tag: Tag,
	pub ifnid: u32,
	pub local: SockAddr,
	pub remote: SockAddr,
}

/// Prefixes the raw handshake bytes the enclave wants written to a peer's
/// wire socket. The caller appends the packet bytes immediately after this
/// header in the same datagram.
#[derive(Cast)]
#[repr(C)]
pub struct MsgRawOutbound {
	pub tag: Tag,
	pub peerid: u32,
}

/// Prefixes a cookie-reply datagram the proxy read off a listening socket.
/// Carried over the proxy's own dedicated channel to one ifn, so no `ifnid`
/// field is needed. The cookie reply's own `idx` field (see
/// [`encode_idx`]) tells the IFN which peer it answers.
#[derive(Cast)]
#[repr(C)]
pub struct MsgRawCookie {
	pub tag: Tag,
}

/// Accompanies the passed file descriptor of a freshly bound-and-connected
/// flow socket. Carried over the proxy's own dedicated channel to one ifn.
#[derive(Cast)]
#[repr(C)]
pub struct MsgFlowSocket {
	pub tag: Tag,
	pub peerid: u32,
	pub local: SockAddr,
	pub remote: SockAddr,
}
