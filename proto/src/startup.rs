//! The startup-configuration protocol: a strict sequence of datagrams the
//! master writes to each child's dedicated socket, ending in `SEOS`. Each
//! datagram is self-describing via a leading [`Tag`]; a child only starts
//! trusting anything read off its other sockets once it has seen `SEOS`.

use std::mem::size_of;
use std::net::IpAddr;
use std::os::unix::net::UnixDatagram;

use utils::bytes::{self, Cast};
use utils::error::*;

#[derive(Clone, Copy, PartialEq, Eq, Cast)]
#[repr(C)]
pub struct Tag(u32);

impl Tag {
	pub const CIDRADDR: Self = Tag(3);
	pub const EOS: Self = Tag(5);
	pub const IFN: Self = Tag(2);
	pub const INIT: Self = Tag(1);
	pub const PEER: Self = Tag(4);
}

/// Which child a record stream is addressed to. Controls which fields the
/// master's encoder fills in: the proxy never sees private keys or peer
/// public keys, the enclave never sees listen addresses, and the IFN sees
/// everything needed to route and filter.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Role {
	Enclave,
	Proxy,
	Ifn,
}

#[derive(Clone, Copy, Cast)]
#[repr(C)]
pub struct SInit {
	pub tag: Tag,
	pub background: u8,
	pub verbose: u8,
	pub uid: u32,
	pub gid: u32,
	/// The proxy's listen port for the enclave, or the enclave's own
	/// reentry port; zero when not meaningful for the recipient role.
	pub port: u32,
	pub nifns: u32,
}

impl SInit {
	#[must_use]
	pub fn new(background: bool, verbose: bool, uid: u32, gid: u32, port: u32, nifns: u32) -> Self {
		Self { tag: Tag::INIT, background: background as u8, verbose: verbose as u8, uid, gid, port, nifns }
	}
}

/// One interface, role-minimized. The proxy only gets the identity key
/// needed to classify inbound MAC1s and the listener count; the enclave
/// gets the private key and peer count but no addresses; the IFN gets the
/// lot, including the inherited tun descriptor.
#[derive(Clone, Copy, Cast)]
#[repr(C)]
pub struct SIfn {
	pub tag: Tag,
	pub ifnid: u32,
	pub pubkey: [u8; 32],
	/// Zeroed for the proxy.
	pub privkey: [u8; 32],
	/// The inherited tun device descriptor. Only meaningful for the IFN.
	pub tun_fd: i32,
	pub port: u32,
	pub nifaddrs: u32,
	pub nlistenaddrs: u32,
	pub npeers: u32,
}

#[derive(Clone, Copy, Cast)]
#[repr(C)]
pub struct SCidrAddr {
	pub tag: Tag,
	/// 4 or 6.
	pub family: u8,
	pub prefix_len: u8,
	pub addr: [u8; 16],
	pub port: u16,
}

impl SCidrAddr {
	#[must_use]
	pub fn new(addr: IpAddr, prefix_len: u8, port: u16) -> Self {
		let (family, bytes) = match addr {
			IpAddr::V4(v4) => (4, {
				let mut b = [0u8; 16];
				b[..4].copy_from_slice(&v4.octets());
				b
			}),
			IpAddr::V6(v6) => (6, v6.octets()),
		};

		Self { tag: Tag::CIDRADDR, family, prefix_len, addr: bytes, port }
	}

	#[must_use]
	pub fn addr(&self) -> IpAddr {
		match self.family {
			4 => IpAddr::V4(std::net::Ipv4Addr::new(self.addr[0], self.addr[1], self.addr[2], self.addr[3])),
			_ => IpAddr::V6(std::net::Ipv6Addr::from(self.addr)),
		}
	}
}

/// One peer, role-minimized. Followed on the wire by `nallowedips` ×
/// [`SCidrAddr`]. The proxy never receives this record at all: it has no
/// notion of peers, only interfaces.
#[derive(Clone, Copy, Cast)]
#[repr(C)]
pub struct SPeer {
	pub tag: Tag,
	pub peerid: u32,
	pub pubkey: [u8; 32],
	/// Zeroed for every recipient except the enclave.
	pub psk: [u8; 32],
	pub has_endpoint: u8,
	pub endpoint: SCidrAddr,
	pub nallowedips: u32,
}

#[derive(Clone, Copy, Cast)]
#[repr(C)]
pub struct SEos {
	pub tag: Tag,
}

impl Default for SEos {
	fn default() -> Self {
		Self { tag: Tag::EOS }
	}
}

/// Reads the leading [`Tag`] of a datagram without consuming it, so the
/// caller can dispatch to the right record type. Returns an error (fatal,
/// per the error taxonomy for a trusted channel) if the datagram is too
/// short to carry one.
pub fn peek_tag(buf: &[u8]) -> Result<Tag> {
	if buf.len() < size_of::<Tag>() {
		return Err(log::error!("Startup-protocol datagram too short to carry a tag"));
	}

	Ok(*utils::bytes::cast(&buf[..size_of::<Tag>()]))
}

/// Blocking-reads one record of type `T` tagged `tag` off the child's
/// dedicated configuration socket. Any mismatch — short read, wrong tag —
/// is a protocol violation from a trusted channel and therefore fatal.
pub fn recv<T: Cast + Copy>(sock: &UnixDatagram, tag: Tag) -> Result<T> {
	let mut buf = [0u8; 256];

	let n = sock.recv(&mut buf).map_err(|err| log::error!("Startup-protocol read failed: {err}"))?;
	let bytes = &buf[..n];

	if peek_tag(bytes)? != tag {
		return Err(log::error!("Startup-protocol record out of sequence"));
	}

	if bytes.len() < size_of::<T>() {
		return Err(log::error!("Startup-protocol record too short"));
	}

	Ok(*bytes::cast(&bytes[..size_of::<T>()]))
}

/// Writes one record to a child's dedicated configuration socket.
pub fn send<T: Cast>(sock: &UnixDatagram, rec: &T) -> Result {
	sock.send(bytes::as_slice(rec)).map_err(|err| log::error!("Startup-protocol write failed: {err}"))?;
	Ok(())
}
