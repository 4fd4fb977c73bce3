//! Minimal IP-header peeking used to classify tunnel packets for the
//! allowed-IP tables. Unlike a full IP stack this never validates checksums,
//! handles fragmentation or options: the tunnel device only ever carries
//! whole, correctly-formed packets, and anything else is simply not our
//! concern here.

use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bilge::prelude::*;

#[bitsize(8)]
#[derive(Clone, Copy, FromBits)]
struct VerIhl {
	ihl: u4,
	ver: u4,
}

/// Reads the source and destination addresses out of a raw IPv4/IPv6 packet.
/// Returns `None` if the packet is truncated or carries an unrecognised
/// version nibble.
#[must_use]
pub fn peek(buf: &[u8]) -> Option<(IpAddr, IpAddr)> {
	let ver = VerIhl::from(*buf.first()?).ver().value();

	match ver {
		4 => {
			if buf.len() < 20 {
				return None;
			}

			let src = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
			let dst = Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]);

			Some((IpAddr::V4(src), IpAddr::V4(dst)))
		}
		6 => {
			if buf.len() < 40 {
				return None;
			}

			let mut src = [0u8; 16];
			let mut dst = [0u8; 16];
			src.copy_from_slice(&buf[8..24]);
			dst.copy_from_slice(&buf[24..40]);

			Some((IpAddr::V6(Ipv6Addr::from(src)), IpAddr::V6(Ipv6Addr::from(dst))))
		}
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn v4_addresses() {
		let mut buf = [0u8; 20];
		buf[0] = 0x45;
		buf[12..16].copy_from_slice(&[10, 0, 0, 1]);
		buf[16..20].copy_from_slice(&[10, 0, 0, 2]);

		let (src, dst) = peek(&buf).unwrap();
		assert_eq!(src, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
		assert_eq!(dst, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
	}

	#[test]
	fn truncated_returns_none() {
		let buf = [0x45u8; 10];
		assert!(peek(&buf).is_none());
	}
}
