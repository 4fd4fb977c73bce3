use blake2::digest::{FixedOutput, Update};
use blake2::Blake2s256;
use utils::bytes::{self, Cast};

use super::A32;

const INITIAL: [u8; 32] = [
	0x22, 0x11, 0xb3, 0x61, 0x08, 0x1a, 0xc5, 0x66, 0x69, 0x12, 0x43, 0xdb, 0x45, 0x8a, 0xd5, 0x32, 0x2d, 0x9c, 0x6c, 0x66, 0x22, 0x93, 0xe8, 0xb7,
	0x0e, 0xe1, 0x9c, 0x65, 0xba, 0x07, 0x9e, 0xf3,
];

#[derive(Clone)]
pub struct Hash(pub(super) A32);

impl Hash {
	#[inline]
	pub fn update(&mut self, data: &impl Cast) {
		let mut core = Blake2s256::default();
		core.update(&self.0);
		core.update(bytes::as_slice(data));
		core.finalize_into(&mut self.0);
	}
}

impl From<A32> for Hash {
	fn from(hash: A32) -> Self {
		Self(hash)
	}
}

impl Default for Hash {
	#[inline]
	fn default() -> Self {
		A32::from(INITIAL).into()
	}
}

#[cfg(test)]
mod tests {
	use blake2::digest::{FixedOutput, Update};

	use super::*;

	/// `INITIAL` is `Hash(CHAIN_INITIAL || "WireGuard v1 zx2c4 Jason@zx2c4.com")`,
	/// the published identifier hash every WireGuard implementation seeds its
	/// transcript with.
	#[test]
	fn initial_matches_published_identifier_hash() {
		const CHAIN_INITIAL: [u8; 32] = [
			0x60, 0xe2, 0x6d, 0xae, 0xf3, 0x27, 0xef, 0xc0, 0x2e, 0xc3, 0x35, 0xe2, 0xa0, 0x25, 0xd2, 0xd0, 0x16, 0xeb, 0x42, 0x06, 0xf8, 0x72, 0x77, 0xf5,
			0x2d, 0x38, 0xd1, 0x98, 0x8b, 0x78, 0xcd, 0x36,
		];

		let mut core = Blake2s256::default();
		Update::update(&mut core, &CHAIN_INITIAL);
		Update::update(&mut core, b"WireGuard v1 zx2c4 Jason@zx2c4.com" as &[u8]);

		let mut out = A32::default();
		core.finalize_into(&mut out);

		assert_eq!(INITIAL, out.as_slice());
	}
}
