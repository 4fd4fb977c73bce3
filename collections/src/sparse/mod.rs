mod inner;
mod ring;
mod slab;

pub use ring::Ring;
pub use slab::Slab;
