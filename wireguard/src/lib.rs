pub mod identity;
pub mod ip;
pub mod mac;
pub mod noise;
pub mod packet;
pub mod session;
pub mod window;

pub use identity::{PeerIdentity, StaticIdentity};
pub use packet::{Cookie, Data, Initiation, Response, Tag, Timestamp, MAC_LEN};
