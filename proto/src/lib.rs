//! Wire records shared by the master's startup-configuration encoder and
//! every child's decoder, and the inter-process runtime messages exchanged
//! between the enclave, the proxy and the interface-workers. One crate, one
//! set of struct definitions, so the producer and every consumer can never
//! drift out of shape.

pub mod ipc;
pub mod startup;

pub use startup::Role;
