//! Session lifecycle: key generation, signing and the network bridge

pub mod bridge;
pub mod keygen;
pub mod signing;

pub use bridge::{DoneSignal, NetworkBridge};
pub use keygen::generate_signer;
pub use signing::{convert_signature, Signer, SigningSigner};
