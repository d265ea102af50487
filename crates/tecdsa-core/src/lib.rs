//! # tECDSA Core
//!
//! Signing-session lifecycle for threshold ECDSA over secp256k1.
//!
//! A fixed group of members jointly produces one signature over a 32-byte
//! digest without any member holding the full private key. This crate
//! provides:
//! - The protocol engine adapter (distributed key generation and signing)
//! - The network bridge relaying engine messages over a pluggable provider
//! - `Signer` / `SigningSigner` session entry points
//! - A chain handle interface with an in-memory implementation
//!
//! ## Example
//!
//! ```rust,ignore
//! use tecdsa_core::{net::LocalNetwork, tss};
//!
//! // Every member runs key generation over its own channel
//! let signer = tss::generate_signer(id, group, params, channel).await?;
//!
//! // Then signs a digest in a fresh session
//! let mut session = signer.initialize_signing(&digest, channel)?;
//! let signature = session.sign().await?;
//! ```

pub mod chain;
pub mod engine;
pub mod error;
pub mod net;
pub mod tss;
pub mod types;

pub use error::{Error, Result};
pub use tss::{generate_signer, Signer, SigningSigner};
pub use types::{Digest, GroupMembers, MemberId, Parameters, ProtocolMessage, PublicKey, Signature};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
