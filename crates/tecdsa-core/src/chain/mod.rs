//! Chain handle used by keep orchestration
//!
//! The core never talks to a chain itself; orchestration code reacts to keep
//! events and submits key generation and signing results through a
//! [`Handle`].

use crate::{Digest, MemberId, Result, Signature};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub mod local;

pub use local::{LocalChain, LocalChainHandle};

/// 20-byte account or contract address
pub type Address = [u8; 20];

/// Member identity of an operator address in signing groups
pub fn member_id(address: &Address) -> MemberId {
    MemberId::from(&address[..])
}

/// A new keep was created with the given members
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepCreatedEvent {
    pub keep_address: Address,
    pub members: Vec<Address>,
    pub honest_threshold: usize,
}

/// A keep asks its members to sign `digest`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRequestedEvent {
    pub keep_address: Address,
    pub digest: Digest,
}

/// A member submitted a key that differs from earlier submissions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictingPublicKeySubmittedEvent {
    pub keep_address: Address,
    pub submitting_member: Address,
    pub conflicting_public_key: [u8; 64],
}

/// Every member submitted the same key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyPublishedEvent {
    pub keep_address: Address,
    pub public_key: [u8; 64],
}

/// A member's signature over the awaited digest was accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureSubmittedEvent {
    pub keep_address: Address,
    pub digest: Digest,
    pub signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepClosedEvent {
    pub keep_address: Address,
}

/// Callback for one kind of chain event
pub type EventHandler<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Live event subscription. Dropping it leaves the subscription running;
/// call [`unsubscribe`](Self::unsubscribe) to cancel.
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn unsubscribe(self) {
        self.task.abort();
    }
}

/// Operator's view of the keep contracts
#[async_trait]
pub trait Handle: Send + Sync {
    /// The operator's own address
    fn address(&self) -> Address;

    /// Register as a candidate for keeps of `application`
    async fn register_as_member_candidate(&self, application: Address) -> Result<()>;

    async fn is_registered_for_application(&self, application: Address) -> Result<bool>;

    async fn is_eligible_for_application(&self, application: Address) -> Result<bool>;

    async fn is_status_up_to_date_for_application(&self, application: Address) -> Result<bool>;

    async fn update_status_for_application(&self, application: Address) -> Result<()>;

    fn on_keep_created(&self, handler: EventHandler<KeepCreatedEvent>) -> Result<Subscription>;

    fn on_signature_requested(
        &self,
        keep_address: Address,
        handler: EventHandler<SignatureRequestedEvent>,
    ) -> Result<Subscription>;

    fn on_conflicting_public_key_submitted(
        &self,
        keep_address: Address,
        handler: EventHandler<ConflictingPublicKeySubmittedEvent>,
    ) -> Result<Subscription>;

    fn on_public_key_published(
        &self,
        keep_address: Address,
        handler: EventHandler<PublicKeyPublishedEvent>,
    ) -> Result<Subscription>;

    fn on_signature_submitted(
        &self,
        keep_address: Address,
        handler: EventHandler<SignatureSubmittedEvent>,
    ) -> Result<Subscription>;

    fn on_keep_closed(
        &self,
        keep_address: Address,
        handler: EventHandler<KeepClosedEvent>,
    ) -> Result<Subscription>;

    /// Submit the group key in 64-byte `x || y` form
    async fn submit_keep_public_key(&self, keep_address: Address, public_key: [u8; 64])
        -> Result<()>;

    async fn submit_signature(&self, keep_address: Address, signature: &Signature) -> Result<()>;

    /// Whether the keep still waits for a signature over `digest`
    async fn is_awaiting_signature(&self, keep_address: Address, digest: &Digest) -> Result<bool>;

    /// False only for closed keeps
    async fn is_active(&self, keep_address: Address) -> Result<bool>;

    /// Latest digest requested to be signed
    async fn latest_digest(&self, keep_address: Address) -> Result<Digest>;
}
