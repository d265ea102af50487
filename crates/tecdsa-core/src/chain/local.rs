//! In-memory chain for tests and local nodes

use super::{
    Address, ConflictingPublicKeySubmittedEvent, EventHandler, Handle, KeepClosedEvent,
    KeepCreatedEvent, PublicKeyPublishedEvent, SignatureRequestedEvent, SignatureSubmittedEvent,
    Subscription,
};
use crate::{Digest, Error, PublicKey, Result, Signature};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
enum ChainEvent {
    KeepCreated(KeepCreatedEvent),
    SignatureRequested(SignatureRequestedEvent),
    ConflictingPublicKey(ConflictingPublicKeySubmittedEvent),
    PublicKeyPublished(PublicKeyPublishedEvent),
    SignatureSubmitted(SignatureSubmittedEvent),
    KeepClosed(KeepClosedEvent),
}

#[derive(Debug)]
struct Keep {
    members: Vec<Address>,
    submitted_keys: BTreeMap<Address, [u8; 64]>,
    public_key: Option<[u8; 64]>,
    latest_digest: Option<Digest>,
    awaiting: Option<Digest>,
    signature: Option<Signature>,
    active: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct CandidateStatus {
    eligible: bool,
    registered: bool,
    up_to_date: bool,
}

struct Inner {
    keeps: DashMap<Address, Keep>,
    candidates: DashMap<(Address, Address), CandidateStatus>,
    events: broadcast::Sender<ChainEvent>,
}

/// Shared in-memory keep registry. Clones observe the same state.
#[derive(Clone)]
pub struct LocalChain {
    inner: Arc<Inner>,
}

impl LocalChain {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                keeps: DashMap::new(),
                candidates: DashMap::new(),
                events,
            }),
        }
    }

    /// Handle acting as `operator`
    pub fn handle(&self, operator: Address) -> LocalChainHandle {
        LocalChainHandle {
            chain: self.clone(),
            operator,
        }
    }

    /// Allow `operator` to register for `application`
    pub fn make_eligible(&self, operator: Address, application: Address) {
        self.inner
            .candidates
            .entry((operator, application))
            .or_default()
            .eligible = true;
    }

    /// Flag the operator's pool status as outdated
    pub fn mark_status_stale(&self, operator: Address, application: Address) {
        if let Some(mut status) = self.inner.candidates.get_mut(&(operator, application)) {
            status.up_to_date = false;
        }
    }

    /// Create a keep and announce it
    pub fn open_keep(
        &self,
        keep_address: Address,
        members: Vec<Address>,
        honest_threshold: usize,
    ) -> Result<()> {
        if members.is_empty() || honest_threshold == 0 || honest_threshold > members.len() {
            return Err(Error::InvalidConfig(format!(
                "Keep with {} members cannot have honest threshold {}",
                members.len(),
                honest_threshold
            )));
        }

        match self.inner.keeps.entry(keep_address) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::Chain(format!(
                    "Keep {} already exists",
                    hex::encode(keep_address)
                )))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Keep {
                    members: members.clone(),
                    submitted_keys: BTreeMap::new(),
                    public_key: None,
                    latest_digest: None,
                    awaiting: None,
                    signature: None,
                    active: true,
                });
            }
        }

        info!(keep = hex::encode(keep_address), members = members.len(), "Keep opened");
        self.emit(ChainEvent::KeepCreated(KeepCreatedEvent {
            keep_address,
            members,
            honest_threshold,
        }));
        Ok(())
    }

    /// Ask the keep's members to sign `digest`
    pub fn request_signature(&self, keep_address: Address, digest: Digest) -> Result<()> {
        {
            let mut keep = self.keep_mut(&keep_address)?;
            if !keep.active {
                return Err(Error::Chain("Keep is closed".into()));
            }
            if keep.public_key.is_none() {
                return Err(Error::Chain("Keep public key is not published".into()));
            }
            if keep.awaiting.is_some() {
                return Err(Error::Chain("Signing already in progress".into()));
            }
            keep.awaiting = Some(digest);
            keep.latest_digest = Some(digest);
            keep.signature = None;
        }

        debug!(keep = hex::encode(keep_address), digest = hex::encode(digest), "Signature requested");
        self.emit(ChainEvent::SignatureRequested(SignatureRequestedEvent {
            keep_address,
            digest,
        }));
        Ok(())
    }

    pub fn close_keep(&self, keep_address: Address) -> Result<()> {
        {
            let mut keep = self.keep_mut(&keep_address)?;
            if !keep.active {
                return Err(Error::Chain("Keep is already closed".into()));
            }
            keep.active = false;
            keep.awaiting = None;
        }

        self.emit(ChainEvent::KeepClosed(KeepClosedEvent { keep_address }));
        Ok(())
    }

    /// Published group key, if every member agreed on one
    pub fn public_key(&self, keep_address: &Address) -> Option<[u8; 64]> {
        self.inner.keeps.get(keep_address).and_then(|keep| keep.public_key)
    }

    /// Signature accepted for the latest request
    pub fn signature(&self, keep_address: &Address) -> Option<Signature> {
        self.inner
            .keeps
            .get(keep_address)
            .and_then(|keep| keep.signature.clone())
    }

    fn keep_mut(
        &self,
        keep_address: &Address,
    ) -> Result<dashmap::mapref::one::RefMut<'_, Address, Keep>> {
        self.inner
            .keeps
            .get_mut(keep_address)
            .ok_or_else(|| Error::Chain(format!("Unknown keep {}", hex::encode(keep_address))))
    }

    fn emit(&self, event: ChainEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn subscribe<E, F>(&self, select: F, handler: EventHandler<E>) -> Subscription
    where
        E: Send + 'static,
        F: Fn(ChainEvent) -> Option<E> + Send + 'static,
    {
        let mut events = self.inner.events.subscribe();
        Subscription::new(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(event) = select(event) {
                            handler(event);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Chain event subscriber lagged")
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    }
}

impl Default for LocalChain {
    fn default() -> Self {
        Self::new()
    }
}

/// [`Handle`] bound to one operator of a [`LocalChain`]
#[derive(Clone)]
pub struct LocalChainHandle {
    chain: LocalChain,
    operator: Address,
}

impl LocalChainHandle {
    fn status(&self, application: Address) -> CandidateStatus {
        self.chain
            .inner
            .candidates
            .get(&(self.operator, application))
            .map(|status| *status)
            .unwrap_or_default()
    }

    fn ensure_member(&self, keep: &Keep) -> Result<()> {
        if !keep.members.contains(&self.operator) {
            return Err(Error::Chain(format!(
                "Operator {} is not a keep member",
                hex::encode(self.operator)
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Handle for LocalChainHandle {
    fn address(&self) -> Address {
        self.operator
    }

    async fn register_as_member_candidate(&self, application: Address) -> Result<()> {
        let mut status = self
            .chain
            .inner
            .candidates
            .get_mut(&(self.operator, application))
            .filter(|status| status.eligible)
            .ok_or_else(|| Error::Chain("Operator is not eligible for the application".into()))?;
        status.registered = true;
        status.up_to_date = true;
        Ok(())
    }

    async fn is_registered_for_application(&self, application: Address) -> Result<bool> {
        Ok(self.status(application).registered)
    }

    async fn is_eligible_for_application(&self, application: Address) -> Result<bool> {
        Ok(self.status(application).eligible)
    }

    async fn is_status_up_to_date_for_application(&self, application: Address) -> Result<bool> {
        let status = self.status(application);
        Ok(status.registered && status.up_to_date)
    }

    async fn update_status_for_application(&self, application: Address) -> Result<()> {
        let mut status = self
            .chain
            .inner
            .candidates
            .get_mut(&(self.operator, application))
            .filter(|status| status.registered)
            .ok_or_else(|| Error::Chain("Operator is not registered for the application".into()))?;
        status.up_to_date = true;
        Ok(())
    }

    fn on_keep_created(&self, handler: EventHandler<KeepCreatedEvent>) -> Result<Subscription> {
        Ok(self.chain.subscribe(
            |event| match event {
                ChainEvent::KeepCreated(event) => Some(event),
                _ => None,
            },
            handler,
        ))
    }

    fn on_signature_requested(
        &self,
        keep_address: Address,
        handler: EventHandler<SignatureRequestedEvent>,
    ) -> Result<Subscription> {
        Ok(self.chain.subscribe(
            move |event| match event {
                ChainEvent::SignatureRequested(event) if event.keep_address == keep_address => {
                    Some(event)
                }
                _ => None,
            },
            handler,
        ))
    }

    fn on_conflicting_public_key_submitted(
        &self,
        keep_address: Address,
        handler: EventHandler<ConflictingPublicKeySubmittedEvent>,
    ) -> Result<Subscription> {
        Ok(self.chain.subscribe(
            move |event| match event {
                ChainEvent::ConflictingPublicKey(event) if event.keep_address == keep_address => {
                    Some(event)
                }
                _ => None,
            },
            handler,
        ))
    }

    fn on_public_key_published(
        &self,
        keep_address: Address,
        handler: EventHandler<PublicKeyPublishedEvent>,
    ) -> Result<Subscription> {
        Ok(self.chain.subscribe(
            move |event| match event {
                ChainEvent::PublicKeyPublished(event) if event.keep_address == keep_address => {
                    Some(event)
                }
                _ => None,
            },
            handler,
        ))
    }

    fn on_signature_submitted(
        &self,
        keep_address: Address,
        handler: EventHandler<SignatureSubmittedEvent>,
    ) -> Result<Subscription> {
        Ok(self.chain.subscribe(
            move |event| match event {
                ChainEvent::SignatureSubmitted(event) if event.keep_address == keep_address => {
                    Some(event)
                }
                _ => None,
            },
            handler,
        ))
    }

    fn on_keep_closed(
        &self,
        keep_address: Address,
        handler: EventHandler<KeepClosedEvent>,
    ) -> Result<Subscription> {
        Ok(self.chain.subscribe(
            move |event| match event {
                ChainEvent::KeepClosed(event) if event.keep_address == keep_address => Some(event),
                _ => None,
            },
            handler,
        ))
    }

    async fn submit_keep_public_key(
        &self,
        keep_address: Address,
        public_key: [u8; 64],
    ) -> Result<()> {
        PublicKey::from_uncompressed_xy(&public_key)?;

        let event = {
            let mut keep = self.chain.keep_mut(&keep_address)?;
            self.ensure_member(&keep)?;
            if keep.submitted_keys.contains_key(&self.operator) {
                return Err(Error::Chain("Public key already submitted".into()));
            }

            let conflicting = keep.submitted_keys.values().any(|key| key != &public_key);
            keep.submitted_keys.insert(self.operator, public_key);

            if conflicting {
                Some(ChainEvent::ConflictingPublicKey(
                    ConflictingPublicKeySubmittedEvent {
                        keep_address,
                        submitting_member: self.operator,
                        conflicting_public_key: public_key,
                    },
                ))
            } else if keep.submitted_keys.len() == keep.members.len()
                && keep.submitted_keys.values().all(|key| key == &public_key)
            {
                keep.public_key = Some(public_key);
                Some(ChainEvent::PublicKeyPublished(PublicKeyPublishedEvent {
                    keep_address,
                    public_key,
                }))
            } else {
                None
            }
        };

        match &event {
            Some(ChainEvent::ConflictingPublicKey(_)) => warn!(
                keep = hex::encode(keep_address),
                member = hex::encode(self.operator),
                "Conflicting public key submitted"
            ),
            Some(ChainEvent::PublicKeyPublished(_)) => info!(
                keep = hex::encode(keep_address),
                public_key = hex::encode(public_key),
                "Keep public key published"
            ),
            _ => {}
        }
        if let Some(event) = event {
            self.chain.emit(event);
        }
        Ok(())
    }

    async fn submit_signature(&self, keep_address: Address, signature: &Signature) -> Result<()> {
        let digest = {
            let mut keep = self.chain.keep_mut(&keep_address)?;
            self.ensure_member(&keep)?;

            let digest = keep
                .awaiting
                .ok_or_else(|| Error::Chain("Keep is not awaiting a signature".into()))?;
            let public_key = keep
                .public_key
                .ok_or_else(|| Error::Chain("Keep public key is not published".into()))?;

            signature.verify(&PublicKey::from_uncompressed_xy(&public_key)?, &digest)?;
            keep.awaiting = None;
            keep.signature = Some(signature.clone());
            digest
        };

        info!(
            keep = hex::encode(keep_address),
            member = hex::encode(self.operator),
            "Signature accepted"
        );
        self.chain.emit(ChainEvent::SignatureSubmitted(SignatureSubmittedEvent {
            keep_address,
            digest,
            signature: signature.clone(),
        }));
        Ok(())
    }

    async fn is_awaiting_signature(&self, keep_address: Address, digest: &Digest) -> Result<bool> {
        let keep = self.chain.keep_mut(&keep_address)?;
        Ok(keep.awaiting.as_ref() == Some(digest))
    }

    async fn is_active(&self, keep_address: Address) -> Result<bool> {
        Ok(self.chain.keep_mut(&keep_address)?.active)
    }

    async fn latest_digest(&self, keep_address: Address) -> Result<Digest> {
        self.chain
            .keep_mut(&keep_address)?
            .latest_digest
            .ok_or_else(|| Error::Chain("No signature was requested".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::SigningKey;
    use k256::ProjectivePoint;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const KEEP: Address = [0xaa; 20];
    const APPLICATION: Address = [0xbb; 20];

    fn operators() -> Vec<Address> {
        (1..=3u8).map(|i| [i; 20]).collect()
    }

    fn signing_key() -> (SigningKey, [u8; 64]) {
        let key = SigningKey::from_bytes(&[7u8; 32].into()).unwrap();
        let point = ProjectivePoint::from(*key.verifying_key().as_affine());
        let public_key = PublicKey::from_point(point).unwrap().to_uncompressed_xy();
        (key, public_key)
    }

    fn sign(key: &SigningKey, digest: &Digest) -> Signature {
        let (signature, recovery_id) = key.sign_prehash_recoverable(digest).unwrap();
        Signature::new(
            signature.r().to_bytes().into(),
            signature.s().to_bytes().into(),
            recovery_id.to_byte(),
        )
    }

    async fn publish(chain: &LocalChain, public_key: [u8; 64]) {
        for operator in operators() {
            chain
                .handle(operator)
                .submit_keep_public_key(KEEP, public_key)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_identical_keys_are_published() {
        let chain = LocalChain::new();
        chain.open_keep(KEEP, operators(), 3).unwrap();
        let (_, public_key) = signing_key();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscription = chain
            .handle(operators()[0])
            .on_public_key_published(
                KEEP,
                Arc::new(move |event| {
                    let _ = tx.send(event);
                }),
            )
            .unwrap();

        publish(&chain, public_key).await;

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.public_key, public_key);
        assert_eq!(chain.public_key(&KEEP), Some(public_key));
    }

    #[tokio::test]
    async fn test_conflicting_key_is_reported() {
        let chain = LocalChain::new();
        chain.open_keep(KEEP, operators(), 3).unwrap();
        let (_, public_key) = signing_key();
        let other = {
            let key = SigningKey::from_bytes(&[9u8; 32].into()).unwrap();
            let point = ProjectivePoint::from(*key.verifying_key().as_affine());
            PublicKey::from_point(point).unwrap().to_uncompressed_xy()
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscription = chain
            .handle(operators()[0])
            .on_conflicting_public_key_submitted(
                KEEP,
                Arc::new(move |event| {
                    let _ = tx.send(event);
                }),
            )
            .unwrap();

        let ops = operators();
        chain.handle(ops[0]).submit_keep_public_key(KEEP, public_key).await.unwrap();
        chain.handle(ops[1]).submit_keep_public_key(KEEP, other).await.unwrap();
        chain.handle(ops[2]).submit_keep_public_key(KEEP, public_key).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.submitting_member, ops[1]);
        assert_eq!(chain.public_key(&KEEP), None);
    }

    #[tokio::test]
    async fn test_signature_accepted_only_when_valid_and_awaited() {
        let chain = LocalChain::new();
        chain.open_keep(KEEP, operators(), 3).unwrap();
        let (key, public_key) = signing_key();
        publish(&chain, public_key).await;

        let handle = chain.handle(operators()[1]);
        let digest = [3u8; 32];
        let signature = sign(&key, &digest);

        assert!(handle.submit_signature(KEEP, &signature).await.is_err());

        chain.request_signature(KEEP, digest).unwrap();
        assert!(handle.is_awaiting_signature(KEEP, &digest).await.unwrap());
        assert_eq!(handle.latest_digest(KEEP).await.unwrap(), digest);

        let wrong = sign(&key, &[4u8; 32]);
        assert!(handle.submit_signature(KEEP, &wrong).await.is_err());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscription = chain
            .handle(operators()[0])
            .on_signature_submitted(
                KEEP,
                Arc::new(move |event| {
                    let _ = tx.send(event);
                }),
            )
            .unwrap();

        handle.submit_signature(KEEP, &signature).await.unwrap();
        assert!(!handle.is_awaiting_signature(KEEP, &digest).await.unwrap());
        assert_eq!(chain.signature(&KEEP), Some(signature.clone()));

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.digest, digest);
        assert_eq!(event.signature, signature);

        let outsider = chain.handle([0xee; 20]);
        assert!(outsider.submit_signature(KEEP, &signature).await.is_err());
    }

    #[tokio::test]
    async fn test_signature_request_event_filters_by_keep() {
        let chain = LocalChain::new();
        chain.open_keep(KEEP, operators(), 3).unwrap();
        chain.open_keep([0xcc; 20], operators(), 2).unwrap();
        let (_, public_key) = signing_key();
        publish(&chain, public_key).await;
        for operator in operators() {
            chain
                .handle(operator)
                .submit_keep_public_key([0xcc; 20], public_key)
                .await
                .unwrap();
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = chain
            .handle(operators()[0])
            .on_signature_requested(
                KEEP,
                Arc::new(move |event| {
                    let _ = tx.send(event);
                }),
            )
            .unwrap();

        chain.request_signature([0xcc; 20], [1u8; 32]).unwrap();
        chain.request_signature(KEEP, [2u8; 32]).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.keep_address, KEEP);
        assert_eq!(event.digest, [2u8; 32]);
        subscription.unsubscribe();
    }

    #[tokio::test]
    async fn test_closed_keep_is_inactive() {
        let chain = LocalChain::new();
        chain.open_keep(KEEP, operators(), 3).unwrap();
        let handle = chain.handle(operators()[0]);

        assert!(handle.is_active(KEEP).await.unwrap());
        chain.close_keep(KEEP).unwrap();
        assert!(!handle.is_active(KEEP).await.unwrap());
        assert!(chain.close_keep(KEEP).is_err());
        assert!(chain.request_signature(KEEP, [0u8; 32]).is_err());
    }

    #[tokio::test]
    async fn test_candidate_registration() {
        let chain = LocalChain::new();
        let operator = operators()[0];
        let handle = chain.handle(operator);

        assert!(!handle.is_eligible_for_application(APPLICATION).await.unwrap());
        assert!(handle.register_as_member_candidate(APPLICATION).await.is_err());

        chain.make_eligible(operator, APPLICATION);
        handle.register_as_member_candidate(APPLICATION).await.unwrap();
        assert!(handle.is_registered_for_application(APPLICATION).await.unwrap());
        assert!(handle
            .is_status_up_to_date_for_application(APPLICATION)
            .await
            .unwrap());

        chain.mark_status_stale(operator, APPLICATION);
        assert!(!handle
            .is_status_up_to_date_for_application(APPLICATION)
            .await
            .unwrap());
        handle.update_status_for_application(APPLICATION).await.unwrap();
        assert!(handle
            .is_status_up_to_date_for_application(APPLICATION)
            .await
            .unwrap());
    }
}
