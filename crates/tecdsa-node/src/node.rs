//! Local keep orchestration
//!
//! Runs every member of one keep in-process: members register with the
//! chain, generate the keep key together, publish it and then answer
//! signature requests. Each protocol session gets its own [`LocalNetwork`].

use crate::config::NodeConfig;
use anyhow::{anyhow, bail, Context, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tecdsa_core::chain::{
    self, Address, Handle, LocalChain, LocalChainHandle, PublicKeyPublishedEvent,
    SignatureRequestedEvent, SignatureSubmittedEvent, Subscription,
};
use tecdsa_core::net::{LocalNetwork, Provider};
use tecdsa_core::{generate_signer, Digest, GroupMembers, Parameters, Signature, Signer};
use tokio::sync::{mpsc, Barrier};
use tracing::{debug, error, info, warn};

/// Application the operators register for
const APPLICATION: Address = [0x0a; 20];

/// Rendezvous for one signing session: every member connects to the
/// session network before any of them starts sending
struct SigningSession {
    network: LocalNetwork,
    ready: Barrier,
}

pub struct LocalKeep {
    chain: LocalChain,
    keep_address: Address,
    operators: Vec<Address>,
    group: GroupMembers,
    params: Parameters,
    signing_timeout: Duration,
    sessions: Arc<DashMap<Digest, Arc<SigningSession>>>,
}

/// Operator address of the `index`-th member
fn operator_address(index: usize) -> Address {
    let mut address = [0u8; 20];
    address[0] = 0x0e;
    address[12..].copy_from_slice(&(index as u64 + 1).to_be_bytes());
    address
}

impl LocalKeep {
    /// Register the operators and open the keep on a fresh local chain
    pub async fn open(config: &NodeConfig) -> Result<Self> {
        let chain = LocalChain::new();
        let keep_address = config.keep_address()?;
        let operators: Vec<Address> = (0..config.keep.members).map(operator_address).collect();

        for operator in &operators {
            chain.make_eligible(*operator, APPLICATION);
            let handle = chain.handle(*operator);
            if !handle.is_registered_for_application(APPLICATION).await? {
                handle.register_as_member_candidate(APPLICATION).await?;
            }
        }

        let group = GroupMembers::new(
            operators.iter().map(chain::member_id).collect(),
            config.keep.honest_threshold,
        )?;
        chain.open_keep(keep_address, operators.clone(), config.keep.honest_threshold)?;

        Ok(Self {
            chain,
            keep_address,
            operators,
            group,
            params: config.parameters(),
            signing_timeout: config.signing_timeout(),
            sessions: Arc::new(DashMap::new()),
        })
    }

    pub fn keep_address(&self) -> Address {
        self.keep_address
    }

    fn handle(&self, operator: Address) -> LocalChainHandle {
        self.chain.handle(operator)
    }

    /// Run key generation for every member and publish the keep key
    pub async fn generate_keys(&self) -> Result<Vec<Signer>> {
        let (published_tx, mut published_rx) = mpsc::unbounded_channel();
        let published = self.handle(self.operators[0]).on_public_key_published(
            self.keep_address,
            Arc::new(move |event: PublicKeyPublishedEvent| {
                let _ = published_tx.send(event);
            }),
        )?;

        let network = LocalNetwork::new();
        let mut tasks = Vec::with_capacity(self.operators.len());
        for operator in &self.operators {
            let provider: Arc<dyn Provider> =
                Arc::new(network.connect(chain::member_id(operator))?);
            tasks.push(tokio::spawn(generate_signer(
                chain::member_id(operator),
                self.group.clone(),
                self.params.clone(),
                provider,
            )));
        }

        let mut signers = Vec::with_capacity(tasks.len());
        for (operator, task) in self.operators.iter().zip(tasks) {
            let signer = task
                .await
                .context("key generation task panicked")?
                .with_context(|| format!("key generation failed for {}", hex::encode(operator)))?;

            self.handle(*operator)
                .submit_keep_public_key(self.keep_address, signer.public_key().to_uncompressed_xy())
                .await?;
            signers.push(signer);
        }

        let event = tokio::time::timeout(self.signing_timeout, published_rx.recv())
            .await
            .context("timed out waiting for the keep public key")?
            .ok_or_else(|| anyhow!("public key subscription closed"))?;
        published.unsubscribe();

        info!(
            keep = hex::encode(self.keep_address),
            public_key = hex::encode(event.public_key),
            "Keep public key published"
        );
        Ok(signers)
    }

    /// Make every member answer signature requests for the keep
    pub fn serve_signing(&self, signers: &[Signer]) -> Result<Vec<Subscription>> {
        if signers.len() != self.operators.len() {
            bail!("expected {} signers, got {}", self.operators.len(), signers.len());
        }

        let mut subscriptions = Vec::with_capacity(signers.len());
        for (operator, signer) in self.operators.iter().zip(signers) {
            let handle = self.handle(*operator);
            let signer = signer.clone();
            let sessions = Arc::clone(&self.sessions);
            let members = self.operators.len();

            let on_request = {
                let handle = handle.clone();
                Arc::new(move |event: SignatureRequestedEvent| {
                    tokio::spawn(sign_and_submit(
                        handle.clone(),
                        signer.clone(),
                        Arc::clone(&sessions),
                        members,
                        event,
                    ));
                })
            };
            subscriptions.push(handle.on_signature_requested(self.keep_address, on_request)?);
        }
        Ok(subscriptions)
    }

    /// Request a signature over `digest` and wait until it is accepted
    pub async fn sign(&self, digest: Digest) -> Result<Signature> {
        let (submitted_tx, mut submitted_rx) = mpsc::unbounded_channel();
        let submitted = self.handle(self.operators[0]).on_signature_submitted(
            self.keep_address,
            Arc::new(move |event: SignatureSubmittedEvent| {
                if event.digest == digest {
                    let _ = submitted_tx.send(event.signature);
                }
            }),
        )?;

        if let Err(error) = self.chain.request_signature(self.keep_address, digest) {
            submitted.unsubscribe();
            return Err(error.into());
        }

        let signature = tokio::time::timeout(self.signing_timeout, submitted_rx.recv()).await;
        submitted.unsubscribe();
        signature
            .context("timed out waiting for the signature")?
            .ok_or_else(|| anyhow!("signature subscription closed"))
    }
}

async fn sign_and_submit(
    handle: LocalChainHandle,
    signer: Signer,
    sessions: Arc<DashMap<Digest, Arc<SigningSession>>>,
    members: usize,
    event: SignatureRequestedEvent,
) {
    let member = signer.member_id().clone();
    if let Err(error) = try_sign_and_submit(&handle, &signer, &sessions, members, &event).await {
        error!(member = %member, %error, "Signing failed");
    }
}

async fn try_sign_and_submit(
    handle: &LocalChainHandle,
    signer: &Signer,
    sessions: &DashMap<Digest, Arc<SigningSession>>,
    members: usize,
    event: &SignatureRequestedEvent,
) -> Result<()> {
    if !handle.is_awaiting_signature(event.keep_address, &event.digest).await? {
        debug!("Signature no longer awaited");
        return Ok(());
    }

    let session = Arc::clone(
        sessions
            .entry(event.digest)
            .or_insert_with(|| {
                Arc::new(SigningSession {
                    network: LocalNetwork::new(),
                    ready: Barrier::new(members),
                })
            })
            .value(),
    );

    let provider: Arc<dyn Provider> = Arc::new(session.network.connect(signer.member_id().clone())?);
    let mut signing = signer.initialize_signing(&event.digest, provider)?;

    // A member that failed before joining never arrives
    let is_current = |_: &Digest, current: &Arc<SigningSession>| Arc::ptr_eq(current, &session);
    match tokio::time::timeout(signer.params().round_timeout, session.ready.wait()).await {
        Ok(joined) => {
            if joined.is_leader() {
                sessions.remove_if(&event.digest, is_current);
            }
        }
        Err(_) => {
            signing.abort();
            sessions.remove_if(&event.digest, is_current);
            bail!("timed out waiting for all {} members to join the signing session", members);
        }
    }

    let signature = signing.sign().await?;

    if !handle.is_awaiting_signature(event.keep_address, &event.digest).await? {
        debug!("Another member already submitted the signature");
        return Ok(());
    }
    if let Err(error) = handle.submit_signature(event.keep_address, &signature).await {
        // Lost the race against another member
        if handle.is_awaiting_signature(event.keep_address, &event.digest).await? {
            return Err(error.into());
        }
        warn!(%error, "Signature submission raced");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_member_missing_from_session_does_not_block_others() {
        let config = NodeConfig::parse(
            r#"
            round_timeout_secs = 1

            [keep]
            members = 3
            honest_threshold = 2
            "#,
        )
        .unwrap();
        let keep = LocalKeep::open(&config).await.unwrap();
        let signers = keep.generate_keys().await.unwrap();

        let digest = [0x42; 32];
        keep.chain.request_signature(keep.keep_address, digest).unwrap();
        let event = SignatureRequestedEvent {
            keep_address: keep.keep_address,
            digest,
        };

        // The third member never joins
        let attempts: Vec<_> = signers[..2]
            .iter()
            .zip(&keep.operators)
            .map(|(signer, operator)| {
                let handle = keep.handle(*operator);
                let sessions = Arc::clone(&keep.sessions);
                let signer = signer.clone();
                let event = event.clone();
                tokio::spawn(async move {
                    try_sign_and_submit(&handle, &signer, &sessions, 3, &event).await
                })
            })
            .collect();

        let results = tokio::time::timeout(Duration::from_secs(10), async {
            let mut results = Vec::new();
            for attempt in attempts {
                results.push(attempt.await.unwrap());
            }
            results
        })
        .await
        .expect("waiting members must give up");

        assert!(results.iter().all(|result| result.is_err()));
        assert!(keep.sessions.is_empty());
        assert!(keep.chain.signature(&keep.keep_address).is_none());
    }
}
