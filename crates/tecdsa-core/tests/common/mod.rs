#![allow(dead_code)]

use k256::{
    elliptic_curve::{bigint::U256, ops::Reduce},
    Scalar,
};
use sha2::{Digest as _, Sha256};
use std::sync::Arc;
use tecdsa_core::engine::KeygenMaterial;
use tecdsa_core::net::{LocalNetwork, Provider};
use tecdsa_core::{Digest, GroupMembers, MemberId, Parameters, Result, Signature, Signer};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Members 100..100+size
pub fn fixture_group(size: u64, threshold: usize) -> GroupMembers {
    GroupMembers::new((100..100 + size).map(MemberId::from).collect(), threshold).unwrap()
}

/// Deterministic dealer polynomial: `c_j = SHA-256("tecdsa-fixture" || j) mod n`
pub fn fixture_coefficients(threshold: usize) -> Vec<Scalar> {
    (0..threshold)
        .map(|j| {
            let mut hasher = Sha256::new();
            hasher.update(b"tecdsa-fixture");
            hasher.update([j as u8]);
            <Scalar as Reduce<U256>>::reduce_bytes(&hasher.finalize())
        })
        .collect()
}

pub fn fixture_signers(group: &GroupMembers, params: &Parameters) -> Vec<Signer> {
    KeygenMaterial::deal(group, &fixture_coefficients(group.threshold()))
        .unwrap()
        .into_iter()
        .map(|material| Signer::new(material, params.clone()))
        .collect()
}

pub fn digest_of(message: &[u8]) -> Digest {
    Sha256::digest(message).into()
}

/// Connect every signer to a fresh network
pub fn connect(network: &LocalNetwork, signers: &[Signer]) -> Vec<Arc<dyn Provider>> {
    signers
        .iter()
        .map(|signer| {
            let channel: Arc<dyn Provider> =
                Arc::new(network.connect(signer.member_id().clone()).unwrap());
            channel
        })
        .collect()
}

/// Run one signing session per signer concurrently over `providers`
pub async fn sign_all(
    signers: &[Signer],
    providers: Vec<Arc<dyn Provider>>,
    digest: Digest,
) -> Vec<Result<Signature>> {
    // Wire every session before any of them starts sending
    let sessions: Vec<_> = signers
        .iter()
        .zip(providers)
        .map(|(signer, provider)| signer.initialize_signing(&digest, provider).unwrap())
        .collect();

    let tasks: Vec<_> = sessions
        .into_iter()
        .map(|mut session| tokio::spawn(async move { session.sign().await }))
        .collect();

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap());
    }
    results
}
