mod common;

use common::*;
use k256::ecdsa::{RecoveryId, VerifyingKey};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tecdsa_core::net::{async_trait, Handler, LocalChannel, LocalNetwork, Provider};
use tecdsa_core::{Error, Parameters, ProtocolMessage, PublicKey, Result, Signature};

const GOLDEN_MESSAGE: &[u8] = b"keep-tecdsa signing fixture";
const GOLDEN_DIGEST: &str = "3f684f011ec9ef028e3eb6e77cf1181fafe5a184fd50e06d16fb34cea62fb69f";
const GOLDEN_R: &str = "4f7db55774cf9546af7ab64f0689345e00eb248be1101c5c3e2d7a0eca853d96";
const GOLDEN_S: &str = "36aa557f7c3ea24550c72385086a78226c7b5e76771e8bed9b91baef4b89f766";
const GOLDEN_RECOVERY_ID: u8 = 0;
const GOLDEN_PUBLIC_KEY: &str = "e68afac7be2fe7e5f14f278abe323bee5da2e4ddc2b3c16808e23a35c2d8af79\
                                 32d283dbdc6817db3dc423904140aa5f00eeb9ff3232c6fc83d5563d0bbfbfd1";

fn recover(signature: &Signature, digest: &[u8; 32]) -> VerifyingKey {
    VerifyingKey::recover_from_prehash(
        digest,
        &signature.to_k256().unwrap(),
        RecoveryId::from_byte(signature.recovery_id).unwrap(),
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_all_members_produce_same_signature() {
    init_tracing();
    let group = fixture_group(5, 3);
    let signers = fixture_signers(&group, &Parameters::default());
    let digest = digest_of(b"threshold signing over a local network");

    let network = LocalNetwork::new();
    let providers = connect(&network, &signers);
    let signatures: Vec<Signature> = sign_all(&signers, providers, digest)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    let public_key = signers[0].public_key();
    for signature in &signatures {
        assert_eq!(signature, &signatures[0]);
        signature.verify(public_key, &digest).unwrap();
    }
    assert_eq!(
        recover(&signatures[0], &digest),
        public_key.verifying_key().unwrap()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_golden_signature_is_reproducible() {
    init_tracing();
    let group = fixture_group(5, 5);
    let signers = fixture_signers(&group, &Parameters::default());
    let digest = digest_of(GOLDEN_MESSAGE);
    assert_eq!(hex::encode(digest), GOLDEN_DIGEST);

    let expected_key: [u8; 64] = hex::decode(GOLDEN_PUBLIC_KEY).unwrap().try_into().unwrap();
    let expected_key = PublicKey::from_uncompressed_xy(&expected_key).unwrap();
    assert_eq!(signers[0].public_key(), &expected_key);

    for _ in 0..2 {
        let network = LocalNetwork::new();
        let providers = connect(&network, &signers);
        for result in sign_all(&signers, providers, digest).await {
            let signature = result.unwrap();
            assert_eq!(hex::encode(signature.r), GOLDEN_R);
            assert_eq!(hex::encode(signature.s), GOLDEN_S);
            assert_eq!(signature.recovery_id, GOLDEN_RECOVERY_ID);
            signature.verify(&expected_key, &digest).unwrap();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_member_finishes_across_repeated_runs() {
    init_tracing();
    let round_timeout = Duration::from_secs(5);
    let group = fixture_group(5, 5);
    let signers = fixture_signers(&group, &Parameters::default().with_round_timeout(round_timeout));
    let digest = digest_of(GOLDEN_MESSAGE);

    for run in 0..8 {
        let started = Instant::now();
        let network = LocalNetwork::new();
        let providers = connect(&network, &signers);
        let results = sign_all(&signers, providers, digest).await;

        for (member, result) in results.iter().enumerate() {
            match result {
                Ok(signature) => assert_eq!(hex::encode(signature.r), GOLDEN_R),
                Err(error) => panic!("run {} member {} failed: {}", run, member, error),
            }
        }
        // A member whose final message was lost would only finish by timing out
        assert!(started.elapsed() < round_timeout, "run {} stalled", run);
    }
}

#[tokio::test]
async fn test_second_sign_is_rejected() {
    let group = fixture_group(2, 2);
    let signers = fixture_signers(&group, &Parameters::default());
    let digest = digest_of(b"sign once");

    let network = LocalNetwork::new();
    let providers = connect(&network, &signers);
    let mut sessions: Vec<_> = signers
        .iter()
        .zip(providers)
        .map(|(signer, provider)| signer.initialize_signing(&digest, provider).unwrap())
        .collect();

    let mut second = sessions.pop().unwrap();
    let mut first = sessions.pop().unwrap();
    let (a, b) = tokio::join!(first.sign(), second.sign());
    a.unwrap();
    b.unwrap();

    let again = tokio::time::timeout(Duration::from_secs(1), first.sign())
        .await
        .expect("second sign must not hang");
    assert!(matches!(again, Err(Error::AlreadySigned)));
}

#[tokio::test]
async fn test_aborted_session_does_not_sign() {
    let group = fixture_group(2, 2);
    let signers = fixture_signers(&group, &Parameters::default());

    let network = LocalNetwork::new();
    let providers = connect(&network, &signers);
    let mut session = signers[0]
        .initialize_signing(&digest_of(b"abort"), providers[0].clone())
        .unwrap();

    session.abort();
    session.abort();
    assert!(matches!(session.sign().await, Err(Error::Aborted)));
}

/// Fails the first unicast message it is asked to send
struct FailingProvider {
    inner: LocalChannel,
    failed: AtomicBool,
}

#[async_trait]
impl Provider for FailingProvider {
    fn register_receive_handler(&self, handler: Handler) -> Result<()> {
        self.inner.register_receive_handler(handler)
    }

    fn unregister_receive_handler(&self) {
        self.inner.unregister_receive_handler()
    }

    async fn send(&self, message: ProtocolMessage) -> Result<()> {
        if !message.is_broadcast() && !self.failed.swap(true, Ordering::SeqCst) {
            return Err(Error::Delivery("simulated transport failure".into()));
        }
        self.inner.send(message).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delivery_failure_terminates_every_session() {
    init_tracing();
    let group = fixture_group(5, 5);
    let params = Parameters::default().with_round_timeout(Duration::from_secs(2));
    let signers = fixture_signers(&group, &params);
    let digest = digest_of(b"lost message");

    let network = LocalNetwork::new();
    let mut providers: Vec<Arc<dyn Provider>> = vec![Arc::new(FailingProvider {
        inner: network.connect(signers[0].member_id().clone()).unwrap(),
        failed: AtomicBool::new(false),
    })];
    providers.extend(connect(&network, &signers[1..]));

    let results = tokio::time::timeout(
        Duration::from_secs(20),
        sign_all(&signers, providers, digest),
    )
    .await
    .expect("sessions must terminate");

    assert!(matches!(results[0], Err(Error::Delivery(_))));
    for result in &results {
        assert!(result.is_err());
    }
}

/// Counts deliveries that reach the session handler
struct RecordingProvider {
    inner: LocalChannel,
    delivered: Arc<AtomicUsize>,
    unregistered: AtomicBool,
}

#[async_trait]
impl Provider for RecordingProvider {
    fn register_receive_handler(&self, handler: Handler) -> Result<()> {
        let delivered = Arc::clone(&self.delivered);
        self.inner.register_receive_handler(Arc::new(move |message| {
            delivered.fetch_add(1, Ordering::SeqCst);
            handler(message)
        }))
    }

    fn unregister_receive_handler(&self) {
        self.unregistered.store(true, Ordering::SeqCst);
        self.inner.unregister_receive_handler()
    }

    async fn send(&self, message: ProtocolMessage) -> Result<()> {
        self.inner.send(message).await
    }
}

#[tokio::test]
async fn test_no_delivery_after_completion() {
    let group = fixture_group(3, 2);
    let signers = fixture_signers(&group, &Parameters::default());
    let digest = digest_of(b"completion is terminal");

    let network = LocalNetwork::new();
    let recorders: Vec<Arc<RecordingProvider>> = signers
        .iter()
        .map(|signer| {
            Arc::new(RecordingProvider {
                inner: network.connect(signer.member_id().clone()).unwrap(),
                delivered: Arc::new(AtomicUsize::new(0)),
                unregistered: AtomicBool::new(false),
            })
        })
        .collect();
    let providers: Vec<Arc<dyn Provider>> = recorders
        .iter()
        .map(|recorder| Arc::clone(recorder) as Arc<dyn Provider>)
        .collect();

    for result in sign_all(&signers, providers, digest).await {
        result.unwrap();
    }

    let before = recorders[0].delivered.load(Ordering::SeqCst);
    assert!(recorders.iter().all(|r| r.unregistered.load(Ordering::SeqCst)));

    let late = ProtocolMessage::broadcast(signers[1].member_id().clone(), 4, vec![0; 32]);
    recorders[1].send(late).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(recorders[0].delivered.load(Ordering::SeqCst), before);
}
