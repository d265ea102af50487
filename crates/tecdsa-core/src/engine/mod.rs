//! Threshold protocol engine adapter
//!
//! [`start_keygen`] and [`start_signing`] build a [`LocalParty`] bound to the
//! local member, the group and (for signing) the key material and digest.
//! Nothing is sent until [`LocalParty::begin`] spawns the protocol task; from
//! then on the party emits messages on its outbound channel, takes inbound
//! messages through [`LocalParty::update`] and resolves its result sink
//! exactly once.

mod keygen;
mod math;
mod messages;
mod ot;
mod rounds;
mod sign;

pub use keygen::KeygenMaterial;
pub use sign::SignatureData;

use crate::{Digest, Error, GroupMembers, MemberId, Parameters, ProtocolMessage, Result};
use messages::{KEYGEN_LAST_ROUND, SIGN_LAST_ROUND};
use rounds::RoundDriver;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Job<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// Producer side of a session's result.
///
/// Both the engine task and the network bridge hold one; whichever resolves
/// first wins and every later value is discarded.
pub struct ResultSink<T> {
    tx: mpsc::Sender<Result<T>>,
}

impl<T> Clone for ResultSink<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> ResultSink<T> {
    /// Resolve with a value. Returns false if already resolved.
    pub fn succeed(&self, value: T) -> bool {
        self.tx.try_send(Ok(value)).is_ok()
    }

    /// Resolve with an error. Returns false if already resolved.
    pub fn fail(&self, error: Error) -> bool {
        self.tx.try_send(Err(error)).is_ok()
    }
}

/// Consumer side of a session's result
pub struct ResultReceiver<T> {
    rx: mpsc::Receiver<Result<T>>,
}

impl<T> ResultReceiver<T> {
    /// Wait for the first resolution
    pub async fn wait(mut self) -> Result<T> {
        let outcome = self.rx.recv().await.unwrap_or(Err(Error::Aborted));
        self.rx.close();
        outcome
    }
}

/// Create a single-fire result slot
pub fn result_channel<T>() -> (ResultSink<T>, ResultReceiver<T>) {
    let (tx, rx) = mpsc::channel(1);
    (ResultSink { tx }, ResultReceiver { rx })
}

/// One member's protocol instance
pub struct LocalParty<T> {
    id: MemberId,
    group: GroupMembers,
    inbound: mpsc::UnboundedSender<ProtocolMessage>,
    /// Why `begin` must refuse to start, decided at construction
    rejection: Option<String>,
    job: Mutex<Option<Job<T>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    sink: ResultSink<T>,
}

impl<T: Send + 'static> LocalParty<T> {
    pub fn id(&self) -> &MemberId {
        &self.id
    }

    pub fn group(&self) -> &GroupMembers {
        &self.group
    }

    /// Start the protocol. Fails when called twice or when the parameters
    /// are inconsistent.
    pub fn begin(&self) -> Result<()> {
        if let Some(reason) = &self.rejection {
            return Err(Error::Start(reason.clone()));
        }

        let job = self
            .job
            .lock()
            .map_err(|_| Error::Start("Party state poisoned".into()))?
            .take()
            .ok_or_else(|| Error::Start(format!("Party {} already started", self.id)))?;

        let sink = self.sink.clone();
        let id = self.id.clone();
        let handle = tokio::spawn(async move {
            match job.await {
                Ok(value) => {
                    sink.succeed(value);
                }
                Err(error) => {
                    warn!(member = %id, %error, "Protocol failed");
                    sink.fail(error);
                }
            }
        });

        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
        Ok(())
    }

    /// Feed one inbound message to the protocol. Messages that arrive before
    /// `begin` are buffered.
    pub fn update(&self, message: ProtocolMessage) -> Result<()> {
        if !self.group.contains(&message.from) {
            return Err(Error::InvalidMember(format!(
                "Message from non-member {}",
                message.from
            )));
        }

        self.inbound
            .send(message)
            .map_err(|_| Error::Protocol(format!("Party {} no longer accepts messages", self.id)))
    }

}

impl<T> LocalParty<T> {
    /// Stop the protocol task if it is still running
    pub fn stop(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                if !handle.is_finished() {
                    debug!(member = %self.id, "Stopping protocol task");
                }
                handle.abort();
            }
        }
        if let Ok(mut job) = self.job.lock() {
            job.take();
        }
    }
}

/// Everything `start_*` hands back: the party, its outbound stream and both
/// ends of its result slot
pub struct PartyHandles<T> {
    pub party: LocalParty<T>,
    pub outbound: mpsc::Receiver<ProtocolMessage>,
    pub sink: ResultSink<T>,
    pub results: ResultReceiver<T>,
}

/// Bind a key generation party
pub fn start_keygen(
    id: MemberId,
    group: GroupMembers,
    params: &Parameters,
) -> PartyHandles<KeygenMaterial> {
    let rejection = check_membership(&id, &group);
    new_party(id, group, rejection, params, KEYGEN_LAST_ROUND, keygen::run_keygen)
}

/// Bind a signing party for `digest`
pub fn start_signing(
    id: MemberId,
    group: GroupMembers,
    material: Arc<KeygenMaterial>,
    digest: Digest,
    params: &Parameters,
) -> PartyHandles<SignatureData> {
    let rejection = check_membership(&id, &group).or_else(|| {
        if material.member_id() != &id {
            Some(format!(
                "Key material belongs to {}, not {}",
                material.member_id(),
                id
            ))
        } else if material.group() != &group {
            Some("Key material was generated for a different group".into())
        } else {
            None
        }
    });

    new_party(id, group, rejection, params, SIGN_LAST_ROUND, move |driver| {
        sign::run_signing(driver, material, digest)
    })
}

fn check_membership(id: &MemberId, group: &GroupMembers) -> Option<String> {
    if group.threshold() > group.len() {
        return Some(format!(
            "Threshold {} exceeds group size {}",
            group.threshold(),
            group.len()
        ));
    }
    if !group.contains(id) {
        return Some(format!("Member {} is not in the group", id));
    }
    None
}

fn new_party<T, F, Fut>(
    id: MemberId,
    group: GroupMembers,
    rejection: Option<String>,
    params: &Parameters,
    last_round: u32,
    protocol: F,
) -> PartyHandles<T>
where
    T: Send + 'static,
    F: FnOnce(RoundDriver) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    // One broadcast round never blocks on buffer space
    let (outbound_tx, outbound) = mpsc::channel(group.len().max(1));
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (sink, results) = result_channel();

    let driver = RoundDriver::new(
        id.clone(),
        group.clone(),
        outbound_tx,
        inbound_rx,
        last_round,
        params.round_timeout,
    );
    let job: Job<T> = Box::pin(protocol(driver));

    let party = LocalParty {
        id,
        group,
        inbound: inbound_tx,
        rejection,
        job: Mutex::new(Some(job)),
        task: Mutex::new(None),
        sink: sink.clone(),
    };

    PartyHandles {
        party,
        outbound,
        sink,
        results,
    }
}
