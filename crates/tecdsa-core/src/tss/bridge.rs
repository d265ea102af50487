//! Network bridge between one engine party and a network provider
//!
//! The bridge lives for exactly one session. Inbound traffic reaches the
//! party through a single receive handler; outbound traffic is relayed by one
//! task that hands each engine message to [`Provider::send`] once. Inbound
//! goes quiet as soon as the [`DoneSignal`] is asserted. Outbound keeps
//! sending what the engine queued before it finished, for at most
//! [`FLUSH_TIMEOUT`], so peers still receive our final round.

use crate::engine::{LocalParty, ResultSink};
use crate::net::{Handler, Provider};
use crate::{Error, GroupMembers, MemberId, ProtocolMessage, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// How long the relay keeps sending queued messages after completion
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// One-shot, idempotent completion indicator
#[derive(Clone)]
pub struct DoneSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl DoneSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Assert completion. Returns true only for the call that flipped it.
    pub fn assert(&self) -> bool {
        self.tx.send_if_modified(|done| {
            if *done {
                false
            } else {
                *done = true;
                true
            }
        })
    }

    pub fn is_done(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once completion is asserted
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for DoneSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Relay for one session
pub struct NetworkBridge<T> {
    member_id: MemberId,
    group: GroupMembers,
    party: Arc<LocalParty<T>>,
    provider: Arc<dyn Provider>,
    sink: ResultSink<T>,
    done: DoneSignal,
    outbound: Mutex<Option<mpsc::Receiver<ProtocolMessage>>>,
}

impl<T: Send + 'static> NetworkBridge<T> {
    /// Register the session's receive handler with `provider`.
    ///
    /// No protocol traffic flows until [`start_relay`](Self::start_relay) and
    /// the party's `begin`.
    pub fn connect(
        party: LocalParty<T>,
        outbound: mpsc::Receiver<ProtocolMessage>,
        sink: ResultSink<T>,
        provider: Arc<dyn Provider>,
    ) -> Result<Self> {
        let member_id = party.id().clone();
        let group = party.group().clone();
        let party = Arc::new(party);
        let done = DoneSignal::new();

        let handler = inbound_handler(
            member_id.clone(),
            Arc::clone(&party),
            sink.clone(),
            done.clone(),
        );
        provider.register_receive_handler(handler).map_err(|e| {
            Error::Initialization(format!(
                "Network provider rejected receive handler for {}: {}",
                member_id, e
            ))
        })?;

        debug!(member = %member_id, "Network bridge connected");
        Ok(Self {
            member_id,
            group,
            party,
            provider,
            sink,
            done,
            outbound: Mutex::new(Some(outbound)),
        })
    }

    pub fn party(&self) -> &LocalParty<T> {
        &self.party
    }

    pub fn done(&self) -> &DoneSignal {
        &self.done
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_done()
    }

    /// Spawn the outbound relay task. Can only be called once.
    pub fn start_relay(&self) -> Result<()> {
        let outbound = self
            .outbound
            .lock()
            .map_err(|_| Error::Start("Bridge state poisoned".into()))?
            .take()
            .ok_or_else(|| Error::Start(format!("Relay for {} already started", self.member_id)))?;

        tokio::spawn(relay_outbound(
            self.member_id.clone(),
            self.group.clone(),
            outbound,
            Arc::clone(&self.provider),
            self.sink.clone(),
            self.done.clone(),
        ));
        Ok(())
    }

    /// Close the bridge when the returned guard goes out of scope
    pub fn close_guard(&self) -> CloseGuard<'_, T> {
        CloseGuard(self)
    }
}

impl<T> NetworkBridge<T> {
    /// Assert completion and tear down. Safe to call repeatedly.
    ///
    /// Stopping the party closes its outbound channel; the relay drains what
    /// is left and exits on its own.
    pub fn close(&self) {
        if !self.done.assert() {
            return;
        }

        self.provider.unregister_receive_handler();
        self.party.stop();
        debug!(member = %self.member_id, "Network bridge closed");
    }
}

impl<T> Drop for NetworkBridge<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Closes its bridge on drop
pub struct CloseGuard<'a, T>(&'a NetworkBridge<T>);

impl<T> Drop for CloseGuard<'_, T> {
    fn drop(&mut self) {
        self.0.close();
    }
}

fn inbound_handler<T: Send + 'static>(
    member_id: MemberId,
    party: Arc<LocalParty<T>>,
    sink: ResultSink<T>,
    done: DoneSignal,
) -> Handler {
    Arc::new(move |message: ProtocolMessage| {
        if done.is_done() {
            trace!(member = %member_id, from = %message.from, "Session complete, discarding message");
            return Ok(());
        }
        if message.from == member_id {
            trace!(member = %member_id, "Dropping self-authored message");
            return Ok(());
        }
        if !message.is_addressed_to(&member_id) {
            trace!(member = %member_id, from = %message.from, "Dropping message for other members");
            return Ok(());
        }

        if let Err(error) = party.update(message) {
            warn!(member = %member_id, %error, "Engine rejected inbound message");
            sink.fail(error);
        }
        Ok(())
    })
}

async fn relay_outbound<T>(
    member_id: MemberId,
    group: GroupMembers,
    mut outbound: mpsc::Receiver<ProtocolMessage>,
    provider: Arc<dyn Provider>,
    sink: ResultSink<T>,
    done: DoneSignal,
) {
    // Set once the session completes; from then on only queued messages go out
    let mut flush_deadline: Option<Instant> = None;

    loop {
        let next = match flush_deadline {
            None => tokio::select! {
                _ = done.wait() => {
                    flush_deadline = Some(Instant::now() + FLUSH_TIMEOUT);
                    continue;
                }
                message = outbound.recv() => message,
            },
            Some(deadline) => match tokio::time::timeout_at(deadline, outbound.recv()).await {
                Ok(message) => message,
                Err(_) => {
                    warn!(member = %member_id, "Gave up flushing outbound messages");
                    break;
                }
            },
        };
        let Some(message) = next else { break };

        if !message.is_broadcast()
            && !message
                .to
                .iter()
                .any(|id| id != &member_id && group.contains(id))
        {
            sink.fail(Error::Delivery(format!(
                "Round {} message from {} has no recipients in the group",
                message.round, member_id
            )));
            break;
        }

        let round = message.round;
        trace!(member = %member_id, round, broadcast = message.is_broadcast(), "Relaying message");
        let Some(sent) = send_before_deadline(&*provider, message, &done, &mut flush_deadline).await
        else {
            warn!(member = %member_id, round, "Gave up flushing outbound messages");
            break;
        };

        if let Err(error) = sent {
            warn!(member = %member_id, round, %error, "Message delivery failed");
            sink.fail(match error {
                Error::Delivery(_) => error,
                other => Error::Delivery(other.to_string()),
            });
            break;
        }
    }
    debug!(member = %member_id, "Outbound relay stopped");
}

/// Send one message. A send still pending at completion gets until the
/// flush deadline; `None` means the deadline passed first.
async fn send_before_deadline(
    provider: &dyn Provider,
    message: ProtocolMessage,
    done: &DoneSignal,
    flush_deadline: &mut Option<Instant>,
) -> Option<Result<()>> {
    let mut send = provider.send(message);
    let deadline = match *flush_deadline {
        Some(deadline) => deadline,
        None => tokio::select! {
            sent = &mut send => return Some(sent),
            _ = done.wait() => *flush_deadline.insert(Instant::now() + FLUSH_TIMEOUT),
        },
    };
    tokio::time::timeout_at(deadline, send).await.ok()
}
