//! In-memory network provider

use super::{async_trait, Handler, Provider};
use crate::{Error, MemberId, ProtocolMessage, Result};
use dashmap::{mapref::entry::Entry, DashMap};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

const DEFAULT_INBOX_CAPACITY: usize = 64;

/// Receive handler of one connected member
#[derive(Clone)]
enum HandlerState {
    /// Nothing registered yet; inbound messages wait in the inbox
    Pending,
    Active(Handler),
    /// Unregistered; inbound messages are discarded
    Closed,
}

/// Routing table for one session's members.
///
/// Each connected member has a bounded inbox drained by a single delivery
/// worker, so delivery concurrency is one task per member no matter how many
/// messages are in flight.
#[derive(Clone)]
pub struct LocalNetwork {
    peers: Arc<DashMap<MemberId, mpsc::Sender<ProtocolMessage>>>,
    inbox_capacity: usize,
}

impl LocalNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::with_inbox_capacity(DEFAULT_INBOX_CAPACITY)
    }

    pub fn with_inbox_capacity(inbox_capacity: usize) -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
            inbox_capacity: inbox_capacity.max(1),
        }
    }

    /// Connect a member and start its delivery worker. Must be called from
    /// within a Tokio runtime.
    pub fn connect(&self, id: MemberId) -> Result<LocalChannel> {
        let (inbox_tx, inbox_rx) = mpsc::channel(self.inbox_capacity);
        match self.peers.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::Initialization(format!(
                    "Member {} is already connected",
                    id
                )))
            }
            Entry::Vacant(entry) => {
                entry.insert(inbox_tx);
            }
        }

        let (state_tx, state_rx) = watch::channel(HandlerState::Pending);
        tokio::spawn(run_delivery(id.clone(), inbox_rx, state_rx));

        debug!(member = %id, "Member connected");
        Ok(LocalChannel {
            id,
            network: self.clone(),
            state: state_tx,
        })
    }

    /// Currently connected members
    pub fn members(&self) -> Vec<MemberId> {
        let mut members: Vec<_> = self.peers.iter().map(|entry| entry.key().clone()).collect();
        members.sort();
        members
    }

    /// Resolve the inboxes a message must reach
    fn targets(
        &self,
        message: &ProtocolMessage,
    ) -> Result<Vec<(MemberId, mpsc::Sender<ProtocolMessage>)>> {
        if message.is_broadcast() {
            return Ok(self
                .peers
                .iter()
                .filter(|entry| entry.key() != &message.from)
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect());
        }

        let recipients: BTreeSet<&MemberId> = message
            .to
            .iter()
            .filter(|id| **id != message.from)
            .collect();

        let mut targets = Vec::with_capacity(recipients.len());
        for id in recipients {
            match self.peers.get(id) {
                Some(entry) => targets.push((id.clone(), entry.value().clone())),
                None => warn!(recipient = %id, round = message.round, "Recipient not connected"),
            }
        }

        if targets.is_empty() {
            return Err(Error::Delivery(format!(
                "None of the {} recipient(s) of the round {} message from {} are connected",
                message.to.len(),
                message.round,
                message.from
            )));
        }
        Ok(targets)
    }
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One member's endpoint on a [`LocalNetwork`]
pub struct LocalChannel {
    id: MemberId,
    network: LocalNetwork,
    state: watch::Sender<HandlerState>,
}

impl LocalChannel {
    pub fn id(&self) -> &MemberId {
        &self.id
    }
}

#[async_trait]
impl Provider for LocalChannel {
    fn register_receive_handler(&self, handler: Handler) -> Result<()> {
        let mut registered = false;
        self.state.send_if_modified(|state| match state {
            HandlerState::Pending => {
                *state = HandlerState::Active(handler);
                registered = true;
                true
            }
            HandlerState::Active(_) | HandlerState::Closed => false,
        });

        if !registered {
            return Err(Error::Initialization(format!(
                "Receive handler for {} was already registered",
                self.id
            )));
        }
        Ok(())
    }

    fn unregister_receive_handler(&self) {
        self.state.send_replace(HandlerState::Closed);
    }

    async fn send(&self, message: ProtocolMessage) -> Result<()> {
        if message.from != self.id {
            return Err(Error::Delivery(format!(
                "Channel of {} cannot send on behalf of {}",
                self.id, message.from
            )));
        }

        for (id, inbox) in self.network.targets(&message)? {
            inbox
                .send(message.clone())
                .await
                .map_err(|_| Error::Delivery(format!("Member {} disconnected", id)))?;
        }
        Ok(())
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.state.send_replace(HandlerState::Closed);
        self.network.peers.remove(&self.id);
    }
}

async fn run_delivery(
    id: MemberId,
    mut inbox: mpsc::Receiver<ProtocolMessage>,
    mut state: watch::Receiver<HandlerState>,
) {
    while let Some(message) = inbox.recv().await {
        let handler = loop {
            let current = state.borrow_and_update().clone();
            match current {
                HandlerState::Pending => {
                    if state.changed().await.is_err() {
                        return;
                    }
                }
                HandlerState::Active(handler) => break Some(handler),
                HandlerState::Closed => break None,
            }
        };

        match handler {
            Some(handler) => {
                if let Err(error) = handler(message) {
                    warn!(member = %id, %error, "Receive handler rejected message");
                }
            }
            None => trace!(member = %id, "Discarding message for closed channel"),
        }
    }
    debug!(member = %id, "Delivery worker stopped");
}
