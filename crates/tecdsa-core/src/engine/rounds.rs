//! Round driver used by the protocol tasks
//!
//! Outbound messages go to the party's outbound channel; inbound messages
//! arrive in any order and are binned by round until a collection asks for
//! them.

use crate::{Error, GroupMembers, MemberId, ProtocolMessage, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Which kind of message a round collects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Broadcast,
    Direct,
}

pub(crate) struct RoundDriver {
    id: MemberId,
    group: GroupMembers,
    outbound: mpsc::Sender<ProtocolMessage>,
    inbound: mpsc::UnboundedReceiver<ProtocolMessage>,
    /// Messages that arrived ahead of the round being collected
    pending: HashMap<u32, Vec<ProtocolMessage>>,
    /// Highest round the protocol uses; anything above is rejected
    last_round: u32,
    round_timeout: Duration,
}

impl RoundDriver {
    pub(crate) fn new(
        id: MemberId,
        group: GroupMembers,
        outbound: mpsc::Sender<ProtocolMessage>,
        inbound: mpsc::UnboundedReceiver<ProtocolMessage>,
        last_round: u32,
        round_timeout: Duration,
    ) -> Self {
        Self {
            id,
            group,
            outbound,
            inbound,
            pending: HashMap::new(),
            last_round,
            round_timeout,
        }
    }

    pub(crate) fn id(&self) -> &MemberId {
        &self.id
    }

    pub(crate) fn group(&self) -> &GroupMembers {
        &self.group
    }

    /// Broadcast a message to all other members
    pub(crate) async fn broadcast<T: Serialize>(&self, round: u32, message: &T) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.emit(ProtocolMessage::broadcast(self.id.clone(), round, payload))
            .await
    }

    /// Send a message to one specific member
    pub(crate) async fn send_direct<T: Serialize>(
        &self,
        round: u32,
        to: &MemberId,
        message: &T,
    ) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.emit(ProtocolMessage::direct(
            self.id.clone(),
            vec![to.clone()],
            round,
            payload,
        ))
        .await
    }

    async fn emit(&self, message: ProtocolMessage) -> Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| Error::Protocol("Outbound channel closed".into()))
    }

    /// Collect one broadcast from every other member
    pub(crate) async fn collect_broadcasts<T: DeserializeOwned>(
        &mut self,
        round: u32,
    ) -> Result<BTreeMap<MemberId, T>> {
        self.collect(round, Delivery::Broadcast).await
    }

    /// Collect one direct message from every other member
    pub(crate) async fn collect_direct<T: DeserializeOwned>(
        &mut self,
        round: u32,
    ) -> Result<BTreeMap<MemberId, T>> {
        self.collect(round, Delivery::Direct).await
    }

    async fn collect<T: DeserializeOwned>(
        &mut self,
        round: u32,
        delivery: Delivery,
    ) -> Result<BTreeMap<MemberId, T>> {
        let expected = self.group.len() - 1;
        let mut received = BTreeMap::new();

        for message in self.pending.remove(&round).unwrap_or_default() {
            self.accept(message, delivery, &mut received)?;
        }

        let deadline = Instant::now() + self.round_timeout;
        while received.len() < expected {
            let message = match tokio::time::timeout_at(deadline, self.inbound.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) => return Err(Error::Aborted),
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "round {} messages from {} of {} members",
                        round,
                        expected - received.len(),
                        expected
                    )))
                }
            };

            if message.round == round {
                self.accept(message, delivery, &mut received)?;
            } else if message.round > round {
                self.buffer(message)?;
            } else {
                debug!(round = message.round, from = %message.from, "Dropping late message");
            }
        }

        debug!(round, count = received.len(), "Round collected");
        Ok(received)
    }

    /// Hold a message for a later round. Only rounds the protocol has and
    /// at most one message per peer and round are kept.
    fn buffer(&mut self, message: ProtocolMessage) -> Result<()> {
        if message.round > self.last_round {
            return Err(Error::Protocol(format!(
                "Message from {} for round {} beyond the last round {}",
                message.from, message.round, self.last_round
            )));
        }

        let expected = self.group.len() - 1;
        let pending = self.pending.entry(message.round).or_default();
        if pending.len() >= expected {
            return Err(Error::Protocol(format!(
                "Too many early messages for round {} (latest from {})",
                message.round, message.from
            )));
        }

        trace!(round = message.round, from = %message.from, "Buffering early message");
        pending.push(message);
        Ok(())
    }

    fn accept<T: DeserializeOwned>(
        &self,
        message: ProtocolMessage,
        delivery: Delivery,
        received: &mut BTreeMap<MemberId, T>,
    ) -> Result<()> {
        if message.from == self.id || !self.group.contains(&message.from) {
            return Err(Error::Protocol(format!(
                "Unexpected sender {} in round {}",
                message.from, message.round
            )));
        }

        let kind = if message.is_broadcast() {
            Delivery::Broadcast
        } else {
            Delivery::Direct
        };
        if kind != delivery {
            return Err(Error::Protocol(format!(
                "Expected {:?} message in round {}, got {:?} from {}",
                delivery, message.round, kind, message.from
            )));
        }
        if !message.is_addressed_to(&self.id) {
            return Err(Error::Protocol(format!(
                "Message from {} in round {} is not addressed to {}",
                message.from, message.round, self.id
            )));
        }
        if received.contains_key(&message.from) {
            return Err(Error::Protocol(format!(
                "Duplicate message from {} in round {}",
                message.from, message.round
            )));
        }

        let body = serde_json::from_slice(&message.payload)
            .map_err(|e| Error::Deserialization(e.to_string()))?;
        received.insert(message.from, body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(
        last_round: u32,
    ) -> (
        RoundDriver,
        mpsc::UnboundedSender<ProtocolMessage>,
        mpsc::Receiver<ProtocolMessage>,
    ) {
        let group = GroupMembers::new((1..=3u64).map(MemberId::from).collect(), 2).unwrap();
        let (outbound_tx, outbound_rx) = mpsc::channel(4);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let driver = RoundDriver::new(
            MemberId::from(1u64),
            group,
            outbound_tx,
            inbound_rx,
            last_round,
            Duration::from_secs(1),
        );
        (driver, inbound_tx, outbound_rx)
    }

    fn broadcast(from: u64, round: u32) -> ProtocolMessage {
        ProtocolMessage::broadcast(MemberId::from(from), round, serde_json::to_vec(&from).unwrap())
    }

    #[tokio::test]
    async fn test_early_messages_are_buffered() {
        let (mut driver, inbound, _outbound) = driver(2);
        for round in [2, 1] {
            for from in [2u64, 3] {
                inbound.send(broadcast(from, round)).unwrap();
            }
        }

        let first = driver.collect_broadcasts::<u64>(1).await.unwrap();
        assert_eq!(first.get(&MemberId::from(3u64)), Some(&3));
        let second = driver.collect_broadcasts::<u64>(2).await.unwrap();
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn test_round_beyond_last_is_rejected() {
        let (mut driver, inbound, _outbound) = driver(2);
        inbound.send(broadcast(2, 3)).unwrap();

        assert!(matches!(
            driver.collect_broadcasts::<u64>(1).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_flood_of_early_messages_is_rejected() {
        let (mut driver, inbound, _outbound) = driver(5);
        for _ in 0..3 {
            inbound.send(broadcast(2, 4)).unwrap();
        }

        assert!(matches!(
            driver.collect_broadcasts::<u64>(1).await,
            Err(Error::Protocol(_))
        ));
        assert_eq!(driver.pending.get(&4).map(Vec::len), Some(2));
    }
}
