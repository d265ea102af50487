//! Key generation sessions

use super::bridge::NetworkBridge;
use super::signing::Signer;
use crate::engine::{self, PartyHandles};
use crate::net::Provider;
use crate::{GroupMembers, MemberId, Parameters, Result};
use std::sync::Arc;
use tracing::{info, instrument};

/// Run distributed key generation for `member_id` and return a [`Signer`]
/// ready to sign for `group`.
///
/// Every member of the group must run this concurrently over the same
/// network. Like signing, the session ends with exactly one outcome and the
/// bridge is torn down on every path.
#[instrument(skip_all, fields(member = %member_id, group_size = group.len()))]
pub async fn generate_signer(
    member_id: MemberId,
    group: GroupMembers,
    params: Parameters,
    provider: Arc<dyn Provider>,
) -> Result<Signer> {
    let PartyHandles {
        party,
        outbound,
        sink,
        results,
    } = engine::start_keygen(member_id, group, &params);

    let bridge = NetworkBridge::connect(party, outbound, sink, provider)?;
    let _closing = bridge.close_guard();
    bridge.start_relay()?;
    bridge.party().begin()?;

    let material = results.wait().await?;
    info!(
        public_key = hex::encode(material.public_key().to_sec1_compressed()),
        "Key generation completed"
    );

    Ok(Signer::new(material, params))
}
