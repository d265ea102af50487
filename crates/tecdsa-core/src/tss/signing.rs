//! Signing sessions

use super::bridge::NetworkBridge;
use crate::engine::{self, KeygenMaterial, PartyHandles, ResultReceiver, SignatureData};
use crate::net::Provider;
use crate::{Digest, Error, GroupMembers, MemberId, Parameters, PublicKey, Result, Signature};
use std::sync::Arc;
use tracing::{info, instrument};

/// A member holding key material from a completed key generation
#[derive(Clone)]
pub struct Signer {
    material: Arc<KeygenMaterial>,
    params: Parameters,
}

impl Signer {
    pub fn new(material: KeygenMaterial, params: Parameters) -> Self {
        Self {
            material: Arc::new(material),
            params,
        }
    }

    pub fn member_id(&self) -> &MemberId {
        self.material.member_id()
    }

    pub fn group(&self) -> &GroupMembers {
        self.material.group()
    }

    pub fn public_key(&self) -> &PublicKey {
        self.material.public_key()
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    /// Prepare a signing session for `digest` over `provider`.
    ///
    /// Only wires the engine party to the network; no protocol messages are
    /// exchanged until [`SigningSigner::sign`].
    #[instrument(skip_all, fields(member = %self.member_id(), digest = %hex::encode(digest)))]
    pub fn initialize_signing(
        &self,
        digest: &Digest,
        provider: Arc<dyn Provider>,
    ) -> Result<SigningSigner> {
        let PartyHandles {
            party,
            outbound,
            sink,
            results,
        } = engine::start_signing(
            self.member_id().clone(),
            self.group().clone(),
            Arc::clone(&self.material),
            *digest,
            &self.params,
        );

        let bridge = NetworkBridge::connect(party, outbound, sink, provider)?;

        Ok(SigningSigner {
            member_id: self.member_id().clone(),
            public_key: *self.public_key(),
            digest: *digest,
            bridge,
            results: Some(results),
        })
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("member_id", self.member_id())
            .field("public_key", &hex::encode(self.public_key().to_sec1_compressed()))
            .finish()
    }
}

/// One signing attempt for a fixed digest
pub struct SigningSigner {
    member_id: MemberId,
    public_key: PublicKey,
    digest: Digest,
    bridge: NetworkBridge<SignatureData>,
    results: Option<ResultReceiver<SignatureData>>,
}

impl SigningSigner {
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Run the protocol and wait for its outcome.
    ///
    /// May be called once; later calls fail with [`Error::AlreadySigned`].
    /// The session is torn down on every return path.
    #[instrument(skip(self), fields(member = %self.member_id))]
    pub async fn sign(&mut self) -> Result<Signature> {
        let results = self.results.take().ok_or(Error::AlreadySigned)?;
        if self.bridge.is_closed() {
            return Err(Error::Aborted);
        }

        let _closing = self.bridge.close_guard();
        self.bridge.start_relay()?;
        self.bridge.party().begin()?;

        let data = results.wait().await?;
        if data.m != self.digest {
            return Err(Error::Protocol(
                "Engine signed a different digest than requested".into(),
            ));
        }

        let signature = convert_signature(&data)?;
        signature
            .verify(&self.public_key, &self.digest)
            .map_err(|_| Error::Protocol("Signature does not verify".into()))?;

        info!(
            r = hex::encode(signature.r),
            s = hex::encode(signature.s),
            recovery_id = signature.recovery_id,
            "Signing completed"
        );
        Ok(signature)
    }

    /// Tear the session down without waiting for an outcome
    pub fn abort(&self) {
        self.bridge.close();
    }
}

/// Convert the engine's raw output into a [`Signature`].
///
/// R and S are big-endian unsigned integers and are left-padded to 32 bytes.
/// Only the first recovery byte carries the recovery id.
pub fn convert_signature(data: &SignatureData) -> Result<Signature> {
    let recovery_id = *data
        .signature_recovery
        .first()
        .ok_or_else(|| Error::Protocol("Missing signature recovery byte".into()))?;
    if recovery_id > 1 {
        return Err(Error::Protocol(format!(
            "Invalid recovery id {}",
            recovery_id
        )));
    }

    Ok(Signature::new(
        to_fixed(&data.r, "R")?,
        to_fixed(&data.s, "S")?,
        recovery_id,
    ))
}

fn to_fixed(bytes: &[u8], name: &str) -> Result<[u8; 32]> {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    let value = &bytes[start..];
    if value.len() > 32 {
        return Err(Error::Protocol(format!(
            "{} does not fit in 32 bytes ({} bytes)",
            name,
            value.len()
        )));
    }

    let mut fixed = [0u8; 32];
    fixed[32 - value.len()..].copy_from_slice(value);
    Ok(fixed)
}
