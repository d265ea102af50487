//! tECDSA Node CLI
//!
//! Runs one keep locally: every member generates its key share over an
//! in-process network, the keep key is published on an in-memory chain and
//! signature requests are answered by the whole group.

mod config;
mod node;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::NodeConfig;
use node::LocalKeep;
use sha2::{Digest as _, Sha256};
use std::path::PathBuf;
use tracing::{info, Level};

/// tECDSA Node - local threshold ECDSA keep
#[derive(Parser)]
#[command(name = "tecdsa-node")]
#[command(about = "Threshold ECDSA keep running on a local network")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "TECDSA_CONFIG")]
    config: Option<PathBuf>,

    /// Number of keep members (overrides the config file)
    #[arg(short = 'n', long, env = "TECDSA_MEMBERS")]
    members: Option<usize>,

    /// Honest threshold (overrides the config file)
    #[arg(short = 't', long, env = "TECDSA_THRESHOLD")]
    threshold: Option<usize>,

    /// Per-round timeout in seconds (overrides the config file)
    #[arg(long, env = "TECDSA_ROUND_TIMEOUT")]
    round_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and publish the keep public key
    Keygen,

    /// Generate the keep key, then sign a message
    Sign {
        /// Message to sign; its SHA-256 digest is signed
        #[arg(short, long, conflicts_with = "digest")]
        message: Option<String>,

        /// Hex-encoded 32-byte digest to sign
        #[arg(short, long)]
        digest: Option<String>,
    },
}

impl Cli {
    fn node_config(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };

        if let Some(members) = self.members {
            config.keep.members = members;
        }
        if let Some(threshold) = self.threshold {
            config.keep.honest_threshold = threshold;
        }
        if let Some(round_timeout) = self.round_timeout {
            config.round_timeout_secs = round_timeout;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.node_config()?;

    info!(
        members = config.keep.members,
        honest_threshold = config.keep.honest_threshold,
        keep = %config.keep.address,
        "Opening keep"
    );
    let keep = LocalKeep::open(&config).await?;
    let signers = keep.generate_keys().await?;

    // Print public key
    println!("Keep: {}", hex::encode(keep.keep_address()));
    println!(
        "Public Key: {}",
        hex::encode(signers[0].public_key().to_uncompressed_xy())
    );

    match cli.command {
        Commands::Keygen => {}
        Commands::Sign {
            ref message,
            ref digest,
        } => {
            let digest = parse_digest(message.as_deref(), digest.as_deref())?;
            let _subscriptions = keep.serve_signing(&signers)?;

            info!(digest = hex::encode(digest), "Requesting signature");
            let signature = keep.sign(digest).await?;

            println!("Signature:");
            println!("  R: {}", hex::encode(signature.r));
            println!("  S: {}", hex::encode(signature.s));
            println!("  V: {}", signature.recovery_id);
            println!("  Compact: {}", hex::encode(signature.to_bytes()));
            println!("  DER: {}", hex::encode(signature.to_der()?));
        }
    }

    Ok(())
}

fn parse_digest(message: Option<&str>, digest: Option<&str>) -> Result<[u8; 32]> {
    match (message, digest) {
        (_, Some(digest)) => hex::decode(digest.trim_start_matches("0x"))
            .context("digest is not hex")?
            .try_into()
            .map_err(|_| anyhow::anyhow!("Digest must be 32 bytes")),
        (Some(message), None) => Ok(Sha256::digest(message.as_bytes()).into()),
        (None, None) => anyhow::bail!("either --message or --digest is required"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_digest() {
        let hashed = parse_digest(Some("hello"), None).unwrap();
        assert_eq!(
            hex::encode(hashed),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        let raw = parse_digest(None, Some(&"ab".repeat(32))).unwrap();
        assert_eq!(raw, [0xab; 32]);

        assert!(parse_digest(None, Some("abcd")).is_err());
        assert!(parse_digest(None, None).is_err());
    }

    #[tokio::test]
    async fn test_local_keep_signs() {
        let config = NodeConfig::parse(
            r#"
            round_timeout_secs = 5
            signing_timeout_secs = 30

            [keep]
            members = 3
            honest_threshold = 2
            "#,
        )
        .unwrap();

        let keep = LocalKeep::open(&config).await.unwrap();
        let signers = keep.generate_keys().await.unwrap();
        let _subscriptions = keep.serve_signing(&signers).unwrap();

        let digest = parse_digest(Some("local keep"), None).unwrap();
        let signature = keep.sign(digest).await.unwrap();
        signature.verify(signers[0].public_key(), &digest).unwrap();
    }
}
