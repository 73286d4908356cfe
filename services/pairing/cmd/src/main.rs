//! Pairing node binary.
//!
//! Administers the persistent fabric table, computes passcode verifiers and
//! runs a loopback commissioning demo: PASE, certificate provisioning over
//! the PASE session, then CASE and CASE resumption.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use pairing_crypto::spake2p::{PasscodeVerifier, PBKDF_MIN_ITERATIONS};
use pairing_crypto::{random_bytes, KeyPair, SYMMETRIC_KEY_LEN};
use pairing_fabric::{
    Certificate, CertificateAuthority, FabricBuilder, FabricId, FabricIndex, FabricManager,
    NodeId, VendorId,
};
use pairing_session::{
    link_pair, ExchangeDispatcher, HandshakeError, PbkdfParameters, SecureSession, SessionManager,
};
use pairing_storage::{MemoryBackend, StorageManager};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[macro_use]
mod logging;
mod config;

use config::NodeConfig;
use logging::PairingLogFormatter;

/// Secure pairing node
#[derive(Parser, Debug)]
#[command(name = "pairing-node", version, about = "PASE/CASE pairing and fabric administration")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "pairing.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    /// Handshake timeout, e.g. 30s; overrides the config file
    #[arg(long)]
    handshake_timeout: Option<humantime::Duration>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect and administer the fabric table
    Fabrics {
        #[command(subcommand)]
        action: FabricCommand,
    },
    /// Compute the passcode verifier a device stores instead of its passcode
    Verifier {
        /// Setup passcode
        #[arg(long)]
        passcode: u32,
        /// PBKDF2 iterations
        #[arg(long, default_value_t = PBKDF_MIN_ITERATIONS)]
        iterations: u32,
        /// Salt as hex; random when omitted
        #[arg(long)]
        salt: Option<String>,
    },
    /// Commission a loopback device, then open CASE and resumed CASE sessions
    Demo {
        /// Setup passcode of the loopback device
        #[arg(long, default_value_t = 20202021)]
        passcode: u32,
        /// Fabric id of the demo fabric
        #[arg(long, default_value_t = 1)]
        fabric_id: u64,
        /// Operational node id assigned to the device
        #[arg(long, default_value_t = 0x2222)]
        node_id: u64,
        /// Label stored with the device's new fabric
        #[arg(long, default_value = "demo")]
        label: String,
    },
}

#[derive(Subcommand, Debug)]
enum FabricCommand {
    /// List fabrics in insertion order
    List,
    /// Remove a fabric
    Remove {
        /// Fabric index
        #[arg(long)]
        index: u8,
    },
    /// Revoke a fabric (index reused last)
    Revoke {
        /// Fabric index
        #[arg(long)]
        index: u8,
    },
    /// Change a fabric's label
    Label {
        /// Fabric index
        #[arg(long)]
        index: u8,
        /// New label (at most 32 characters, unique)
        #[arg(long)]
        label: String,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = NodeConfig::load_from_file(&args.config)?;
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    if let Some(timeout) = args.handshake_timeout {
        config.session.handshake_timeout = timeout.to_string();
    }

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("pairing_node={}", config.log_level).parse()?)
        .add_directive(format!("pairing_session={}", config.log_level).parse()?)
        .add_directive(format!("pairing_fabric={}", config.log_level).parse()?)
        .add_directive(format!("pairing_storage={}", config.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(PairingLogFormatter::new("pairing".to_string()))
        .init();

    info!("Starting pairing node v{}", env!("CARGO_PKG_VERSION"));

    let result = match args.command {
        Command::Fabrics { action } => run_fabric_command(&config, action).await,
        Command::Verifier {
            passcode,
            iterations,
            salt,
        } => print_verifier(passcode, iterations, salt.as_deref()),
        Command::Demo {
            passcode,
            fabric_id,
            node_id,
            label,
        } => run_demo(&config, passcode, FabricId(fabric_id), NodeId(node_id), &label).await,
    };

    if let Err(e) = &result {
        component_error!("node", "Command failed: {:#}", e);
    }
    result
}

/// Fabric table over the configured storage, loaded from disk
async fn open_fabric_table(config: &NodeConfig) -> Result<Arc<FabricManager>> {
    let storage = StorageManager::from_mode(config.storage_mode()?)
        .await
        .context("failed to open storage")?;
    let fabrics = FabricManager::new(storage.create_context(&config.fabric_context)?);
    let loaded = fabrics.init_from_storage().await?;
    component_info!("fabric", "Loaded {} fabrics", loaded);
    Ok(Arc::new(fabrics))
}

async fn run_fabric_command(config: &NodeConfig, action: FabricCommand) -> Result<()> {
    let fabrics = open_fabric_table(config).await?;
    match action {
        FabricCommand::List => {
            let rows: Vec<serde_json::Value> = fabrics
                .fabrics()
                .await
                .iter()
                .map(|f| {
                    serde_json::json!({
                        "fabricIndex": f.index().get(),
                        "fabricId": f.fabric_id().to_string(),
                        "nodeId": f.node_id().to_string(),
                        "rootVendorId": f.root_vendor_id().0,
                        "label": f.label(),
                        "operationalId": to_hex(f.operational_id()),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        FabricCommand::Remove { index } => {
            let removed = fabrics.remove_fabric(FabricIndex::new(index)?).await?;
            component_info!("fabric", "Removed fabric {} ({})", index, removed.fabric_id());
        }
        FabricCommand::Revoke { index } => {
            let revoked = fabrics.revoke_fabric(FabricIndex::new(index)?).await?;
            component_info!("fabric", "Revoked fabric {} ({})", index, revoked.fabric_id());
        }
        FabricCommand::Label { index, label } => {
            fabrics.update_label(FabricIndex::new(index)?, &label).await?;
            component_info!("fabric", "Fabric {} labelled {:?}", index, label);
        }
    }
    Ok(())
}

fn print_verifier(passcode: u32, iterations: u32, salt: Option<&str>) -> Result<()> {
    let salt = match salt {
        Some(hex) => parse_hex(hex)?,
        None => random_bytes::<32>().to_vec(),
    };
    let parameters = PbkdfParameters {
        iterations,
        salt: salt.clone(),
    };
    if !parameters.is_valid() {
        bail!("iterations or salt length out of range");
    }
    let verifier = PasscodeVerifier::derive(passcode, &salt, iterations)?;
    let output = serde_json::json!({
        "iterations": iterations,
        "salt": to_hex(&salt),
        "verifier": to_hex(&verifier.to_bytes()?),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_demo(
    config: &NodeConfig,
    passcode: u32,
    fabric_id: FabricId,
    device_node_id: NodeId,
    label: &str,
) -> Result<()> {
    let session_config = config.session_config()?;

    // The device is this node; the controller lives in memory only
    let device_fabrics = open_fabric_table(config).await?;
    let device = Arc::new(SessionManager::new(device_fabrics.clone(), session_config.clone()));
    let _watcher = device.watch_fabrics();

    let controller_storage = StorageManager::new(Arc::new(MemoryBackend::new()));
    let controller_fabrics = Arc::new(FabricManager::new(
        controller_storage.create_context("controller")?,
    ));
    let controller = Arc::new(SessionManager::new(controller_fabrics.clone(), session_config));

    let ca = CertificateAuthority::new_root(1, Some(fabric_id.0));
    let epoch_key: [u8; SYMMETRIC_KEY_LEN] = random_bytes();
    let controller_key = KeyPair::generate();
    let controller_noc = ca.issue_node(controller_key.public_key(), 1, fabric_id.0)?;
    let controller_fabric = FabricBuilder::new(controller_key)
        .index(controller_fabrics.next_fabric_index().await?)
        .root_vendor_id(VendorId(0xFFF1))
        .identity_protection_key(epoch_key)
        .root_certificate(ca.certificate().clone())
        .operational_certificate(controller_noc)
        .label("controller")
        .build()?;
    let controller_index = controller_fabric.index();
    controller_fabrics.add_fabric(controller_fabric).await?;

    let (controller_link, device_link) = link_pair(32);
    let (controller_exchanges, _) = ExchangeDispatcher::new(controller_link.0, controller_link.1);
    let (_device_exchanges, mut incoming) = ExchangeDispatcher::new(device_link.0, device_link.1);

    // Commissioning window: the device holds only the verifier
    let salt = random_bytes::<32>().to_vec();
    let verifier = PasscodeVerifier::derive(passcode, &salt, PBKDF_MIN_ITERATIONS)?;
    let parameters = PbkdfParameters {
        iterations: PBKDF_MIN_ITERATIONS,
        salt,
    };

    let mut exchange = controller_exchanges.open_exchange()?;
    let (controller_pase, device_pase) = tokio::join!(
        controller.pase_commission(&mut exchange, passcode),
        async {
            let mut exchange = incoming.recv().await.ok_or(HandshakeError::ChannelClosed)?;
            device.pase_accept(&mut exchange, verifier, parameters).await
        }
    );
    let (controller_pase, device_pase) = (controller_pase?, device_pase?);
    component_info!(
        "demo",
        "PASE session {} <-> {} established",
        controller_pase.local_session_id(),
        device_pase.local_session_id()
    );

    // Provision operational credentials over the PASE session
    let device_key = KeyPair::generate();
    let device_noc = ca.issue_node(device_key.public_key(), device_node_id.0, fabric_id.0)?;
    controller_pase.send(&ca.certificate().to_bytes()).await?;
    controller_pase.send(&device_noc.to_bytes()).await?;
    controller_pase.send(&epoch_key).await?;
    let (pase_tx, mut pase_rx) = mpsc::channel(8);
    let flushed = controller_pase.bind(pase_tx).await?;
    component_debug!("demo", "Flushed {} provisioning messages", flushed);

    let root_cert = Certificate::from_bytes(&receive(&device_pase, &mut pase_rx).await?)?;
    let noc = Certificate::from_bytes(&receive(&device_pase, &mut pase_rx).await?)?;
    let ipk: [u8; SYMMETRIC_KEY_LEN] = receive(&device_pase, &mut pase_rx)
        .await?
        .as_slice()
        .try_into()
        .context("malformed epoch key")?;

    let device_fabric = FabricBuilder::new(device_key)
        .index(device_fabrics.next_fabric_index().await?)
        .root_vendor_id(VendorId(0xFFF1))
        .identity_protection_key(ipk)
        .root_certificate(root_cert)
        .operational_certificate(noc)
        .build()?;
    let device_index = device_fabric.index();
    device_fabrics.add_fabric(device_fabric).await?;
    device_fabrics.persist_fabrics().await?;
    if let Err(e) = device_fabrics.update_label(device_index, label).await {
        component_warn!("fabric", "Keeping fabric {} unlabelled: {}", device_index, e);
    }
    component_info!(
        "fabric",
        "Device joined fabric {} as index {}",
        fabric_id,
        device_index
    );

    controller.remove_session(controller_pase.local_session_id()).await;
    device.remove_session(device_pase.local_session_id()).await;

    // Operational sessions: full CASE first, then resumption from the cached record
    for attempt in 1..=2 {
        let mut exchange = controller_exchanges.open_exchange()?;
        let (controller_case, device_case) = tokio::join!(
            controller.case_connect(&mut exchange, controller_index, device_node_id),
            async {
                let mut exchange = incoming.recv().await.ok_or(HandshakeError::ChannelClosed)?;
                device.case_accept(&mut exchange).await
            }
        );
        let (controller_case, device_case) = (controller_case?, device_case?);
        component_info!(
            "demo",
            "CASE attempt {}: session {} <-> {} with node {}",
            attempt,
            controller_case.local_session_id(),
            device_case.local_session_id(),
            controller_case.peer_node_id()
        );

        let (case_tx, mut case_rx) = mpsc::channel(8);
        controller_case.bind(case_tx).await?;
        controller_case.send(b"hello over CASE").await?;
        let echoed = receive(&device_case, &mut case_rx).await?;
        component_info!(
            "demo",
            "Device decrypted {} bytes: {}",
            echoed.len(),
            String::from_utf8_lossy(&echoed)
        );

        controller.remove_session(controller_case.local_session_id()).await;
        device.remove_session(device_case.local_session_id()).await;
    }

    component_info!(
        "demo",
        "Resumption records cached: controller {}, device {}",
        controller.resumption().len(),
        device.resumption().len()
    );
    Ok(())
}

/// Receive and decrypt one packet from a bound session sink
async fn receive(session: &SecureSession, rx: &mut mpsc::Receiver<Bytes>) -> Result<Vec<u8>> {
    let packet = rx.recv().await.context("session sink closed")?;
    let (_, plaintext) = session.open(&packet).await?;
    Ok(plaintext.to_vec())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn parse_hex(hex: &str) -> Result<Vec<u8>> {
    if !hex.is_ascii() || hex.len() % 2 != 0 {
        bail!("salt must be an even number of hex digits");
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16).with_context(|| format!("invalid hex at {}", i))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_helpers() {
        assert_eq!(to_hex(&[0x00, 0xab, 0x7f]), "00ab7f");
        assert_eq!(parse_hex("00ab7F").unwrap(), vec![0x00, 0xab, 0x7f]);
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
        assert!(parse_hex("é1").is_err());
    }

    #[test]
    fn test_verifier_rejects_short_salt() {
        assert!(print_verifier(20202021, PBKDF_MIN_ITERATIONS, Some("0011")).is_err());
    }
}
