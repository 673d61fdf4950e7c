//! VBFT devnet node.
//!
//! Runs a whole committee inside one process: every validator gets its own
//! consensus runner, in-memory ledger and transaction pool, and they talk
//! through the in-process network hub until the requested height is reached.

use anyhow::{bail, Context, Result};
use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vbft_config::{ChainConfig, NodeId, PeerConfig, VrfKey};
use vbft_consensus::{
    Block, ConsensusHandle, ConsensusResult, ConsensusRunner, Ledger, LocalNetwork, MemoryLedger,
    MemoryTxPool, Transaction,
};
use vbft_cryptography::KeyPair;

/// Options for one devnet run
struct DevnetOptions {
    validators: u32,
    heights: u32,
    config: Option<PathBuf>,
    block_msec: Option<u64>,
    state_dir: Option<PathBuf>,
    isolate: Option<u32>,
}

fn cli() -> Command {
    Command::new("vbft-node")
        .version(env!("CARGO_PKG_VERSION"))
        .about("VRF-based BFT consensus node")
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .help("Emit logs as JSON")
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("devnet")
                .about("Run an in-process committee until it reaches a height")
                .arg(
                    Arg::new("validators")
                        .long("validators")
                        .short('n')
                        .value_name("N")
                        .value_parser(clap::value_parser!(u32).range(1..=64))
                        .default_value("4"),
                )
                .arg(
                    Arg::new("heights")
                        .long("heights")
                        .value_name("H")
                        .value_parser(clap::value_parser!(u32).range(1..))
                        .default_value("10"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .short('c')
                        .value_name("FILE")
                        .help("Chain config supplying timings; the committee is generated")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("block-ms")
                        .long("block-ms")
                        .value_name("MS")
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    Arg::new("state-dir")
                        .long("state-dir")
                        .value_name("DIR")
                        .help("Persist each validator's lock and votes here")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("isolate")
                        .long("isolate")
                        .value_name("INDEX")
                        .help("Cut one validator off the network after the first block")
                        .value_parser(clap::value_parser!(u32)),
                ),
        )
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.with_target(true).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    init_logging(matches.get_flag("log-json"));

    match matches.subcommand() {
        Some(("devnet", args)) => {
            let options = DevnetOptions {
                validators: args.get_one::<u32>("validators").copied().unwrap_or(4),
                heights: args.get_one::<u32>("heights").copied().unwrap_or(10),
                config: args.get_one::<PathBuf>("config").cloned(),
                block_msec: args.get_one::<u64>("block-ms").copied(),
                state_dir: args.get_one::<PathBuf>("state-dir").cloned(),
                isolate: args.get_one::<u32>("isolate").copied(),
            };
            if let Err(e) = run_devnet(options).await {
                error!("Devnet failed: {:#}", e);
                std::process::exit(1);
            }
            Ok(())
        }
        _ => bail!("unknown command"),
    }
}

/// Deterministic devnet key for slot `index`
fn devnet_keypair(index: u32) -> KeyPair {
    let mut seed = [0u8; 32];
    seed[..4].copy_from_slice(&index.to_le_bytes());
    seed[4..].copy_from_slice(&[0x5A; 28]);
    KeyPair::from_seed(seed)
}

fn devnet_config(options: &DevnetOptions, keys: &[KeyPair]) -> Result<ChainConfig> {
    let mut config = match &options.config {
        Some(path) => ChainConfig::read(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ChainConfig::default(),
    };
    config.peers = keys
        .iter()
        .enumerate()
        .map(|(i, key)| PeerConfig {
            index: i as u32,
            id: NodeId::from_public_key(&key.public_key().to_bytes()),
            vrf_key: VrfKey::from_bytes(&key.vrf_public_key().to_bytes()),
        })
        .collect();
    if let Some(block_msec) = options.block_msec {
        config.block_msec = block_msec;
    }
    config.validate().context("Invalid devnet config")?;
    Ok(config)
}

async fn run_devnet(options: DevnetOptions) -> Result<()> {
    let keys: Vec<KeyPair> = (0..options.validators).map(devnet_keypair).collect();
    let config = devnet_config(&options, &keys)?;
    if let Some(index) = options.isolate {
        if index >= options.validators {
            bail!("cannot isolate {index}: only {} validators", options.validators);
        }
    }
    if let Some(dir) = &options.state_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    info!(
        validators = options.validators,
        quorum = config.quorum(),
        max_faulty = config.max_faulty(),
        block_msec = config.block_msec,
        target = options.heights,
        "Starting devnet"
    );

    let genesis = Block::genesis(&config);
    let network = LocalNetwork::new();
    let mut handles = Vec::new();
    let mut ledgers = Vec::new();
    let mut tasks: Vec<JoinHandle<ConsensusResult<()>>> = Vec::new();

    for (index, key) in (0u32..).zip(keys) {
        let ledger = Arc::new(MemoryLedger::new(genesis.clone()));
        let txpool = Arc::new(MemoryTxPool::new());
        txpool.add(Transaction::new(format!("devnet-tx-{index}").into_bytes()));

        let (runner, handle) = ConsensusRunner::new(
            config.clone(),
            key,
            ledger.clone(),
            txpool,
            network.endpoint(index),
        )
        .context("Failed to create consensus runner")?;
        let runner = match &options.state_dir {
            Some(dir) => runner.with_state_path(dir.join(format!("validator-{index}.state"))),
            None => runner,
        };
        network.register(handle.clone())?;

        handles.push(handle);
        ledgers.push(ledger);
        tasks.push(tokio::spawn(runner.run()));
    }
    network.connect_all()?;

    let reporter = start_reporting(handles.clone());
    let outcome = tokio::select! {
        result = wait_for_height(&network, &ledgers, options.heights, options.isolate) => result,
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal (Ctrl+C)");
            Ok(())
        }
    };
    reporter.abort();

    shutdown(&handles, tasks).await;
    outcome?;

    let tip = ledgers[0].tip();
    info!(
        height = tip.height(),
        hash = %tip.hash(),
        "Devnet finished"
    );
    Ok(())
}

async fn wait_for_height(
    network: &Arc<LocalNetwork>,
    ledgers: &[Arc<MemoryLedger>],
    target: u32,
    isolate: Option<u32>,
) -> Result<()> {
    let mut poll = tokio::time::interval(Duration::from_millis(50));
    let mut isolated = false;
    loop {
        poll.tick().await;

        if let (Some(index), false) = (isolate, isolated) {
            if ledgers.iter().any(|l| l.current_height() >= 1) {
                network.isolate(index)?;
                warn!(validator = index, "Isolated validator");
                isolated = true;
            }
        }

        let reached = ledgers
            .iter()
            .enumerate()
            .filter(|(i, _)| isolate != Some(*i as u32))
            .all(|(_, l)| l.current_height() >= target);
        if reached {
            break;
        }
    }

    // Every live member must hold the same chain
    let reference = ledgers[0].block_hashes();
    for (i, ledger) in ledgers.iter().enumerate() {
        if isolate == Some(i as u32) {
            continue;
        }
        let hashes = ledger.block_hashes();
        let common = hashes.len().min(reference.len());
        if hashes[..common] != reference[..common] {
            bail!("validator {i} diverged from validator 0");
        }
    }
    Ok(())
}

fn start_reporting(handles: Vec<ConsensusHandle>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            for handle in &handles {
                let status = handle.status();
                info!(
                    validator = ?handle.index(),
                    height = status.height,
                    round = status.round,
                    step = %status.step,
                    active_peers = status.active_peers,
                    stalled = status.stalled,
                    "Status"
                );
            }
        }
    })
}

async fn shutdown(handles: &[ConsensusHandle], tasks: Vec<JoinHandle<ConsensusResult<()>>>) {
    for handle in handles {
        if let Err(e) = handle.stop() {
            warn!(error = %e, "Failed to stop runner");
        }
    }
    for (index, task) in tasks.into_iter().enumerate() {
        match tokio::time::timeout(Duration::from_secs(5), task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(validator = index, error = %e, "Runner exited with error"),
            Ok(Err(e)) => error!(validator = index, error = %e, "Runner panicked"),
            Err(_) => warn!(validator = index, "Runner did not stop in time"),
        }
    }
}
