use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fins_gateway::config::GatewayConfig;
use fins_gateway::erp::{ErpClient, HttpErpClient};
use fins_gateway::handshake::Handshake;
use fins_gateway::memory_map::{MemoryMap, SlotId};
use fins_gateway::ops::{self, OpResponse, Operation};
use fins_gateway::orchestrator::{Orchestrator, TaskKind};
use fins_gateway::registers::EquipmentRegisters;
use fins_gateway::scheduler::Scheduler;
use fins_gateway::store::BatchStore;
use fins_gateway::{logging, FinsClient, SimulatedPlc, UdpTransport};

#[derive(Debug, Parser)]
#[command(name = "fins-gateway", version, about = "PLC to ERP batch gateway")]
struct Cli {
    /// Configuration file.
    #[arg(short, long, env = "FINS_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run every task on its schedule until interrupted.
    Run,
    /// Run one task now (intake, telemetry, settlement, health, retention, fault-scan).
    Trigger { task: String },
    /// List active batches.
    Status,
    /// List batches the PLC reported as failed.
    Failed,
    /// List archived batches.
    History {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Retry settlement or cancellation of one batch.
    Retry { work_order: String },
    /// Cancel one unfinished batch.
    Cancel { work_order: String },
    /// Archive every active batch as failed.
    ClearActive,
    /// Print the PLC memory map.
    ShowMap,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = GatewayConfig::load(cli.config.as_deref())?;
    let _log_guard = logging::init(&config.logging)?;

    let orchestrator = Arc::new(bootstrap(&config).await?);

    let op = match cli.command {
        Command::Run => {
            run(orchestrator, &config).await;
            return Ok(ExitCode::SUCCESS);
        }
        Command::Trigger { task } => match task.parse::<TaskKind>() {
            Ok(kind) => Operation::Trigger(kind),
            Err(e) => return print(OpResponse::failed(e.to_string())),
        },
        Command::Status => Operation::Status,
        Command::Failed => Operation::Failed,
        Command::History { limit } => Operation::History { limit },
        Command::Retry { work_order } => Operation::Retry(work_order),
        Command::Cancel { work_order } => Operation::Cancel(work_order),
        Command::ClearActive => Operation::ClearActive,
        Command::ShowMap => Operation::ShowMap,
    };

    print(ops::execute(&orchestrator, op).await)
}

fn print(response: OpResponse) -> anyhow::Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(if response.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn bootstrap(config: &GatewayConfig) -> anyhow::Result<Orchestrator> {
    let map = MemoryMap::standard();
    map.validate().context("memory map is inconsistent")?;
    info!(layout = map.version, "memory map validated");

    let (source, destination) = (config.plc.source(), config.plc.destination());
    let client = if config.plc.simulate {
        warn!("plc.simulate is set; using the in-process PLC simulator");
        FinsClient::new(simulated_plc(&map)?, source, destination)
    } else {
        let addr = config.plc.socket_addr();
        let transport = UdpTransport::connect(addr, config.plc.timeout())
            .await
            .with_context(|| format!("failed to open FINS socket to {addr}"))?;
        FinsClient::new(transport, source, destination)
    };
    info!(plc = ?client, "FINS client ready");

    let registers = EquipmentRegisters::new(Arc::new(client), Arc::new(map));
    let handshake = Handshake::new(registers, config.retry_policy());

    let store = BatchStore::open(&config.database.path)
        .await
        .with_context(|| format!("failed to open {}", config.database.path.display()))?;

    let erp: Arc<dyn ErpClient> = Arc::new(HttpErpClient::new(config.erp_settings())?);

    Ok(Orchestrator::new(
        store,
        handshake,
        erp,
        config.orchestrator_settings(),
    ))
}

/// A simulator whose channels start in the idle state: write slots
/// released, nothing waiting to be read.
fn simulated_plc(map: &MemoryMap) -> anyhow::Result<SimulatedPlc> {
    let plc = SimulatedPlc::new();
    plc.set_word(map.write_flag, 1);
    plc.set_word(map.failure_flag, 1);
    for slot in 0..map.read_slots {
        plc.set_word(map.flag_address(SlotId::Read(slot))?, 1);
    }
    Ok(plc)
}

async fn run(orchestrator: Arc<Orchestrator>, config: &GatewayConfig) {
    let shutdown = CancellationToken::new();
    let schedule = config.schedule.clone();
    let scheduler = Scheduler::new(orchestrator, move |kind| schedule.interval(kind));
    let loops = tokio::spawn(scheduler.run(shutdown.clone()));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(e) => warn!(error = %e, "cannot listen for ctrl-c; shutting down"),
    }
    shutdown.cancel();
    if let Err(e) = loops.await {
        warn!(error = %e, "scheduler did not stop cleanly");
    }
}
