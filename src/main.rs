//! Process entry point: wires the collaborators built in `ald_control` into
//! a running control runtime for one machine.
//!
//! Composition only — no control logic lives here. Mirrors the source
//! project's `main.py`/`async_config_loader` shape: load config, bring up
//! logging, construct collaborators, reconcile machine state left over from
//! a previous process, then run the Command Intake loop and the Continuous
//! Parameter Logger side by side until the process is asked to stop.

use ald_control::audit;
use ald_control::cache::ParameterCache;
use ald_control::cancellation::CancellationRegistry;
use ald_control::command_intake::{AllowAllAuthenticator, CommandIntake};
use ald_control::config::{PlcMode, Settings};
use ald_control::datastore::postgres::PostgresDatastore;
use ald_control::datastore::Datastore;
use ald_control::executor::RecordOnce;
use ald_control::logger::ContinuousParameterLogger;
use ald_control::logging::{self, OutputFormat};
use ald_control::machine_state::MachineStateAuthority;
use ald_control::plc::modbus::ModbusPlc;
use ald_control::plc::simulated::SimulatedPlc;
use ald_control::plc::Plc;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const AUDIT_QUEUE_CAPACITY: usize = 1_000;
const PARAMETER_CACHE_TTL: Duration = Duration::from_secs(300);
const PARAMETER_CACHE_BULK_REFRESH: Duration = Duration::from_secs(60);
const COMMAND_POLL_INTERVAL_MS: u64 = 500;

#[derive(Parser, Debug)]
#[command(name = "ald-control-runtime", about = "On-machine ALD control runtime")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config/ald_control.toml")]
    config: String,

    /// Emit single-line JSON logs instead of pretty-printed ones.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match Settings::load_from(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("failed to load configuration from {}: {e}", cli.config);
            return ExitCode::FAILURE;
        }
    };

    let format = if cli.json_logs { OutputFormat::Json } else { OutputFormat::Pretty };
    if let Err(e) = logging::init(&settings, format) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "control runtime exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let machine_id = settings.machine_id;
    info!(%machine_id, "starting ALD control runtime");

    let datastore: Arc<dyn Datastore> = Arc::new(
        PostgresDatastore::connect(&settings.datastore.url, settings.datastore.max_connections)
            .await?,
    );

    let plc: Arc<dyn Plc> = match settings.plc.mode {
        PlcMode::Real => Arc::new(ModbusPlc::new(settings.plc.clone())),
        PlcMode::Simulation => Arc::new(SimulatedPlc::new()),
    };
    plc.initialize().await?;

    let cancellation = Arc::new(CancellationRegistry::new());
    let cache = Arc::new(ParameterCache::new(PARAMETER_CACHE_TTL, PARAMETER_CACHE_BULK_REFRESH));
    let (audit, _audit_task) = audit::spawn(datastore.clone(), AUDIT_QUEUE_CAPACITY);

    MachineStateAuthority::new(datastore.as_ref())
        .reconcile_at_startup(machine_id)
        .await?;

    let logger = Arc::new(ContinuousParameterLogger::new(
        datastore.clone(),
        plc.clone(),
        cache.clone(),
        machine_id,
        settings.logger.clone(),
        settings.plc.byte_order,
    ));
    let recorder: Option<Arc<dyn RecordOnce>> = Some(logger.clone());

    let intake = CommandIntake::new(
        datastore.clone(),
        plc.clone(),
        cancellation.clone(),
        cache.clone(),
        audit,
        Arc::new(AllowAllAuthenticator),
        recorder,
        machine_id,
    );

    let cache_refresh_task = {
        let cache = cache.clone();
        let datastore = datastore.clone();
        tokio::spawn(async move { cache.run_background_refresh(datastore.as_ref()).await })
    };
    let logger_task = {
        let logger = logger.clone();
        tokio::spawn(async move { logger.run_forever().await })
    };
    let intake_task = tokio::spawn(async move { intake.run_forever(COMMAND_POLL_INTERVAL_MS).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, stopping");
        }
        result = intake_task => {
            if let Err(e) = result {
                error!(error = %e, "command intake task panicked");
            }
        }
        result = logger_task => {
            if let Err(e) = result {
                error!(error = %e, "continuous parameter logger task panicked");
            }
        }
        result = cache_refresh_task => {
            if let Err(e) = result {
                error!(error = %e, "parameter cache refresh task panicked");
            }
        }
    }

    plc.disconnect().await?;
    Ok(())
}
