//! probe-gdb-server - Main Entry Point

use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use probe_gdb_server::{
    config::{Args, LoggingConfig},
    controller::{TargetController, TargetControllerHandle, TargetControllerState},
    events::{Event, EventBus, EventListener},
    gdb::GdbRspServer,
    probe::{discovery::ProbeDiscovery, DebugProbe, ProbeBackend, ProbeRsProbe, SimulatedProbe},
    Config, DebugError,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Handle special flags first
    if args.generate_config {
        let config = Config::default();
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    let mut config = Config::load(args.config.as_ref()).context("Failed to load configuration")?;
    config.merge_args(&args);

    init_logging(&config.logging)?;
    info!("Starting probe-gdb-server v{}", env!("CARGO_PKG_VERSION"));
    debug!("Command line args: {:?}", args);

    if args.validate_config {
        config.validate()?;
        println!("Configuration is valid");
        return Ok(());
    }

    if args.show_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    if args.list_probes {
        let probes = ProbeDiscovery::list_probes();
        if probes.is_empty() {
            println!("No debug probes found");
        }
        for probe in probes {
            println!("{}", probe);
        }
        return Ok(());
    }

    config.validate().inspect_err(|e| {
        error!("Configuration validation failed: {}", e);
    })?;
    info!("Configuration loaded and validated successfully");

    run(config).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    let events = EventBus::new();
    let mut lifecycle = events.subscribe("application");

    info!("Using {} backend", config.debugger.backend);
    let handle = spawn_controller(&config, &events)?;

    if let Err(e) = wait_until_active(&mut lifecycle, config.startup_timeout()).await {
        handle.shutdown(config.shutdown_timeout()).await;
        return Err(e);
    }

    let server = GdbRspServer::new(config.gdb_server_config(), handle.service(), events.clone());
    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            handle.shutdown(config.shutdown_timeout()).await;
            return Err(e.into());
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server_task = tokio::spawn(async move { server.serve(listener, shutdown_rx).await });
    info!("probe-gdb-server started successfully");

    let mut server_finished = false;
    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Received Ctrl-C, shutting down"),
                Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
            }
            Ok(())
        }
        reason = wait_for_controller_stop(&mut lifecycle) => {
            error!("Target controller stopped: {}", reason);
            Err(anyhow::anyhow!("Target controller stopped: {}", reason))
        }
        joined = &mut server_task => {
            server_finished = true;
            match joined {
                Ok(Ok(())) => {
                    info!("GDB server exited");
                    Ok(())
                }
                Ok(Err(e)) => Err(anyhow::Error::from(e).context("GDB server failed")),
                Err(e) => Err(anyhow::Error::from(e).context("GDB server task failed")),
            }
        }
    };

    info!("Cleaning up resources...");
    let _ = shutdown_tx.send(true);
    if !server_finished {
        match tokio::time::timeout(config.shutdown_timeout(), server_task).await {
            Ok(Ok(Err(e))) => debug!("GDB server ended with: {}", e),
            Ok(Err(e)) => warn!("GDB server task failed: {}", e),
            Err(_) => warn!("GDB server did not stop within {:?}", config.shutdown_timeout()),
            Ok(Ok(Ok(()))) => {}
        }
    }
    handle.shutdown(config.shutdown_timeout()).await;

    info!("probe-gdb-server stopped");
    outcome
}

fn spawn_controller(config: &Config, events: &EventBus) -> anyhow::Result<TargetControllerHandle> {
    let backend = config.debugger.backend;
    let probe_rs = config.probe_rs_config();
    let simulator = config.simulator_config();

    // The factory runs on the controller thread, the probe session never leaves it
    let factory = move || -> probe_gdb_server::probe::ProbeResult<Box<dyn DebugProbe>> {
        let probe: Box<dyn DebugProbe> = match backend {
            ProbeBackend::ProbeRs => Box::new(ProbeRsProbe::new(probe_rs)),
            ProbeBackend::Simulator => Box::new(SimulatedProbe::new(simulator)),
        };
        Ok(probe)
    };

    TargetController::spawn(config.controller_config(), events.clone(), factory)
        .context("Failed to start target controller thread")
}

async fn wait_until_active(listener: &mut EventListener, timeout: Duration) -> anyhow::Result<()> {
    let event = listener
        .wait_for(
            |event| {
                matches!(
                    event,
                    Event::ControllerStateChanged {
                        state: TargetControllerState::Active | TargetControllerState::Stopped,
                        ..
                    }
                )
            },
            timeout,
        )
        .await;

    match event.as_deref() {
        Some(Event::ControllerStateChanged {
            state: TargetControllerState::Active,
            ..
        }) => {
            info!("Target controller active");
            Ok(())
        }
        Some(Event::ControllerStateChanged { reason, .. }) => {
            let reason = reason.clone().unwrap_or_else(|| "unknown reason".to_string());
            Err(DebugError::DeviceInitializationFailure(reason).into())
        }
        _ => bail!("Target controller did not become active within {:?}", timeout),
    }
}

/// Resolves with the failure reason once the controller reaches its terminal state
async fn wait_for_controller_stop(listener: &mut EventListener) -> String {
    while let Some(event) = listener.recv().await {
        if let Event::ControllerStateChanged {
            state: TargetControllerState::Stopped,
            reason,
        } = event.as_ref()
        {
            return reason.clone().unwrap_or_else(|| "no reason given".to_string());
        }
    }
    "event bus closed".to_string()
}

/// Initialize logging system
fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(false)
        .with_line_number(false);

    // Configure output destination
    if let Some(log_file) = &logging.file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .with_context(|| format!("Failed to open log file {}", log_file.display()))?;

        subscriber.with_writer(file).init();

        println!("Logging to file: {}", log_file.display());
    } else {
        subscriber.with_writer(std::io::stderr).init();
    }

    debug!("Logging initialized with level: {}", logging.level);
    Ok(())
}
