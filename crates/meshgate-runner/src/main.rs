use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use meshgate_classes::ClassRegistry;
use meshgate_engine::{Engine, EngineConfig, FileStore};
use meshgate_runner::{field_dump, spawn_host_thread, Args, HostRequest, RunnerError, TcpTransport};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), RunnerError> {
    meshgate_metrics::describe_metrics();

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    info!("coordinator bridge {}, snapshot {}", args.connect, args.state.display());

    let engine = Arc::new(Engine::new(
        TcpTransport::new(args.connect.clone()),
        ClassRegistry::with_builtin(),
        FileStore::new(&args.state),
        config,
    ));
    engine.context().link().set_trace(args.trace_frames);

    // A failed first attempt is retried by the poll cycle.
    if let Err(err) = engine.connect() {
        warn!("initial connect failed: {}", err);
    }

    let host = spawn_host_thread(engine.clone(), Duration::from_millis(args.period_ms), args.cycles)?;
    for line in &args.commands {
        host.send(HostRequest::Command(line.clone()))
            .map_err(|_| RunnerError::Stopped)?;
    }

    let shutdown = host.sender();
    ctrlc::set_handler(move || {
        let _ = shutdown.send(HostRequest::Shutdown);
    })?;

    let summary = host.join().map_err(|_| RunnerError::Stopped)?;
    info!(
        "stopped: {} cycles ({} failed), {} requests ({} failed)",
        summary.cycles, summary.cycle_errors, summary.requests, summary.request_errors
    );
    engine.disconnect();

    if args.dump_fields {
        println!("{}", field_dump(&engine.fields())?);
    }
    Ok(())
}
