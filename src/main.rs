mod cli;

use clap::Parser;
use cli::{Cli, Command};
use spiral_orchestrator::{
    api::ApiServer,
    config::Config,
    human_requests::HumanRequestStore,
    logging,
    models::HumanRequest,
    orchestrator::Orchestrator,
    queue::TaskQueue,
    slave::{executor::SlaveExecutorState, manager::SlaveManager, InstallReport, SlaveInstaller},
    supervisor::Supervisor,
    transport::{CircuitBreakerConfig, RobustTransport, TransportConfig},
    version::VersionProbe,
    worker_registry::WorkerRegistry,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

fn main() {
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        if let Err(e) = dotenvy::from_path(path) {
            eprintln!("warning: could not load config file {path:?}: {e}");
        }
    }

    let runtime = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    let exit_code = runtime.block_on(run(cli.command));
    std::process::exit(exit_code);
}

/// Dispatches the requested subcommand and maps its outcome to the exit
/// codes in spec §6.6: `0` success, `1` operational failure. Clap itself
/// exits `2` on misuse before we ever get here.
async fn run(command: Command) -> i32 {
    let result = match command {
        Command::Orchestrator => run_orchestrator().await,
        Command::Slave => run_slave().await,
        Command::Supervisor => run_supervisor().await,
        Command::AddSlave { host_port, token, master_url, capabilities } => {
            add_slave(host_port, token, master_url, capabilities).await
        }
        Command::InstallSlave { host_port, token, source } => install_slave(host_port, token, source).await,
        Command::Status { master_url } => print_status(master_url).await,
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    }
}

async fn run_orchestrator() -> anyhow::Result<()> {
    let config = Config::load()?;
    let _log_guard = logging::init(&config.data_dir, "orchestrator");
    info!("starting master: task queue, worker registry, slave manager, assignment loop");

    let version_probe = Arc::new(VersionProbe::probe_at_boot());
    if !version_probe.checks_enabled() {
        warn!("master version could not be determined; slave version checks are disabled");
    }

    let transport_config = TransportConfig::default();
    let circuit_config = CircuitBreakerConfig {
        failure_threshold: config.circuit.threshold,
        cooldown: config.circuit.cooldown,
    };
    let transport = Arc::new(RobustTransport::new(transport_config, circuit_config)?);

    let human_requests = Arc::new(HumanRequestStore::new(&config.data_dir, Some(log_notifier())).await?);
    let slaves = Arc::new(
        SlaveManager::new(&config.data_dir, transport, version_probe, human_requests.clone()).await?,
    );
    let queue = TaskQueue::new(config.timing.max_queue_size);
    let workers = WorkerRegistry::new(config.timing.heartbeat_ttl);

    let orchestrator = Arc::new(Orchestrator::new(
        queue,
        workers,
        slaves.clone(),
        human_requests.clone(),
        config.timing.task_timeout,
    ));

    let assignment = tokio::spawn(orchestrator.clone().run_assignment_loop());
    let timeout_sweep = tokio::spawn(orchestrator.clone().run_timeout_sweep_loop());
    let liveness = tokio::spawn(orchestrator.clone().run_worker_liveness_loop());
    let health = {
        let slaves = slaves.clone();
        let interval = config.timing.health_interval;
        tokio::spawn(async move { slaves.run_health_loop(interval).await })
    };

    let api = ApiServer::new(&config, orchestrator.clone(), human_requests);

    tokio::select! {
        result = api.run() => {
            if let Err(e) = result {
                error!(error = %e, "master HTTP server exited");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let in_flight = orchestrator.queue().assigned_tasks().await.len();
            warn!(in_flight, "received shutdown signal, stopping master; in-flight tasks are not drained");
        }
    }

    assignment.abort();
    timeout_sweep.abort();
    liveness.abort();
    health.abort();
    Ok(())
}

fn log_notifier() -> Arc<dyn Fn(&HumanRequest) + Send + Sync> {
    Arc::new(|request: &HumanRequest| {
        warn!(
            id = %request.id,
            kind = %request.kind,
            state = ?request.state,
            "human request notification"
        );
    })
}

async fn run_slave() -> anyhow::Result<()> {
    let config = Config::load()?;
    let _log_guard = logging::init(&config.data_dir, "slave_executor");
    let token = config.require_slave_token()?.to_string();

    let state = SlaveExecutorState::new(&config.slave, token)?;
    let router = spiral_orchestrator::slave::executor::router(state);

    let addr = format!("{}:{}", config.slave.host, config.slave.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr, "slave executor listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn run_supervisor() -> anyhow::Result<()> {
    let config = Config::load()?;
    let _log_guard = logging::init(&config.data_dir, "supervisor");

    let current_exe = std::env::current_exe()?;
    let components = vec![spiral_orchestrator::models::SupervisedProcessSpec {
        name: "orchestrator".to_string(),
        command: current_exe.to_string_lossy().to_string(),
        args: vec!["orchestrator".to_string()],
        enabled: true,
        restart_budget: config.supervisor.restart_budget,
    }];

    let supervisor = Arc::new(Supervisor::new(
        &config.data_dir,
        components,
        config.supervisor.restart_budget,
        config.supervisor.check_interval,
    ));

    supervisor.acquire_lockfile()?;
    supervisor.start_all().await;

    let scan = tokio::spawn(supervisor.clone().run_health_scan_loop());
    supervisor.wait_for_shutdown_signal().await;
    scan.abort();
    Ok(())
}

async fn add_slave(host_port: String, token: String, master_url: String, capabilities: Vec<String>) -> anyhow::Result<()> {
    let (host, port) = split_host_port(&host_port)?;
    let id = format!("{host}-{port}");
    let client = reqwest::Client::new();

    let body = serde_json::json!({
        "id": id,
        "host": host,
        "port": port,
        "token": token,
        "capabilities": capabilities.into_iter().collect::<HashSet<_>>(),
    });

    let response = client
        .post(format!("{master_url}/slaves"))
        .json(&body)
        .send()
        .await?;

    if response.status().is_success() {
        println!("slave {id} registered");
        Ok(())
    } else {
        anyhow::bail!("master rejected slave registration: {}", response.status())
    }
}

async fn install_slave(host_port: String, token: String, source: String) -> anyhow::Result<()> {
    let (host, port) = split_host_port(&host_port)?;
    let base_url = format!("http://{host}:{port}");

    let transport = Arc::new(RobustTransport::new(TransportConfig::default(), CircuitBreakerConfig::default())?);
    let installer = SlaveInstaller::new(transport);
    let report: InstallReport = installer.install(&base_url, &token, &source).await?;

    for stage in &report.stages {
        println!("{:<16} {:?}", stage.name, stage.status);
    }

    if report.succeeded {
        println!("install succeeded");
        Ok(())
    } else {
        anyhow::bail!("install failed, see stage report above")
    }
}

async fn print_status(master_url: String) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let response = client.get(format!("{master_url}/stats")).send().await?;
    let body: serde_json::Value = response.json().await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn split_host_port(host_port: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = host_port
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected host:port, got {host_port}"))?;
    let port: u16 = port.parse()?;
    Ok((host.to_string(), port))
}
