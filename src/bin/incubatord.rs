use clap::{App, Arg};
use incubator::config::{DaemonConfig, DEFAULT_CONFIG_PATH};
use incubator::hal::{RelayDriver, SensorDriver};
use incubator::linux::{HwmonSensorDriver, SysfsRelayDriver};
use incubator::server;
use incubator::sim::{SimConfig, SimulatedIncubator};
use incubator::{ControlLoop, SettingsStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("incubatord")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Incubator control daemon")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Configuration file")
                .takes_value(true)
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::with_name("bind")
                .long("bind")
                .value_name("ADDR")
                .help("Listen address, overrides [server] bind")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("settings")
                .long("settings")
                .value_name("FILE")
                .help("Settings file, overrides [storage] settings_path")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("tick-ms")
                .long("tick-ms")
                .value_name("MS")
                .help("Tick interval in milliseconds")
                .takes_value(true)
                .validator(|v| v.parse::<u64>().map(|_| ()).map_err(|_| "must be a number".to_string())),
        )
        .arg(
            Arg::with_name("simulate")
                .long("simulate")
                .help("Run against the simulated incubator")
                .conflicts_with("hardware"),
        )
        .arg(
            Arg::with_name("hardware")
                .long("hardware")
                .help("Drive the sysfs relays and hwmon sensor"),
        )
        .arg(
            Arg::with_name("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log filter when RUST_LOG is unset")
                .takes_value(true),
        )
        .get_matches();

    let config_path = matches.value_of("config").unwrap_or(DEFAULT_CONFIG_PATH);
    let mut config = DaemonConfig::load_or_default(config_path)?;
    if let Some(bind) = matches.value_of("bind") {
        config.server.bind = bind.to_string();
    }
    if let Some(path) = matches.value_of("settings") {
        config.storage.settings_path = path.into();
    }
    if let Some(ms) = matches.value_of("tick-ms") {
        config.control.tick_interval_ms = ms.parse()?;
    }
    if matches.is_present("simulate") {
        config.simulator.enabled = true;
    }
    if matches.is_present("hardware") {
        config.simulator.enabled = false;
    }
    if let Some(level) = matches.value_of("log-level") {
        config.logging.level = level.to_string();
    }
    config.validate()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let sensor: Arc<dyn SensorDriver>;
    let relays: Arc<dyn RelayDriver>;
    let mut simulator = None;
    if config.simulator.enabled {
        let chamber = Arc::new(SimulatedIncubator::new(SimConfig {
            ambient_f: config.simulator.ambient_f,
            ambient_humidity_pct: config.simulator.ambient_humidity_pct,
            initial_f: config.simulator.ambient_f,
            initial_humidity_pct: config.simulator.ambient_humidity_pct,
            ..SimConfig::default()
        }));
        sensor = chamber.clone();
        relays = chamber.clone();
        simulator = Some(chamber);
    } else {
        sensor = Arc::new(HwmonSensorDriver::open(&config.sensor)?);
        relays = Arc::new(SysfsRelayDriver::open(&config.relays)?);
    }

    let settings = Arc::new(SettingsStore::open(&config.storage.settings_path));
    let mut control = ControlLoop::new(sensor, relays, settings, config.control.io_timeout());
    if let Some(chamber) = simulator {
        control = control.with_simulator(chamber);
    }
    let control = Arc::new(control);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = TcpListener::bind(&config.server.bind).await?;
    let server_task = tokio::spawn(server::serve(
        listener,
        Arc::clone(&control),
        wait_for(shutdown_rx.clone()),
    ));

    let loop_task = tokio::spawn(
        Arc::clone(&control).run(config.control.tick_interval(), wait_for(shutdown_rx)),
    );

    info!(
        "incubatord running ({}), tick {} ms, API on {}",
        if config.simulator.enabled { "simulator" } else { "hardware" },
        config.control.tick_interval_ms,
        config.server.bind
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    if let Err(e) = loop_task.await {
        error!("Control loop task failed: {}", e);
        control.shutdown().await;
    }
    match server_task.await {
        Ok(Err(e)) => error!("Server error: {}", e),
        Err(e) => error!("Server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    info!("incubatord stopped, relays off");
    Ok(())
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}
