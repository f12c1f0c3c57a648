use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use incubator::protocol::{Command, Request, Response, ResponseStatus};
use incubator::relay::{RelayCheck, RelayId};
use incubator::safety::SafetyEventRecord;
use incubator::sensor::Reading;
use incubator::settings::{HumidityPatch, Settings, SettingsUpdate, TemperaturePatch};
use incubator::sim::SimFault;
use incubator::status::Status;
use incubator::subsystems::{Action, Target};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

struct Client {
    host: String,
    port: u16,
}

#[tokio::main]
async fn main() -> CliResult {
    let matches = App::new("incubator")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Incubator controller client")
        .setting(AppSettings::VersionlessSubcommands)
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Daemon host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Daemon port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .subcommand(SubCommand::with_name("status").about("Show the latest controller status"))
        .subcommand(
            SubCommand::with_name("settings")
                .about("Show or change thresholds")
                .subcommand(SubCommand::with_name("get").about("Show current settings"))
                .subcommand(
                    SubCommand::with_name("set")
                        .about("Apply a partial settings update")
                        .arg(float_arg("temp-target", "Temperature target (F)"))
                        .arg(float_arg("temp-min", "Heat below this temperature (F)"))
                        .arg(float_arg("temp-max", "Stop heating at this temperature (F)"))
                        .arg(float_arg("cutoff", "Safety cutoff temperature (F)"))
                        .arg(
                            Arg::with_name("sensor-timeout")
                                .long("sensor-timeout")
                                .value_name("SECONDS")
                                .help("Sensor staleness timeout")
                                .takes_value(true),
                        )
                        .arg(float_arg("hum-target", "Humidity target (%)"))
                        .arg(float_arg("hum-min", "Humidify below this level (%)"))
                        .arg(float_arg("hum-max", "Stop humidifying at this level (%)")),
                ),
        )
        .subcommand(
            SubCommand::with_name("control")
                .about("Start or stop a subsystem")
                .arg(
                    Arg::with_name("target")
                        .help("Subsystem")
                        .required(true)
                        .possible_values(&["temperature", "humidity", "all"]),
                )
                .arg(
                    Arg::with_name("action")
                        .help("Action")
                        .required(true)
                        .possible_values(&["start", "stop"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("reset")
                .about("Restore default settings and switch every relay off")
                .arg(
                    Arg::with_name("confirm")
                        .long("confirm")
                        .help("Required to perform the reset"),
                ),
        )
        .subcommand(SubCommand::with_name("events").about("Show recent safety trips"))
        .subcommand(
            SubCommand::with_name("test")
                .about("Run a hardware self-test (both subsystems must be stopped)")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(
                    SubCommand::with_name("relays")
                        .about("Cycle each relay on and off")
                        .arg(
                            Arg::with_name("on-ms")
                                .long("on-ms")
                                .value_name("MILLIS")
                                .help("Time each relay stays on")
                                .takes_value(true)
                                .default_value("1000"),
                        )
                        .arg(
                            Arg::with_name("off-ms")
                                .long("off-ms")
                                .value_name("MILLIS")
                                .help("Pause after switching each relay off")
                                .takes_value(true)
                                .default_value("500"),
                        ),
                )
                .subcommand(
                    SubCommand::with_name("sensor")
                        .about("Take a series of sensor readings")
                        .arg(
                            Arg::with_name("samples")
                                .short("n")
                                .long("samples")
                                .value_name("COUNT")
                                .help("Number of readings")
                                .takes_value(true)
                                .default_value("5"),
                        )
                        .arg(
                            Arg::with_name("interval")
                                .short("i")
                                .long("interval")
                                .value_name("MILLIS")
                                .help("Time between readings")
                                .takes_value(true)
                                .default_value("2000"),
                        ),
                ),
        )
        .subcommand(
            SubCommand::with_name("fault")
                .about("Inject a fault into the simulated incubator")
                .arg(
                    Arg::with_name("kind")
                        .help("Fault to inject")
                        .required(true)
                        .possible_values(&[
                            "temperature-dropout",
                            "humidity-dropout",
                            "sensor-hang",
                            "stuck-relay",
                            "secondary-offset",
                        ]),
                )
                .arg(
                    Arg::with_name("relay")
                        .long("relay")
                        .value_name("RELAY")
                        .help("Relay for stuck-relay")
                        .takes_value(true)
                        .possible_values(&["heater1", "heater2", "humidifier"])
                        .default_value("heater1"),
                )
                .arg(
                    Arg::with_name("millis")
                        .long("millis")
                        .value_name("MILLIS")
                        .help("Hang time for sensor-hang")
                        .takes_value(true)
                        .default_value("5000"),
                )
                .arg(float_arg("offset", "Secondary line offset for secondary-offset (F)").default_value("5.0")),
        )
        .subcommand(SubCommand::with_name("clear-faults").about("Remove every injected simulator fault"))
        .subcommand(
            SubCommand::with_name("monitor")
                .about("Stream live status")
                .arg(
                    Arg::with_name("duration")
                        .short("d")
                        .long("duration")
                        .value_name("SECONDS")
                        .help("Stop after this many seconds")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("server")
                .about("Start the control daemon")
                .arg(
                    Arg::with_name("background")
                        .short("b")
                        .long("background")
                        .help("Run the daemon in the background"),
                )
                .arg(
                    Arg::with_name("simulate")
                        .long("simulate")
                        .help("Use the simulated incubator"),
                ),
        )
        .get_matches();

    let client = Client {
        host: matches.value_of("host").unwrap_or(DEFAULT_HOST).to_string(),
        port: matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?,
    };
    let format = matches.value_of("format").unwrap_or("table");

    match matches.subcommand() {
        ("status", _) => handle_status(&client, format).await?,
        ("settings", Some(sub)) => handle_settings(&client, sub, format).await?,
        ("control", Some(sub)) => handle_control(&client, sub, format).await?,
        ("reset", Some(sub)) => {
            if sub.is_present("confirm") {
                let response = client.send(Command::Reset).await?;
                print_result("Reset", "defaults restored, relays off", &response, format);
            } else {
                println!("{}", "Reset requires --confirm".yellow());
            }
        }
        ("events", _) => handle_events(&client, format).await?,
        ("test", Some(sub)) => handle_test(&client, sub, format).await?,
        ("fault", Some(sub)) => {
            let fault = parse_fault(sub)?;
            let response = client.send(Command::SimulateFault { fault }).await?;
            print_result("Fault", &format!("{:?} injected", fault), &response, format);
        }
        ("clear-faults", _) => {
            let response = client.send(Command::ClearFaults).await?;
            print_result("Faults", "cleared", &response, format);
        }
        ("monitor", Some(sub)) => handle_monitor(&client, sub, format).await?,
        ("server", Some(sub)) => handle_server(sub, client.port)?,
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Start the daemon with the simulator", "incubator server --simulate".bright_cyan());
            println!("  {} Show live readings", "incubator status".bright_cyan());
            println!("  {} Start both controllers", "incubator control all start".bright_cyan());
        }
    }

    Ok(())
}

fn float_arg<'a>(name: &'a str, help: &'a str) -> Arg<'a, 'a> {
    Arg::with_name(name)
        .long(name)
        .value_name("VALUE")
        .help(help)
        .takes_value(true)
        .validator(|v| v.parse::<f32>().map(|_| ()).map_err(|_| "must be a number".to_string()))
}

impl Client {
    async fn connect(&self) -> CliResult<TcpStream> {
        let addr = format!("{}:{}", self.host, self.port);
        match TcpStream::connect(&addr).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                eprintln!("{} Failed to connect to incubatord at {}", "x".red(), addr.bright_white());
                if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    eprintln!("  Daemon is not running. Start it with: {}", "incubator server".bright_cyan());
                }
                Err(e.into())
            }
        }
    }

    async fn send(&self, command: Command) -> CliResult<Response> {
        self.send_within(command, REQUEST_TIMEOUT).await
    }

    async fn send_within(&self, command: Command, limit: Duration) -> CliResult<Response> {
        let stream = self.connect().await?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let request = Request::new(request_id(), command);
        let line = serde_json::to_string(&request)?;

        let exchange = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            read_response(&mut reader).await
        };
        match tokio::time::timeout(limit, exchange).await {
            Ok(result) => result,
            Err(_) => Err(format!("no response within {} s", limit.as_secs()).into()),
        }
    }
}

async fn read_response(reader: &mut BufReader<OwnedReadHalf>) -> CliResult<Response> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err("daemon closed the connection".into());
    }
    Ok(serde_json::from_str(line.trim())?)
}

fn request_id() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(1)
}

async fn handle_status(client: &Client, format: &str) -> CliResult {
    let response = client.send(Command::GetStatus).await?;
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }
    let status: Status = decode(&response)?;
    match format {
        "compact" => println!("{}", status.summary()),
        _ => print_status_table(&status),
    }
    Ok(())
}

async fn handle_settings(client: &Client, matches: &ArgMatches<'_>, format: &str) -> CliResult {
    match matches.subcommand() {
        ("set", Some(sub)) => {
            let update = SettingsUpdate {
                temperature: Some(TemperaturePatch {
                    target: parse_opt(sub, "temp-target")?,
                    min: parse_opt(sub, "temp-min")?,
                    max: parse_opt(sub, "temp-max")?,
                    safety_cutoff: parse_opt(sub, "cutoff")?,
                    sensor_timeout_s: parse_opt(sub, "sensor-timeout")?,
                    enabled: None,
                }),
                humidity: Some(HumidityPatch {
                    target: parse_opt(sub, "hum-target")?,
                    min: parse_opt(sub, "hum-min")?,
                    max: parse_opt(sub, "hum-max")?,
                    enabled: None,
                }),
            };
            let response = client.send(Command::ApplySettings { update }).await?;
            if response.is_ok() && format == "table" {
                print_settings_table(&decode(&response)?);
            } else {
                print_result("Settings", "updated", &response, format);
            }
        }
        _ => {
            let response = client.send(Command::GetSettings).await?;
            match format {
                "json" => println!("{}", serde_json::to_string_pretty(&response)?),
                _ => print_settings_table(&decode(&response)?),
            }
        }
    }
    Ok(())
}

async fn handle_control(client: &Client, matches: &ArgMatches<'_>, format: &str) -> CliResult {
    let target: Target = matches.value_of("target").unwrap_or("all").parse()?;
    let action: Action = matches.value_of("action").unwrap_or("stop").parse()?;
    let response = client.send(Command::Control { target, action }).await?;
    let what = format!("{} {}", target, if action == Action::Start { "started" } else { "stopped" });
    print_result("Control", &what, &response, format);
    Ok(())
}

async fn handle_events(client: &Client, format: &str) -> CliResult {
    let response = client.send(Command::GetSafetyEvents).await?;
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }
    let events: Vec<SafetyEventRecord> = decode(&response)?;
    if events.is_empty() {
        println!("{}", "No safety trips recorded".bright_green());
    }
    for event in events {
        let edge = if event.tripped { "TRIP ".bright_red() } else { "CLEAR".bright_green() };
        println!(
            "[{:>8}s] {} {:?} at {}",
            event.timestamp_ms / 1000,
            edge,
            event.event,
            fmt_value(event.temperature_f, "F")
        );
    }
    Ok(())
}

async fn handle_test(client: &Client, matches: &ArgMatches<'_>, format: &str) -> CliResult {
    match matches.subcommand() {
        ("relays", Some(sub)) => {
            let on_ms: u64 = parse_opt(sub, "on-ms")?.unwrap_or(1_000);
            let off_ms: u64 = parse_opt(sub, "off-ms")?.unwrap_or(500);
            let limit = REQUEST_TIMEOUT + Duration::from_millis(on_ms.saturating_add(off_ms).saturating_mul(RelayId::ALL.len() as u64));

            println!("{}", "Cycling relays...".bright_blue());
            let response = client.send_within(Command::TestRelays { on_ms, off_ms }, limit).await?;
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&response)?);
                return Ok(());
            }
            if response.status != ResponseStatus::Ok {
                print_result("Relay test", "", &response, format);
                return Ok(());
            }
            let checks: Vec<RelayCheck> = decode(&response)?;
            for check in checks {
                let verdict = if check.passed { "PASS".bright_green() } else { "FAIL".bright_red() };
                println!("  {:<11} {} {}", check.relay.name(), verdict, check.error.unwrap_or_default());
            }
        }
        ("sensor", Some(sub)) => {
            let samples: u32 = parse_opt(sub, "samples")?.unwrap_or(5);
            let interval_ms: u64 = parse_opt(sub, "interval")?.unwrap_or(2_000);
            let limit = REQUEST_TIMEOUT + Duration::from_millis(interval_ms.saturating_mul(u64::from(samples)));

            println!("{}", "Reading sensor...".bright_blue());
            let response = client
                .send_within(Command::TestSensor { samples, interval_ms }, limit)
                .await?;
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&response)?);
                return Ok(());
            }
            if response.status != ResponseStatus::Ok {
                print_result("Sensor test", "", &response, format);
                return Ok(());
            }
            let readings: Vec<Reading> = decode(&response)?;
            for (n, reading) in readings.iter().enumerate() {
                match (reading.temperature_f, reading.humidity_pct) {
                    (Some(t), Some(h)) => println!("  #{} {:.2} F  {:.2} %", n + 1, t, h),
                    _ => println!("  #{} {}", n + 1, "error reading sensor".bright_red()),
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn parse_fault(matches: &ArgMatches<'_>) -> CliResult<SimFault> {
    let fault = match matches.value_of("kind").unwrap_or_default() {
        "temperature-dropout" => SimFault::TemperatureDropout,
        "humidity-dropout" => SimFault::HumidityDropout,
        "sensor-hang" => SimFault::SensorHang {
            millis: parse_opt(matches, "millis")?.unwrap_or(5_000),
        },
        "stuck-relay" => SimFault::StuckRelay {
            relay: match matches.value_of("relay") {
                Some("heater2") => RelayId::Heater2,
                Some("humidifier") => RelayId::Humidifier,
                _ => RelayId::Heater1,
            },
        },
        "secondary-offset" => SimFault::SecondaryOffset {
            offset_f: parse_opt(matches, "offset")?.unwrap_or(5.0),
        },
        other => return Err(format!("unknown fault {}", other).into()),
    };
    Ok(fault)
}

async fn handle_monitor(client: &Client, matches: &ArgMatches<'_>, format: &str) -> CliResult {
    let duration = match matches.value_of("duration") {
        Some(s) => Some(Duration::from_secs(s.parse()?)),
        None => None,
    };

    let stream = client.connect().await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let request = serde_json::to_string(&Request::new(request_id(), Command::Subscribe))?;
    writer.write_all(request.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    println!("{}", "Monitoring incubator (Ctrl+C to stop)...".bright_blue().bold());
    if format == "table" {
        println!("{}", "  Seq │ Temp     │ Hum    │ Heat state   │ Humidifier  │ Relays │ Safety".bright_white());
    }

    let updates = stream_updates(&mut reader, format);
    match duration {
        Some(limit) => match tokio::time::timeout(limit, updates).await {
            Ok(result) => result,
            Err(_) => Ok(()),
        },
        None => updates.await,
    }
}

async fn stream_updates(reader: &mut BufReader<OwnedReadHalf>, format: &str) -> CliResult {
    loop {
        let response = read_response(reader).await?;
        match format {
            "json" => println!("{}", serde_json::to_string(&response)?),
            "compact" => println!("{}", decode::<Status>(&response)?.summary()),
            _ => print_status_row(&decode(&response)?),
        }
    }
}

fn handle_server(matches: &ArgMatches<'_>, port: u16) -> CliResult {
    let daemon = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("incubatord")))
        .filter(|path| path.exists())
        .unwrap_or_else(|| "incubatord".into());

    let mut cmd = std::process::Command::new(daemon);
    cmd.arg("--bind").arg(format!("127.0.0.1:{}", port));
    if matches.is_present("simulate") {
        cmd.arg("--simulate");
    }

    println!("{}", "Starting incubator daemon...".bright_green().bold());
    if matches.is_present("background") {
        cmd.spawn()?;
        println!("Daemon started in background on port {}", port);
    } else {
        cmd.status()?;
    }
    Ok(())
}

fn parse_opt<T: std::str::FromStr>(matches: &ArgMatches<'_>, name: &str) -> CliResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match matches.value_of(name) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| format!("invalid --{}: {}", name, e).into()),
        None => Ok(None),
    }
}

fn decode<T: serde::de::DeserializeOwned>(response: &Response) -> CliResult<T> {
    if response.status != ResponseStatus::Ok {
        return Err(response
            .message
            .clone()
            .unwrap_or_else(|| format!("{:?}", response.status))
            .into());
    }
    let data = response.data.clone().ok_or("response carried no data")?;
    Ok(serde_json::from_value(data)?)
}

fn print_result(action: &str, value: &str, response: &Response, format: &str) {
    match format {
        "json" => match serde_json::to_string_pretty(response) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("{}", e),
        },
        "compact" => println!("{:?}", response.status),
        _ => {
            let message = response.message.as_deref().unwrap_or("");
            match response.status {
                ResponseStatus::Ok => println!("{} {}", action.bright_white(), value.bright_green()),
                ResponseStatus::Rejected => {
                    println!("{} rejected: {}", action.bright_white(), message.bright_red())
                }
                ResponseStatus::Error => {
                    println!("{} failed: {}", action.bright_white(), message.bright_red())
                }
            }
        }
    }
}

fn fmt_value(value: Option<f32>, unit: &str) -> String {
    match value {
        Some(v) => format!("{:.1}{}", v, unit),
        None => "--".to_string(),
    }
}

fn on_off(on: bool) -> ColoredString {
    if on {
        "ON".bright_green()
    } else {
        "off".dimmed()
    }
}

fn print_status_table(status: &Status) {
    println!("{}", "Incubator Status".bright_blue().bold());
    println!("{}", "════════════════".bright_blue());
    println!("Temperature:   {}", fmt_value(status.reading.temperature_f, " F").bright_white());
    println!("Humidity:      {}", fmt_value(status.reading.humidity_pct, " %").bright_white());
    if let Some(secondary) = status.reading.secondary_temperature_f {
        println!("Secondary:     {:.1} F", secondary);
    }
    println!(
        "Temperature:   {:?} ({})",
        status.temperature_state,
        if status.is_running.temperature { "running".green() } else { "stopped".yellow() }
    );
    println!(
        "Humidity:      {:?} ({})",
        status.humidity_state,
        if status.is_running.humidity { "running".green() } else { "stopped".yellow() }
    );
    println!(
        "Relays:        heater1 {}  heater2 {}  humidifier {}",
        on_off(status.relays.heater1),
        on_off(status.relays.heater2),
        on_off(status.relays.humidifier)
    );

    let safety = &status.safety;
    if safety.any() || status.humidity_sensor_failure {
        println!("{}", "Safety:".bright_red().bold());
        if safety.sensor_failure {
            println!("  {}", "temperature sensor failure".red());
        }
        if safety.overheat_triggered {
            println!("  {}", "secondary over-temperature".red());
        }
        if safety.cutoff_triggered {
            println!("  {}", "safety cutoff reached".red());
        }
        if status.humidity_sensor_failure {
            println!("  {}", "humidity sensor failure".yellow());
        }
    } else {
        println!("Safety:        {}", "OK".bright_green());
    }

    println!(
        "Counters:      {} ticks, {} relay failures, {} safety trips, {} tick errors",
        status.counters.ticks,
        status.counters.relay_write_failures,
        status.counters.safety_trips,
        status.counters.tick_errors
    );
    println!("Uptime:        {} s", status.uptime_s);
    if let Some(error) = &status.last_error {
        println!("Last error:    {}", error.bright_red());
    }
}

fn print_status_row(status: &Status) {
    let safety = if status.safety.any() { "TRIPPED".bright_red() } else { "ok".green() };
    println!(
        "{:>5} │ {:>8} │ {:>6} │ {:<12} │ {:<11} │ {:>6} │ {}",
        status.seq,
        fmt_value(status.reading.temperature_f, "F"),
        fmt_value(status.reading.humidity_pct, "%"),
        format!("{:?}", status.temperature_state),
        format!("{:?}", status.humidity_state),
        format!("{:03b}", status.relay_mask),
        safety
    );
}

fn print_settings_table(settings: &Settings) {
    let t = &settings.temperature;
    let h = &settings.humidity;
    println!("{}", "Temperature (F)".bright_blue().bold());
    println!("  min {:.1}  target {:.1}  max {:.1}  cutoff {:.1}", t.min, t.target, t.max, t.safety_cutoff);
    println!("  sensor timeout {} s, {}", t.sensor_timeout_s, if t.enabled { "enabled".green() } else { "disabled".yellow() });
    println!("{}", "Humidity (%)".bright_blue().bold());
    println!("  min {:.1}  target {:.1}  max {:.1}", h.min, h.target, h.max);
    println!("  {}", if h.enabled { "enabled".green() } else { "disabled".yellow() });
}
