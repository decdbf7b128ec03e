//! Application definition.

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};

use nestlink_net::sim::NetworkSpec;
use nestlink_net::{
    ClientConfig, InterfaceConfig, NestClient, NestInterface, RecordingSim, Transport,
    TransportContext,
};

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");
pub const AUTHORS: &'static str = env!("CARGO_PKG_AUTHORS");

pub fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("nestlink")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .version(VERSION)
        .author(AUTHORS)
        .about("Drive a remote NEST-style simulator over pub/sub message slots.")
        .arg(
            Arg::with_name("verbosity")
                .long("verbosity")
                .short("v")
                .takes_value(true)
                .default_value("info")
                .value_name("verb")
                .global(true)
                .help("Set the verbosity of the log output"),
        )
        .arg(
            Arg::with_name("transport")
                .long("transport")
                .takes_value(true)
                .default_value("tcp")
                .global(true)
                .help("Slot transport to use (tcp, zmq)"),
        )
        .subcommand(
            SubCommand::with_name("client")
                .display_order(10)
                .about("Run the simulator-hosting client role")
                .arg(
                    Arg::with_name("bind")
                        .long("bind")
                        .takes_value(true)
                        .default_value("127.0.0.1:8000")
                        .help("Address the result publisher binds"),
                )
                .arg(
                    Arg::with_name("interface")
                        .long("interface")
                        .takes_value(true)
                        .default_value("127.0.0.1:2001")
                        .help("Address of the interface's command publisher"),
                )
                .arg(
                    Arg::with_name("silent")
                        .long("silent")
                        .short("s")
                        .help("Suppress log output"),
                ),
        )
        .subcommand(
            SubCommand::with_name("run")
                .display_order(20)
                .about("Run a full session: spawn the client, build the network, simulate")
                .arg(
                    Arg::with_name("spec")
                        .required(true)
                        .value_name("spec-file")
                        .help("Path to the JSON network description"),
                )
                .arg(
                    Arg::with_name("projections")
                        .long("projections")
                        .takes_value(true)
                        .value_name("file")
                        .help("Path to a JSON device projection list"),
                )
                .arg(
                    Arg::with_name("simulate")
                        .long("simulate")
                        .takes_value(true)
                        .default_value("500")
                        .value_name("ms")
                        .help("Simulation duration in milliseconds"),
                )
                .arg(
                    Arg::with_name("bind")
                        .long("bind")
                        .takes_value(true)
                        .default_value("127.0.0.1:2001")
                        .help("Address the command publisher binds"),
                )
                .arg(
                    Arg::with_name("client-addr")
                        .long("client-addr")
                        .takes_value(true)
                        .default_value("127.0.0.1:8000")
                        .help("Address the spawned client binds its result publisher"),
                )
                .arg(
                    Arg::with_name("no-spawn")
                        .long("no-spawn")
                        .help("Attach to an externally started client instead of spawning one"),
                )
                .arg(
                    Arg::with_name("timeout")
                        .long("timeout")
                        .takes_value(true)
                        .default_value("10")
                        .value_name("secs")
                        .help("Barrier deadline in seconds"),
                ),
        )
}

pub fn app_matches() -> ArgMatches<'static> {
    app().get_matches()
}

pub fn start(matches: ArgMatches) -> Result<()> {
    match matches.subcommand() {
        ("client", Some(m)) => start_client(m),
        ("run", Some(m)) => start_run(m),
        _ => Ok(()),
    }
}

fn transport(matches: &ArgMatches) -> Result<Transport> {
    let s = matches.value_of("transport").unwrap_or("tcp");
    Transport::from_str(s).map_err(|e| anyhow!("{}", e))
}

fn addr_arg(matches: &ArgMatches, name: &str) -> Result<SocketAddr> {
    let s = matches
        .value_of(name)
        .ok_or_else(|| anyhow!("missing `{}` address", name))?;
    s.parse().with_context(|| format!("bad `{}` address", name))
}

/// Runs the client role until ctrl-c, hosting the bundled in-memory
/// simulator.
fn start_client(matches: &ArgMatches) -> Result<()> {
    setup_log_verbosity(matches);

    let ctx = TransportContext::new(transport(matches)?)?;
    let config = ClientConfig {
        bind_addr: addr_arg(matches, "bind")?,
        interface_addr: addr_arg(matches, "interface")?,
        ..Default::default()
    };
    let mut client = NestClient::new(&ctx, config, Box::new(RecordingSim::new()))?;

    let shutdown = client.shutdown_handle();
    ctrlc::set_handler(move || shutdown.shutdown())?;

    client.run()?;
    Ok(())
}

/// Drives a whole session from the command line, the same sequence the
/// original driving scripts used: reset, build, project, connect,
/// simulate, count.
fn start_run(matches: &ArgMatches) -> Result<()> {
    setup_log_verbosity(matches);

    let spec_path = matches.value_of("spec").unwrap();
    let spec: NetworkSpec = serde_json::from_str(
        &fs::read_to_string(spec_path).with_context(|| format!("failed reading {}", spec_path))?,
    )?;

    let bind_addr = addr_arg(matches, "bind")?;
    let client_addr = addr_arg(matches, "client-addr")?;
    let timeout: u64 = matches.value_of("timeout").unwrap().parse()?;

    let ctx = TransportContext::new(transport(matches)?)?;
    let mut interface = NestInterface::new(
        &ctx,
        InterfaceConfig {
            bind_addr,
            client_addr,
            barrier_timeout: Duration::from_secs(timeout),
            ..Default::default()
        },
    )?;

    if matches.is_present("no-spawn") {
        info!("waiting for an externally started client");
        interface.wait_ready()?;
    } else {
        let exe = env::current_exe()?;
        let exe = exe
            .to_str()
            .ok_or_else(|| anyhow!("executable path not utf-8"))?;
        let bind = client_addr.to_string();
        let iface = bind_addr.to_string();
        interface.start_client(
            exe,
            &["client", "--bind", bind.as_str(), "--interface", iface.as_str()],
            true,
        )?;
    }

    interface.reset()?;
    interface.build_network(&spec)?;
    if let Some(path) = matches.value_of("projections") {
        let projections =
            fs::read_to_string(path).with_context(|| format!("failed reading {}", path))?;
        interface.send_device_projections(&projections)?;
    }
    interface.connect_all()?;

    let duration: f64 = matches.value_of("simulate").unwrap().parse()?;
    interface.simulate(duration)?;

    let nconnections = interface.get_num_connections()?;
    println!("network simulated for {} ms, {} connections", duration, nconnections);

    interface.shutdown();
    Ok(())
}

fn setup_log_verbosity(matches: &ArgMatches) {
    use simplelog::{LevelFilter, TermLogger};
    let level_filter = if matches.is_present("silent") {
        LevelFilter::Off
    } else {
        match matches.value_of("verbosity") {
            Some(s) => match s {
                "0" | "none" => LevelFilter::Off,
                "1" | "err" | "error" | "min" => LevelFilter::Error,
                "2" | "warn" | "warning" => LevelFilter::Warn,
                "3" | "info" | "default" => LevelFilter::Info,
                "4" | "debug" => LevelFilter::Debug,
                "5" | "trace" | "max" | "all" => LevelFilter::Trace,
                _ => LevelFilter::Info,
            },
            _ => LevelFilter::Info,
        }
    };
    let mut config_builder = simplelog::ConfigBuilder::new();
    let logger_conf = config_builder
        .set_time_level(LevelFilter::Error)
        .set_target_level(LevelFilter::Debug)
        .set_location_level(LevelFilter::Error)
        .set_time_format_str("%H:%M:%S%.6f")
        .build();
    TermLogger::init(level_filter, logger_conf, simplelog::TerminalMode::Mixed);
}
