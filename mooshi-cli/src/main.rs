//! Command-line client for the Mooshimeter multimeter
//!
//! Connects to the first meter found (or the one matching `--device`),
//! discovers its node tree and reads, writes or watches nodes.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{info, warn};

use mooshi_client::config::default_config_path;
use mooshi_client::proto::description::PATH_ADMIN;
use mooshi_client::transport::{self, EventReceiver, Transport};
use mooshi_client::{
    BtleTransport, ErrorCode, InitHandler, NodeId, NodeType, Session, SessionConfig, SessionError,
    SimHandle, SimMeter, TransportError, Value,
};

#[derive(Parser)]
#[command(name = "mooshi")]
#[command(about = "Command-line client for the Mooshimeter multimeter")]
struct Cli {
    /// Config file (default: $MOOSHI_HOME/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Talk to an in-process simulated meter instead of Bluetooth
    #[arg(long, global = true)]
    simulate: bool,

    /// Device name or address to connect to
    #[arg(short, long, global = true)]
    device: Option<String>,

    /// Scan timeout in seconds
    #[arg(short, long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List meters in range
    Scan,
    /// Print the node tree with current values
    Tree,
    /// Read one node
    Get { path: String },
    /// Write a value to a node
    Set { path: String, value: String },
    /// Select a chooser option, e.g. CH1:MAPPING:TEMP
    Choose { path: String },
    /// Print every change of the given nodes until interrupted
    Watch {
        #[arg(required = true)]
        paths: Vec<String>,
    },
}

/// First error raised inside a session callback
type Failure = Arc<Mutex<Option<SessionError>>>;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            let code = e
                .downcast_ref::<SessionError>()
                .map(SessionError::code)
                .unwrap_or(ErrorCode::Usage);
            ExitCode::from(code as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&cli)?;
    let (mut transport, mut events, sim) = open_transport(cli.simulate)?;

    let command = cli.command;
    let failure: Failure = Arc::new(Mutex::new(None));
    let Some(on_init) = init_for(&command, Arc::clone(&failure)) else {
        return scan_meters(transport.as_mut(), &mut events, config.scan_timeout()).await;
    };

    let mut session = Session::new(transport, events, config);

    let timeout_failure = Arc::clone(&failure);
    session
        .setup(on_init, move |session| {
            let seconds = session.config().scan_timeout;
            fail(
                session,
                &timeout_failure,
                SessionError::ScanFailed(TransportError::Scan(format!(
                    "no meter found within {seconds}s"
                ))),
            );
        })
        .await?;

    if let (Commands::Watch { .. }, Some(handle)) = (&command, sim) {
        tokio::spawn(simulate_readings(handle));
    }

    tokio::select! {
        result = session.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    if let (Commands::Tree, true) = (&command, session.is_initialized()) {
        print!("{}", session.dump_tree(None));
    }
    session.shutdown().await;

    let failed = failure.lock().unwrap_or_else(PoisonError::into_inner).take();
    match failed {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn load_config(cli: &Cli) -> Result<SessionConfig, SessionError> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::load_or_default(&default_config_path())?,
    };
    if let Some(device) = &cli.device {
        config.device = Some(device.clone());
    }
    if let Some(timeout) = cli.timeout {
        config.scan_timeout = timeout;
    }
    Ok(config)
}

fn open_transport(
    simulate: bool,
) -> Result<(Box<dyn Transport>, EventReceiver, Option<SimHandle>), SessionError> {
    if simulate {
        let (meter, handle, events) = SimMeter::new()?;
        Ok((Box::new(meter), events, Some(handle)))
    } else {
        let (transport, events) = BtleTransport::new();
        Ok((Box::new(transport), events, None))
    }
}

async fn scan_meters(
    transport: &mut dyn Transport,
    events: &mut EventReceiver,
    duration: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Scanning for meters ({} seconds)...", duration.as_secs());
    let found = transport::scan(transport, events, duration).await?;

    println!("\nFound {} meters:", found.len());
    for meter in found {
        let name = meter.name.unwrap_or_else(|| "Unknown".to_string());
        println!("  {} ({})", name, meter.device);
    }
    Ok(())
}

fn fail(session: &mut Session, failure: &Failure, error: SessionError) {
    let mut slot = failure.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_none() {
        *slot = Some(error);
    }
    session.stop();
}

/// Work to do once the tree is known; `None` for commands that never connect
fn init_for(command: &Commands, failure: Failure) -> Option<InitHandler> {
    let on_init: InitHandler = match command {
        Commands::Scan => return None,
        Commands::Tree => Box::new(move |session: &mut Session| {
            if let Err(e) = wait_for_all_values(session) {
                fail(session, &failure, e);
            }
        }),
        Commands::Get { path } => {
            let path = path.clone();
            Box::new(move |session: &mut Session| {
                if let Err(e) = get(session, &path) {
                    fail(session, &failure, e);
                }
            })
        }
        Commands::Set { path, value } => {
            let (path, literal) = (path.clone(), value.clone());
            Box::new(move |session: &mut Session| {
                if let Err(e) = set(session, &path, &literal) {
                    fail(session, &failure, e);
                }
            })
        }
        Commands::Choose { path } => {
            let path = path.clone();
            Box::new(move |session: &mut Session| {
                if let Err(e) = choose(session, &path) {
                    fail(session, &failure, e);
                }
            })
        }
        Commands::Watch { paths } => {
            let paths = paths.clone();
            Box::new(move |session: &mut Session| {
                if let Err(e) = watch(session, &paths) {
                    fail(session, &failure, e);
                }
            })
        }
    };
    Some(on_init)
}

fn print_value(session: &Session, node: NodeId) {
    println!("{} = {}", session.tree().path(node), session.value_as_string(node));
}

/// Stop once every node requested during discovery has answered
fn wait_for_all_values(session: &mut Session) -> Result<(), SessionError> {
    let admin = session.node(PATH_ADMIN)?;
    let skip = session.tree().walk(admin);
    let nodes: Vec<NodeId> = session
        .tree()
        .walk(session.tree().root())
        .into_iter()
        .filter(|id| !skip.contains(id) && session.tree().node(*id).op_code().is_some())
        .collect();

    let outstanding = Arc::new(Mutex::new(nodes.clone()));
    for node in nodes {
        let outstanding = Arc::clone(&outstanding);
        session.node_subscribe(node, move |session, node| {
            let mut waiting = outstanding.lock().unwrap_or_else(PoisonError::into_inner);
            waiting.retain(|id| *id != node);
            if waiting.is_empty() {
                session.stop();
            }
        })?;
    }
    Ok(())
}

fn get(session: &mut Session, path: &str) -> Result<(), SessionError> {
    let node = session.node(path)?;
    session.node_request_value(node)?;
    session.node_subscribe(node, |session, node| {
        print_value(session, node);
        session.stop();
    })?;
    Ok(())
}

fn set(session: &mut Session, path: &str, literal: &str) -> Result<(), SessionError> {
    let node = session.node(path)?;
    let node_type = session.tree().node(node).node_type();
    let value = Value::parse(node_type, literal)?;
    session.node_set_value(node, value.clone(), true)?;
    confirm(session, node, value)
}

fn choose(session: &mut Session, path: &str) -> Result<(), SessionError> {
    let option = session.node(path)?;
    session.node_choose(option)?;
    let chooser = session
        .tree()
        .node(option)
        .parent()
        .ok_or_else(|| SessionError::NotAChooser(path.to_string()))?;
    let value = session
        .node_value(chooser)
        .cloned()
        .unwrap_or(Value::Choice(0));
    confirm(session, chooser, value)
}

/// Wait for the meter to echo `expected` back
fn confirm(session: &mut Session, node: NodeId, expected: Value) -> Result<(), SessionError> {
    session.node_subscribe(node, move |session, node| {
        if session.node_value(node) == Some(&expected) {
            print_value(session, node);
            session.stop();
        }
    })?;
    Ok(())
}

fn watch(session: &mut Session, paths: &[String]) -> Result<(), SessionError> {
    for path in paths {
        let node = session.node(path)?;
        if session.tree().node(node).node_type() == NodeType::Plain {
            warn!("{path} holds no value");
        }
        session.node_subscribe(node, |session, node| print_value(session, node))?;
    }
    Ok(())
}

/// Keep the simulated channels moving so `watch` has something to show
async fn simulate_readings(handle: SimHandle) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut step = 0u32;
    loop {
        ticker.tick().await;
        step = step.wrapping_add(1);
        let phase = step as f32 / 10.0;
        let readings = [
            ("CH1:VALUE", Value::Float(0.25 * phase.sin())),
            ("CH2:VALUE", Value::Float(3.3 + 0.01 * phase.cos())),
            ("BAT_V", Value::Float(3.05 - step as f32 * 1e-5)),
        ];
        for (path, value) in readings {
            if let Err(e) = handle.push_value(path, value) {
                warn!("simulated reading for {path}: {e}");
            }
        }
    }
}
