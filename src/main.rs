//! pumpctl: interactive operator console for the syringe exchange engine
//!
//! Usage:
//!   pumpctl --config pumps.yaml --port /dev/ttyUSB0
//!   pumpctl --simulate --time-scale 10       # demo session without hardware
//!
//! Commands are read line by line; `help` lists them. Set RUST_LOG or
//! `--log-level` to control logging.

use clap::{Parser, Subcommand};
use log::{error, info};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::thread;
use syringe_exchange::{Compartment, Config, Dose, Orchestrator, Result, ValveTarget};

#[derive(Parser)]
#[command(name = "pumpctl", version)]
#[command(about = "Operator console for RS-485 syringe pump exchange rigs", long_about = None)]
struct Cli {
    /// YAML configuration; the canonical four-syringe rig when absent
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serial port to connect at startup
    #[arg(long)]
    port: Option<String>,

    /// Run against a simulated device chain
    #[arg(long)]
    simulate: bool,

    /// Speed-up of simulated motion
    #[arg(long, default_value_t = 1.0)]
    time_scale: f64,

    /// Log filter, e.g. `debug` or `syringe_exchange=trace`
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Parser)]
#[command(multicall = true)]
struct Line {
    #[command(subcommand)]
    command: Console,
}

#[derive(Subcommand)]
enum Console {
    /// Open a serial port (the configured one by default)
    Connect { port: Option<String> },
    Disconnect,
    /// List serial ports on which device 1 answers
    Scan,
    #[command(name = "load-config")]
    LoadConfig { file: PathBuf },
    #[command(name = "save-config")]
    SaveConfig { file: PathBuf },
    /// Start a mode: `start-mode intermittent exchange_rate=500 total_exchange_amount=25000`
    #[command(name = "start-mode")]
    StartMode {
        name: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    Stop,
    /// Change the running mode's rate in uL/s
    #[command(name = "set-rate")]
    SetRate { rate: f64 },
    /// `dose add 10` or `dose remove 10 --rate 50`
    Dose {
        direction: String,
        volume: f64,
        #[arg(long)]
        rate: Option<f64>,
    },
    /// Overwrite a tally: reservoir, reservoirN, waste, cell or exchanged
    #[command(name = "reset-volumes")]
    ResetVolumes { compartment: String, volume: f64 },
    /// Print a JSON status snapshot
    Status,
    /// Turn a valve to a position or alias
    Valve { device: u8, target: String },
    /// Name a valve position
    Alias { device: u8, position: u8, name: String },
    /// Clear a latched volume tripwire
    Ack,
    /// Swap push and pull of a configured pair
    #[command(name = "pair-swap")]
    PairSwap { name: String },
    /// Stop everything immediately
    Halt,
    #[command(alias = "exit")]
    Quit,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let default_port = config.server.port.clone();
    let orchestrator = Orchestrator::new(config)?;

    let events = orchestrator.subscribe();
    thread::spawn(move || {
        for event in events {
            match serde_json::to_string(&event) {
                Ok(json) => println!("event {}", json),
                Err(e) => error!("Event not serialisable: {}", e),
            }
        }
    });

    if cli.simulate {
        orchestrator.connect_simulated(cli.time_scale)?;
    } else if let Some(port) = cli.port.or(default_port) {
        orchestrator.connect(&port)?;
    } else {
        info!("Not connected; use `connect <port>` or start with --simulate");
    }

    let stdin = io::stdin();
    loop {
        print!("pumpctl> ");
        io::stdout().flush()?;
        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            break;
        }
        let words: Vec<&str> = input.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }
        let line = match Line::try_parse_from(&words) {
            Ok(line) => line,
            Err(e) => {
                // Help and usage errors are both printed by clap
                let _ = e.print();
                continue;
            }
        };
        match run(&orchestrator, line.command) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => eprintln!("error ({:?}): {}", e.kind(), e),
        }
    }

    orchestrator.disconnect()
}

/// Execute one console command; false once the operator quits
fn run(orchestrator: &Orchestrator, command: Console) -> Result<bool> {
    match command {
        Console::Connect { port } => {
            let port = port
                .or_else(|| orchestrator.config().server.port)
                .ok_or_else(|| syringe_exchange::PumpError::InvalidArgument("no port given".to_string()))?;
            orchestrator.connect(&port)?;
        }
        Console::Disconnect => orchestrator.disconnect()?,
        Console::Scan => {
            for port in orchestrator.scan()? {
                println!("{}", port);
            }
        }
        Console::LoadConfig { file } => orchestrator.load_config(file)?,
        Console::SaveConfig { file } => orchestrator.save_config(file)?,
        Console::StartMode { name, args } => orchestrator.start(&name, &args)?,
        Console::Stop => orchestrator.stop()?,
        Console::SetRate { rate } => orchestrator.set_rate(rate)?,
        Console::Dose {
            direction,
            volume,
            rate,
        } => {
            let mut dose = Dose::parse(&direction, volume)?;
            if let Some(rate) = rate {
                dose = dose.with_rate(rate);
            }
            orchestrator.dose(dose)?;
        }
        Console::ResetVolumes { compartment, volume } => {
            orchestrator.reset_volumes(Compartment::parse(&compartment)?, volume)?
        }
        Console::Status => {
            let status = serde_json::to_string_pretty(&orchestrator.status())
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            println!("{}", status);
        }
        Console::Valve { device, target } => {
            orchestrator.move_valve(device, ValveTarget::from(target))?
        }
        Console::Alias {
            device,
            position,
            name,
        } => orchestrator.set_port_alias(device, position, &name)?,
        Console::Ack => {
            if !orchestrator.acknowledge() {
                println!("nothing to acknowledge");
            }
        }
        Console::PairSwap { name } => orchestrator.swap_pair(&name)?,
        Console::Halt => orchestrator.halt_all(),
        Console::Quit => return Ok(false),
    }
    Ok(true)
}
