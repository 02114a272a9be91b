//! Entry point for `meshprobe`.
//!
//! Parses arguments, sets up logging and runs the interactive menu. All link
//! and estimation work is delegated to `meshprobe-core`; this file only owns
//! process setup, terminal I/O and Ctrl-C handling.

use anyhow::{Context, Result};
use clap::Parser;
use meshprobe_core::message::now_millis;
use meshprobe_core::protocol::list_ports;
use meshprobe_core::record::MessageRecorder;
use meshprobe_core::session::{Session, SessionConfig};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Control loop pace during a test or while watching messages
const STEP_INTERVAL: Duration = Duration::from_millis(5);

/// Exit status when the link cannot be opened
const EXIT_OPEN_FAILED: u8 = 2;

type Input = Lines<BufReader<Stdin>>;

/// Measure message loss and latency to a mesh node over a serial link.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Serial port of the gateway node (default: /dev/ttyACM0)
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate (default: 115200)
    #[arg(short, long)]
    baud: Option<u32>,

    /// Use a simulated node instead of the serial port
    #[arg(short, long)]
    fake: bool,

    /// CSV file received messages are appended to during a test
    #[arg(long)]
    log: Option<PathBuf>,

    /// JSON settings file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Print the effective settings as JSON and exit
    #[arg(long)]
    print_config: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Defaults, then the settings file, then flags
fn load_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::from_file(path)?,
        None => SessionConfig::default(),
    };

    if let Some(port) = &args.port {
        config.connection.port_name = port.clone();
    }
    if let Some(baud) = args.baud {
        config.connection.baud_rate = baud;
    }
    if args.fake {
        config.simulate = true;
    }
    if let Some(log) = &args.log {
        config.log_path = Some(log.clone());
    }
    Ok(config)
}

/// Parse a strictly positive number of milliseconds
fn parse_millis(text: &str) -> Option<u64> {
    text.trim().parse::<u64>().ok().filter(|&v| v > 0)
}

fn print_prompt(text: &str) {
    print!("{}", text);
    let _ = std::io::stdout().flush();
}

/// Read one line; `None` on end of input
async fn prompt(input: &mut Input, text: &str) -> Result<Option<String>> {
    print_prompt(text);
    input.next_line().await.context("reading stdin")
}

/// Prompt until a valid value is entered; `None` on end of input
async fn read_millis(input: &mut Input, text: &str) -> Result<Option<u64>> {
    loop {
        let Some(line) = prompt(input, text).await? else {
            return Ok(None);
        };
        match parse_millis(&line) {
            Some(value) => return Ok(Some(value)),
            None => println!("Valor incorrecto."),
        }
    }
}

fn print_menu(config: &SessionConfig) {
    let estimator = &config.estimator;
    println!(
        "1: Ingresar el periodo de envio de mensajes (={})",
        estimator.message_period_ms
    );
    println!(
        "2: Ingresar el periodo usado para la prueba (={})",
        estimator.test_period_ms
    );
    println!(
        "3: Ingresar el tiempo máximo de espera (={})",
        estimator.max_response_delay_ms
    );
    println!("4: Iniciar envio de mensajes");
    println!("5: Ver todos los mensajes recibidos");
    println!(
        "6: Ingresar el periodo de impresión de resultados (={})",
        config.report_period_ms
    );
    println!("X: Terminar");
}

/// Run the menu until the user quits, input ends or Ctrl-C
async fn menu(
    session: &mut Session,
    input: &mut Input,
    shutdown: &CancellationToken,
) -> Result<()> {
    while !shutdown.is_cancelled() {
        print_menu(session.config());

        let line = tokio::select! {
            line = prompt(input, "Ingresar una opción: ") => line?,
            _ = shutdown.cancelled() => break,
        };
        let Some(line) = line else {
            break;
        };

        let choice = line.trim().to_lowercase();
        let setting = match choice.as_str() {
            "1" => Some("Ingresar cada cuanto tiempo se envía un mensaje [ms]: "),
            "2" => Some("Ingresar el tiempo considerado para la prueba [ms]: "),
            "3" => Some("Ingresar el tiempo máximo que se espera una respuesta o timeout [ms]: "),
            "6" => Some("Ingresar cada cuanto tiempo se imprime mensaje en pantalla [ms]: "),
            _ => None,
        };

        if let Some(text) = setting {
            let Some(value) = read_millis(input, text).await? else {
                break;
            };
            let config = session.config_mut();
            match choice.as_str() {
                "1" => config.estimator.message_period_ms = value,
                "2" => config.estimator.test_period_ms = value,
                "3" => config.estimator.max_response_delay_ms = value,
                _ => config.report_period_ms = value,
            }
            continue;
        }

        match choice.as_str() {
            "4" => run_test(session, input, shutdown).await?,
            "5" => watch(session, input, shutdown).await?,
            "x" => break,
            _ => println!("Opción incorrecta."),
        }
    }
    Ok(())
}

/// Probe until ENTER or Ctrl-C, printing a report every report period
async fn run_test(
    session: &mut Session,
    input: &mut Input,
    shutdown: &CancellationToken,
) -> Result<()> {
    if let Err(e) = session.start_test(now_millis()) {
        println!("{}", e);
        return Ok(());
    }
    println!("Presionar ENTER para volver al menú...");

    let mut ticker = tokio::time::interval(STEP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let result = loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(report) = session.step(now_millis(), |_| {}) {
                    println!("{}", report);
                }
            }
            line = input.next_line() => break line.map(|_| ()).context("reading stdin"),
            _ = shutdown.cancelled() => break Ok(()),
        }
    };

    let stats = session.stats();
    session.stop_test();
    tracing::debug!(
        "test finished: {} probes sent, {} matched, {} unmatched",
        stats.probes_sent,
        stats.matched,
        stats.unmatched
    );
    result
}

/// Print every received message until ENTER or Ctrl-C
async fn watch(
    session: &mut Session,
    input: &mut Input,
    shutdown: &CancellationToken,
) -> Result<()> {
    session.discard_pending();
    println!("Presionar ENTER para volver al menú...");

    let mut ticker = tokio::time::interval(STEP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                session.drain(now_millis(), |m| println!("{}", m.summary()));
            }
            line = input.next_line() => return line.map(|_| ()).context("reading stdin"),
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    if args.list_ports {
        let ports = list_ports();
        if ports.is_empty() {
            println!("No serial ports found");
        }
        for port in ports {
            println!("{}", port);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let config = load_config(&args)?;
    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(ExitCode::SUCCESS);
    }

    let mut session = Session::new(config);
    if let Some(path) = session.config().log_path.clone() {
        let recorder = MessageRecorder::open(&path)
            .with_context(|| format!("opening message log {}", path.display()))?;
        session.attach_recorder(recorder);
    }

    if let Err(e) = session.open() {
        tracing::error!(
            "cannot open {}: {}",
            session.config().connection.port_name,
            e
        );
        return Ok(ExitCode::from(EXIT_OPEN_FAILED));
    }

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let result = menu(&mut session, &mut input, &shutdown).await;

    tracing::info!("Closing...");
    session.close();
    result.map(|()| ExitCode::SUCCESS)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
