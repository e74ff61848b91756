//! # MeshCore Simulator - Main Entry Point
//!
//! Headless simulator for a LoRa-style mesh protocol ("MeshCore"): the
//! per-node protocol core (codec, signed adverts, time sync, flood/direct
//! forwarding, store-and-forward mailbox, link-health controls) runs over a
//! deterministic virtual clock and a link-based radio channel model, with
//! many simulated nodes in a single process.
//!
//! Three ways to drive it:
//!
//! 1. `scenario <name>` - run a built-in topology (linear, star, companion)
//!    for a fixed simulated duration and print the outcome.
//! 2. `run <scene.json>` - load a scene file describing nodes, links and
//!    channel parameters, with simulator defaults from an optional TOML
//!    config.
//! 3. `interactive` - step simulated time by hand and talk to individual
//!    nodes over their CLI (`ping`, `trace`, `status`, ...).
//!
//! Every run is reproducible: identities, TX jitter and RSSI shadowing all
//! derive from one master seed.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand};
use env_logger::Builder;
use log::{LevelFilter, info};

use meshcore_sim::simulation::runner::{SimEvent, SimRunner};
use meshcore_sim::simulation::scenarios;
use meshcore_sim::simulation::scene::{self, SimConfig};

#[derive(Parser)]
#[command(name = "meshcore-sim", version, about = "MeshCore mesh protocol simulator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a built-in scenario.
    Scenario {
        /// One of: linear, star, companion.
        name: String,
        /// Simulated duration in milliseconds.
        #[arg(long, default_value_t = 60_000)]
        duration_ms: u64,
        /// Master seed for identities, jitter and shadowing.
        #[arg(long, default_value_t = 7)]
        seed: u64,
    },
    /// Run a scene file.
    Run {
        /// Path to the scene JSON.
        scene: String,
        /// Simulator defaults file (TOML: tick_ms, duration_ms, seed).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the configured duration.
        #[arg(long)]
        duration_ms: Option<u64>,
        /// Print the final state snapshot as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Step simulated time by hand and send CLI commands to nodes.
    Interactive {
        /// Scene file; the built-in linear scenario when absent.
        #[arg(long)]
        scene: Option<String>,
        #[arg(long, default_value_t = 7)]
        seed: u64,
    },
}

fn main() -> anyhow::Result<()> {
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("meshcore_sim"), LevelFilter::Debug)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Scenario {
            name,
            duration_ms,
            seed,
        } => run_scenario(&name, duration_ms, seed),
        Command::Run {
            scene,
            config,
            duration_ms,
            json,
        } => run_scene(&scene, config, duration_ms, json),
        Command::Interactive { scene, seed } => run_interactive(scene.as_deref(), seed),
    }
}

fn run_scenario(name: &str, duration_ms: u64, seed: u64) -> anyhow::Result<()> {
    let Some(mut runner) = scenarios::build(name, seed) else {
        bail!(
            "Unknown scenario: {name} (available: {})",
            scenarios::SCENARIO_NAMES.join(", ")
        );
    };

    print_topology(&runner);
    info!("Running scenario '{name}' for {duration_ms}ms of simulated time");
    runner.run(duration_ms);
    print_summary(&runner);
    Ok(())
}

fn run_scene(
    scene_path: &str,
    config_path: Option<PathBuf>,
    duration_override: Option<u64>,
    json: bool,
) -> anyhow::Result<()> {
    let config = match config_path {
        Some(path) => SimConfig::load(&path)?,
        None => SimConfig::default(),
    };
    let scene = scene::load_scene(scene_path)?;
    let mut runner = scene::build_runner(&scene, config.seed);
    runner.tick_ms = config.tick_ms;

    let duration_ms = duration_override.unwrap_or(config.duration_ms);
    print_topology(&runner);
    info!("Running scene '{scene_path}' for {duration_ms}ms of simulated time");
    runner.run(duration_ms);

    if json {
        println!("{}", serde_json::to_string_pretty(&runner.state())?);
    } else {
        print_summary(&runner);
    }
    Ok(())
}

fn run_interactive(scene_path: Option<&str>, seed: u64) -> anyhow::Result<()> {
    let mut runner = match scene_path {
        Some(path) => {
            let scene = scene::load_scene(path)?;
            scene::build_runner(&scene, seed)
        }
        None => scenarios::build("linear", seed).expect("built-in scenario exists"),
    };

    print_topology(&runner);
    println!("Interactive mode. Commands:");
    println!("  step [ms]          - advance simulation (default 1000)");
    println!("  cmd <node> <cli>   - send CLI command to a node");
    println!("  state              - print state snapshot as JSON");
    println!("  quit               - exit");
    println!();

    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(3, char::is_whitespace);
        let command = parts.next().unwrap_or_default().to_ascii_lowercase();

        match command.as_str() {
            "quit" | "exit" => break,
            "step" => {
                let ms: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(1000);
                let end = runner.clock.millis() + ms;
                while runner.clock.millis() < end {
                    let tick = runner.tick_ms;
                    for event in runner.run_step(tick) {
                        print_event(&event);
                    }
                }
            }
            "cmd" => match (parts.next(), parts.next()) {
                (Some(node), Some(rest)) => {
                    println!("{}", runner.inject_command(node, rest));
                    let tick = runner.tick_ms;
                    for event in runner.run_step(tick) {
                        print_event(&event);
                    }
                }
                _ => println!("Usage: cmd <node> <cli command>"),
            },
            "state" => println!("{}", serde_json::to_string_pretty(&runner.state())?),
            _ => println!("Unknown command: {line}"),
        }
    }
    Ok(())
}

fn print_event(event: &SimEvent) {
    if let SimEvent::Log {
        node,
        at_ms,
        tag,
        text,
    } = event
    {
        println!("  [{at_ms:>8}ms] {node:10} {tag} {text}");
    }
}

fn print_topology(runner: &SimRunner) {
    println!("\n=== Topology ({} nodes) ===", runner.node_names().count());
    for name in runner.node_names() {
        let node = runner.node(name).expect("node is listed");
        println!(
            "  [{}] {} ({:02X})",
            if node.is_repeater() { "R" } else { "C" },
            name,
            node.hash()
        );
    }
    println!("Links:");
    for ((a, b), link) in runner.radio.links() {
        println!(
            "  {a} <-> {b}  rssi={} snr={}.{}dB",
            link.rssi,
            link.snr / 4,
            (link.snr % 4).abs() * 25
        );
    }
    println!();
}

fn print_summary(runner: &SimRunner) {
    println!("\n=== Final Stats ===");
    for name in runner.node_names() {
        let node = runner.node(name).expect("node is listed");
        let s = &node.stats;
        println!(
            "  {} ({:02X}): RX={} TX={} FWD={} ERR={}",
            name,
            node.hash(),
            s.rx_count,
            s.tx_count,
            s.fwd_count,
            s.err_count
        );
    }

    println!("\n=== Recent Events ===");
    let start = runner.events.len().saturating_sub(30);
    for event in &runner.events[start..] {
        print_event(event);
    }
}
