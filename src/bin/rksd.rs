use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use console::style;
use tracing_subscriber::EnvFilter;

use rksd::adapters::clock::{ClockControl, FakeClock, SystemClock};
use rksd::adapters::ntp_client::{NtpAuth, NtpTransport, NullTransport};
use rksd::adapters::pps::ScriptedPps;
use rksd::adapters::ptp_codec::ScriptedCodec;
use rksd::config::{Config, InstanceConfig};
use rksd::domain::link::{LinkFlags, LinkKind, LinkRow, TsCaps};
use rksd::engine::{Engine, EngineConfig, ModuleBuilder, ModuleSpec};
use rksd::runtime::lowlevel::{block_signals, rt_signal_base};
use rksd::runtime::{Runtime, RuntimeConfig};
use rksd::sync::ModuleKind;
use rksd::sync::pps::PpsConfig;
use rksd::sync::ptp::PtpConfig;

/// Real-time signals reserved for per-thread user delivery.
const RT_SIGNAL_COUNT: i32 = 8;

#[derive(Parser, Debug)]
#[command(name = "rksd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Rusty Klock Sync Daemon - multi-source time synchronization")]
struct Cli {
    /// Daemon configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Default interface for instances that do not name one
    #[arg(short = 'i', long, value_name = "IFACE")]
    interface: Option<String>,

    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Observe only: never adjust any clock
    #[arg(long)]
    dry_clock: bool,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => fatal(&format!("cannot load {}: {err}", cli.config.display())),
    };
    if let Some(default_iface) = &cli.interface {
        for inst in &mut config.instances {
            if inst.interface.is_none() {
                inst.interface = Some(default_iface.clone());
            }
        }
    }

    // Block the handled signals before any thread exists so every thread
    // inherits the mask and delivery stays with the engine's signalfd.
    let mut signos = vec![libc::SIGINT, libc::SIGTERM];
    for n in 0..RT_SIGNAL_COUNT {
        signos.push(rt_signal_base() + n);
    }
    if let Err(err) = block_signals(&signos) {
        fatal(&format!("cannot block signals: {err}"));
    }

    let runtime = Runtime::new(RuntimeConfig {
        pool_size: config.general.message_pool_size,
    });
    let clock: Arc<dyn ClockControl> = if cli.dry_clock {
        Arc::new(FakeClock::new())
    } else {
        Arc::new(SystemClock)
    };

    let engine_config = EngineConfig {
        selection_interval: config.general.selection_interval,
        selection_holdoff: config.general.selection_holdoff,
        stats_interval: config.general.stats_interval,
        save_interval: config.general.save_interval,
        policy: config.general.policy.clone(),
        state_path: config.general.state_path.clone(),
    };
    let specs: Vec<ModuleSpec> = config.instances.iter().map(module_spec).collect();

    let engine = match Engine::start(&runtime, engine_config, clock, specs) {
        Ok(engine) => engine,
        Err(err) => fatal(&format!("engine startup failed: {err}")),
    };
    if let Err(err) = runtime.enable_signalfd(engine.handle(), &signos) {
        fatal(&format!("cannot install signal handling: {err}"));
    }
    for &signo in &signos {
        runtime.signals().subscribe(signo, engine.handle());
    }

    if let Err(err) = engine.push_link_table(scan_interfaces()) {
        tracing::warn!(error = %err, "initial link table push failed");
    }

    let code = engine.wait();
    process::exit(code);
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "rksd=info",
        1 => "rksd=debug",
        _ => "rksd=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn fatal(message: &str) -> ! {
    eprintln!("{} {}", style("Error:").red().bold(), message);
    process::exit(1);
}

fn module_spec(inst: &InstanceConfig) -> ModuleSpec {
    let builder = match inst.kind {
        ModuleKind::Freerun => ModuleBuilder::Freerun,
        ModuleKind::Ptp => ModuleBuilder::Ptp(
            PtpConfig {
                mode: inst.ptp_mode,
                domain: inst.ptp_domain,
                ..PtpConfig::default()
            },
            // The wire backend registers itself here; without one the port
            // stays idle and the module reports its timeouts honestly.
            Box::new(ScriptedCodec::new()),
        ),
        ModuleKind::Ntp | ModuleKind::Crny => {
            let transport: Box<dyn NtpTransport> = Box::new(NullTransport);
            ModuleBuilder::Ntp {
                transport,
                wire_mode: inst.wire_mode,
                auth: match (&inst.key_id, &inst.key_value) {
                    (Some(id), Some(value)) => Some(NtpAuth {
                        key_id: *id,
                        key_value: value.clone(),
                    }),
                    _ => None,
                },
            }
        }
        ModuleKind::Pps | ModuleKind::Gps => ModuleBuilder::Pps(
            PpsConfig {
                tod_available: inst.tod_available,
                ..PpsConfig::default()
            },
            Box::new(ScriptedPps::new()),
        ),
    };
    ModuleSpec {
        name: inst.name.clone(),
        kind: inst.kind,
        tick_interval: inst.tick_interval,
        user_priority: inst.priority,
        interface: inst.interface.clone(),
        prefer_hw_timestamps: inst.hw_timestamps,
        builder,
    }
}

/// Bootstrap link table from sysfs; a netlink provider takes over with
/// `Engine::push_link_table` once running.
fn scan_interfaces() -> Vec<LinkRow> {
    let mut rows = Vec::new();
    let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
        return rows;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        let if_index = std::fs::read_to_string(path.join("ifindex"))
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
            .unwrap_or(0);
        let up = std::fs::read_to_string(path.join("operstate"))
            .map(|s| s.trim() == "up")
            .unwrap_or(false);
        let mut l2_addr = [0u8; 6];
        if let Ok(addr) = std::fs::read_to_string(path.join("address")) {
            for (slot, part) in l2_addr.iter_mut().zip(addr.trim().split(':')) {
                *slot = u8::from_str_radix(part, 16).unwrap_or(0);
            }
        }
        let mut flags = LinkFlags::empty();
        if up {
            flags = LinkFlags::UP | LinkFlags::RUNNING;
        }
        rows.push(LinkRow {
            if_index,
            if_name: name,
            kind: LinkKind::Physical,
            flags,
            bond: None,
            vlan_id: None,
            l2_addr,
            ts_caps: TsCaps::SOFTWARE,
        });
    }
    rows
}
