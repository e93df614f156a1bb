//! afdctl: operate on AFD status areas from the command line.
//!
//! # Usage
//!
//! ```bash
//! afdctl --work-dir ~/afd migrate fsa etc/HOST_CONFIG
//! afdctl show fsa
//! afdctl host ftp.example --disable
//! afdctl check --wait 5 --cleanup
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use afd_status::fsa::{ERROR_ACKNOWLEDGED, ERROR_OFFLINE, HOST_DISABLED, PAUSE_QUEUE};
use afd_status::{
    AfdConfig, AttachedRegion, DirConfig, DirectoryStatus, ErrorClass, HeartbeatMonitor,
    HeartbeatRegion, HostConfig, HostStatus, Liveness, MonitorConfig, MonitorStatus, Op,
    StatusAreaMigrator, StatusError, StatusRecord, SupervisorAction, cleanup_orphan_host,
};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "afdctl")]
#[command(about = "Inspect and maintain AFD status areas")]
struct Args {
    /// AFD work directory (holds fifodir/, messages/ and files/)
    #[arg(long, env = "AFD_WORK_DIR", global = true)]
    work_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish a new version of an area from its configuration file
    Migrate {
        area: Area,
        /// HOST_CONFIG, MON_CONFIG or DIR_CONFIG style file
        config: PathBuf,
    },
    /// Print every record of the current version of an area
    Show { area: Area },
    /// Change status bits of one host under its record lock
    Host {
        alias: String,
        #[arg(long, conflicts_with = "enable")]
        disable: bool,
        #[arg(long)]
        enable: bool,
        #[arg(long, conflicts_with = "resume")]
        pause: bool,
        #[arg(long)]
        resume: bool,
        /// Acknowledge the current error state
        #[arg(long)]
        ack: bool,
        /// Treat errors as expected (host is known to be offline)
        #[arg(long)]
        offline: bool,
        /// Reset the error counter
        #[arg(long)]
        clear_errors: bool,
    },
    /// Check whether the supervisor heartbeat is moving
    Check {
        /// Seconds to watch the counter
        #[arg(long, default_value_t = 5)]
        wait: u64,
        /// Terminate a dead supervisor's processes and remove its region
        #[arg(long)]
        cleanup: bool,
    },
    /// Run a supervisor heartbeat until shutdown is requested
    Heartbeat {
        /// Number of child process slots in the region
        #[arg(long, default_value_t = 0)]
        processes: usize,
        /// Milliseconds between beats
        #[arg(long, default_value_t = 1000)]
        interval: u64,
        /// Seconds to wait for an existing supervisor before taking over
        #[arg(long, default_value_t = 5)]
        wait: u64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Area {
    Fsa,
    Msa,
    Fra,
}

#[derive(Debug)]
enum CliError {
    Status(StatusError),
    UnknownHost(String),
    AlreadyRunning,
}

impl CliError {
    fn is_fatal(&self) -> bool {
        match self {
            CliError::Status(e) => e.class() == ErrorClass::Fatal,
            CliError::UnknownHost(_) | CliError::AlreadyRunning => false,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Status(e) => write!(f, "{e}"),
            CliError::UnknownHost(alias) => write!(f, "no host `{alias}` in the FSA"),
            CliError::AlreadyRunning => f.write_str("a supervisor is already running"),
        }
    }
}

impl From<StatusError> for CliError {
    fn from(e: StatusError) -> Self {
        CliError::Status(e)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.work_dir {
        Some(dir) => AfdConfig::with_work_dir(dir),
        None => AfdConfig::from_env(),
    };

    match run(&config, args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("afdctl: {e}");
            if e.is_fatal() {
                ExitCode::from(1)
            } else {
                ExitCode::from(2)
            }
        }
    }
}

fn run(config: &AfdConfig, command: Command) -> Result<(), CliError> {
    match command {
        Command::Migrate { area, config: file } => migrate(config, area, &file),
        Command::Show { area } => {
            let dir = config.fifo_dir();
            match area {
                Area::Fsa => show::<HostStatus>(&dir, describe_host),
                Area::Msa => show::<MonitorStatus>(&dir, describe_monitor),
                Area::Fra => show::<DirectoryStatus>(&dir, describe_dir),
            }
        }
        Command::Host {
            alias,
            disable,
            enable,
            pause,
            resume,
            ack,
            offline,
            clear_errors,
        } => {
            let mut set = 0;
            let mut clear = 0;
            for (on, bit) in [
                (disable, HOST_DISABLED),
                (pause, PAUSE_QUEUE),
                (ack, ERROR_ACKNOWLEDGED),
                (offline, ERROR_OFFLINE),
            ] {
                if on {
                    set |= bit;
                }
            }
            if enable {
                clear |= HOST_DISABLED;
            }
            if resume {
                clear |= PAUSE_QUEUE;
            }
            update_host(config, &alias, set, clear, clear_errors)
        }
        Command::Check { wait, cleanup } => {
            let monitor = HeartbeatMonitor::new(config.heartbeat_path(), config.heartbeat);
            let liveness = monitor.check(Duration::from_secs(wait), cleanup)?;
            println!(
                "{}",
                match liveness {
                    Liveness::Active => "active",
                    Liveness::Inactive => "inactive",
                    Liveness::Missing => "missing",
                }
            );
            Ok(())
        }
        Command::Heartbeat {
            processes,
            interval,
            wait,
        } => heartbeat(
            config,
            processes,
            Duration::from_millis(interval),
            Duration::from_secs(wait),
        ),
    }
}

fn migrate(config: &AfdConfig, area: Area, file: &Path) -> Result<(), CliError> {
    ensure_dirs(config)?;
    let dir = config.fifo_dir();

    match area {
        Area::Fsa => {
            let hosts = HostConfig::load(file)?;
            let m = StatusAreaMigrator::<HostStatus>::new(&dir).migrate(&hosts)?;
            report(m.area.version_id(), m.carried, m.fresh, m.orphans.len());
            let outgoing = config.outgoing_dir();
            for orphan in &m.orphans {
                if let Err(e) = cleanup_orphan_host(&outgoing, orphan) {
                    tracing::warn!(host = %orphan.alias(), error = %e, "orphan cleanup failed");
                }
            }
        }
        Area::Msa => {
            let monitors = MonitorConfig::load(file)?;
            let m = StatusAreaMigrator::<MonitorStatus>::new(&dir).migrate(&monitors)?;
            report(m.area.version_id(), m.carried, m.fresh, m.orphans.len());
        }
        Area::Fra => {
            let dirs = DirConfig::load(file)?;
            let m = StatusAreaMigrator::<DirectoryStatus>::new(&dir).migrate(&dirs)?;
            report(m.area.version_id(), m.carried, m.fresh, m.orphans.len());
        }
    }
    Ok(())
}

fn ensure_dirs(config: &AfdConfig) -> Result<(), StatusError> {
    config.ensure_dirs().map_err(|source| StatusError::Io {
        op: Op::CreateRegion,
        path: config.work_dir().to_path_buf(),
        source,
    })
}

fn report(version_id: i32, carried: usize, fresh: usize, orphans: usize) {
    println!("version {version_id}: {carried} carried, {fresh} new, {orphans} removed");
}

fn show<R: StatusRecord>(dir: &Path, describe: fn(&R) -> String) -> Result<(), CliError> {
    let attached = AttachedRegion::<R>::attach(dir)?;
    let area = attached.area();
    println!(
        "{:?} version {} ({} records)",
        area.kind(),
        area.version_id(),
        area.capacity()
    );
    for (i, record) in area.records().iter().enumerate() {
        println!("{i:>4}  {}", describe(record));
    }
    Ok(())
}

fn describe_host(h: &HostStatus) -> String {
    format!(
        "{:<31} status={:#06x} errors={} queued={} active={}/{}",
        h.alias(),
        h.host_status,
        h.error_counter,
        h.jobs_queued,
        h.active_transfers,
        h.allowed_transfers
    )
}

fn describe_monitor(m: &MonitorStatus) -> String {
    format!(
        "{:<31} {:?} errors={} queue={} rate={}",
        m.alias(),
        m.connect_status(),
        m.error_counter,
        m.jobs_in_queue,
        m.transfer_rate
    )
}

fn describe_dir(d: &DirectoryStatus) -> String {
    format!(
        "{:<31} host={} id={:x} files={} errors={}{}",
        d.alias(),
        d.host_alias(),
        d.dir_id,
        d.files_in_dir,
        d.error_counter,
        if d.is_disabled() { " disabled" } else { "" }
    )
}

fn update_host(
    config: &AfdConfig,
    alias: &str,
    set: u32,
    clear: u32,
    clear_errors: bool,
) -> Result<(), CliError> {
    let attached = AttachedRegion::<HostStatus>::attach(&config.fifo_dir())?;
    let area = attached.area();
    let index = area
        .find(alias)
        .ok_or_else(|| CliError::UnknownHost(alias.to_string()))?;

    let status = area.update(index, |host| {
        host.host_status = (host.host_status | set) & !clear;
        if clear_errors {
            host.error_counter = 0;
        }
        host.host_status
    })?;
    println!("{alias}: status={status:#06x}");
    Ok(())
}

fn heartbeat(
    config: &AfdConfig,
    processes: usize,
    interval: Duration,
    wait: Duration,
) -> Result<(), CliError> {
    let path = config.heartbeat_path();
    let monitor = HeartbeatMonitor::new(&path, config.heartbeat);
    if monitor.decide(wait)? == SupervisorAction::AlreadyRunning {
        return Err(CliError::AlreadyRunning);
    }

    ensure_dirs(config)?;
    let region = HeartbeatRegion::create(&path, processes)?;
    region.set_pid(0, std::process::id() as i32)?;
    tracing::info!(path = %path.display(), processes, ?interval, "supervisor heartbeat started");

    while !region.shutdown_requested() {
        region.beat();
        std::thread::sleep(interval);
    }

    tracing::info!(counter = region.counter(), "shutdown requested");
    region.remove();
    Ok(())
}
