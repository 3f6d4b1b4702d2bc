use std::time::Duration;

use clap::{Parser, Subcommand};
use procmon_affinity::{
    detect, get_affinity, set_affinity, validate_pid, AffinityBackend, BackendKind, BindScope,
    CpuIdSet,
};
use procmon_core::schema::{AFFINITY_V1, HOST_INFO_V1};
use procmon_core::{get_platform, ProcmonError};
use procmon_scan::host::cpu_counts;
use procmon_scan::table::current_timestamp;
use procmon_scan::{KernelVersion, Process, ScanConfig, ThreadScanGate};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Live process sampling and CPU affinity tool.
#[derive(Parser, Debug)]
#[command(name = "procmon", version, about, long_about = None)]
struct Cli {
    /// The format for log output.
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// The minimum log level to display.
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sample the live process table.
    ///
    /// Runs the given number of cycles, sleeping between them, and prints the
    /// table as of the last cycle. CPU percentages need at least two cycles.
    Scan(ScanArgs),

    /// Read or change the CPUs a process may run on.
    #[command(subcommand)]
    Affinity(AffinityCommand),

    /// Show host capabilities: CPU counts, affinity backend, kernel version.
    Platform(PlatformArgs),
}

#[derive(Parser, Debug)]
struct ScanArgs {
    /// Number of sampling cycles.
    #[arg(
        long,
        value_name = "N",
        default_value_t = 2,
        env = "PROCMON_CYCLES",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    cycles: u32,

    /// Pause between cycles (e.g., "500ms", "1s", "1m").
    #[arg(long, value_name = "DURATION", default_value = "1s", env = "PROCMON_INTERVAL")]
    interval: String,

    /// Show only the first N rows after sorting.
    #[arg(long, value_name = "N")]
    top: Option<usize>,

    /// Show only this process.
    #[arg(long, value_name = "PID")]
    pid: Option<u32>,

    /// Output as JSON (default).
    #[arg(long)]
    json: bool,

    /// Output as human-readable table.
    #[arg(long, conflicts_with = "json")]
    table: bool,

    /// Sort rows by this field.
    #[arg(long, value_enum, default_value = "cpu")]
    sort: SortField,

    /// Skip per-thread scanning.
    #[arg(long)]
    no_threads: bool,
}

#[derive(Subcommand, Debug)]
enum AffinityCommand {
    /// Print the CPUs a process is bound to.
    Get(AffinityGetArgs),

    /// Bind a process to a list of CPUs.
    Set(AffinitySetArgs),
}

#[derive(Parser, Debug)]
struct AffinityGetArgs {
    /// Target process ID.
    #[arg(value_name = "PID")]
    pid: u32,

    /// Output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Parser, Debug)]
struct AffinitySetArgs {
    /// Target process ID.
    #[arg(value_name = "PID")]
    pid: u32,

    /// CPU list, e.g. "0,2-3".
    #[arg(value_name = "CPUS")]
    cpus: String,
}

#[derive(Parser, Debug)]
struct PlatformArgs {
    /// Output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum SortField {
    Pid,
    Cpu,
    Memory,
}

#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Eq)]
enum LogFormat {
    /// Human-readable text format.
    Text,
    /// Machine-readable JSON format.
    Json,
}

/// Exit codes
///
/// - 0: Success
/// - 1: Operation failed (bad arguments, process not found, kernel refused)
/// - 125: Fatal environment failure (process table unavailable)
mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const INTERNAL_ERROR: i32 = 125;
}

fn main() {
    let cli = Cli::parse();

    // Initialize the tracing subscriber
    let filter = EnvFilter::from_default_env().add_directive(cli.log_level.into());

    match cli.log_format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
    }

    info!("Initialization complete. Starting main logic.");
    if let Some(command) = cli.command {
        match run_command(command) {
            Ok(exit_code) => {
                info!("Main logic finished.");
                std::process::exit(exit_code);
            }
            Err(err) if err.is_fatal() => {
                eprintln!("{err}");
                std::process::exit(exit_codes::INTERNAL_ERROR);
            }
            Err(err) => {
                eprintln!("Error: {err}");
                std::process::exit(exit_codes::FAILURE);
            }
        }
    } else {
        println!("Platform: {}", get_platform());
    }
    info!("Main logic finished.");
}

fn run_command(command: Command) -> Result<i32, ProcmonError> {
    match command {
        Command::Scan(args) => run_scan(args),
        Command::Affinity(cmd) => run_affinity(cmd),
        Command::Platform(args) => run_platform(args),
    }
}

// ============================================================================
// scan
// ============================================================================

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn run_scan(args: ScanArgs) -> Result<i32, ProcmonError> {
    use procmon_scan::Monitor;

    let interval = parse_duration(&args.interval)?;
    let config = ScanConfig {
        scan_threads: !args.no_threads,
        ..ScanConfig::default()
    };

    let mut monitor = Monitor::open(&config)?;
    for cycle in 0..args.cycles {
        if cycle > 0 {
            std::thread::sleep(interval);
        }
        let stats = monitor.cycle()?;
        tracing::debug!(
            cycle = monitor.table().cycle(),
            records = stats.records,
            removed = stats.removed,
            "cycle complete"
        );
    }

    let table = monitor.table();
    let mut rows: Vec<&Process> = table
        .iter()
        .filter(|p| args.pid.map_or(true, |pid| p.pid == pid))
        .collect();
    sort_processes(&mut rows, args.sort);
    if let Some(top) = args.top {
        rows.truncate(top);
    }

    let missing = args.pid.is_some() && rows.is_empty();
    if args.table {
        if missing {
            eprintln!("Error: process {} not found", args.pid.unwrap_or_default());
            return Ok(exit_codes::FAILURE);
        }
        print_process_table(&rows);
        println!(
            "Tasks: {} total, {} running; {} threads",
            table.total_tasks, table.running_tasks, table.total_threads
        );
    } else {
        let report = table.report(monitor.host().summary(), rows);
        print_json(&report)?;
    }

    Ok(if missing {
        exit_codes::FAILURE
    } else {
        exit_codes::SUCCESS
    })
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn run_scan(_args: ScanArgs) -> Result<i32, ProcmonError> {
    Err(ProcmonError::not_supported("process scan", get_platform()))
}

/// Sort rows by the requested field; CPU and memory sort descending.
fn sort_processes(rows: &mut [&Process], field: SortField) {
    match field {
        SortField::Pid => rows.sort_by_key(|p| p.pid),
        SortField::Cpu => rows.sort_by(|a, b| {
            b.cpu_percent
                .partial_cmp(&a.cpu_percent)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.pid.cmp(&b.pid))
        }),
        SortField::Memory => {
            rows.sort_by(|a, b| b.rss_bytes.cmp(&a.rss_bytes).then(a.pid.cmp(&b.pid)))
        }
    }
}

/// Print processes in table format.
fn print_process_table(rows: &[&Process]) {
    println!(
        "{:>7} {:>7} {:>6} {:>10} {:>5} {:>3} {:<12} COMMAND",
        "PID", "PPID", "CPU%", "RES", "THR", "S", "USER"
    );
    println!("{:-<80}", "");

    if rows.is_empty() {
        println!("(no matching processes)");
        return;
    }

    for p in rows {
        let user = p.user.as_deref().unwrap_or("-");
        println!(
            "{:>7} {:>7} {:>6.1} {:>10} {:>5} {:>3} {:<12} {}",
            p.pid,
            p.ppid,
            p.cpu_percent,
            format_memory(p.rss_bytes),
            p.thread_count,
            p.state.code(),
            truncate(user, 12),
            truncate(p.display_command(), 40)
        );
    }
}

/// Format a byte count as a human-readable string.
fn format_memory(bytes: u64) -> String {
    let kb = bytes / 1024;
    if kb < 1024 {
        format!("{kb}K")
    } else if kb < 1024 * 1024 {
        format!("{}M", kb / 1024)
    } else {
        format!("{:.1}G", kb as f64 / (1024.0 * 1024.0))
    }
}

/// Truncate string to max characters (not bytes).
fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}

// ============================================================================
// affinity
// ============================================================================

#[derive(Debug, Serialize)]
struct AffinityReport {
    schema_id: &'static str,
    timestamp: String,
    pid: u32,
    backend: &'static str,
    kind: BackendKind,
    scope: BindScope,
    existing_cpus: u32,
    cpus: Vec<u32>,
}

fn run_affinity(command: AffinityCommand) -> Result<i32, ProcmonError> {
    let (existing_cpus, _) = cpu_counts();
    let host = detect(existing_cpus)?;

    match command {
        AffinityCommand::Get(args) => {
            validate_pid(args.pid)?;
            let Some(cpus) = get_affinity(args.pid, &host) else {
                eprintln!("Error: unable to read CPU affinity of PID {}", args.pid);
                return Ok(exit_codes::FAILURE);
            };

            if args.json {
                let report = AffinityReport {
                    schema_id: AFFINITY_V1,
                    timestamp: current_timestamp(),
                    pid: args.pid,
                    backend: host.backend().name(),
                    kind: host.kind(),
                    scope: host.scope(),
                    existing_cpus,
                    cpus: cpus.iter().copied().collect(),
                };
                print_json(&report)?;
            } else {
                println!("pid {}: {}", args.pid, format_cpu_list(&cpus));
            }
            Ok(exit_codes::SUCCESS)
        }
        AffinityCommand::Set(args) => {
            validate_pid(args.pid)?;
            let cpus: CpuIdSet = args.cpus.parse()?;
            if let Some(id) = cpus.iter().find(|&&id| id >= existing_cpus) {
                return Err(ProcmonError::invalid_argument(format!(
                    "CPU {id} does not exist (host has {existing_cpus})"
                )));
            }

            let listed = format_cpu_list(&cpus);
            if !set_affinity(args.pid, &host, cpus) {
                eprintln!("Error: unable to set CPU affinity of PID {}", args.pid);
                return Ok(exit_codes::FAILURE);
            }
            info!(pid = args.pid, cpus = %listed, "affinity updated");
            println!("pid {}: {}", args.pid, listed);
            Ok(exit_codes::SUCCESS)
        }
    }
}

/// Render ids as a compact list, collapsing runs: `0-3,6`.
fn format_cpu_list(cpus: &CpuIdSet) -> String {
    let mut ids: Vec<u32> = cpus.iter().copied().collect();
    ids.sort_unstable();
    ids.dedup();

    let mut parts = Vec::new();
    let mut iter = ids.into_iter().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
    }
    if parts.is_empty() {
        "(none)".to_string()
    } else {
        parts.join(",")
    }
}

// ============================================================================
// platform
// ============================================================================

#[derive(Debug, Serialize)]
struct HostInfo {
    schema_id: &'static str,
    timestamp: String,
    platform: &'static str,
    existing_cpus: u32,
    active_cpus: u32,
    affinity_backend: Option<&'static str>,
    kernel_version: Option<KernelVersion>,
    process_scan: bool,
    thread_scan: ThreadScanGate,
}

fn run_platform(args: PlatformArgs) -> Result<i32, ProcmonError> {
    let (existing_cpus, active_cpus) = cpu_counts();
    let affinity_backend = detect(existing_cpus)
        .ok()
        .map(|host| host.backend().name());
    let kernel_version = KernelVersion::current();
    let config = ScanConfig::default();

    let info = HostInfo {
        schema_id: HOST_INFO_V1,
        timestamp: current_timestamp(),
        platform: get_platform(),
        existing_cpus,
        active_cpus,
        affinity_backend,
        kernel_version,
        process_scan: procmon_scan::SUPPORTED,
        thread_scan: ThreadScanGate::evaluate(
            config.scan_threads,
            config.thread_scan_blocklist,
            kernel_version,
        ),
    };

    if args.json {
        print_json(&info)?;
    } else {
        println!("Platform: {}", info.platform);
        println!("CPUs: {} existing, {} active", existing_cpus, active_cpus);
        println!("Affinity backend: {}", affinity_backend.unwrap_or("none"));
        match kernel_version {
            Some(v) => println!("Kernel: {v}"),
            None => println!("Kernel: unknown"),
        }
        println!("Thread scan: {:?}", info.thread_scan);
    }
    Ok(exit_codes::SUCCESS)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), ProcmonError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| ProcmonError::internal(format!("JSON serialization failed: {}", e)))?;
    println!("{json}");
    Ok(())
}

/// Parse a duration string like "500ms", "2s", "1m", or just "5" (seconds).
fn parse_duration(s: &str) -> Result<Duration, ProcmonError> {
    let s = s.trim();

    if let Ok(secs) = s.parse::<f64>() {
        if !secs.is_finite() || secs < 0.0 {
            return Err(ProcmonError::invalid_argument(format!(
                "invalid duration '{}': must be a finite, non-negative number",
                s
            )));
        }
        return Ok(Duration::from_secs_f64(secs));
    }

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix("ms") {
        (n, 0.001)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1.0)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60.0)
    } else {
        return Err(ProcmonError::invalid_argument(format!(
            "invalid duration '{}': expected number or number with suffix (ms, s, m)",
            s
        )));
    };

    let num: f64 = num_str.trim().parse().map_err(|_| {
        ProcmonError::invalid_argument(format!("invalid duration '{}': not a valid number", s))
    })?;

    if !num.is_finite() || num < 0.0 {
        return Err(ProcmonError::invalid_argument(format!(
            "invalid duration '{}': must be a finite, non-negative number",
            s
        )));
    }

    Ok(Duration::from_secs_f64(num * multiplier))
}
