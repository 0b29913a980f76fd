use clap::Parser;
use prts_probe::{
    connect_with_backoff, hub_url, run_session, FirewallProvider, HostFirewall, ProbeAgent,
    ProbeIdentity, ProviderKind, SystemMetrics,
};
use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    identity: ProbeIdentity,
    interval: Duration,
    firewall: ProviderKind,
    connect_attempts: u32,
    debug: bool,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "prts-probe")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    id: String,
    #[arg(long, default_value = "")]
    name: String,
    #[arg(long, default_value = "")]
    region: String,
    #[arg(long, default_value_t = 2)]
    interval: u64,
    #[arg(long, default_value = "")]
    firewall: String,
    #[arg(long, default_value_t = 5)]
    connect_attempts: u32,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("prts-probe: {err}");
            std::process::exit(2);
        }
    };
    let _log_guard = init_logging(&config);
    let url = match hub_url(&config.addr) {
        Ok(url) => url,
        Err(err) => {
            error!(event = "invalid_addr", addr = %config.addr, error = %err);
            std::process::exit(2);
        }
    };

    let provider = HostFirewall::select(config.firewall);
    info!(
        event = "probe_start",
        node_id = %config.identity.id,
        url = %url,
        firewall = provider.name(),
        interval_secs = config.interval.as_secs()
    );
    let agent = ProbeAgent::new(config.identity.clone(), provider, SystemMetrics::new());

    let Some(ws) = connect_with_backoff(&url, config.connect_attempts).await else {
        error!(event = "hub_unreachable", url = %url, attempts = config.connect_attempts);
        std::process::exit(1);
    };

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let end = run_session(ws, &agent, config.interval, shutdown).await;
    info!(event = "probe_stop", reason = ?end, code = end.exit_code());
    std::process::exit(end.exit_code());
}

fn load_config() -> Result<Config, String> {
    let args = Args::parse();
    let debug = args.debug || env_true("PRTS_PROBE_DEBUG");
    let firewall: ProviderKind = resolve_flag(&args.firewall, "PRTS_FIREWALL", "auto").parse()?;
    let id = resolve_flag(&args.id, "PRTS_NODE_ID", &default_node_id());
    Ok(Config {
        addr: resolve_flag(&args.addr, "PRTS_HUB_ADDR", "localhost:8080"),
        identity: ProbeIdentity {
            name: resolve_flag(&args.name, "PRTS_NODE_NAME", &id),
            region: resolve_flag(&args.region, "PRTS_NODE_REGION", "CN-SH"),
            id,
        },
        interval: Duration::from_secs(args.interval.max(1)),
        firewall,
        connect_attempts: args.connect_attempts.max(1),
        debug,
        log_dir: resolve_flag(&args.log_dir, "PRTS_LOG_DIR", ".prts/logs"),
    })
}

fn default_node_id() -> String {
    let host = std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .unwrap_or_else(|| "local".to_string());
    format!("probe-{}", host.to_lowercase())
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("PRTS_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir, &config.identity.id) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str, node_id: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let safe_id: String = node_id
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' { ch } else { '_' })
        .collect();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(format!("prts-probe-{safe_id}.log")))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn resolve_flag(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}
