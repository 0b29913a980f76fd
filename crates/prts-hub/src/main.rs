use clap::Parser;
use prts_core::wire::DEFAULT_MAX_FRAME_BYTES;
use prts_hub::{app, AppState, Hub, MessageRouter, OffsetClock, RuleSync};
use prts_storage::{FleetStore, SqliteStore, SETTING_TIME_OFFSET};
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    db_path: String,
    debug: bool,
    sweep_interval: Duration,
    queue_capacity: usize,
    write_timeout: Duration,
    resync_delay: Duration,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "prts-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    db: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 60)]
    sweep_interval: u64,
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 500)]
    resync_delay_ms: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            std::process::exit(2);
        }
    };

    let store = match SqliteStore::open(&config.db_path) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(event = "store_open_error", path = %config.db_path, error = %err);
            std::process::exit(1);
        }
    };
    match store.mark_all_nodes_offline() {
        Ok(reset) => info!(event = "nodes_reset_offline", count = reset),
        Err(err) => warn!(event = "nodes_reset_error", error = %err),
    }

    let clock = Arc::new(OffsetClock::new(load_time_offset(store.as_ref())));
    let (hub, events) = Hub::new(config.queue_capacity);
    let hub = Arc::new(hub);
    let rules = Arc::new(RuleSync::new(
        hub.clone(),
        store.clone(),
        clock.clone(),
        config.sweep_interval,
    ));
    let router = Arc::new(MessageRouter::new(
        hub.clone(),
        store.clone(),
        clock.clone(),
        rules.clone(),
        config.resync_delay,
        DEFAULT_MAX_FRAME_BYTES,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync_task = rules.clone().spawn(shutdown_rx);
    let router_task = tokio::spawn(router.clone().run(events));

    let state = AppState {
        hub: hub.clone(),
        router,
        rules,
        store,
        clock: clock.clone(),
        write_timeout: config.write_timeout,
        max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            std::process::exit(1);
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        db = %config.db_path,
        time_offset_nanos = clock.offset_nanos(),
        sweep_secs = config.sweep_interval.as_secs()
    );

    let shutdown_hub = hub.clone();
    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown");
        shutdown_hub.close_all().await;
    };

    if let Err(err) = axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "hub_error", error = %err);
    }

    shutdown_tx.send_replace(true);
    let _ = sync_task.await;
    router_task.abort();
    info!(event = "hub_stop");
}

fn load_time_offset(store: &dyn FleetStore) -> i64 {
    match store.setting(SETTING_TIME_OFFSET) {
        Ok(Some(value)) => value.trim().parse().unwrap_or_else(|_| {
            warn!(event = "time_offset_invalid", value = %value);
            0
        }),
        Ok(None) => 0,
        Err(err) => {
            warn!(event = "time_offset_load_error", error = %err);
            0
        }
    }
}

fn load_config() -> Config {
    let args = Args::parse();
    let debug = args.debug || env_true("PRTS_HUB_DEBUG");
    Config {
        addr: resolve_flag(&args.addr, "PRTS_HUB_ADDR", "0.0.0.0:8080"),
        db_path: resolve_flag(&args.db, "PRTS_DB", "prts.db"),
        debug,
        sweep_interval: Duration::from_secs(args.sweep_interval.max(1)),
        queue_capacity: args.queue_capacity.max(1),
        write_timeout: Duration::from_secs(args.write_timeout.max(1)),
        resync_delay: Duration::from_millis(args.resync_delay_ms),
        log_dir: resolve_flag(&args.log_dir, "PRTS_LOG_DIR", ".prts/logs"),
    }
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
    let writer = match open_log_file(&config.log_dir) {
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

/// Duplicates log output to stdout and the optional log file.
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

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("prts-hub.log"))?;
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
