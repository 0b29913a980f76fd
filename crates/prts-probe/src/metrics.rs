use std::fs;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::Path;
use std::time::{Duration, Instant};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const UNKNOWN_MAC: &str = "00:00:00:00:00:00";

/// Raw host readings for one report. Fields the host cannot provide are zero or empty.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetricsSample {
    pub load: u32,
    pub memory_usage: u32,
    pub memory_total_mb: u64,
    /// Hardware sensor reading, if the host exposes one.
    pub temperature: Option<f64>,
    pub net_up: f64,
    pub net_down: f64,
    pub ip: String,
    pub mac: String,
    pub interface: String,
    pub os: String,
    pub kernel: String,
    pub uptime: Duration,
}

pub trait MetricsSource: Send {
    fn sample(&mut self) -> MetricsSample;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuTimes {
    pub total: u64,
    pub idle: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Reads `/proc` and `/sys`; on hosts without them every reading degrades to zero.
pub struct SystemMetrics {
    started: Instant,
    prev_cpu: Option<CpuTimes>,
    prev_net: Option<(NetCounters, Instant)>,
}

impl SystemMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            prev_cpu: read_cpu_times(),
            prev_net: read_net_counters().map(|counters| (counters, now)),
        }
    }

    fn cpu_load(&mut self) -> u32 {
        let Some(current) = read_cpu_times() else {
            return 0;
        };
        let load = self
            .prev_cpu
            .map(|prev| cpu_percent(prev, current))
            .unwrap_or(0);
        self.prev_cpu = Some(current);
        load
    }

    fn net_rates(&mut self) -> (f64, f64) {
        let Some(current) = read_net_counters() else {
            return (0.0, 0.0);
        };
        let now = Instant::now();
        let rates = match self.prev_net {
            Some((prev, at)) => {
                let elapsed = now.duration_since(at);
                (
                    rate_mb_per_sec(prev.tx_bytes, current.tx_bytes, elapsed),
                    rate_mb_per_sec(prev.rx_bytes, current.rx_bytes, elapsed),
                )
            }
            None => (0.0, 0.0),
        };
        self.prev_net = Some((current, now));
        rates
    }
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SystemMetrics {
    fn sample(&mut self) -> MetricsSample {
        let load = self.cpu_load();
        let (net_up, net_down) = self.net_rates();
        let (memory_usage, memory_total_mb) = fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|text| parse_meminfo(&text))
            .unwrap_or((0, 0));
        let interface = fs::read_to_string("/proc/net/route")
            .ok()
            .and_then(|text| parse_default_route(&text))
            .unwrap_or_else(|| "unknown".to_string());
        let mac = fs::read_to_string(format!("/sys/class/net/{interface}/address"))
            .map(|text| text.trim().to_string())
            .unwrap_or_else(|_| UNKNOWN_MAC.to_string());
        let kernel = fs::read_to_string("/proc/sys/kernel/osrelease")
            .map(|text| text.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        MetricsSample {
            load,
            memory_usage,
            memory_total_mb,
            temperature: read_thermal_zone(Path::new("/sys/class/thermal")),
            net_up,
            net_down,
            ip: primary_ip().to_string(),
            mac,
            interface,
            os: std::env::consts::OS.to_string(),
            kernel,
            uptime: self.started.elapsed(),
        }
    }
}

/// Busy share of CPU time between two `/proc/stat` readings, 0..=100.
pub fn cpu_percent(prev: CpuTimes, current: CpuTimes) -> u32 {
    let total = current.total.saturating_sub(prev.total);
    if total == 0 {
        return 0;
    }
    let idle = current.idle.saturating_sub(prev.idle).min(total);
    (((total - idle) as f64 / total as f64) * 100.0).round() as u32
}

pub fn rate_mb_per_sec(prev: u64, current: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    current.saturating_sub(prev) as f64 / BYTES_PER_MB / secs
}

pub fn parse_proc_stat(text: &str) -> Option<CpuTimes> {
    let line = text.lines().find(|line| line.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|field| field.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        total: fields.iter().take(8).sum(),
        idle,
    })
}

/// Returns (used percent, total MB).
pub fn parse_meminfo(text: &str) -> Option<(u32, u64)> {
    let mut total_kb = None;
    let mut available_kb = None;
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next().and_then(|v| v.parse::<u64>().ok())) {
            (Some("MemTotal:"), Some(value)) => total_kb = Some(value),
            (Some("MemAvailable:"), Some(value)) => available_kb = Some(value),
            _ => {}
        }
    }
    let total_kb = total_kb.filter(|total| *total > 0)?;
    let available_kb = available_kb.unwrap_or(0).min(total_kb);
    let used = ((total_kb - available_kb) as f64 / total_kb as f64 * 100.0).round() as u32;
    Some((used, total_kb / 1024))
}

/// Sums counters over every interface except loopback.
pub fn parse_net_dev(text: &str) -> Option<NetCounters> {
    let mut counters = NetCounters::default();
    let mut seen = false;
    for line in text.lines().skip(2) {
        let Some((name, values)) = line.split_once(':') else {
            continue;
        };
        if name.trim() == "lo" {
            continue;
        }
        let values: Vec<u64> = values
            .split_whitespace()
            .filter_map(|value| value.parse().ok())
            .collect();
        if values.len() < 9 {
            continue;
        }
        counters.rx_bytes += values[0];
        counters.tx_bytes += values[8];
        seen = true;
    }
    seen.then_some(counters)
}

/// Interface carrying the default route.
pub fn parse_default_route(text: &str) -> Option<String> {
    text.lines().skip(1).find_map(|line| {
        let mut fields = line.split_whitespace();
        let iface = fields.next()?;
        let destination = fields.next()?;
        (destination == "00000000").then(|| iface.to_string())
    })
}

fn read_cpu_times() -> Option<CpuTimes> {
    fs::read_to_string("/proc/stat")
        .ok()
        .and_then(|text| parse_proc_stat(&text))
}

fn read_net_counters() -> Option<NetCounters> {
    fs::read_to_string("/proc/net/dev")
        .ok()
        .and_then(|text| parse_net_dev(&text))
}

/// Prefers a CPU package zone, then the first zone with a non-zero reading.
pub fn read_thermal_zone(root: &Path) -> Option<f64> {
    let mut readings = Vec::new();
    for entry in fs::read_dir(root).ok()?.flatten() {
        let path = entry.path();
        let is_zone = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with("thermal_zone"))
            .unwrap_or(false);
        if !is_zone {
            continue;
        }
        let Some(millis) = fs::read_to_string(path.join("temp"))
            .ok()
            .and_then(|text| text.trim().parse::<f64>().ok())
        else {
            continue;
        };
        if millis <= 0.0 {
            continue;
        }
        let kind = fs::read_to_string(path.join("type"))
            .map(|text| text.trim().to_string())
            .unwrap_or_default();
        readings.push((path, kind, millis / 1000.0));
    }
    readings.sort_by(|a, b| a.0.cmp(&b.0));
    readings
        .iter()
        .find(|(_, kind, _)| matches!(kind.as_str(), "x86_pkg_temp" | "cpu_thermal" | "cpu-thermal"))
        .or_else(|| readings.first())
        .map(|(_, _, celsius)| *celsius)
}

/// Source address the kernel would pick for outbound traffic. No packet is sent.
pub fn primary_ip() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
        Ok(socket.local_addr()?.ip())
    };
    probe().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Stand-in when no sensor exists: 35 °C plus a share of load plus a sub-degree wobble.
pub fn synthetic_temperature(load: u32, unix_secs: i64) -> f64 {
    35.0 + load as f64 * 0.4 + unix_secs.rem_euclid(10) as f64 / 10.0
}

pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let mins = (secs % 3_600) / 60;
    format!("{days}d {hours:02}h {mins:02}m")
}

pub fn node_template(os: &str) -> &'static str {
    match os {
        "windows" => "Windows Desktop Node",
        "macos" => "macOS Node",
        _ => "Standard Linux Node",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_percent_uses_busy_share_of_the_delta() {
        let prev = CpuTimes {
            total: 1_000,
            idle: 800,
        };
        let current = CpuTimes {
            total: 1_200,
            idle: 850,
        };
        assert_eq!(cpu_percent(prev, current), 75);
        assert_eq!(cpu_percent(current, current), 0);
    }

    #[test]
    fn proc_stat_counts_iowait_as_idle() {
        let text = "cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 50 0 25 400 25 0 0 0 0 0\n";
        assert_eq!(
            parse_proc_stat(text),
            Some(CpuTimes {
                total: 1_000,
                idle: 850
            })
        );
        assert_eq!(parse_proc_stat("intr 1 2 3"), None);
    }

    #[test]
    fn meminfo_reports_used_percent_and_total_megabytes() {
        let text = "MemTotal:       16384000 kB\nMemFree:         1000000 kB\nMemAvailable:    4096000 kB\n";
        assert_eq!(parse_meminfo(text), Some((75, 16_000)));
        assert_eq!(parse_meminfo("MemFree: 10 kB"), None);
    }

    #[test]
    fn net_dev_skips_loopback() {
        let text = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 5000      10    0    0    0     0          0         0     5000      10    0    0    0     0       0          0
  eth0: 2048      20    0    0    0     0          0         0     1024      12    0    0    0     0       0          0
 wlan0: 100        1    0    0    0     0          0         0       50       1    0    0    0     0       0          0
";
        assert_eq!(
            parse_net_dev(text),
            Some(NetCounters {
                rx_bytes: 2_148,
                tx_bytes: 1_074
            })
        );
    }

    #[test]
    fn default_route_interface_is_found() {
        let text = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask
docker0\t000011AC\t00000000\t0001\t0\t0\t0\t0000FFFF
eth0\t00000000\t0100A8C0\t0003\t0\t0\t100\t00000000
";
        assert_eq!(parse_default_route(text), Some("eth0".to_string()));
        assert_eq!(parse_default_route("Iface\tDestination\n"), None);
    }

    #[test]
    fn rates_are_megabytes_per_second() {
        let rate = rate_mb_per_sec(0, 2 * 1024 * 1024, Duration::from_secs(2));
        assert!((rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(rate_mb_per_sec(10, 5, Duration::from_secs(1)), 0.0);
        assert_eq!(rate_mb_per_sec(0, 5, Duration::ZERO), 0.0);
    }

    #[test]
    fn synthetic_temperature_stays_in_band() {
        assert!((synthetic_temperature(0, 0) - 35.0).abs() < 1e-9);
        assert!((synthetic_temperature(50, 1_700_000_009) - 55.9).abs() < 1e-9);
        for secs in 0..30 {
            let t = synthetic_temperature(100, secs);
            assert!((75.0..76.0).contains(&t));
        }
    }

    #[test]
    fn uptime_is_days_hours_minutes() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "0d 00h 00m");
        assert_eq!(
            format_uptime(Duration::from_secs(2 * 86_400 + 3 * 3_600 + 4 * 60 + 59)),
            "2d 03h 04m"
        );
    }

    #[test]
    fn thermal_zone_prefers_cpu_package() {
        let dir = std::env::temp_dir().join(format!("prts-thermal-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        for (zone, kind, temp) in [
            ("thermal_zone0", "acpitz", "27800"),
            ("thermal_zone1", "x86_pkg_temp", "48000"),
        ] {
            fs::create_dir_all(dir.join(zone)).expect("zone dir");
            fs::write(dir.join(zone).join("type"), kind).expect("type");
            fs::write(dir.join(zone).join("temp"), temp).expect("temp");
        }
        assert_eq!(read_thermal_zone(&dir), Some(48.0));
        fs::remove_dir_all(&dir).expect("cleanup");
        assert_eq!(read_thermal_zone(&dir), None);
    }
}
