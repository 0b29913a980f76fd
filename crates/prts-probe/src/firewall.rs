use std::future::Future;
use std::str::FromStr;
use tokio::process::Command;
use tracing::debug;

/// Name of the rule group (Windows) or chain (iptables) owned by the probe.
pub const RULE_GROUP: &str = "PRTS-Honeypot";

const ADMIN_REQUIRED: &str = "Admin privileges required for firewall management";

/// Provider output that only says the managed group is not there yet.
const MISSING_GROUP_PATTERNS: [&str; 4] = [
    "ObjectNotFound",
    "对象未找到",
    "No chain/target/match by that name",
    "does a matching rule exist",
];

pub fn is_missing_group(output: &str) -> bool {
    MISSING_GROUP_PATTERNS
        .iter()
        .any(|pattern| output.contains(pattern))
}

/// Host firewall backend. Errors carry the provider's own output text.
pub trait FirewallProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn check_access(&self) -> impl Future<Output = Result<(), String>> + Send;

    fn enable_group(&self) -> impl Future<Output = Result<(), String>> + Send;

    fn disable_group(&self) -> impl Future<Output = Result<(), String>> + Send;

    /// Removes every entry of the managed group. Entries outside it are never touched.
    fn clear_group(&self) -> impl Future<Output = Result<(), String>> + Send;

    fn apply_deny(&self, targets: &[String]) -> impl Future<Output = Result<(), String>> + Send;

    fn apply_allow(&self, targets: &[String]) -> impl Future<Output = Result<(), String>> + Send;
}

/// Addresses end up inside shell arguments, so only address characters pass.
pub fn validate_targets(targets: &[String]) -> Result<(), String> {
    for target in targets {
        let valid = !target.is_empty()
            && target
                .chars()
                .all(|ch| ch.is_ascii_hexdigit() || matches!(ch, '.' | ':' | '/' | '-'));
        if !valid {
            return Err(format!("invalid rule target: {target}"));
        }
    }
    Ok(())
}

async fn run_command(program: &str, args: &[&str]) -> Result<String, String> {
    debug!(event = "firewall_exec", program, args = %args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|err| format!("{program}: {err}"))?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = format!("{stdout}{stderr}").trim().to_string();
        if combined.is_empty() {
            return Err(format!("{program} exited with {}", output.status));
        }
        return Err(combined);
    }
    Ok(stdout)
}

/// Windows Firewall through `NetSecurity` cmdlets.
#[derive(Debug, Clone, Default)]
pub struct PowerShellProvider;

impl PowerShellProvider {
    pub fn enable_script() -> String {
        format!("Enable-NetFirewallRule -Group '{RULE_GROUP}' -ErrorAction Stop")
    }

    pub fn disable_script() -> String {
        format!("Disable-NetFirewallRule -Group '{RULE_GROUP}' -ErrorAction Stop")
    }

    pub fn clear_script() -> String {
        format!("Remove-NetFirewallRule -Group '{RULE_GROUP}' -ErrorAction SilentlyContinue")
    }

    pub fn rule_script(action: &str, targets: &[String]) -> String {
        let (display, name) = match action {
            "Allow" => ("PRTS Inbound Allow List", "PRTS-Allow-Rules"),
            _ => ("PRTS Inbound Block List", "PRTS-Block-Rules"),
        };
        format!(
            "New-NetFirewallRule -DisplayName '{display}' -Name '{name}' -Direction Inbound \
             -Action {action} -RemoteAddress {} -Group '{RULE_GROUP}' \
             -Description 'Managed by PRTS Honeypot'",
            targets.join(",")
        )
    }

    async fn powershell(script: &str) -> Result<(), String> {
        run_command("powershell", &["-Command", script]).await.map(|_| ())
    }
}

impl FirewallProvider for PowerShellProvider {
    fn name(&self) -> &'static str {
        "powershell"
    }

    async fn check_access(&self) -> Result<(), String> {
        run_command("netsh", &["advfirewall", "show", "currentprofile"])
            .await
            .map(|_| ())
            .map_err(|_| ADMIN_REQUIRED.to_string())
    }

    async fn enable_group(&self) -> Result<(), String> {
        Self::powershell(&Self::enable_script()).await
    }

    async fn disable_group(&self) -> Result<(), String> {
        Self::powershell(&Self::disable_script()).await
    }

    async fn clear_group(&self) -> Result<(), String> {
        Self::powershell(&Self::clear_script()).await
    }

    async fn apply_deny(&self, targets: &[String]) -> Result<(), String> {
        validate_targets(targets)?;
        Self::powershell(&Self::rule_script("Block", targets)).await
    }

    async fn apply_allow(&self, targets: &[String]) -> Result<(), String> {
        validate_targets(targets)?;
        Self::powershell(&Self::rule_script("Allow", targets)).await
    }
}

/// Linux netfilter: a dedicated chain that is jumped to from `INPUT` while enabled.
#[derive(Debug, Clone)]
pub struct IptablesProvider {
    binary: String,
}

impl Default for IptablesProvider {
    fn default() -> Self {
        Self {
            binary: "iptables".to_string(),
        }
    }
}

impl IptablesProvider {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn rule_args(verdict: &str, targets: &[String]) -> Vec<String> {
        let position = if verdict == "ACCEPT" { "-I" } else { "-A" };
        vec![
            position.to_string(),
            RULE_GROUP.to_string(),
            "-s".to_string(),
            targets.join(","),
            "-j".to_string(),
            verdict.to_string(),
        ]
    }

    async fn iptables(&self, args: &[&str]) -> Result<String, String> {
        run_command(&self.binary, args).await
    }

    async fn ensure_chain(&self) -> Result<(), String> {
        match self.iptables(&["-N", RULE_GROUP]).await {
            Ok(_) => Ok(()),
            Err(err) if err.contains("already exists") => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn apply(&self, verdict: &str, targets: &[String]) -> Result<(), String> {
        validate_targets(targets)?;
        self.ensure_chain().await?;
        let args = Self::rule_args(verdict, targets);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.iptables(&args).await.map(|_| ())
    }
}

impl FirewallProvider for IptablesProvider {
    fn name(&self) -> &'static str {
        "iptables"
    }

    async fn check_access(&self) -> Result<(), String> {
        self.iptables(&["-S", "INPUT"])
            .await
            .map(|_| ())
            .map_err(|_| ADMIN_REQUIRED.to_string())
    }

    async fn enable_group(&self) -> Result<(), String> {
        self.ensure_chain().await?;
        if self.iptables(&["-C", "INPUT", "-j", RULE_GROUP]).await.is_ok() {
            return Ok(());
        }
        self.iptables(&["-I", "INPUT", "-j", RULE_GROUP])
            .await
            .map(|_| ())
    }

    async fn disable_group(&self) -> Result<(), String> {
        self.iptables(&["-D", "INPUT", "-j", RULE_GROUP])
            .await
            .map(|_| ())
    }

    async fn clear_group(&self) -> Result<(), String> {
        self.iptables(&["-F", RULE_GROUP]).await.map(|_| ())
    }

    async fn apply_deny(&self, targets: &[String]) -> Result<(), String> {
        self.apply("DROP", targets).await
    }

    async fn apply_allow(&self, targets: &[String]) -> Result<(), String> {
        self.apply("ACCEPT", targets).await
    }
}

/// Accepts everything and touches nothing.
#[derive(Debug, Clone, Default)]
pub struct NoopProvider;

impl FirewallProvider for NoopProvider {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn check_access(&self) -> Result<(), String> {
        Ok(())
    }

    async fn enable_group(&self) -> Result<(), String> {
        Ok(())
    }

    async fn disable_group(&self) -> Result<(), String> {
        Ok(())
    }

    async fn clear_group(&self) -> Result<(), String> {
        Ok(())
    }

    async fn apply_deny(&self, targets: &[String]) -> Result<(), String> {
        debug!(event = "firewall_noop", verdict = "deny", count = targets.len());
        Ok(())
    }

    async fn apply_allow(&self, targets: &[String]) -> Result<(), String> {
        debug!(event = "firewall_noop", verdict = "allow", count = targets.len());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Auto,
    PowerShell,
    Iptables,
    None,
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "" | "auto" => Ok(ProviderKind::Auto),
            "powershell" | "windows" => Ok(ProviderKind::PowerShell),
            "iptables" => Ok(ProviderKind::Iptables),
            "none" | "noop" => Ok(ProviderKind::None),
            other => Err(format!("Unknown firewall provider: {other}")),
        }
    }
}

/// The provider picked at start-up.
#[derive(Debug, Clone)]
pub enum HostFirewall {
    PowerShell(PowerShellProvider),
    Iptables(IptablesProvider),
    Noop(NoopProvider),
}

impl HostFirewall {
    pub fn select(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::PowerShell => HostFirewall::PowerShell(PowerShellProvider),
            ProviderKind::Iptables => HostFirewall::Iptables(IptablesProvider::default()),
            ProviderKind::None => HostFirewall::Noop(NoopProvider),
            ProviderKind::Auto if cfg!(windows) => HostFirewall::PowerShell(PowerShellProvider),
            ProviderKind::Auto if cfg!(target_os = "linux") => {
                HostFirewall::Iptables(IptablesProvider::default())
            }
            ProviderKind::Auto => HostFirewall::Noop(NoopProvider),
        }
    }
}

impl FirewallProvider for HostFirewall {
    fn name(&self) -> &'static str {
        match self {
            HostFirewall::PowerShell(p) => p.name(),
            HostFirewall::Iptables(p) => p.name(),
            HostFirewall::Noop(p) => p.name(),
        }
    }

    async fn check_access(&self) -> Result<(), String> {
        match self {
            HostFirewall::PowerShell(p) => p.check_access().await,
            HostFirewall::Iptables(p) => p.check_access().await,
            HostFirewall::Noop(p) => p.check_access().await,
        }
    }

    async fn enable_group(&self) -> Result<(), String> {
        match self {
            HostFirewall::PowerShell(p) => p.enable_group().await,
            HostFirewall::Iptables(p) => p.enable_group().await,
            HostFirewall::Noop(p) => p.enable_group().await,
        }
    }

    async fn disable_group(&self) -> Result<(), String> {
        match self {
            HostFirewall::PowerShell(p) => p.disable_group().await,
            HostFirewall::Iptables(p) => p.disable_group().await,
            HostFirewall::Noop(p) => p.disable_group().await,
        }
    }

    async fn clear_group(&self) -> Result<(), String> {
        match self {
            HostFirewall::PowerShell(p) => p.clear_group().await,
            HostFirewall::Iptables(p) => p.clear_group().await,
            HostFirewall::Noop(p) => p.clear_group().await,
        }
    }

    async fn apply_deny(&self, targets: &[String]) -> Result<(), String> {
        match self {
            HostFirewall::PowerShell(p) => p.apply_deny(targets).await,
            HostFirewall::Iptables(p) => p.apply_deny(targets).await,
            HostFirewall::Noop(p) => p.apply_deny(targets).await,
        }
    }

    async fn apply_allow(&self, targets: &[String]) -> Result<(), String> {
        match self {
            HostFirewall::PowerShell(p) => p.apply_allow(targets).await,
            HostFirewall::Iptables(p) => p.apply_allow(targets).await,
            HostFirewall::Noop(p) => p.apply_allow(targets).await,
        }
    }
}
