//! Remediation backends.
//!
//! A confirmed attacker is blocked at the host firewall; a false alarm is
//! answered by adding the address to an allow-list file so it is never
//! reported again. Both actions are driven by the operator's answer to an
//! alert.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::RemediationError;

/// Operator's answer to an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemediationChoice {
    Block,
    Whitelist,
}

impl std::fmt::Display for RemediationChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
            Self::Whitelist => write!(f, "whitelist"),
        }
    }
}

impl std::str::FromStr for RemediationChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "block" | "b" => Ok(Self::Block),
            "whitelist" | "w" | "allow" => Ok(Self::Whitelist),
            _ => Err(format!("Invalid remediation choice: {}", s)),
        }
    }
}

/// Host firewall used for blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallBackend {
    /// `iptables` / `ip6tables` INPUT chain DROP rules
    Iptables,
    /// Windows Firewall through `netsh advfirewall`
    Netsh,
    /// Log the block without touching the firewall
    None,
}

impl Default for FirewallBackend {
    fn default() -> Self {
        if cfg!(windows) {
            Self::Netsh
        } else {
            Self::Iptables
        }
    }
}

impl std::fmt::Display for FirewallBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Iptables => write!(f, "iptables"),
            Self::Netsh => write!(f, "netsh"),
            Self::None => write!(f, "none"),
        }
    }
}

impl FirewallBackend {
    /// Command line that installs a drop rule for `address`, if any.
    pub fn block_command(&self, address: IpAddr) -> Option<Vec<String>> {
        let ip = address.to_string();
        match self {
            Self::Iptables => Some(vec![
                iptables_program(address).to_string(),
                "-A".to_string(),
                "INPUT".to_string(),
                "-s".to_string(),
                ip,
                "-j".to_string(),
                "DROP".to_string(),
            ]),
            Self::Netsh => Some(vec![
                "netsh".to_string(),
                "advfirewall".to_string(),
                "firewall".to_string(),
                "add".to_string(),
                "rule".to_string(),
                format!("name=ddos-watch block {}", ip),
                "dir=in".to_string(),
                "action=block".to_string(),
                format!("remoteip={}", ip),
            ]),
            Self::None => None,
        }
    }

    /// Command line that succeeds when a drop rule for `address` already exists.
    fn check_command(&self, address: IpAddr) -> Option<Vec<String>> {
        match self {
            Self::Iptables => Some(vec![
                iptables_program(address).to_string(),
                "-C".to_string(),
                "INPUT".to_string(),
                "-s".to_string(),
                address.to_string(),
                "-j".to_string(),
                "DROP".to_string(),
            ]),
            _ => None,
        }
    }
}

fn iptables_program(address: IpAddr) -> &'static str {
    match address {
        IpAddr::V4(_) => "iptables",
        IpAddr::V6(_) => "ip6tables",
    }
}

/// Runs `argv`, returning whether it exited successfully.
fn run_command(argv: &[String]) -> Result<bool, RemediationError> {
    let Some((program, args)) = argv.split_first() else {
        return Ok(false);
    };

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| RemediationError::Command {
            command: argv.join(" "),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!("'{}' failed ({}): {}", argv.join(" "), output.status, stderr.trim());
    }
    Ok(output.status.success())
}

/// Allow-list file holding one address per line. Blank lines and `#`
/// comments are ignored; unparsable lines are skipped with a warning.
#[derive(Debug)]
pub struct Whitelist {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Whitelist {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every address in the file. A missing file is an empty list.
    pub fn entries(&self) -> Result<BTreeSet<IpAddr>, RemediationError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(source) => {
                return Err(RemediationError::Whitelist {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let mut entries = BTreeSet::new();
        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            match line.parse::<IpAddr>() {
                Ok(ip) => {
                    entries.insert(ip);
                }
                Err(_) => warn!("Ignoring invalid allow-list entry '{}'", line),
            }
        }
        Ok(entries)
    }

    pub fn contains(&self, address: IpAddr) -> bool {
        match self.entries() {
            Ok(entries) => entries.contains(&address),
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    /// Appends `address`. Returns false if it was already listed.
    pub fn add(&self, address: IpAddr) -> Result<bool, RemediationError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.entries()?;
        if !entries.insert(address) {
            return Ok(false);
        }
        self.store(&entries)?;
        Ok(true)
    }

    /// Removes `address`. Returns false if it was not listed.
    pub fn remove(&self, address: IpAddr) -> Result<bool, RemediationError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.entries()?;
        if !entries.remove(&address) {
            return Ok(false);
        }
        self.store(&entries)?;
        Ok(true)
    }

    fn store(&self, entries: &BTreeSet<IpAddr>) -> Result<(), RemediationError> {
        let mut content = String::new();
        for ip in entries {
            content.push_str(&ip.to_string());
            content.push('\n');
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| RemediationError::Whitelist {
                path: self.path.clone(),
                source,
            })?;
        }
        std::fs::write(&self.path, content).map_err(|source| RemediationError::Whitelist {
            path: self.path.clone(),
            source,
        })
    }
}

/// Actions available once an operator has answered an alert.
pub trait Remediator: Send + Sync {
    /// Blocks inbound traffic from `address`. Returns true on success.
    fn block(&self, address: IpAddr) -> bool;

    fn whitelist_add(&self, address: IpAddr) -> Result<(), RemediationError>;

    fn whitelist_remove(&self, address: IpAddr) -> Result<(), RemediationError>;

    fn whitelist_contains(&self, address: IpAddr) -> bool;
}

/// Host firewall plus allow-list file.
#[derive(Debug)]
pub struct FirewallRemediator {
    backend: FirewallBackend,
    whitelist: Whitelist,
}

impl FirewallRemediator {
    pub fn new(backend: FirewallBackend, whitelist_path: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            whitelist: Whitelist::new(whitelist_path),
        }
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }
}

impl Remediator for FirewallRemediator {
    fn block(&self, address: IpAddr) -> bool {
        let Some(argv) = self.backend.block_command(address) else {
            info!("Firewall backend is 'none', not blocking {}", address);
            return true;
        };

        if let Some(check) = self.backend.check_command(address) {
            if let Ok(true) = run_command(&check) {
                info!("{} is already blocked", address);
                return true;
            }
        }

        match run_command(&argv) {
            Ok(true) => {
                info!("Blocked {} with {}", address, self.backend);
                true
            }
            Ok(false) => {
                warn!("Failed to block {} with {}", address, self.backend);
                false
            }
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    fn whitelist_add(&self, address: IpAddr) -> Result<(), RemediationError> {
        if self.whitelist.add(address)? {
            info!("Added {} to the allow-list", address);
        } else {
            debug!("{} is already allow-listed", address);
        }
        Ok(())
    }

    fn whitelist_remove(&self, address: IpAddr) -> Result<(), RemediationError> {
        if self.whitelist.remove(address)? {
            info!("Removed {} from the allow-list", address);
        }
        Ok(())
    }

    fn whitelist_contains(&self, address: IpAddr) -> bool {
        self.whitelist.contains(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_choice_parse() {
        assert_eq!("block".parse::<RemediationChoice>().unwrap(), RemediationChoice::Block);
        assert_eq!(" B \n".parse::<RemediationChoice>().unwrap(), RemediationChoice::Block);
        assert_eq!(
            "Whitelist".parse::<RemediationChoice>().unwrap(),
            RemediationChoice::Whitelist
        );
        assert!("maybe".parse::<RemediationChoice>().is_err());
        assert_eq!(RemediationChoice::Whitelist.to_string(), "whitelist");
    }

    #[test]
    fn test_block_commands() {
        let cmd = FirewallBackend::Iptables.block_command(ip("1.2.3.4")).unwrap();
        assert_eq!(cmd.join(" "), "iptables -A INPUT -s 1.2.3.4 -j DROP");

        let cmd = FirewallBackend::Iptables.block_command(ip("2001:db8::1")).unwrap();
        assert_eq!(cmd[0], "ip6tables");

        let cmd = FirewallBackend::Netsh.block_command(ip("1.2.3.4")).unwrap();
        assert_eq!(cmd[0], "netsh");
        assert!(cmd.contains(&"remoteip=1.2.3.4".to_string()));

        assert!(FirewallBackend::None.block_command(ip("1.2.3.4")).is_none());
    }

    #[test]
    fn test_none_backend_blocks_successfully() {
        let dir = tempfile::tempdir().unwrap();
        let remediator = FirewallRemediator::new(FirewallBackend::None, dir.path().join("wl.txt"));
        assert!(remediator.block(ip("10.0.0.9")));
    }

    #[test]
    fn test_whitelist_add_remove_contains() {
        let dir = tempfile::tempdir().unwrap();
        let remediator =
            FirewallRemediator::new(FirewallBackend::None, dir.path().join("lists/wl.txt"));
        let addr = ip("203.0.113.7");

        assert!(!remediator.whitelist_contains(addr));
        remediator.whitelist_add(addr).unwrap();
        remediator.whitelist_add(addr).unwrap();
        assert!(remediator.whitelist_contains(addr));

        let content = std::fs::read_to_string(remediator.whitelist().path()).unwrap();
        assert_eq!(content, "203.0.113.7\n");

        remediator.whitelist_remove(addr).unwrap();
        assert!(!remediator.whitelist_contains(addr));
        remediator.whitelist_remove(addr).unwrap();
    }

    #[test]
    fn test_whitelist_skips_comments_and_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wl.txt");
        std::fs::write(&path, "# trusted\n10.0.0.1  # gateway\n\nnot-an-ip\n::1\n").unwrap();

        let list = Whitelist::new(&path);
        let entries = list.entries().unwrap();

        assert_eq!(entries.len(), 2);
        assert!(list.contains(ip("10.0.0.1")));
        assert!(list.contains(ip("::1")));
    }
}
