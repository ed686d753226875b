//! Grant/revoke of per-client allow rules via the external packet-filter
//! utilities, with a bounded concurrent-grant budget.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::firewall::{FirewallError, Manager, IPV4_GRANT_PREFIX, IPV6_GRANT_PREFIX};

/// Wait budget for each grant or revoke invocation, covering the
/// packet-filter tool's internal lock.
const TOOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Absolute paths to the packet-filter utilities for both families.
/// ip6tables is flag-compatible with iptables, so rule construction is
/// shared and only the binary differs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolPaths {
    pub iptables: PathBuf,
    pub iptables_save: PathBuf,
    pub iptables_restore: PathBuf,
    pub ip6tables: PathBuf,
    pub ip6tables_save: PathBuf,
    pub ip6tables_restore: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            iptables: "/sbin/iptables".into(),
            iptables_save: "/sbin/iptables-save".into(),
            iptables_restore: "/sbin/iptables-restore".into(),
            ip6tables: "/sbin/ip6tables".into(),
            ip6tables_save: "/sbin/ip6tables-save".into(),
            ip6tables_restore: "/sbin/ip6tables-restore".into(),
        }
    }
}

struct Family {
    tool: PathBuf,
    save: PathBuf,
    restore: PathBuf,
    icmp: &'static str,
    prefix: u8,
}

#[derive(Clone, Copy)]
enum RuleOp {
    Insert,
    Delete,
}

impl RuleOp {
    fn flag(self) -> &'static str {
        match self {
            // Insert rather than append, to sit in front of environment
            // rules and to minimize chain traversal per packet.
            RuleOp::Insert => "--insert",
            RuleOp::Delete => "--delete",
        }
    }
}

/// Manages grants of IP subnet access using iptables and ip6tables.
///
/// The budget is a counting semaphore: a unit is reserved before the
/// allow rules are inserted and returned only once the rules are removed
/// again. Due to the overhead of iptables processing and its impact on
/// measurements, the capacity should be small.
pub struct IpManager {
    budget: Semaphore,
    capacity: u32,
    v4: Family,
    v6: Family,
    saved4: Mutex<Option<Vec<u8>>>,
    saved6: Mutex<Option<Vec<u8>>>,
}

impl IpManager {
    /// Create a manager allowing up to `max_clients` concurrent grants.
    pub fn new(max_clients: usize, tools: ToolPaths) -> Self {
        Self {
            budget: Semaphore::new(max_clients),
            capacity: max_clients as u32,
            v4: Family {
                tool: tools.iptables,
                save: tools.iptables_save,
                restore: tools.iptables_restore,
                icmp: "icmp",
                prefix: IPV4_GRANT_PREFIX,
            },
            v6: Family {
                tool: tools.ip6tables,
                save: tools.ip6tables_save,
                restore: tools.ip6tables_restore,
                icmp: "icmpv6",
                prefix: IPV6_GRANT_PREFIX,
            },
            saved4: Mutex::new(None),
            saved6: Mutex::new(None),
        }
    }

    /// Budget units currently available. Useful for diagnostics.
    pub fn available_permits(&self) -> usize {
        self.budget.available_permits()
    }

    fn family(&self, ip: IpAddr) -> &Family {
        match ip {
            IpAddr::V4(_) => &self.v4,
            IpAddr::V6(_) => &self.v6,
        }
    }

    async fn modify_rules(&self, op: RuleOp, ip: IpAddr) -> Result<(), FirewallError> {
        let family = self.family(ip);
        let run = async {
            for args in client_rules(op, ip, family.prefix) {
                run_tool(&family.tool, &args).await?;
            }
            Ok(())
        };
        tokio::time::timeout(TOOL_TIMEOUT, run)
            .await
            .map_err(|_| FirewallError::Timeout {
                tool: family.tool.display().to_string(),
                timeout_secs: TOOL_TIMEOUT.as_secs(),
            })?
    }

    async fn start_family(
        &self,
        family: &Family,
        snapshot: &Mutex<Option<Vec<u8>>>,
        port: u16,
        device: &str,
    ) -> Result<(), FirewallError> {
        // Save the original rules first so a restore is possible even
        // when installing the managed ruleset fails partway.
        let saved = run_tool(&family.save, &[]).await?;
        *snapshot.lock().expect("snapshot mutex poisoned") = Some(saved);

        let mut commands: Vec<Vec<String>> = vec![
            // Flushing existing rules does not change the default policy.
            vec!["--flush".to_string()],
            // Drop everything by default; the following rules selectively
            // open access where necessary.
            vec!["--policy".to_string(), "INPUT".to_string(), "DROP".to_string()],
        ];

        // Allow all traffic on unmanaged interfaces. This keeps loopback
        // and private-network communication (e.g. intra-container and
        // monitoring traffic) working while only `device` is restricted.
        for name in local_interfaces()? {
            if name != device {
                commands.push(vec![
                    "--append=INPUT".to_string(),
                    format!("--in-interface={name}"),
                    "--protocol=all".to_string(),
                    "--jump=ACCEPT".to_string(),
                ]);
            }
        }

        commands.push(vec![
            "--append=INPUT".to_string(),
            format!("--protocol={}", family.icmp),
            "--jump=ACCEPT".to_string(),
            "--wait".to_string(),
        ]);
        // The envelope service itself.
        commands.push(vec![
            "--append=INPUT".to_string(),
            "--protocol=tcp".to_string(),
            format!("--dport={port}"),
            "--jump=ACCEPT".to_string(),
            "--wait".to_string(),
        ]);
        // DNS.
        commands.push(vec![
            "--append=INPUT".to_string(),
            "--protocol=udp".to_string(),
            "--dport=53".to_string(),
            "--jump=ACCEPT".to_string(),
            "--wait".to_string(),
        ]);
        // Established connections.
        commands.push(vec![
            "--append=INPUT".to_string(),
            "--match=conntrack".to_string(),
            "--ctstate=ESTABLISHED,RELATED".to_string(),
            "--jump=ACCEPT".to_string(),
            "--wait".to_string(),
        ]);
        // Reject, not drop, so refused clients get a signal.
        commands.push(vec![
            "--append=INPUT".to_string(),
            "--jump=REJECT".to_string(),
            "--wait".to_string(),
        ]);

        for args in commands {
            run_tool(&family.tool, &args).await?;
        }
        Ok(())
    }

    async fn restore_family(
        &self,
        family: &Family,
        snapshot: &Mutex<Option<Vec<u8>>>,
    ) -> Result<Vec<u8>, FirewallError> {
        let rules = snapshot
            .lock()
            .expect("snapshot mutex poisoned")
            .take()
            .ok_or(FirewallError::NotStarted)?;
        restore_rules(&family.restore, &rules).await
    }
}

#[async_trait]
impl Manager for IpManager {
    async fn start(&self, port: u16, device: &str) -> Result<(), FirewallError> {
        self.start_family(&self.v4, &self.saved4, port, device).await?;
        self.start_family(&self.v6, &self.saved6, port, device).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<Vec<u8>, FirewallError> {
        let mut output = self.restore_family(&self.v4, &self.saved4).await?;
        output.extend(self.restore_family(&self.v6, &self.saved6).await?);
        Ok(output)
    }

    async fn grant(&self, ip: IpAddr) -> Result<(), FirewallError> {
        let permit = self
            .budget
            .try_acquire()
            .map_err(|_| FirewallError::MaxConcurrent)?;
        permit.forget();
        if let Err(err) = self.modify_rules(RuleOp::Insert, ip).await {
            // The tool cannot both add a rule and exit non-zero, so the
            // reservation can be returned safely.
            self.budget.add_permits(1);
            return Err(err);
        }
        Ok(())
    }

    async fn revoke(&self, ip: IpAddr) -> Result<(), FirewallError> {
        self.modify_rules(RuleOp::Delete, ip).await?;
        // Release only after the delete succeeds: a failed delete is a
        // live leaked rule and the budget must keep reflecting it.
        self.budget.add_permits(1);
        Ok(())
    }

    async fn drain(&self) {
        if let Ok(permits) = self.budget.acquire_many(self.capacity).await {
            drop(permits);
        }
    }
}

fn client_rules(op: RuleOp, ip: IpAddr, prefix: u8) -> [Vec<String>; 3] {
    let chain = format!("{}=INPUT", op.flag());
    [
        vec![
            "--wait".to_string(),
            chain.clone(),
            format!("--source={ip}/{prefix}"),
            "--jump=ACCEPT".to_string(),
        ],
        vec![
            "--wait".to_string(),
            chain.clone(),
            "--protocol=tcp".to_string(),
            "--dport=80".to_string(),
            "--jump=ACCEPT".to_string(),
        ],
        vec![
            "--wait".to_string(),
            chain,
            "--protocol=tcp".to_string(),
            "--dport=443".to_string(),
            "--jump=ACCEPT".to_string(),
        ],
    ]
}

async fn run_tool(tool: &Path, args: &[String]) -> Result<Vec<u8>, FirewallError> {
    let output = Command::new(tool).args(args).output().await?;
    if !output.status.success() {
        return Err(FirewallError::Tool {
            tool: tool.display().to_string(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

async fn restore_rules(tool: &Path, rules: &[u8]) -> Result<Vec<u8>, FirewallError> {
    let mut child = Command::new(tool)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    {
        let mut stdin = child.stdin.take().expect("stdin is piped");
        stdin.write_all(rules).await?;
    }
    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(FirewallError::Tool {
            tool: tool.display().to_string(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

fn local_interfaces() -> Result<BTreeSet<String>, FirewallError> {
    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
    Ok(addrs.map(|ifaddr| ifaddr.interface_name).collect())
}
