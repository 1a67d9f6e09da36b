//! Tracks the set of virtual IPs the daemon's frontend is currently
//! serving and ensures the local interface carries exactly that set,
//! shelling out to the `ip` command the way a lightweight VIP daemon
//! does when no netlink bindings are available.
use snafu::{ResultExt, Snafu};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use tokio::process::Command;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to run `ip addr {action}` for {address} on {interface}"))]
    Exec {
        action: &'static str,
        address: Ipv4Addr,
        interface: String,
        source: std::io::Error,
    },
    #[snafu(display("`ip addr {action}` for {address} on {interface} exited with status {status}"))]
    Failed {
        action: &'static str,
        address: Ipv4Addr,
        interface: String,
        status: std::process::ExitStatus,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// The addresses currently ensured on `interface`. Reconciling against a
/// fresh desired set only issues `ip addr add/del` for the delta.
pub struct VipSet {
    interface: String,
    current: HashSet<Ipv4Addr>,
}

impl VipSet {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            current: HashSet::new(),
        }
    }

    pub fn current(&self) -> &HashSet<Ipv4Addr> {
        &self.current
    }

    /// Adds addresses newly in `desired` and removes ones no longer
    /// there.
    pub async fn reconcile(&mut self, desired: &HashSet<Ipv4Addr>) -> Result<()> {
        for address in desired.difference(&self.current).copied().collect::<Vec<_>>() {
            self.ensure(address).await?;
        }
        for address in self.current.difference(desired).copied().collect::<Vec<_>>() {
            self.remove(address).await?;
        }
        Ok(())
    }

    pub async fn ensure(&mut self, address: Ipv4Addr) -> Result<()> {
        if self.current.contains(&address) {
            return Ok(());
        }
        run_ip_addr("add", address, &self.interface).await?;
        self.current.insert(address);
        Ok(())
    }

    pub async fn remove(&mut self, address: Ipv4Addr) -> Result<()> {
        if !self.current.remove(&address) {
            return Ok(());
        }
        run_ip_addr("del", address, &self.interface).await
    }

    /// Removes every currently-held address; run on watchdog-triggered
    /// shutdown so the daemon does not leave stale VIPs claimed.
    pub async fn clear(&mut self) -> Result<()> {
        for address in self.current.clone() {
            self.remove(address).await?;
        }
        Ok(())
    }
}

async fn run_ip_addr(action: &'static str, address: Ipv4Addr, interface: &str) -> Result<()> {
    let status = Command::new("ip")
        .args(["addr", action, &format!("{address}/32"), "dev", interface])
        .status()
        .await
        .context(ExecSnafu {
            action,
            address,
            interface: interface.to_string(),
        })?;
    if !status.success() {
        return FailedSnafu {
            action,
            address,
            interface: interface.to_string(),
            status,
        }
        .fail();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_is_idempotent_in_the_tracked_set() {
        let set = VipSet::new("eth0");
        assert!(set.current().is_empty());
    }
}
