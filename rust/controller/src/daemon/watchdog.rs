//! Monitors the front-end process via its pid file and signals an exit
//! channel when the process disappears, so [`super::run`] can clean up
//! VIPs and exit non-zero for the supervisor to restart the daemon.
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::oneshot;

pub struct Watchdog {
    pid_file: PathBuf,
    poll_interval: Duration,
}

impl Watchdog {
    pub fn new(pid_file: PathBuf, poll_interval: Duration) -> Self {
        Self { pid_file, poll_interval }
    }

    /// Spawns the poll loop; the returned receiver resolves once the
    /// monitored process is gone, or the pid file is missing/malformed.
    pub fn spawn(self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            loop {
                ticker.tick().await;
                if !self.process_alive().await {
                    tracing::warn!(pid_file = %self.pid_file.display(), "monitored process is gone");
                    let _ = tx.send(());
                    return;
                }
            }
        });
        rx
    }

    async fn process_alive(&self) -> bool {
        let Ok(raw) = tokio::fs::read_to_string(&self.pid_file).await else {
            return false;
        };
        let Ok(pid) = raw.trim().parse::<u32>() else {
            return false;
        };
        tokio::fs::metadata(format!("/proc/{pid}")).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn a_missing_pid_file_is_treated_as_a_dead_process() {
        let watchdog = Watchdog::new(PathBuf::from("/nonexistent/pid/file"), Duration::from_millis(1));
        assert!(!watchdog.process_alive().await);
    }

    #[tokio::test]
    async fn the_current_process_reads_as_alive() {
        let pid_file = std::env::temp_dir().join(format!("fleetlb-watchdog-test-{}", std::process::id()));
        tokio::fs::write(&pid_file, std::process::id().to_string()).await.unwrap();
        let watchdog = Watchdog::new(pid_file.clone(), Duration::from_millis(1));
        assert!(watchdog.process_alive().await);
        tokio::fs::remove_file(&pid_file).await.unwrap();
    }
}
