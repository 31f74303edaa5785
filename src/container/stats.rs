//! Resource statistics collection

use bollard::container::{CPUStats, MemoryStats, StatsOptions};
use futures_util::StreamExt;

use crate::error::{BackplaneError, Result};

use super::manager::ContainerManager;

/// One sample of a container's resource usage
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ContainerStats {
    pub cpu_pct: f64,
    pub mem_usage: u64,
    pub mem_limit: u64,
    pub mem_pct: f64,
    pub net_rx: u64,
    pub net_tx: u64,
    pub block_read: u64,
    pub block_write: u64,
}

impl ContainerManager {
    /// Take a single stats sample from the user's container
    pub async fn get_container_stats(&self, user_id: &str) -> Result<ContainerStats> {
        let info = self
            .get_by_user(user_id)
            .ok_or_else(|| BackplaneError::ContainerNotFound(user_id.to_string()))?;

        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };

        let mut stream = self.docker().stats(&info.container_name, Some(options));

        let sample = match stream.next().await {
            Some(Ok(stats)) => stats,
            Some(Err(e)) => return Err(BackplaneError::Docker(e)),
            None => {
                return Err(BackplaneError::StreamError(
                    "stats stream ended without a sample".to_string(),
                ))
            }
        };

        let cpu_pct = calculate_cpu(&sample.cpu_stats, &sample.precpu_stats);
        let (mem_usage, mem_limit, mem_pct) = calculate_memory(&sample.memory_stats);
        let (net_rx, net_tx) = calculate_network(&sample.networks);
        let (block_read, block_write) =
            calculate_blkio(&sample.blkio_stats.io_service_bytes_recursive);

        Ok(ContainerStats {
            cpu_pct,
            mem_usage,
            mem_limit,
            mem_pct,
            net_rx,
            net_tx,
            block_read,
            block_write,
        })
    }
}

/// CPU percentage: (container delta / system delta) * online CPUs * 100
fn calculate_cpu(current: &CPUStats, previous: &CPUStats) -> f64 {
    let cpu_delta = current
        .cpu_usage
        .total_usage
        .saturating_sub(previous.cpu_usage.total_usage);
    let system_delta = current
        .system_cpu_usage
        .unwrap_or(0)
        .saturating_sub(previous.system_cpu_usage.unwrap_or(0));

    if cpu_delta == 0 || system_delta == 0 {
        return 0.0;
    }

    let cpus = current.online_cpus.unwrap_or(1) as f64;
    let raw = (cpu_delta as f64 / system_delta as f64) * cpus * 100.0;
    raw.min(100.0 * cpus)
}

fn calculate_memory(stats: &MemoryStats) -> (u64, u64, f64) {
    let usage = stats.usage.unwrap_or(0);
    let limit = stats.limit.unwrap_or(0);
    let pct = if limit > 0 {
        (usage as f64 / limit as f64) * 100.0
    } else {
        0.0
    };
    (usage, limit, pct)
}

fn calculate_network(
    networks: &Option<std::collections::HashMap<String, bollard::container::NetworkStats>>,
) -> (u64, u64) {
    let mut rx = 0u64;
    let mut tx = 0u64;

    if let Some(nets) = networks {
        for stats in nets.values() {
            rx += stats.rx_bytes;
            tx += stats.tx_bytes;
        }
    }

    (rx, tx)
}

fn calculate_blkio(
    entries: &Option<Vec<bollard::container::BlkioStatsEntry>>,
) -> (u64, u64) {
    let mut read = 0u64;
    let mut write = 0u64;

    if let Some(entries) = entries {
        for entry in entries {
            // cgroup v1 capitalizes the op, v2 does not
            match entry.op.to_ascii_lowercase().as_str() {
                "read" => read += entry.value,
                "write" => write += entry.value,
                _ => {}
            }
        }
    }

    (read, write)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    // bollard's stats structs don't derive Default, so build zeroed fixtures by hand.
    fn zero_cpu_stats() -> CPUStats {
        CPUStats {
            cpu_usage: bollard::container::CPUUsage {
                percpu_usage: None,
                usage_in_usermode: 0,
                total_usage: 0,
                usage_in_kernelmode: 0,
            },
            system_cpu_usage: None,
            online_cpus: None,
            throttling_data: bollard::container::ThrottlingData {
                periods: 0,
                throttled_periods: 0,
                throttled_time: 0,
            },
        }
    }

    fn zero_memory_stats() -> MemoryStats {
        MemoryStats {
            stats: None,
            max_usage: None,
            usage: None,
            failcnt: None,
            limit: None,
            commit: None,
            commit_peak: None,
            commitbytes: None,
            commitpeakbytes: None,
            privateworkingset: None,
        }
    }

    fn zero_network_stats() -> bollard::container::NetworkStats {
        bollard::container::NetworkStats {
            rx_dropped: 0,
            rx_bytes: 0,
            rx_errors: 0,
            tx_packets: 0,
            tx_dropped: 0,
            rx_packets: 0,
            tx_errors: 0,
            tx_bytes: 0,
        }
    }

    #[test]
    fn test_calculate_cpu() {
        let mut current = zero_cpu_stats();
        current.cpu_usage.total_usage = 200_000_000;
        current.system_cpu_usage = Some(1_000_000_000);
        current.online_cpus = Some(4);

        let mut previous = zero_cpu_stats();
        previous.cpu_usage.total_usage = 100_000_000;
        previous.system_cpu_usage = Some(500_000_000);

        // (100M / 500M) * 4 * 100 = 80%
        let cpu = calculate_cpu(&current, &previous);
        assert!((cpu - 80.0).abs() < 0.1);
    }

    #[test]
    fn test_calculate_cpu_no_delta() {
        let current = zero_cpu_stats();
        let previous = zero_cpu_stats();
        assert_eq!(calculate_cpu(&current, &previous), 0.0);
    }

    #[test]
    fn test_calculate_memory_pct() {
        let mut stats = zero_memory_stats();
        stats.usage = Some(512 * 1024 * 1024);
        stats.limit = Some(2 * 1024 * 1024 * 1024);

        let (usage, limit, pct) = calculate_memory(&stats);
        assert_eq!(usage, 512 * 1024 * 1024);
        assert_eq!(limit, 2 * 1024 * 1024 * 1024);
        assert!((pct - 25.0).abs() < 0.001);
    }

    #[test]
    fn test_calculate_network_sums_interfaces() {
        let mut networks = HashMap::new();

        let mut eth0 = zero_network_stats();
        eth0.rx_bytes = 1000;
        eth0.tx_bytes = 2000;
        networks.insert("eth0".to_string(), eth0);

        let mut eth1 = zero_network_stats();
        eth1.rx_bytes = 500;
        eth1.tx_bytes = 1000;
        networks.insert("eth1".to_string(), eth1);

        let (rx, tx) = calculate_network(&Some(networks));
        assert_eq!(rx, 1500);
        assert_eq!(tx, 3000);
    }

    #[test]
    fn test_calculate_blkio_is_case_insensitive() {
        let entries = vec![
            bollard::container::BlkioStatsEntry {
                major: 8,
                minor: 0,
                op: "Read".to_string(),
                value: 4096,
            },
            bollard::container::BlkioStatsEntry {
                major: 8,
                minor: 0,
                op: "write".to_string(),
                value: 8192,
            },
            bollard::container::BlkioStatsEntry {
                major: 8,
                minor: 0,
                op: "Total".to_string(),
                value: 12288,
            },
        ];

        let (read, write) = calculate_blkio(&Some(entries));
        assert_eq!(read, 4096);
        assert_eq!(write, 8192);
    }
}
