//! Host resource metrics for the keepalive snapshot.

use crate::error::Result;

/// Memory figures in MiB, as published in the keepalive batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_mib: u64,
    pub used_mib: u64,
    pub free_mib: u64,
}

/// Reads current memory figures from the kernel.
pub fn memory() -> Result<MemoryStats> {
    let text = std::fs::read_to_string("/proc/meminfo")?;
    Ok(parse_meminfo(&text))
}

/// Reads the 1-minute load average.
pub fn load_average() -> Result<f64> {
    let text = std::fs::read_to_string("/proc/loadavg")?;
    Ok(parse_loadavg(&text))
}

/// Aggregate network byte counters across physical interfaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Reads aggregate interface counters, excluding loopback.
pub fn network() -> Result<NetworkStats> {
    let text = std::fs::read_to_string("/proc/net/dev")?;
    Ok(parse_netdev(&text))
}

fn parse_netdev(text: &str) -> NetworkStats {
    let mut stats = NetworkStats::default();
    for line in text.lines().skip(2) {
        let Some((name, fields)) = line.split_once(':') else {
            continue;
        };
        if name.trim() == "lo" {
            continue;
        }
        let fields: Vec<&str> = fields.split_whitespace().collect();
        // Receive bytes is field 0, transmit bytes field 8.
        stats.rx_bytes += fields.first().and_then(|v| v.parse().ok()).unwrap_or(0);
        stats.tx_bytes += fields.get(8).and_then(|v| v.parse().ok()).unwrap_or(0);
    }
    stats
}

fn parse_meminfo(text: &str) -> MemoryStats {
    let mut total_kib = 0u64;
    let mut available_kib = 0u64;
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => total_kib = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0),
            Some("MemAvailable:") => {
                available_kib = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            }
            _ => {}
        }
    }
    let total_mib = total_kib / 1024;
    let free_mib = available_kib / 1024;
    MemoryStats {
        total_mib,
        used_mib: total_mib.saturating_sub(free_mib),
        free_mib,
    }
}

fn parse_loadavg(text: &str) -> f64 {
    text.split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo() {
        let text = "MemTotal:       16314160 kB\nMemFree:         825912 kB\nMemAvailable:    8123456 kB\nBuffers:         411024 kB\n";
        let stats = parse_meminfo(text);
        assert_eq!(stats.total_mib, 15931);
        assert_eq!(stats.free_mib, 7933);
        assert_eq!(stats.used_mib, 15931 - 7933);
    }

    #[test]
    fn test_parse_loadavg() {
        assert!((parse_loadavg("0.52 0.58 0.59 1/389 12345\n") - 0.52).abs() < f64::EPSILON);
        assert!(parse_loadavg("") < f64::EPSILON);
    }

    #[test]
    fn test_parse_netdev_skips_loopback() {
        let text = "Inter-|   Receive                                                |  Transmit\n face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n    lo: 1000    10    0    0    0     0          0         0     1000    10    0    0    0     0       0          0\n  eth0: 500000  400    0    0    0     0          0         0   250000   300    0    0    0     0       0          0\n  eth1: 100     1    0    0    0     0          0         0       50     1    0    0    0     0       0          0\n";
        let stats = parse_netdev(text);
        assert_eq!(stats.rx_bytes, 500_100);
        assert_eq!(stats.tx_bytes, 250_050);
    }

    #[test]
    fn test_live_reads_do_not_error_on_linux() {
        assert!(memory().is_ok());
        assert!(load_average().is_ok());
        assert!(network().is_ok());
    }
}
