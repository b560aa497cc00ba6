//! Sender frequency analysis over a capture file.
//!
//! Used to name the suspect behind an alarm (the busiest non-local sender in
//! the snapshot) and by the `senders` subcommand to print a top-N report.
//!
//! Attributing an attack to the single most frequent sender is a heuristic:
//! a busy but legitimate peer will be named if the real flood is spread over
//! many spoofed addresses.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use etherparse::{NetSlice, SlicedPacket};
use pcap::{Capture, Device};
use serde::Serialize;
use tracing::{debug, trace, warn};

/// Per-sender packet count, in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct SenderFrequency {
    counts: Vec<SenderCount>,
    index: HashMap<IpAddr, usize>,
    total: u64,
}

/// One row of the sender report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SenderCount {
    #[serde(rename = "IpAddress")]
    pub address: IpAddr,
    #[serde(rename = "RequestCount")]
    pub count: u64,
}

impl SenderFrequency {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts `senders`, skipping any address in `local`.
    pub fn from_senders<I>(senders: I, local: &HashSet<IpAddr>) -> Self
    where
        I: IntoIterator<Item = IpAddr>,
    {
        let mut freq = Self::new();
        for ip in senders {
            if !local.contains(&ip) {
                freq.record(ip);
            }
        }
        freq
    }

    /// Reads every packet of the capture at `path` and counts IP sources.
    pub fn from_pcap(path: &Path, local: &HashSet<IpAddr>) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("PCAP file not found: {}", path.display());
        }

        let mut cap = Capture::from_file(path)
            .with_context(|| format!("Failed to open PCAP file: {}", path.display()))?;
        let link = LinkLayer::from_datalink(cap.get_datalink().0);

        let mut freq = Self::new();
        let mut skipped = 0u64;

        while let Ok(packet) = cap.next_packet() {
            match source_address(link, packet.data) {
                Some(ip) if !local.contains(&ip) => freq.record(ip),
                Some(_) => {}
                None => skipped += 1,
            }
        }

        debug!(
            "Counted {} packets from {} senders in {} ({} non-IP skipped)",
            freq.total,
            freq.counts.len(),
            path.display(),
            skipped
        );
        Ok(freq)
    }

    pub fn record(&mut self, address: IpAddr) {
        self.total += 1;
        match self.index.get(&address) {
            Some(&i) => self.counts[i].count += 1,
            None => {
                self.index.insert(address, self.counts.len());
                self.counts.push(SenderCount { address, count: 1 });
            }
        }
    }

    /// The busiest sender; the earliest seen wins a tie.
    pub fn most_frequent(&self) -> Option<SenderCount> {
        let mut best: Option<SenderCount> = None;
        for entry in &self.counts {
            if best.map_or(true, |b| entry.count > b.count) {
                best = Some(*entry);
            }
        }
        best
    }

    /// The `n` busiest senders, busiest first, ties in first-seen order.
    pub fn top(&self, n: usize) -> Vec<SenderCount> {
        let mut sorted = self.counts.clone();
        sorted.sort_by(|a, b| b.count.cmp(&a.count));
        sorted.truncate(n);
        sorted
    }

    pub fn count_of(&self, address: IpAddr) -> u64 {
        self.index
            .get(&address)
            .map(|&i| self.counts[i].count)
            .unwrap_or(0)
    }

    /// Packets counted across all non-local senders.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkLayer {
    Ethernet,
    RawIp,
    LinuxSll,
}

impl LinkLayer {
    fn from_datalink(linktype: i32) -> Self {
        match linktype {
            // DLT_RAW variants, LINKTYPE_IPV4, LINKTYPE_IPV6
            12 | 14 | 101 | 228 | 229 => Self::RawIp,
            113 => Self::LinuxSll,
            1 => Self::Ethernet,
            other => {
                trace!("Unknown link type {}, assuming Ethernet", other);
                Self::Ethernet
            }
        }
    }
}

fn source_address(link: LinkLayer, data: &[u8]) -> Option<IpAddr> {
    let sliced = match link {
        LinkLayer::Ethernet => SlicedPacket::from_ethernet(data).ok()?,
        LinkLayer::RawIp => SlicedPacket::from_ip(data).ok()?,
        LinkLayer::LinuxSll => SlicedPacket::from_linux_sll(data).ok()?,
    };

    match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => Some(IpAddr::from(ipv4.header().source())),
        Some(NetSlice::Ipv6(ipv6)) => Some(IpAddr::from(ipv6.header().source())),
        _ => None,
    }
}

/// Addresses that belong to this host: every interface address known to
/// pcap, loopback, and `extra`.
pub fn local_addresses(extra: &[IpAddr]) -> HashSet<IpAddr> {
    let mut local: HashSet<IpAddr> = extra.iter().copied().collect();
    local.insert(IpAddr::from([127, 0, 0, 1]));
    local.insert(IpAddr::from(std::net::Ipv6Addr::LOCALHOST));

    match Device::list() {
        Ok(devices) => {
            for device in devices {
                local.extend(device.addresses.iter().map(|a| a.addr));
            }
        }
        Err(e) => warn!("Could not enumerate interface addresses: {}", e),
    }

    local
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn ips(list: &[&str]) -> Vec<IpAddr> {
        list.iter().map(|s| ip(s)).collect()
    }

    #[test]
    fn test_most_frequent_excludes_local() {
        let local: HashSet<IpAddr> = [ip("192.168.1.10")].into_iter().collect();
        let senders = ips(&[
            "192.168.1.10",
            "192.168.1.10",
            "192.168.1.10",
            "10.0.0.5",
            "10.0.0.7",
            "10.0.0.5",
        ]);

        let freq = SenderFrequency::from_senders(senders, &local);
        let top = freq.most_frequent().unwrap();

        assert_eq!(top.address, ip("10.0.0.5"));
        assert_eq!(top.count, 2);
        assert_eq!(freq.count_of(ip("192.168.1.10")), 0);
        assert_eq!(freq.total(), 3);
    }

    #[test]
    fn test_tie_goes_to_first_seen() {
        let senders = ips(&["10.0.0.7", "10.0.0.5", "10.0.0.5", "10.0.0.7"]);
        let freq = SenderFrequency::from_senders(senders, &HashSet::new());
        assert_eq!(freq.most_frequent().unwrap().address, ip("10.0.0.7"));
    }

    #[test]
    fn test_only_local_traffic_has_no_suspect() {
        let local: HashSet<IpAddr> = [ip("10.0.0.1")].into_iter().collect();
        let freq = SenderFrequency::from_senders(ips(&["10.0.0.1", "10.0.0.1"]), &local);
        assert!(freq.is_empty());
        assert!(freq.most_frequent().is_none());
    }

    #[test]
    fn test_top_n_ordering() {
        let senders = ips(&["1.1.1.1", "2.2.2.2", "3.3.3.3", "3.3.3.3", "2.2.2.2", "4.4.4.4"]);
        let freq = SenderFrequency::from_senders(senders, &HashSet::new());

        let top = freq.top(3);
        assert_eq!(
            top.iter().map(|c| c.address).collect::<Vec<_>>(),
            ips(&["2.2.2.2", "3.3.3.3", "1.1.1.1"])
        );
        assert_eq!(freq.top(10).len(), 4);
    }

    #[test]
    fn test_report_json_shape() {
        let freq = SenderFrequency::from_senders(ips(&["1.1.1.1"]), &HashSet::new());
        let json = serde_json::to_string(&freq.top(1)).unwrap();
        assert_eq!(json, r#"[{"IpAddress":"1.1.1.1","RequestCount":1}]"#);
    }

    #[test]
    fn test_source_address_from_ethernet_frame() {
        let mut frame = vec![0u8; 14 + 20];
        frame[12] = 0x08; // ethertype IPv4
        let ip_header = &mut frame[14..];
        ip_header[0] = 0x45;
        ip_header[3] = 20; // total length
        ip_header[8] = 64;
        ip_header[9] = 253; // experimental, no transport header
        ip_header[12..16].copy_from_slice(&[198, 51, 100, 23]);
        ip_header[16..20].copy_from_slice(&[10, 0, 0, 1]);

        assert_eq!(
            source_address(LinkLayer::Ethernet, &frame),
            Some(ip("198.51.100.23"))
        );
        assert_eq!(source_address(LinkLayer::RawIp, &frame[14..]), Some(ip("198.51.100.23")));
        assert_eq!(source_address(LinkLayer::Ethernet, &[0u8; 4]), None);
    }

    #[test]
    fn test_from_pcap_counts_sources() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merged.pcap");
        crate::testutil::write_pcap(
            &path,
            &[[10, 0, 0, 1], [198, 51, 100, 7], [203, 0, 113, 5], [203, 0, 113, 5]],
        );
        let local: HashSet<IpAddr> = [ip("10.0.0.1")].into_iter().collect();

        let freq = SenderFrequency::from_pcap(&path, &local).unwrap();

        assert_eq!(freq.total(), 3);
        assert_eq!(freq.most_frequent().unwrap().address, ip("203.0.113.5"));
    }

    #[test]
    fn test_from_pcap_missing_file() {
        let missing = SenderFrequency::from_pcap(Path::new("/nonexistent.pcap"), &HashSet::new());
        assert!(missing.is_err());
    }

    #[test]
    fn test_local_addresses_include_loopback_and_extra() {
        let local = local_addresses(&[ip("192.0.2.1")]);
        assert!(local.contains(&ip("127.0.0.1")));
        assert!(local.contains(&ip("192.0.2.1")));
    }
}
