//! Address grouper
//!
//! Splits a tag address list into maximal contiguous same-device runs so
//! the PLC connection can batch-read each run in a single MC3E frame.
//! PLC round-trip time dominates performance; this decomposition is an
//! algorithm, not an optimisation — a naive per-address read would miss
//! the latency target entirely.

use super::address::{DeviceAddress, DeviceCode};
use std::collections::HashSet;

/// A maximal contiguous run of same-device addresses, offsets increasing by
/// exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRun {
    pub device: DeviceCode,
    pub start_offset: u32,
    pub count: u32,
}

impl AddressRun {
    /// The addresses covered by this run, in ascending offset order.
    pub fn addresses(&self) -> impl Iterator<Item = DeviceAddress> + '_ {
        (0..self.count).map(move |i| DeviceAddress::new(self.device, self.start_offset + i))
    }
}

/// Group a tag address list into maximal contiguous runs.
///
/// Duplicate addresses are deduplicated, keeping the first occurrence.
/// An empty input returns no runs — callers must treat this as success with
/// an empty result map, not an error.
pub fn group_addresses(addresses: &[DeviceAddress]) -> Vec<AddressRun> {
    let mut seen = HashSet::new();
    let mut deduped = Vec::with_capacity(addresses.len());
    for addr in addresses {
        if seen.insert(*addr) {
            deduped.push(*addr);
        }
    }
    if deduped.is_empty() {
        return Vec::new();
    }

    // Stable grouping by device, preserving first-seen device order.
    let mut device_order = Vec::new();
    let mut by_device: std::collections::HashMap<DeviceCode, Vec<u32>> =
        std::collections::HashMap::new();
    for addr in &deduped {
        by_device.entry(addr.device).or_insert_with(|| {
            device_order.push(addr.device);
            Vec::new()
        });
        by_device.get_mut(&addr.device).unwrap().push(addr.offset);
    }

    let mut runs = Vec::new();
    for device in device_order {
        let mut offsets = by_device.remove(&device).unwrap();
        offsets.sort_unstable();

        let mut run_start = offsets[0];
        let mut run_len: u32 = 1;
        for window in offsets.windows(2) {
            let (prev, next) = (window[0], window[1]);
            if next == prev + 1 {
                run_len += 1;
            } else {
                runs.push(AddressRun {
                    device,
                    start_offset: run_start,
                    count: run_len,
                });
                run_start = next;
                run_len = 1;
            }
        }
        runs.push(AddressRun {
            device,
            start_offset: run_start,
            count: run_len,
        });
    }

    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(offset: u32) -> DeviceAddress {
        DeviceAddress::new(DeviceCode::D, offset)
    }

    #[test]
    fn empty_input_returns_no_runs() {
        assert!(group_addresses(&[]).is_empty());
    }

    #[test]
    fn single_contiguous_run() {
        let addrs = vec![d(100), d(101), d(102)];
        let runs = group_addresses(&addrs);
        assert_eq!(
            runs,
            vec![AddressRun {
                device: DeviceCode::D,
                start_offset: 100,
                count: 3
            }]
        );
    }

    #[test]
    fn non_contiguous_addresses_become_single_address_runs() {
        let addrs = vec![d(100), d(200), d(300)];
        let runs = group_addresses(&addrs);
        assert_eq!(runs.len(), 3);
        assert!(runs.iter().all(|r| r.count == 1));
    }

    #[test]
    fn mixed_contiguous_and_isolated() {
        let addrs = vec![d(10), d(11), d(12), d(50), d(100), d(101)];
        let runs = group_addresses(&addrs);
        assert_eq!(
            runs,
            vec![
                AddressRun {
                    device: DeviceCode::D,
                    start_offset: 10,
                    count: 3
                },
                AddressRun {
                    device: DeviceCode::D,
                    start_offset: 50,
                    count: 1
                },
                AddressRun {
                    device: DeviceCode::D,
                    start_offset: 100,
                    count: 2
                },
            ]
        );
    }

    #[test]
    fn duplicate_addresses_are_deduplicated() {
        let addrs = vec![d(100), d(100), d(101)];
        let runs = group_addresses(&addrs);
        assert_eq!(runs, vec![AddressRun { device: DeviceCode::D, start_offset: 100, count: 2 }]);
    }

    #[test]
    fn distinct_devices_produce_independent_runs() {
        let addrs = vec![
            d(10),
            DeviceAddress::new(DeviceCode::M, 0),
            d(11),
            DeviceAddress::new(DeviceCode::M, 1),
        ];
        let runs = group_addresses(&addrs);
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().any(|r| r.device == DeviceCode::D && r.count == 2));
        assert!(runs.iter().any(|r| r.device == DeviceCode::M && r.count == 2));
    }

    #[test]
    fn run_addresses_iterator_matches_offsets() {
        let run = AddressRun {
            device: DeviceCode::D,
            start_offset: 100,
            count: 3,
        };
        let addrs: Vec<_> = run.addresses().collect();
        assert_eq!(addrs, vec![d(100), d(101), d(102)]);
    }
}
