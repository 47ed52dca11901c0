//! Timing statistics for the profiling request.
use std::{collections::HashMap, fmt::Write, time::Duration};

use fpjtag_protocol::Opcode;

#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct OpcodeStats {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

/// Counts handled requests per opcode and the time spent on them.
#[derive(Debug, Default)]
pub struct Profile {
    stats: HashMap<Opcode, OpcodeStats>,
    hardware_timeout_ms: Option<i32>,
    client_timeout_ms: Option<i32>,
}

impl Profile {
    pub fn new() -> Profile {
        Profile::default()
    }

    pub fn record(&mut self, opcode: Opcode, elapsed: Duration) {
        let stats = self.stats.entry(opcode).or_default();
        stats.count += 1;
        stats.total += elapsed;
        stats.max = stats.max.max(elapsed);
    }

    pub fn stats(&self, opcode: Opcode) -> OpcodeStats {
        self.stats.get(&opcode).copied().unwrap_or_default()
    }

    /// Timeouts announced by the client. They are only reported.
    pub fn set_timeouts(&mut self, hardware_ms: i32, client_ms: i32) {
        self.hardware_timeout_ms = Some(hardware_ms);
        self.client_timeout_ms = Some(client_ms);
    }

    /// One line per opcode that was seen, in opcode order.
    pub fn report(&self) -> String {
        let mut report = String::new();
        if let (Some(hardware), Some(client)) = (self.hardware_timeout_ms, self.client_timeout_ms) {
            let _ = writeln!(
                report,
                "timeouts: hardware {} ms, client {} ms",
                hardware, client
            );
        }
        for opcode in Opcode::ALL {
            let Some(stats) = self.stats.get(&opcode) else {
                continue;
            };
            let _ = writeln!(
                report,
                "{:<24}{:>8} calls{:>12.3} ms total{:>10.3} ms max",
                opcode.name(),
                stats.count,
                stats.total.as_secs_f64() * 1000.0,
                stats.max.as_secs_f64() * 1000.0
            );
        }
        report
    }
}

#[test]
fn record_accumulates() {
    let mut profile = Profile::new();
    profile.record(Opcode::Scan, Duration::from_millis(3));
    profile.record(Opcode::Scan, Duration::from_millis(5));
    let stats = profile.stats(Opcode::Scan);
    assert_eq!(stats.count, 2);
    assert_eq!(stats.total, Duration::from_millis(8));
    assert_eq!(stats.max, Duration::from_millis(5));
    assert_eq!(profile.stats(Opcode::Hello).count, 0);
}

#[test]
fn report_lists_seen_opcodes() {
    let mut profile = Profile::new();
    profile.set_timeouts(1700, 0);
    profile.record(Opcode::Hello, Duration::from_micros(250));
    profile.record(Opcode::Scan, Duration::from_millis(2));
    let report = profile.report();
    let lines: Vec<&str> = report.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "timeouts: hardware 1700 ms, client 0 ms");
    assert!(lines[1].starts_with("hello"));
    assert!(lines[2].starts_with("scan"));
    assert!(lines[2].contains("2.000 ms total"));
}
