use std::time::Duration;

use fpjtag_protocol::Opcode;

use crate::config::Config;

const OPCODE_SLOTS: usize = 20;

/// Per-call deadlines derived from opcode weights.
///
/// A call may take `weight × multiplier`, plus the cold-start grace when the
/// session still has to connect. A weight or multiplier of zero means the call
/// is never timed out.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    weights: [u32; OPCODE_SLOTS],
    multiplier: Duration,
    cold_start_grace: Duration,
}

impl TimeoutPolicy {
    pub fn new(multiplier: Duration, cold_start_grace: Duration) -> TimeoutPolicy {
        let mut weights = [0; OPCODE_SLOTS];
        for opcode in Opcode::ALL {
            weights[opcode as usize] = opcode.default_weight();
        }
        TimeoutPolicy {
            weights,
            multiplier,
            cold_start_grace,
        }
    }

    pub fn from_config(config: &Config) -> TimeoutPolicy {
        TimeoutPolicy::new(config.client_timeout, config.cold_start_grace)
    }

    pub fn with_weight(mut self, opcode: Opcode, weight: u32) -> TimeoutPolicy {
        self.weights[opcode as usize] = weight;
        self
    }

    pub fn weight(&self, opcode: Opcode) -> u32 {
        self.weights[opcode as usize]
    }

    pub fn multiplier(&self) -> Duration {
        self.multiplier
    }

    pub fn allowed_duration(&self, opcode: Opcode, connected: bool) -> Option<Duration> {
        let weight = self.weight(opcode);
        if weight == 0 || self.multiplier.is_zero() {
            return None;
        }
        let allowed = self.multiplier.checked_mul(weight).unwrap_or(Duration::MAX);
        Some(if connected {
            allowed
        } else {
            allowed.saturating_add(self.cold_start_grace)
        })
    }
}

#[test]
fn deadline_is_weight_times_multiplier() {
    let policy = TimeoutPolicy::new(Duration::from_millis(10), Duration::from_secs(14));
    assert_eq!(
        policy.allowed_duration(Opcode::Scan, true),
        Some(Duration::from_millis(120))
    );
    assert_eq!(
        policy.allowed_duration(Opcode::Initialize, false),
        Some(Duration::from_millis(800) + Duration::from_secs(14))
    );
}

#[test]
fn zero_disables_deadline() {
    let policy = TimeoutPolicy::new(Duration::ZERO, Duration::from_secs(14));
    assert_eq!(policy.allowed_duration(Opcode::Scan, true), None);
    let policy =
        TimeoutPolicy::new(Duration::from_millis(10), Duration::ZERO).with_weight(Opcode::Stall, 0);
    assert_eq!(policy.allowed_duration(Opcode::Stall, true), None);
    assert_eq!(
        policy.allowed_duration(Opcode::Hello, false),
        Some(Duration::from_millis(10))
    );
}
