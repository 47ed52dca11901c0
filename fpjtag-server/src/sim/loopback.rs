use fpjtag_protocol::tap::{Register, TapState};

use crate::{HardwareError, PinLevel, Programmer, ProgrammerInfo};

/// A programmer whose scans capture exactly the bits they shift out.
///
/// It reports itself as a FlashPro5 on a single port and keeps track of the
/// TAP state, TRST level and TCK frequency it was given. A fault can be
/// injected into the n-th JTAG call to test error paths.
#[derive(Debug, Clone)]
pub struct Loopback {
    ports: Vec<String>,
    info: ProgrammerInfo,
    state: TapState,
    trst: PinLevel,
    frequency: u32,
    calls: usize,
    fail_on_call: Option<usize>,
}

impl Default for Loopback {
    fn default() -> Self {
        Loopback::new()
    }
}

impl Loopback {
    pub fn new() -> Loopback {
        Loopback {
            ports: vec!["usb00001".to_string()],
            info: ProgrammerInfo {
                kind: "FlashPro5".to_string(),
                revision: "Rev C".to_string(),
                connection: "usb2.0".to_string(),
                id: "00001".to_string(),
            },
            state: TapState::Reset,
            trst: PinLevel::High,
            frequency: 6_000_000,
            calls: 0,
            fail_on_call: None,
        }
    }

    /// Reports a different programmer model, e.g. `"FlashPro3"`.
    pub fn with_kind(mut self, kind: &str) -> Loopback {
        self.info.kind = kind.to_string();
        self
    }

    pub fn with_ports(mut self, ports: &[&str]) -> Loopback {
        self.ports = ports.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Makes the JTAG call with the zero-based index `call` fail.
    /// Only calls that act on the chain are counted.
    pub fn fail_on_call(mut self, call: usize) -> Loopback {
        self.fail_on_call = Some(call);
        self
    }

    /// Number of JTAG calls made so far.
    pub fn calls(&self) -> usize {
        self.calls
    }

    fn count(&mut self, call: &'static str) -> Result<(), HardwareError> {
        let index = self.calls;
        self.calls += 1;
        if self.fail_on_call == Some(index) {
            return Err(HardwareError::new(call, "injected fault"));
        }
        Ok(())
    }
}

fn fill(capture: Option<&mut [u8]>, num_bits: u32, source: impl Fn(usize) -> u8) {
    let Some(capture) = capture else {
        return;
    };
    let len = (num_bits.div_ceil(8) as usize).min(capture.len());
    for (i, byte) in capture[..len].iter_mut().enumerate() {
        *byte = source(i);
    }
    let used = num_bits % 8;
    if used != 0 && len > 0 {
        capture[len - 1] &= (1u8 << used) - 1;
    }
}

impl Programmer for Loopback {
    fn enumerate_ports(&mut self) -> Result<Vec<String>, HardwareError> {
        Ok(self.ports.clone())
    }

    fn open(&mut self, port: &str) -> Result<ProgrammerInfo, HardwareError> {
        if !self.ports.iter().any(|p| p == port) && port != "usb" {
            return Err(HardwareError::new("open", format!("no programmer on {}", port)));
        }
        Ok(self.info.clone())
    }

    fn close(&mut self) -> Result<(), HardwareError> {
        Ok(())
    }

    fn state(&mut self) -> Result<TapState, HardwareError> {
        Ok(self.state)
    }

    fn set_state(&mut self, state: TapState) -> Result<(), HardwareError> {
        self.count("set_state")?;
        self.state = state;
        Ok(())
    }

    fn delay_tck(&mut self, _ticks: u32) -> Result<(), HardwareError> {
        self.count("delay_tck")
    }

    fn delay_us(&mut self, _microseconds: u32) -> Result<(), HardwareError> {
        self.count("delay_us")
    }

    fn scan(
        &mut self,
        register: Register,
        num_bits: u32,
        output: &[u8],
        capture: Option<&mut [u8]>,
    ) -> Result<(), HardwareError> {
        self.count("scan")?;
        fill(capture, num_bits, |i| output.get(i).copied().unwrap_or(0));
        self.state = TapState::pause(register);
        Ok(())
    }

    fn scan_constant(
        &mut self,
        register: Register,
        num_bits: u32,
        value: bool,
        capture: Option<&mut [u8]>,
    ) -> Result<(), HardwareError> {
        self.count("scan_constant")?;
        let byte = if value { 0xff } else { 0x00 };
        fill(capture, num_bits, |_| byte);
        self.state = TapState::pause(register);
        Ok(())
    }

    fn set_trst(&mut self, level: PinLevel) -> Result<(), HardwareError> {
        self.count("set_trst")?;
        self.trst = level;
        if level == PinLevel::Low {
            self.state = TapState::Reset;
        }
        Ok(())
    }

    fn trst(&mut self) -> Result<PinLevel, HardwareError> {
        Ok(self.trst)
    }

    fn set_tck_frequency(&mut self, hz: u32) -> Result<(), HardwareError> {
        self.frequency = hz;
        Ok(())
    }

    fn tck_frequency(&mut self) -> Result<u32, HardwareError> {
        Ok(self.frequency)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scan_echoes_output() {
        let mut loopback = Loopback::new();
        let mut capture = [0u8; 2];
        loopback
            .scan(Register::Instruction, 12, &[0x34, 0xff], Some(&mut capture))
            .unwrap();
        assert_eq!(capture, [0x34, 0x0f]);
        assert_eq!(loopback.state().unwrap(), TapState::IrPause);
    }

    #[test]
    fn injected_fault_hits_one_call() {
        let mut loopback = Loopback::new().fail_on_call(1);
        loopback.set_state(TapState::Idle).unwrap();
        let err = loopback.delay_tck(10).unwrap_err();
        assert_eq!(err.call, "delay_tck");
        loopback.delay_tck(10).unwrap();
        assert_eq!(loopback.calls(), 3);
    }

    #[test]
    fn asserting_trst_resets_tap() {
        let mut loopback = Loopback::new();
        loopback.set_state(TapState::DrPause).unwrap();
        loopback.set_trst(PinLevel::Low).unwrap();
        assert_eq!(loopback.state().unwrap(), TapState::Reset);
        assert_eq!(loopback.trst().unwrap(), PinLevel::Low);
    }
}
