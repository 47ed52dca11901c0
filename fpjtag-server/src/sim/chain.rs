use std::collections::VecDeque;

use fpjtag_protocol::tap::{Register, TapState, tms_path};

use crate::{HardwareError, PinLevel, Programmer, ProgrammerInfo};

const IR_LEN: usize = 8;

/// A simulated TAP controller.
///
/// Capture-DR loads a fixed pattern into the data register and Capture-IR loads
/// `0b0000_0001` into the instruction register. Bits shifted into the data
/// register are recorded.
#[derive(Debug, Clone)]
pub struct Device {
    state: TapState,
    pattern: Vec<bool>,
    dr: VecDeque<bool>,
    ir: VecDeque<bool>,
    shifted_in: Vec<bool>,
    idle_clocks: u64,
}

impl Device {
    /// A device whose data register captures `pattern`, LSB of the first byte first.
    pub fn with_pattern(pattern: &[u8]) -> Device {
        Device {
            state: TapState::Reset,
            pattern: (0..pattern.len() * 8)
                .map(|i| pattern[i / 8] >> (i % 8) & 1 == 1)
                .collect(),
            dr: VecDeque::new(),
            ir: VecDeque::new(),
            shifted_in: Vec::new(),
            idle_clocks: 0,
        }
    }

    pub fn state(&self) -> TapState {
        self.state
    }

    /// Bits shifted into the data register since the last Capture-DR.
    pub fn shifted_in(&self) -> &[bool] {
        &self.shifted_in
    }

    /// Clocks spent in Run-Test/Idle.
    pub fn idle_clocks(&self) -> u64 {
        self.idle_clocks
    }

    pub fn reset_counters(&mut self) {
        self.idle_clocks = 0;
    }

    /// One TCK cycle. Returns the bit shifted out on TDO.
    pub fn clock(&mut self, tms: bool, tdi: bool) -> bool {
        let mut tdo = false;
        match self.state {
            TapState::DrCapture => {
                self.dr = self.pattern.iter().copied().collect();
                self.shifted_in.clear();
            }
            TapState::IrCapture => {
                self.ir = (0..IR_LEN).map(|i| i == 0).collect();
            }
            TapState::DrShift => {
                tdo = self.dr.pop_front().unwrap_or(false);
                self.dr.push_back(tdi);
                self.shifted_in.push(tdi);
            }
            TapState::IrShift => {
                tdo = self.ir.pop_front().unwrap_or(false);
                self.ir.push_back(tdi);
            }
            TapState::Idle if !tms => self.idle_clocks += 1,
            _ => {}
        }
        self.state = self.state.next(tms).unwrap_or(TapState::Reset);
        tdo
    }

    fn walk(&mut self, target: TapState) -> Result<(), HardwareError> {
        let path = tms_path(self.state, target)
            .map_err(|e| HardwareError::new("set_state", e.to_string()))?;
        for tms in path.iter() {
            self.clock(tms, false);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Phase {
    EntryLen,
    EntryTms,
    ShiftLen,
    Shift,
    ExitLen,
    ExitTms,
}

/// The UJTAG bridge: parses framed DR bits and drives the inferior TAP.
///
/// Bypassed TAPs around the FPGA take the first `leading` bits of an operation
/// and the `trailing` bits following its last frame. A transaction that
/// carries trailing bits ends the operation.
#[derive(Debug, Clone)]
struct Bridge {
    device: Device,
    phase: Phase,
    acc: u8,
    acc_bits: u8,
    remaining: u8,
    delayed: bool,
    shift_lengths: Vec<u32>,
    leading: u32,
    trailing: u32,
    skip: u32,
    frame_done: bool,
    trailing_seen: u32,
    bypass_bits: u64,
}

impl Bridge {
    fn new(device: Device) -> Bridge {
        Bridge {
            device,
            phase: Phase::EntryLen,
            acc: 0,
            acc_bits: 0,
            remaining: 0,
            delayed: false,
            shift_lengths: Vec::new(),
            leading: 0,
            trailing: 0,
            skip: 0,
            frame_done: false,
            trailing_seen: 0,
            bypass_bits: 0,
        }
    }

    /// The physical TAP went back to Run-Test/Idle.
    fn end_transaction(&mut self) {
        if self.trailing_seen > 0 {
            self.skip = self.leading;
        }
        self.frame_done = false;
        self.trailing_seen = 0;
    }

    fn collect(&mut self, tdi: bool, width: u8) -> Option<u8> {
        self.acc |= u8::from(tdi) << self.acc_bits;
        self.acc_bits += 1;
        if self.acc_bits < width {
            return None;
        }
        let value = self.acc;
        self.acc = 0;
        self.acc_bits = 0;
        Some(value)
    }

    /// One DR shift clock through the bridge. Returns the bit the inferior TAP
    /// shifted out on the previous clock.
    fn clock(&mut self, tdi: bool) -> bool {
        if self.skip > 0 {
            self.skip -= 1;
            self.bypass_bits += 1;
            return false;
        }
        if self.frame_done && self.trailing_seen < self.trailing {
            self.trailing_seen += 1;
            self.bypass_bits += 1;
            return false;
        }
        self.frame_done = false;
        let out = self.delayed;
        let mut tdo = false;
        match self.phase {
            Phase::EntryLen => match self.collect(tdi, 3) {
                Some(0) => self.phase = Phase::ShiftLen,
                Some(len) => {
                    self.remaining = len;
                    self.phase = Phase::EntryTms;
                }
                None => {}
            },
            Phase::EntryTms => {
                self.device.clock(tdi, false);
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.phase = Phase::ShiftLen;
                }
            }
            Phase::ShiftLen => match self.collect(tdi, 6) {
                Some(0) => self.phase = Phase::ExitLen,
                Some(len) => {
                    self.shift_lengths.push(u32::from(len));
                    self.remaining = len;
                    self.phase = Phase::Shift;
                }
                None => {}
            },
            Phase::Shift => {
                self.remaining -= 1;
                tdo = self.device.clock(self.remaining == 0, tdi);
                if self.remaining == 0 {
                    self.phase = Phase::ExitLen;
                }
            }
            Phase::ExitLen => match self.collect(tdi, 3) {
                Some(0) => {
                    self.phase = Phase::EntryLen;
                    self.frame_done = true;
                }
                Some(len) => {
                    self.remaining = len;
                    self.phase = Phase::ExitTms;
                }
                None => {}
            },
            Phase::ExitTms => {
                self.device.clock(tdi, false);
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.phase = Phase::EntryLen;
                    self.frame_done = true;
                }
            }
        }
        self.delayed = tdo;
        out
    }
}

#[derive(Debug, Clone)]
enum Target {
    Direct(Device),
    Bridged(Bridge),
}

/// A programmer attached to a simulated [`Device`].
///
/// In direct mode the device is the TAP the programmer drives. In bridged mode
/// the programmer drives an FPGA TAP whose data register is a UJTAG bridge to
/// the device.
#[derive(Debug, Clone)]
pub struct SimProgrammer {
    target: Target,
    physical: TapState,
    trst: PinLevel,
    frequency: u32,
}

impl SimProgrammer {
    pub fn direct(device: Device) -> SimProgrammer {
        SimProgrammer::new(Target::Direct(device))
    }

    pub fn bridged(device: Device) -> SimProgrammer {
        SimProgrammer::new(Target::Bridged(Bridge::new(device)))
    }

    fn new(target: Target) -> SimProgrammer {
        SimProgrammer {
            target,
            physical: TapState::Reset,
            trst: PinLevel::High,
            frequency: 4_000_000,
        }
    }

    pub fn device(&self) -> &Device {
        match &self.target {
            Target::Direct(device) => device,
            Target::Bridged(bridge) => &bridge.device,
        }
    }

    pub fn device_mut(&mut self) -> &mut Device {
        match &mut self.target {
            Target::Direct(device) => device,
            Target::Bridged(bridge) => &mut bridge.device,
        }
    }

    /// Puts bypassed TAPs before and after the FPGA. Only a bridged device is
    /// affected.
    ///
    /// Operations are told apart by their trailing bits, so `leading` only
    /// applies to later operations when `trailing` is non-zero.
    pub fn with_bypass(mut self, leading: u32, trailing: u32) -> SimProgrammer {
        if let Target::Bridged(bridge) = &mut self.target {
            bridge.leading = leading;
            bridge.trailing = trailing;
            bridge.skip = leading;
        }
        self
    }

    /// Number of bits that went to bypassed TAPs instead of the bridge.
    pub fn bypass_bits(&self) -> u64 {
        match &self.target {
            Target::Direct(_) => 0,
            Target::Bridged(bridge) => bridge.bypass_bits,
        }
    }

    /// Lengths of all non-empty shift phases the bridge has seen.
    pub fn shift_lengths(&self) -> &[u32] {
        match &self.target {
            Target::Direct(_) => &[],
            Target::Bridged(bridge) => &bridge.shift_lengths,
        }
    }
}

fn output_bit(output: &[u8], i: usize) -> bool {
    output.get(i / 8).is_some_and(|b| b >> (i % 8) & 1 == 1)
}

fn store_bit(capture: &mut [u8], i: usize, bit: bool) {
    if let Some(byte) = capture.get_mut(i / 8) {
        if bit {
            *byte |= 1 << (i % 8);
        } else {
            *byte &= !(1 << (i % 8));
        }
    }
}

impl Programmer for SimProgrammer {
    fn enumerate_ports(&mut self) -> Result<Vec<String>, HardwareError> {
        Ok(vec!["usb00001".to_string()])
    }

    fn open(&mut self, _port: &str) -> Result<ProgrammerInfo, HardwareError> {
        Ok(ProgrammerInfo {
            kind: "FlashPro5".to_string(),
            revision: "sim".to_string(),
            connection: "usb2.0".to_string(),
            id: "00001".to_string(),
        })
    }

    fn close(&mut self) -> Result<(), HardwareError> {
        Ok(())
    }

    fn state(&mut self) -> Result<TapState, HardwareError> {
        Ok(match &self.target {
            Target::Direct(device) => device.state(),
            Target::Bridged(_) => self.physical,
        })
    }

    fn set_state(&mut self, state: TapState) -> Result<(), HardwareError> {
        match &mut self.target {
            Target::Direct(device) => device.walk(state),
            Target::Bridged(bridge) => {
                if state == TapState::Idle {
                    bridge.end_transaction();
                }
                self.physical = state;
                Ok(())
            }
        }
    }

    fn delay_tck(&mut self, ticks: u32) -> Result<(), HardwareError> {
        if let Target::Direct(device) = &mut self.target {
            for _ in 0..ticks {
                device.clock(false, false);
            }
        }
        Ok(())
    }

    fn delay_us(&mut self, _microseconds: u32) -> Result<(), HardwareError> {
        Ok(())
    }

    fn scan(
        &mut self,
        register: Register,
        num_bits: u32,
        output: &[u8],
        mut capture: Option<&mut [u8]>,
    ) -> Result<(), HardwareError> {
        let num_bits = num_bits as usize;
        match &mut self.target {
            Target::Direct(device) => {
                if num_bits == 0 {
                    return device.walk(TapState::pause(register));
                }
                device.walk(TapState::shift(register))?;
                for i in 0..num_bits {
                    let tdo = device.clock(i + 1 == num_bits, output_bit(output, i));
                    if let Some(capture) = capture.as_mut() {
                        store_bit(capture, i, tdo);
                    }
                }
                // Exit1 -> Pause
                device.clock(false, false);
            }
            Target::Bridged(bridge) => {
                for i in 0..num_bits {
                    let tdo = match register {
                        Register::Data => bridge.clock(output_bit(output, i)),
                        Register::Instruction => false,
                    };
                    if let Some(capture) = capture.as_mut() {
                        store_bit(capture, i, tdo);
                    }
                }
                self.physical = TapState::pause(register);
            }
        }
        Ok(())
    }

    fn scan_constant(
        &mut self,
        register: Register,
        num_bits: u32,
        value: bool,
        capture: Option<&mut [u8]>,
    ) -> Result<(), HardwareError> {
        let output = vec![if value { 0xff } else { 0x00 }; num_bits.div_ceil(8) as usize];
        self.scan(register, num_bits, &output, capture)
    }

    fn set_trst(&mut self, level: PinLevel) -> Result<(), HardwareError> {
        self.trst = level;
        if level == PinLevel::Low {
            if let Target::Direct(device) = &mut self.target {
                device.state = TapState::Reset;
            }
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
