//! # UJTAG tunnel encoder
//!
//! Some FPGAs expose the TAP of a soft core (the "inferior" TAP) only through
//! a bridge in their user JTAG data register. The bridge reads framed DR scans
//! made of three phases:
//!
//! | Phase | Length prefix | Payload |
//! |-------|---------------|---------|
//! | entry | 3 bits | up to 6 TMS bits for the inferior TAP |
//! | shift | 6 bits | up to 56 data bits |
//! | exit  | 3 bits | up to 7 TMS bits for the inferior TAP |
//!
//! All prefixes and payloads are sent LSB first. During the shift phase the
//! bridge drives TMS high on the last data bit, so the inferior TAP always leaves
//! the shift phase in Exit1.
//!
//! Captured data comes back one clock late: bit `i` of a chunk is returned on
//! clock `i + 1`, and the last bit is returned on the first clock of the exit
//! length prefix. [`realign`] undoes this.
//!
//! The bridge cannot report the state of the inferior TAP. The encoder keeps a
//! shadow copy, and every path is planned from it.
use fpjtag_protocol::{
    ScanField,
    error::TapError,
    tap::{Register, TapState, TmsPath, tms_path},
};

use crate::{Programmer, error::TunnelError};

pub const ENTRY_LEN_BITS: u32 = 3;
pub const SHIFT_LEN_BITS: u32 = 6;
pub const EXIT_LEN_BITS: u32 = 3;
pub const ENTRY_MAX_LEN: u8 = 6;
pub const EXIT_MAX_LEN: u8 = 7;
pub const MAX_CHUNK_BITS: u32 = 56;

#[derive(Debug, Clone)]
pub struct TunnelEncoder {
    shadow: TapState,
    leading_bypass: u32,
    trailing_bypass: u32,
}

impl Default for TunnelEncoder {
    fn default() -> Self {
        TunnelEncoder::new()
    }
}

impl TunnelEncoder {
    pub fn new() -> TunnelEncoder {
        TunnelEncoder {
            shadow: TapState::Reset,
            leading_bypass: 0,
            trailing_bypass: 0,
        }
    }

    /// Sets the number of bypassed TAPs before and after the FPGA in the chain.
    pub fn set_bypass(&mut self, leading: u32, trailing: u32) {
        self.leading_bypass = leading;
        self.trailing_bypass = trailing;
    }

    /// The last known state of the inferior TAP.
    pub fn shadow(&self) -> TapState {
        self.shadow
    }

    /// Moves the inferior TAP to `target`.
    ///
    /// A move to Reset is always sent, using five TMS ones, so it also
    /// resynchronizes an undefined shadow state.
    pub fn move_to<P: Programmer + ?Sized>(
        &mut self,
        programmer: &mut P,
        target: TapState,
    ) -> Result<(), TunnelError> {
        let result = self.transition(programmer, target);
        self.invalidate_on_error(result)
    }

    /// Shifts one scan field through `register` of the inferior TAP.
    /// Leaves the inferior TAP in the register's pause state.
    ///
    /// A field whose buffers are too short is refused before anything is sent,
    /// and the shadow state stays valid.
    pub fn scan_field<P: Programmer + ?Sized>(
        &mut self,
        programmer: &mut P,
        register: Register,
        field: &mut ScanField,
    ) -> Result<(), TunnelError> {
        let needed = field.byte_len();
        for buf in [field.output.as_deref(), field.capture.as_deref()]
            .into_iter()
            .flatten()
        {
            if buf.len() < needed {
                return Err(TunnelError::ShortBuffer {
                    needed,
                    len: buf.len(),
                });
            }
        }
        let result = self.shift_field(programmer, register, field);
        self.invalidate_on_error(result)
    }

    /// Clocks the inferior TAP `cycles` times in Run-Test/Idle, then moves it
    /// to `end_state`.
    pub fn run_test<P: Programmer + ?Sized>(
        &mut self,
        programmer: &mut P,
        cycles: u32,
        end_state: TapState,
    ) -> Result<(), TunnelError> {
        let result = self.idle_cycles(programmer, cycles, end_state);
        self.invalidate_on_error(result)
    }

    fn invalidate_on_error(&mut self, result: Result<(), TunnelError>) -> Result<(), TunnelError> {
        if result.is_err() {
            log::error!("Tunnel operation failed, inferior TAP state is unknown");
            self.shadow = TapState::Undefined;
        }
        result
    }

    fn transition<P: Programmer + ?Sized>(
        &mut self,
        programmer: &mut P,
        target: TapState,
    ) -> Result<(), TunnelError> {
        if target == TapState::Undefined {
            return Err(TapError::UndefinedState.into());
        }
        if target != TapState::Reset && target == self.shadow {
            return Ok(());
        }
        let path = if target == TapState::Reset {
            TmsPath::RESET
        } else {
            tms_path(self.shadow, target)?
        };
        log::trace!(
            "Tunnel move {} -> {}: {} TMS bits {:#04x}",
            self.shadow,
            target,
            path.len(),
            path.bits()
        );

        // Paths longer than one exit phase are sent as consecutive transactions.
        let (mut head, mut rest) = path.split_at(EXIT_MAX_LEN);
        let mut first = true;
        loop {
            // empty entry and shift phases
            let leading = if first { self.leading_bypass } else { 0 };
            programmer.scan_constant(
                Register::Data,
                leading + ENTRY_LEN_BITS + SHIFT_LEN_BITS,
                false,
                None,
            )?;
            send_tms(programmer, EXIT_LEN_BITS, head)?;
            let last = rest.is_empty();
            if last {
                pad(programmer, self.trailing_bypass)?;
            }
            programmer.set_state(TapState::Idle)?;
            if last {
                break;
            }
            (head, rest) = rest.split_at(EXIT_MAX_LEN);
            first = false;
        }
        self.shadow = target;
        Ok(())
    }

    fn shift_field<P: Programmer + ?Sized>(
        &mut self,
        programmer: &mut P,
        register: Register,
        field: &mut ScanField,
    ) -> Result<(), TunnelError> {
        if field.num_bits == 0 {
            return Ok(());
        }
        let shift_state = TapState::shift(register);
        pad(programmer, self.leading_bypass)?;

        let mut sent = 0u32;
        while sent < field.num_bits {
            let entry = tms_path(self.shadow, shift_state)?;
            if entry.len() > ENTRY_MAX_LEN {
                return Err(TunnelError::EntryTooLong { len: entry.len() });
            }
            send_tms(programmer, ENTRY_LEN_BITS, entry)?;

            let chunk = (field.num_bits - sent).min(MAX_CHUNK_BITS);
            let start = (sent / 8) as usize;
            let end = start + chunk.div_ceil(8) as usize;
            log::trace!("Tunnel {} chunk of {} bits at bit {}", register, chunk, sent);
            programmer.scan(Register::Data, SHIFT_LEN_BITS, &[chunk as u8], None)?;
            let capture = field.capture.as_deref_mut().map(|c| &mut c[start..end]);
            match field.output.as_deref() {
                Some(output) => {
                    programmer.scan(Register::Data, chunk, &output[start..end], capture)?
                }
                None => programmer.scan_constant(Register::Data, chunk, false, capture)?,
            }

            // One TMS zero takes Exit1 to Pause. The first clock of its length
            // prefix returns the chunk's last bit.
            let mut last_bit = [0u8; 1];
            let capturing = field.capture.is_some();
            programmer.scan(
                Register::Data,
                EXIT_LEN_BITS,
                &[1],
                capturing.then_some(&mut last_bit[..]),
            )?;
            programmer.scan(Register::Data, 1, &[0], None)?;
            self.shadow = TapState::pause(register);

            if let Some(capture) = field.capture.as_deref_mut() {
                realign(&mut capture[start..end], chunk, last_bit[0] & 1 == 1);
            }

            sent += chunk;
            if sent == field.num_bits {
                pad(programmer, self.trailing_bypass)?;
            }
            programmer.set_state(TapState::Idle)?;
        }
        Ok(())
    }

    fn idle_cycles<P: Programmer + ?Sized>(
        &mut self,
        programmer: &mut P,
        cycles: u32,
        end_state: TapState,
    ) -> Result<(), TunnelError> {
        self.transition(programmer, TapState::Idle)?;

        let mut ticks = cycles;
        let mut first = true;
        while ticks > 0 {
            if first {
                pad(programmer, self.leading_bypass)?;
            }
            // TMS zeros keep the inferior TAP in Run-Test/Idle
            let entry = ticks.min(u32::from(ENTRY_MAX_LEN));
            ticks -= entry;
            programmer.scan(Register::Data, ENTRY_LEN_BITS, &[entry as u8], None)?;
            programmer.scan_constant(Register::Data, entry, false, None)?;
            programmer.scan_constant(Register::Data, SHIFT_LEN_BITS, false, None)?;

            let exit = ticks.min(u32::from(EXIT_MAX_LEN));
            ticks -= exit;
            programmer.scan(Register::Data, EXIT_LEN_BITS, &[exit as u8], None)?;
            if exit > 0 {
                programmer.scan_constant(Register::Data, exit, false, None)?;
            }

            if ticks == 0 {
                pad(programmer, self.trailing_bypass)?;
            }
            programmer.set_state(TapState::Idle)?;
            first = false;
        }

        self.transition(programmer, end_state)
    }
}

/// Sends a length prefix of `len_bits` bits followed by the TMS bits of `path`.
fn send_tms<P: Programmer + ?Sized>(
    programmer: &mut P,
    len_bits: u32,
    path: TmsPath,
) -> Result<(), TunnelError> {
    programmer.scan(Register::Data, len_bits, &[path.len()], None)?;
    if !path.is_empty() {
        programmer.scan(
            Register::Data,
            u32::from(path.len()),
            &[path.bits()],
            None,
        )?;
    }
    Ok(())
}

/// Zeros for bypassed TAPs in the chain.
fn pad<P: Programmer + ?Sized>(programmer: &mut P, bits: u32) -> Result<(), TunnelError> {
    if bits > 0 {
        programmer.scan_constant(Register::Data, bits, false, None)?;
    }
    Ok(())
}

/// Corrects the one-clock capture delay of the bridge.
///
/// `buf` holds the `num_bits` bits captured during a shift phase, where bit 0
/// is stale and bit `i` belongs to data bit `i - 1`. The buffer is shifted
/// right by one bit and `last` becomes the final data bit. Bits past
/// `num_bits` are cleared.
pub fn realign(buf: &mut [u8], num_bits: u32, last: bool) {
    if num_bits == 0 || buf.is_empty() {
        return;
    }
    let len = buf.len();
    for i in 0..len {
        let carry = if i + 1 < len { buf[i + 1] & 1 } else { 0 };
        buf[i] = (buf[i] >> 1) | (carry << 7);
    }
    let top = (num_bits - 1) as usize;
    let (byte, bit) = (top / 8, top % 8);
    if byte < len {
        if last {
            buf[byte] |= 1 << bit;
        } else {
            buf[byte] &= !(1 << bit);
        }
    }
    let used = num_bits % 8;
    if used != 0 {
        buf[len - 1] &= (1u8 << used) - 1;
    }
}
