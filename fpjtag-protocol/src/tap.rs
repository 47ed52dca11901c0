//! IEEE 1149.1 TAP controller model.
//!
//! [`next_state`] is the fixed transition table of the TAP controller and
//! [`tms_path`] computes the TMS sequence that walks the controller from one
//! state to another. Both are pure; neither touches hardware.
use std::fmt::Display;

use crate::error::TapError;

/// The register a scan is shifted through.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Register {
    Instruction,
    Data,
}

impl Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Register::Instruction => write!(f, "IR"),
            Register::Data => write!(f, "DR"),
        }
    }
}

/// The sixteen TAP controller states plus a marker for "unknown".
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TapState {
    Reset,
    Idle,
    DrSelect,
    DrCapture,
    DrShift,
    DrExit1,
    DrPause,
    DrExit2,
    DrUpdate,
    IrSelect,
    IrCapture,
    IrShift,
    IrExit1,
    IrPause,
    IrExit2,
    IrUpdate,
    /// The state is not known. Every transition out of it is an error.
    Undefined,
}

/// Coarse grouping of TAP states used while planning paths.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TapRegion {
    TestLogicReset,
    RunTestIdle,
    DataRegister,
    InstructionRegister,
}

/// Position of a state inside the DR or IR column of the state diagram.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Phase {
    Select,
    Capture,
    Shift,
    Exit1,
    Pause,
    Exit2,
    Update,
}

impl TapState {
    /// All defined states, in wire-code order.
    pub const ALL: [TapState; 16] = [
        TapState::Reset,
        TapState::Idle,
        TapState::DrSelect,
        TapState::DrCapture,
        TapState::DrShift,
        TapState::DrExit1,
        TapState::DrPause,
        TapState::DrExit2,
        TapState::DrUpdate,
        TapState::IrSelect,
        TapState::IrCapture,
        TapState::IrShift,
        TapState::IrExit1,
        TapState::IrPause,
        TapState::IrExit2,
        TapState::IrUpdate,
    ];

    /// The integer used for this state on the wire.
    pub fn code(self) -> i32 {
        match self {
            TapState::Undefined => -1,
            state => TapState::ALL
                .iter()
                .position(|s| *s == state)
                .map_or(-1, |index| index as i32),
        }
    }

    /// Inverse of [`TapState::code`].
    pub fn from_code(code: i32) -> Option<TapState> {
        if code == -1 {
            return Some(TapState::Undefined);
        }
        usize::try_from(code)
            .ok()
            .and_then(|index| TapState::ALL.get(index).copied())
    }

    pub fn name(self) -> &'static str {
        match self {
            TapState::Reset => "RESET",
            TapState::Idle => "IDLE",
            TapState::DrSelect => "DRSELECT",
            TapState::DrCapture => "DRCAPTURE",
            TapState::DrShift => "DRSHIFT",
            TapState::DrExit1 => "DREXIT1",
            TapState::DrPause => "DRPAUSE",
            TapState::DrExit2 => "DREXIT2",
            TapState::DrUpdate => "DRUPDATE",
            TapState::IrSelect => "IRSELECT",
            TapState::IrCapture => "IRCAPTURE",
            TapState::IrShift => "IRSHIFT",
            TapState::IrExit1 => "IREXIT1",
            TapState::IrPause => "IRPAUSE",
            TapState::IrExit2 => "IREXIT2",
            TapState::IrUpdate => "IRUPDATE",
            TapState::Undefined => "UNDEFINED",
        }
    }

    /// States in which the controller can remain while TMS is held.
    /// Path moves have to start and end in one of them.
    pub fn is_stable(self) -> bool {
        matches!(
            self,
            TapState::Reset
                | TapState::Idle
                | TapState::DrShift
                | TapState::DrPause
                | TapState::IrShift
                | TapState::IrPause
        )
    }

    /// The shift state of the given register.
    pub fn shift(register: Register) -> TapState {
        match register {
            Register::Instruction => TapState::IrShift,
            Register::Data => TapState::DrShift,
        }
    }

    /// The pause state of the given register.
    pub fn pause(register: Register) -> TapState {
        match register {
            Register::Instruction => TapState::IrPause,
            Register::Data => TapState::DrPause,
        }
    }

    pub fn region(self) -> Result<TapRegion, TapError> {
        match self {
            TapState::Reset => Ok(TapRegion::TestLogicReset),
            TapState::Idle => Ok(TapRegion::RunTestIdle),
            TapState::Undefined => Err(TapError::UndefinedState),
            state => match state.phase() {
                Some((Register::Data, _)) => Ok(TapRegion::DataRegister),
                Some((Register::Instruction, _)) => Ok(TapRegion::InstructionRegister),
                None => Err(TapError::UndefinedState),
            },
        }
    }

    /// The state reached after one TCK edge with the given TMS level.
    pub fn next(self, tms: bool) -> Result<TapState, TapError> {
        use TapState::*;
        let next = match (self, tms) {
            (Reset, true) => Reset,
            (Reset, false) => Idle,
            (Idle, true) => DrSelect,
            (Idle, false) => Idle,

            (DrSelect, true) => IrSelect,
            (DrSelect, false) => DrCapture,
            (DrCapture, true) => DrExit1,
            (DrCapture, false) => DrShift,
            (DrShift, true) => DrExit1,
            (DrShift, false) => DrShift,
            (DrExit1, true) => DrUpdate,
            (DrExit1, false) => DrPause,
            (DrPause, true) => DrExit2,
            (DrPause, false) => DrPause,
            (DrExit2, true) => DrUpdate,
            (DrExit2, false) => DrShift,
            (DrUpdate, true) => DrSelect,
            (DrUpdate, false) => Idle,

            (IrSelect, true) => Reset,
            (IrSelect, false) => IrCapture,
            (IrCapture, true) => IrExit1,
            (IrCapture, false) => IrShift,
            (IrShift, true) => IrExit1,
            (IrShift, false) => IrShift,
            (IrExit1, true) => IrUpdate,
            (IrExit1, false) => IrPause,
            (IrPause, true) => IrExit2,
            (IrPause, false) => IrPause,
            (IrExit2, true) => IrUpdate,
            (IrExit2, false) => IrShift,
            (IrUpdate, true) => DrSelect,
            (IrUpdate, false) => Idle,

            (Undefined, _) => return Err(TapError::UndefinedState),
        };
        Ok(next)
    }

    fn phase(self) -> Option<(Register, Phase)> {
        use Register::*;
        let phase = match self {
            TapState::DrSelect => (Data, Phase::Select),
            TapState::DrCapture => (Data, Phase::Capture),
            TapState::DrShift => (Data, Phase::Shift),
            TapState::DrExit1 => (Data, Phase::Exit1),
            TapState::DrPause => (Data, Phase::Pause),
            TapState::DrExit2 => (Data, Phase::Exit2),
            TapState::DrUpdate => (Data, Phase::Update),
            TapState::IrSelect => (Instruction, Phase::Select),
            TapState::IrCapture => (Instruction, Phase::Capture),
            TapState::IrShift => (Instruction, Phase::Shift),
            TapState::IrExit1 => (Instruction, Phase::Exit1),
            TapState::IrPause => (Instruction, Phase::Pause),
            TapState::IrExit2 => (Instruction, Phase::Exit2),
            TapState::IrUpdate => (Instruction, Phase::Update),
            _ => return None,
        };
        Some(phase)
    }
}

impl Display for TapState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Free-standing form of [`TapState::next`].
pub fn next_state(state: TapState, tms: bool) -> Result<TapState, TapError> {
    state.next(tms)
}

/// A TMS bit sequence of at most [`TmsPath::MAX_LEN`] bits.
/// Bit `i` of [`TmsPath::bits`] is clocked out `i`-th, i.e. LSB first.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TmsPath {
    bits: u8,
    len: u8,
}

impl TmsPath {
    pub const MAX_LEN: u8 = 8;

    /// Five TMS ones reach Test-Logic-Reset from any state.
    pub const RESET: TmsPath = TmsPath {
        bits: 0x1f,
        len: 5,
    };

    pub fn new(bits: u8, len: u8) -> TmsPath {
        let len = len.min(Self::MAX_LEN);
        let mask = if len == Self::MAX_LEN {
            u8::MAX
        } else {
            (1u8 << len) - 1
        };
        TmsPath {
            bits: bits & mask,
            len,
        }
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn push(&mut self, bit: bool) -> Option<()> {
        if self.len >= Self::MAX_LEN {
            return None;
        }
        self.bits |= u8::from(bit) << self.len;
        self.len += 1;
        Some(())
    }

    /// The TMS levels in clocking order.
    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).map(|i| self.bits >> i & 1 == 1)
    }

    /// Splits off the first `n` bits.
    pub fn split_at(&self, n: u8) -> (TmsPath, TmsPath) {
        let n = n.min(self.len);
        let head = TmsPath::new(self.bits, n);
        let tail = TmsPath::new(self.bits.checked_shr(u32::from(n)).unwrap_or(0), self.len - n);
        (head, tail)
    }

    /// Applies the path to `from` and returns the state it ends in.
    pub fn walk(&self, from: TapState) -> Result<TapState, TapError> {
        self.iter().try_fold(from, TapState::next)
    }
}

/// Computes the TMS bits that move the controller from `from` to `to`.
///
/// While the two states lie in different regions the path leaves the current
/// region toward the target; inside the target's region a small lookup on the
/// target's phase picks the next edge. The resulting path never exceeds
/// [`TmsPath::MAX_LEN`] bits for any pair of defined states.
pub fn tms_path(from: TapState, to: TapState) -> Result<TmsPath, TapError> {
    let to_region = to.region()?;
    let mut current = from;
    let mut path = TmsPath::default();

    while current != to {
        let current_region = current.region()?;
        let bit = if current_region != to_region {
            match current_region {
                TapRegion::TestLogicReset => false,
                TapRegion::RunTestIdle => true,
                TapRegion::DataRegister | TapRegion::InstructionRegister => {
                    !(matches!(current, TapState::DrUpdate | TapState::IrUpdate)
                        && to == TapState::Idle)
                }
            }
        } else {
            let (Some((_, from_phase)), Some((_, to_phase))) = (current.phase(), to.phase())
            else {
                return Err(TapError::UnexpectedTarget { from, to });
            };
            match to_phase {
                Phase::Select => true,
                Phase::Capture => from_phase != Phase::Select,
                Phase::Shift => !matches!(
                    from_phase,
                    Phase::Select | Phase::Capture | Phase::Exit2
                ),
                Phase::Exit1 => !matches!(from_phase, Phase::Select | Phase::Exit2),
                Phase::Pause | Phase::Exit2 => {
                    !matches!(from_phase, Phase::Select | Phase::Exit1)
                }
                Phase::Update => from_phase != Phase::Select,
            }
        };
        path.push(bit).ok_or(TapError::PathTooLong { from, to })?;
        current = current.next(bit)?;
    }
    Ok(path)
}
