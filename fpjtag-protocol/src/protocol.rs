use std::fmt::Display;

use crate::tap::{Register, TapState};

/// Version reported by a companion in its hello response.
pub const CODE_VERSION: i32 = 1;
/// Version of the request/response layout.
pub const API_VERSION: i32 = 1;

/// Status codes carried at the start of every response.
pub mod status {
    pub const OK: i32 = 0;
    pub const FAIL: i32 = -4;
    pub const INIT_FAILED: i32 = -100;
    pub const DEVICE_ERROR: i32 = -107;
    pub const SYNTAX_ERROR: i32 = -601;
}

/// The closed set of request kinds. The discriminant is the byte sent on the wire.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Hello = 0,
    SetPort = 1,
    SetLogging = 2,
    Initialize = 3,
    Quit = 4,
    SetTunnelMode = 5,
    SetSpeed = 6,
    SetSpeedDivisor = 7,
    Scan = 8,
    StateMove = 9,
    RunTest = 10,
    Reset = 11,
    PathMove = 12,
    Sleep = 13,
    // 14 separates the JTAG operations from the management requests
    Shutdown = 15,
    Profiling = 16,
    SetTimeouts = 17,
    Stall = 18,
    SetFileLogging = 19,
}

impl Opcode {
    pub const ALL: [Opcode; 19] = [
        Opcode::Hello,
        Opcode::SetPort,
        Opcode::SetLogging,
        Opcode::Initialize,
        Opcode::Quit,
        Opcode::SetTunnelMode,
        Opcode::SetSpeed,
        Opcode::SetSpeedDivisor,
        Opcode::Scan,
        Opcode::StateMove,
        Opcode::RunTest,
        Opcode::Reset,
        Opcode::PathMove,
        Opcode::Sleep,
        Opcode::Shutdown,
        Opcode::Profiling,
        Opcode::SetTimeouts,
        Opcode::Stall,
        Opcode::SetFileLogging,
    ];

    pub fn from_u8(value: u8) -> Option<Opcode> {
        Opcode::ALL.into_iter().find(|op| *op as u8 == value)
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Hello => "hello",
            Opcode::SetPort => "set_usb_port",
            Opcode::SetLogging => "logging",
            Opcode::Initialize => "initialize",
            Opcode::Quit => "quit",
            Opcode::SetTunnelMode => "set_ujtag",
            Opcode::SetSpeed => "speed",
            Opcode::SetSpeedDivisor => "speed_div",
            Opcode::Scan => "scan",
            Opcode::StateMove => "statemove",
            Opcode::RunTest => "runtest",
            Opcode::Reset => "reset",
            Opcode::PathMove => "pathmove",
            Opcode::Sleep => "sleep",
            Opcode::Shutdown => "shutdown",
            Opcode::Profiling => "profiling",
            Opcode::SetTimeouts => "set_timeouts",
            Opcode::Stall => "stall",
            Opcode::SetFileLogging => "set_server_file_logger",
        }
    }

    /// Relative cost of a request. A client multiplies this with its
    /// per-unit timeout to get the deadline of a call.
    pub fn default_weight(self) -> u32 {
        match self {
            Opcode::Hello => 1,
            Opcode::SetPort => 1,
            Opcode::SetLogging => 1,
            Opcode::Initialize => 80,
            Opcode::Quit => 50,
            Opcode::SetTunnelMode => 3,
            Opcode::SetSpeed => 3,
            Opcode::SetSpeedDivisor => 3,
            Opcode::Scan => 12,
            Opcode::StateMove => 6,
            Opcode::RunTest => 6,
            Opcode::Reset => 6,
            Opcode::PathMove => 6,
            Opcode::Sleep => 90,
            Opcode::Shutdown => 70,
            Opcode::Profiling => 2,
            Opcode::SetTimeouts => 1,
            Opcode::Stall => 20,
            Opcode::SetFileLogging => 1,
        }
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Action on the TRST pin requested by a reset operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TrstAction {
    Deassert,
    Assert,
    Unchanged,
}

impl TrstAction {
    pub fn code(self) -> i8 {
        match self {
            TrstAction::Deassert => 0,
            TrstAction::Assert => 1,
            TrstAction::Unchanged => -1,
        }
    }

    pub fn from_code(code: i8) -> Option<TrstAction> {
        match code {
            0 => Some(TrstAction::Deassert),
            1 => Some(TrstAction::Assert),
            -1 => Some(TrstAction::Unchanged),
            _ => None,
        }
    }
}

/// One contiguous piece of a scan.
///
/// Both buffers, when present, hold `num_bits.div_ceil(8)` bytes with the first
/// bit shifted in the LSB of the first byte. Without output the field shifts
/// zeros; without a capture buffer the data shifted out is discarded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScanField {
    pub num_bits: u32,
    pub output: Option<Box<[u8]>>,
    pub capture: Option<Box<[u8]>>,
}

impl ScanField {
    /// A field that drives `output` and discards what is shifted out.
    pub fn output(num_bits: u32, output: &[u8]) -> ScanField {
        ScanField {
            num_bits,
            output: Some(output.into()),
            capture: None,
        }
    }

    /// A field that shifts zeros and keeps what is shifted out.
    pub fn capture(num_bits: u32) -> ScanField {
        ScanField {
            num_bits,
            output: None,
            capture: Some(vec![0; Self::byte_len_for(num_bits)].into_boxed_slice()),
        }
    }

    /// A field that drives `output` and keeps what is shifted out.
    pub fn exchange(num_bits: u32, output: &[u8]) -> ScanField {
        ScanField {
            num_bits,
            output: Some(output.into()),
            capture: Some(vec![0; Self::byte_len_for(num_bits)].into_boxed_slice()),
        }
    }

    pub fn byte_len(&self) -> usize {
        Self::byte_len_for(self.num_bits)
    }

    fn byte_len_for(num_bits: u32) -> usize {
        num_bits.div_ceil(8) as usize
    }
}

#[test]
fn scan_field_buffers_are_sized_to_bits() {
    assert_eq!(ScanField::capture(130).capture.unwrap().len(), 17);
    assert_eq!(ScanField::capture(8).byte_len(), 1);
    assert_eq!(ScanField::capture(0).byte_len(), 0);
}

/// A shift through one register, made of one or more fields.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScanCommand {
    pub register: Register,
    pub end_state: TapState,
    pub fields: Vec<ScanField>,
}

impl ScanCommand {
    pub fn num_bits(&self) -> u64 {
        self.fields.iter().map(|f| u64::from(f.num_bits)).sum()
    }
}

/// A single JTAG operation as queued by a caller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Operation {
    Scan(ScanCommand),
    StateMove { end_state: TapState },
    RunTest { cycles: u32, end_state: TapState },
    Reset { trst: TrstAction },
    /// Visits every state in order. The first and last states must be stable.
    PathMove { path: Vec<TapState> },
    Sleep { microseconds: u32 },
}

impl Operation {
    pub fn opcode(&self) -> Opcode {
        match self {
            Operation::Scan(_) => Opcode::Scan,
            Operation::StateMove { .. } => Opcode::StateMove,
            Operation::RunTest { .. } => Opcode::RunTest,
            Operation::Reset { .. } => Opcode::Reset,
            Operation::PathMove { .. } => Opcode::PathMove,
            Operation::Sleep { .. } => Opcode::Sleep,
        }
    }
}

/// A request is sent from the client to the companion.
/// Every request is answered by exactly one [`Response`] before the next one is sent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Request {
    /// Query the companion's code and API version.
    Hello,
    /// Select the programmer port used by the next [`Request::Initialize`].
    SetPort { port: String },
    /// Raise per-operation logging of the companion.
    SetLogging { enable: bool },
    /// Find and open the programmer.
    Initialize,
    /// Close the programmer.
    Quit,
    /// Route all JTAG operations through the tunnel bridge.
    SetTunnelMode { enable: bool },
    /// Set the TCK frequency in Hz.
    SetSpeed { hz: i32 },
    /// Query the TCK frequency actually in use.
    SetSpeedDivisor { speed: i32 },
    Execute(Operation),
    /// Stop the companion process after answering.
    Shutdown,
    /// Query the companion's per-request timing report.
    Profiling,
    SetTimeouts { hardware_ms: i32, client_ms: i32 },
    /// Delay the answer. Useful to exercise client deadlines.
    Stall { milliseconds: u32 },
    SetFileLogging { enable: bool },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Hello => Opcode::Hello,
            Request::SetPort { .. } => Opcode::SetPort,
            Request::SetLogging { .. } => Opcode::SetLogging,
            Request::Initialize => Opcode::Initialize,
            Request::Quit => Opcode::Quit,
            Request::SetTunnelMode { .. } => Opcode::SetTunnelMode,
            Request::SetSpeed { .. } => Opcode::SetSpeed,
            Request::SetSpeedDivisor { .. } => Opcode::SetSpeedDivisor,
            Request::Execute(operation) => operation.opcode(),
            Request::Shutdown => Opcode::Shutdown,
            Request::Profiling => Opcode::Profiling,
            Request::SetTimeouts { .. } => Opcode::SetTimeouts,
            Request::Stall { .. } => Opcode::Stall,
            Request::SetFileLogging { .. } => Opcode::SetFileLogging,
        }
    }
}

impl From<Operation> for Request {
    fn from(value: Operation) -> Self {
        Request::Execute(value)
    }
}

/// The companion's answer to a [`Request`].
///
/// A response with a non-zero status never carries opcode specific fields
/// and always decodes to [`Response::Status`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Response {
    Status(i32),
    Hello { code_version: i32, api_version: i32 },
    SpeedDivisor { khz: i32 },
    Profiling { report: String },
    /// The executed scan with captured data in every field that asked for it.
    /// Output data is not echoed.
    Scan(ScanCommand),
}

impl Response {
    pub fn ok() -> Response {
        Response::Status(status::OK)
    }

    pub fn status(&self) -> i32 {
        match self {
            Response::Status(code) => *code,
            _ => status::OK,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status() == status::OK
    }
}

#[test]
fn opcodes_are_a_closed_set() {
    for op in Opcode::ALL {
        assert_eq!(Opcode::from_u8(op as u8), Some(op));
    }
    assert_eq!(Opcode::from_u8(14), None);
    assert_eq!(Opcode::from_u8(20), None);
    assert_eq!(Opcode::from_u8(0xff), None);
}

#[test]
fn heavy_requests_have_large_weights() {
    assert_eq!(Opcode::Initialize.default_weight(), 80);
    assert_eq!(Opcode::Sleep.default_weight(), 90);
    assert_eq!(Opcode::Scan.default_weight(), 12);
    assert!(Opcode::ALL.iter().all(|op| op.default_weight() > 0));
}

#[test]
fn failed_response_reports_status() {
    assert!(Response::ok().is_ok());
    assert_eq!(Response::Status(status::DEVICE_ERROR).status(), -107);
    assert!(Response::SpeedDivisor { khz: 6000 }.is_ok());
}
