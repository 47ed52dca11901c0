//! Read and write implementations for requests and responses.
//!
//! Every envelope is a frame: a little-endian `u32` payload length followed by
//! the payload. The payload is a sequence of tagged fields; each field starts
//! with a one byte type tag so that a decoder can reject envelopes whose layout
//! does not match the opcode.
use std::io::{self, Read, Write};

use crate::{
    error::ReadError,
    protocol::{Opcode, Operation, Request, Response, ScanCommand, ScanField, TrstAction, status},
    tap::{Register, TapState},
};

/// Default upper bound for a single frame.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

const TAG_U8: u8 = 0x20;
const TAG_I8: u8 = 0x21;
const TAG_U32: u8 = 0x60;
const TAG_I32: u8 = 0x61;
const TAG_BOOL: u8 = 0x80;
const TAG_STRING: u8 = 0xa0;

const FRAME_HEADER_LEN: usize = 4;

/// Accumulates the tagged fields of one payload.
#[derive(Default)]
struct FieldWriter {
    buf: Vec<u8>,
}

impl FieldWriter {
    fn u8(&mut self, value: u8) {
        self.buf.extend_from_slice(&[TAG_U8, value]);
    }

    fn i8(&mut self, value: i8) {
        self.buf.push(TAG_I8);
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.buf.push(TAG_U32);
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn i32(&mut self, value: i32) {
        self.buf.push(TAG_I32);
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn bool(&mut self, value: bool) {
        self.buf.extend_from_slice(&[TAG_BOOL, u8::from(value)]);
    }

    fn string(&mut self, value: &str) -> io::Result<()> {
        let len = u32::try_from(value.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "string too long"))?;
        self.buf.push(TAG_STRING);
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }
}

/// Walks the tagged fields of one payload.
struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(data: &'a [u8]) -> FieldReader<'a> {
        FieldReader { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ReadError> {
        if self.remaining() < len {
            return Err(ReadError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ReadError> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    fn tag(&mut self, expected: u8) -> Result<(), ReadError> {
        let [got] = self.take_array::<1>()?;
        if got != expected {
            return Err(ReadError::UnexpectedTag { expected, got });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, ReadError> {
        self.tag(TAG_U8)?;
        let [value] = self.take_array::<1>()?;
        Ok(value)
    }

    fn i8(&mut self) -> Result<i8, ReadError> {
        self.tag(TAG_I8)?;
        Ok(i8::from_le_bytes(self.take_array()?))
    }

    fn u32(&mut self) -> Result<u32, ReadError> {
        self.tag(TAG_U32)?;
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    fn i32(&mut self) -> Result<i32, ReadError> {
        self.tag(TAG_I32)?;
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    fn bool(&mut self) -> Result<bool, ReadError> {
        self.tag(TAG_BOOL)?;
        match self.take_array::<1>()? {
            [0] => Ok(false),
            [1] => Ok(true),
            [other] => Err(ReadError::InvalidFormat(format!(
                "Invalid boolean value {}",
                other
            ))),
        }
    }

    fn string(&mut self) -> Result<String, ReadError> {
        self.tag(TAG_STRING)?;
        let len = u32::from_le_bytes(self.take_array()?) as usize;
        let bytes = self.take(len)?;
        Ok(str::from_utf8(bytes)?.to_owned())
    }

    fn count(&mut self) -> Result<usize, ReadError> {
        let value = self.i32()?;
        usize::try_from(value)
            .map_err(|_| ReadError::InvalidFormat(format!("Negative count {}", value)))
    }

    fn tap_state(&mut self) -> Result<TapState, ReadError> {
        let code = self.i32()?;
        state_from_code(code)
    }

    fn finish(self) -> Result<(), ReadError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(ReadError::TrailingBytes(n)),
        }
    }
}

fn state_from_code(code: i32) -> Result<TapState, ReadError> {
    TapState::from_code(code).ok_or_else(|| ReadError::InvalidFormat(format!("Invalid TAP state {}", code)))
}

fn invalid_input(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message)
}

fn to_i32(value: u32, what: &str) -> io::Result<i32> {
    i32::try_from(value).map_err(|_| invalid_input(format!("{} {} out of range", what, value)))
}

/// Writes a length prefixed frame.
pub fn write_frame(writer: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| invalid_input("frame too large".into()))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(payload)
}

/// Reads one length prefixed frame, rejecting frames larger than `max_frame_size`.
pub fn read_frame(reader: &mut impl Read, max_frame_size: usize) -> Result<Vec<u8>, ReadError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header) as usize;
    if len > max_frame_size {
        return Err(ReadError::TooManyBytes {
            max: max_frame_size,
            got: len,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Writes the body of a scan. Output bytes are only written when `with_output` is set.
fn write_scan(w: &mut FieldWriter, scan: &ScanCommand, with_output: bool) -> io::Result<()> {
    w.bool(scan.register == Register::Instruction);
    w.i32(scan.end_state.code());
    w.i32(
        i32::try_from(scan.fields.len())
            .map_err(|_| invalid_input("too many scan fields".into()))?,
    );
    for field in &scan.fields {
        let byte_len = field.byte_len();
        let output = match &field.output {
            Some(output) if with_output => Some(sized(output, byte_len, "output")?),
            _ => None,
        };
        let capture = match &field.capture {
            Some(capture) => Some(sized(capture, byte_len, "capture")?),
            None => None,
        };
        w.i32(to_i32(field.num_bits, "field length")?);
        w.bool(output.is_none());
        w.bool(capture.is_none());
        for i in 0..byte_len {
            if let Some(output) = output {
                w.u8(output[i]);
            }
            if let Some(capture) = capture {
                w.u8(capture[i]);
            }
        }
    }
    Ok(())
}

fn sized<'a>(buf: &'a [u8], byte_len: usize, what: &str) -> io::Result<&'a [u8]> {
    if buf.len() < byte_len {
        return Err(invalid_input(format!(
            "{} buffer holds {} bytes, field needs {}",
            what,
            buf.len(),
            byte_len
        )));
    }
    Ok(&buf[..byte_len])
}

fn read_scan(r: &mut FieldReader) -> Result<ScanCommand, ReadError> {
    let register = if r.bool()? {
        Register::Instruction
    } else {
        Register::Data
    };
    let end_state = r.tap_state()?;
    let num_fields = r.count()?;
    let mut fields = Vec::with_capacity(num_fields.min(64));
    for _ in 0..num_fields {
        let num_bits = r.count()? as u32;
        let no_output = r.bool()?;
        let no_capture = r.bool()?;
        let byte_len = num_bits.div_ceil(8) as usize;
        let per_byte = usize::from(!no_output) + usize::from(!no_capture);
        // each byte is a tag and a value
        if byte_len * per_byte * 2 > r.remaining() {
            return Err(ReadError::Truncated);
        }
        let mut output = (!no_output).then(|| vec![0u8; byte_len]);
        let mut capture = (!no_capture).then(|| vec![0u8; byte_len]);
        for i in 0..byte_len {
            if let Some(output) = output.as_mut() {
                output[i] = r.u8()?;
            }
            if let Some(capture) = capture.as_mut() {
                capture[i] = r.u8()?;
            }
        }
        fields.push(ScanField {
            num_bits,
            output: output.map(Vec::into_boxed_slice),
            capture: capture.map(Vec::into_boxed_slice),
        });
    }
    Ok(ScanCommand {
        register,
        end_state,
        fields,
    })
}

impl Request {
    /// Serializes the request without the frame header.
    pub fn encode_payload(&self) -> io::Result<Vec<u8>> {
        let mut w = FieldWriter::default();
        w.u8(self.opcode() as u8);
        match self {
            Request::Hello
            | Request::Initialize
            | Request::Quit
            | Request::Shutdown
            | Request::Profiling => {}
            Request::SetPort { port } => w.string(port)?,
            Request::SetLogging { enable }
            | Request::SetTunnelMode { enable }
            | Request::SetFileLogging { enable } => w.bool(*enable),
            Request::SetSpeed { hz } => w.i32(*hz),
            Request::SetSpeedDivisor { speed } => w.i32(*speed),
            Request::SetTimeouts {
                hardware_ms,
                client_ms,
            } => {
                w.i32(*hardware_ms);
                w.i32(*client_ms);
            }
            Request::Stall { milliseconds } => w.u32(*milliseconds),
            Request::Execute(operation) => match operation {
                Operation::Scan(scan) => write_scan(&mut w, scan, true)?,
                Operation::StateMove { end_state } => w.i32(end_state.code()),
                Operation::RunTest { cycles, end_state } => {
                    w.i32(to_i32(*cycles, "cycle count")?);
                    w.i8(end_state.code() as i8);
                }
                Operation::Reset { trst } => w.i8(trst.code()),
                Operation::PathMove { path } => {
                    w.i32(
                        i32::try_from(path.len())
                            .map_err(|_| invalid_input("path too long".into()))?,
                    );
                    for state in path {
                        w.i32(state.code());
                    }
                }
                Operation::Sleep { microseconds } => w.u32(*microseconds),
            },
        }
        Ok(w.buf)
    }

    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        write_frame(writer, &self.encode_payload()?)
    }

    /// Parses a payload produced by [`Request::encode_payload`].
    pub fn decode_payload(payload: &[u8]) -> Result<Request, ReadError> {
        let mut r = FieldReader::new(payload);
        let code = r.u8()?;
        let opcode = Opcode::from_u8(code).ok_or(ReadError::InvalidOpcode(code))?;
        let request = match opcode {
            Opcode::Hello => Request::Hello,
            Opcode::Initialize => Request::Initialize,
            Opcode::Quit => Request::Quit,
            Opcode::Shutdown => Request::Shutdown,
            Opcode::Profiling => Request::Profiling,
            Opcode::SetPort => Request::SetPort { port: r.string()? },
            Opcode::SetLogging => Request::SetLogging { enable: r.bool()? },
            Opcode::SetTunnelMode => Request::SetTunnelMode { enable: r.bool()? },
            Opcode::SetFileLogging => Request::SetFileLogging { enable: r.bool()? },
            Opcode::SetSpeed => Request::SetSpeed { hz: r.i32()? },
            Opcode::SetSpeedDivisor => Request::SetSpeedDivisor { speed: r.i32()? },
            Opcode::SetTimeouts => Request::SetTimeouts {
                hardware_ms: r.i32()?,
                client_ms: r.i32()?,
            },
            Opcode::Stall => Request::Stall {
                milliseconds: r.u32()?,
            },
            Opcode::Scan => Request::Execute(Operation::Scan(read_scan(&mut r)?)),
            Opcode::StateMove => Request::Execute(Operation::StateMove {
                end_state: r.tap_state()?,
            }),
            Opcode::RunTest => Request::Execute(Operation::RunTest {
                cycles: r.count()? as u32,
                end_state: state_from_code(i32::from(r.i8()?))?,
            }),
            Opcode::Reset => {
                let code = r.i8()?;
                let trst = TrstAction::from_code(code)
                    .ok_or_else(|| ReadError::InvalidFormat(format!("Invalid TRST {}", code)))?;
                Request::Execute(Operation::Reset { trst })
            }
            Opcode::PathMove => {
                let len = r.count()?;
                // every state takes five bytes
                if len * 5 > r.remaining() {
                    return Err(ReadError::Truncated);
                }
                let path = (0..len)
                    .map(|_| r.tap_state())
                    .collect::<Result<Vec<_>, _>>()?;
                Request::Execute(Operation::PathMove { path })
            }
            Opcode::Sleep => Request::Execute(Operation::Sleep {
                microseconds: r.u32()?,
            }),
        };
        r.finish()?;
        Ok(request)
    }

    pub fn from_reader(reader: &mut impl Read, max_frame_size: usize) -> Result<Request, ReadError> {
        let payload = read_frame(reader, max_frame_size)?;
        Request::decode_payload(&payload)
    }
}

impl Response {
    /// Serializes the response without the frame header.
    pub fn encode_payload(&self) -> io::Result<Vec<u8>> {
        let mut w = FieldWriter::default();
        w.i32(self.status());
        match self {
            Response::Status(_) => {}
            Response::Hello {
                code_version,
                api_version,
            } => {
                w.i32(*code_version);
                w.i32(*api_version);
            }
            Response::SpeedDivisor { khz } => w.i32(*khz),
            Response::Profiling { report } => w.string(report)?,
            Response::Scan(scan) => write_scan(&mut w, scan, false)?,
        }
        Ok(w.buf)
    }

    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        write_frame(writer, &self.encode_payload()?)
    }

    /// Parses the answer to a request with the given opcode.
    pub fn decode_payload(opcode: Opcode, payload: &[u8]) -> Result<Response, ReadError> {
        let mut r = FieldReader::new(payload);
        let code = r.i32()?;
        let response = if code != status::OK {
            Response::Status(code)
        } else {
            match opcode {
                Opcode::Hello => Response::Hello {
                    code_version: r.i32()?,
                    api_version: r.i32()?,
                },
                Opcode::SetSpeedDivisor => Response::SpeedDivisor { khz: r.i32()? },
                Opcode::Profiling => Response::Profiling { report: r.string()? },
                Opcode::Scan => Response::Scan(read_scan(&mut r)?),
                _ => Response::Status(code),
            }
        };
        r.finish()?;
        Ok(response)
    }

    pub fn from_reader(
        reader: &mut impl Read,
        opcode: Opcode,
        max_frame_size: usize,
    ) -> Result<Response, ReadError> {
        let payload = read_frame(reader, max_frame_size)?;
        Response::decode_payload(opcode, &payload)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_le_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn write_hello() {
        let mut out = Vec::new();
        Request::Hello.write_to(&mut out).unwrap();
        assert_eq!(out, frame(&[TAG_U8, 0]));
    }

    #[test]
    fn read_set_port() {
        let mut payload = vec![TAG_U8, Opcode::SetPort as u8, TAG_STRING, 3, 0, 0, 0];
        payload.extend_from_slice(b"usb");
        let mut cursor = Cursor::new(frame(&payload));
        match Request::from_reader(&mut cursor, MAX_FRAME_SIZE).unwrap() {
            Request::SetPort { port } => assert_eq!(port, "usb"),
            other => panic!("expected SetPort, got {:?}", other),
        }
    }

    #[test]
    fn scan_bytes_are_interleaved() {
        let scan = ScanCommand {
            register: Register::Instruction,
            end_state: TapState::Idle,
            fields: vec![ScanField {
                num_bits: 12,
                output: Some(Box::new([0xab, 0x0c])),
                capture: Some(Box::new([0x11, 0x22])),
            }],
        };
        let payload = Request::Execute(Operation::Scan(scan))
            .encode_payload()
            .unwrap();
        let mut expected = vec![TAG_U8, 8, TAG_BOOL, 1, TAG_I32, 1, 0, 0, 0];
        expected.extend_from_slice(&[TAG_I32, 1, 0, 0, 0]);
        expected.extend_from_slice(&[TAG_I32, 12, 0, 0, 0, TAG_BOOL, 0, TAG_BOOL, 0]);
        expected.extend_from_slice(&[TAG_U8, 0xab, TAG_U8, 0x11, TAG_U8, 0x0c, TAG_U8, 0x22]);
        assert_eq!(payload, expected);
    }

    #[test]
    fn absent_buffers_are_not_sent() {
        let scan = ScanCommand {
            register: Register::Data,
            end_state: TapState::DrPause,
            fields: vec![ScanField::capture(32), ScanField::output(4, &[0x5])],
        };
        let request = Request::Execute(Operation::Scan(scan.clone()));
        let payload = request.encode_payload().unwrap();
        // 4 capture bytes + 1 output byte
        assert_eq!(payload.len(), 2 + 2 + 5 + 5 + 2 * (5 + 2 + 2) + 5 * 2);
        assert_eq!(Request::decode_payload(&payload).unwrap(), request);
    }

    #[test]
    fn operations_survive_encoding() {
        let operations = [
            Operation::StateMove {
                end_state: TapState::IrPause,
            },
            Operation::RunTest {
                cycles: 1000,
                end_state: TapState::Idle,
            },
            Operation::Reset {
                trst: TrstAction::Unchanged,
            },
            Operation::PathMove {
                path: vec![TapState::Idle, TapState::DrSelect, TapState::DrCapture, TapState::DrShift],
            },
            Operation::Sleep { microseconds: 250 },
        ];
        for operation in operations {
            let mut out = Vec::new();
            Request::Execute(operation.clone()).write_to(&mut out).unwrap();
            let decoded = Request::from_reader(&mut Cursor::new(out), MAX_FRAME_SIZE).unwrap();
            assert_eq!(decoded, Request::Execute(operation));
        }
    }

    #[test]
    fn scan_response_drops_output() {
        let scan = ScanCommand {
            register: Register::Data,
            end_state: TapState::Idle,
            fields: vec![ScanField {
                num_bits: 8,
                output: Some(Box::new([0xff])),
                capture: Some(Box::new([0x3c])),
            }],
        };
        let mut out = Vec::new();
        Response::Scan(scan).write_to(&mut out).unwrap();
        match Response::from_reader(&mut Cursor::new(out), Opcode::Scan, MAX_FRAME_SIZE).unwrap() {
            Response::Scan(echo) => {
                assert_eq!(echo.fields[0].output, None);
                assert_eq!(echo.fields[0].capture.as_deref(), Some(&[0x3c][..]));
            }
            other => panic!("expected Scan, got {:?}", other),
        }
    }

    #[test]
    fn failed_response_carries_only_status() {
        let mut out = Vec::new();
        Response::Status(status::DEVICE_ERROR)
            .write_to(&mut out)
            .unwrap();
        assert_eq!(out, frame(&[TAG_I32, 0x95, 0xff, 0xff, 0xff]));
        let response =
            Response::from_reader(&mut Cursor::new(out), Opcode::Scan, MAX_FRAME_SIZE).unwrap();
        assert_eq!(response, Response::Status(status::DEVICE_ERROR));
    }

    #[test]
    fn speed_divisor_response() {
        let payload = Response::SpeedDivisor { khz: 6000 }.encode_payload().unwrap();
        let response = Response::decode_payload(Opcode::SetSpeedDivisor, &payload).unwrap();
        assert_eq!(response, Response::SpeedDivisor { khz: 6000 });
    }

    #[test]
    fn invalid_opcode() {
        match Request::decode_payload(&[TAG_U8, 14]) {
            Err(ReadError::InvalidOpcode(14)) => {}
            other => panic!("expected InvalidOpcode, got {:?}", other),
        }
    }

    #[test]
    fn wrong_tag() {
        let payload = [TAG_U8, Opcode::StateMove as u8, TAG_U32, 1, 0, 0, 0];
        match Request::decode_payload(&payload) {
            Err(ReadError::UnexpectedTag { expected, got }) => {
                assert_eq!(expected, TAG_I32);
                assert_eq!(got, TAG_U32);
            }
            other => panic!("expected UnexpectedTag, got {:?}", other),
        }
    }

    #[test]
    fn trailing_bytes() {
        let payload = [TAG_U8, Opcode::Hello as u8, TAG_U8, 0];
        match Request::decode_payload(&payload) {
            Err(ReadError::TrailingBytes(2)) => {}
            other => panic!("expected TrailingBytes, got {:?}", other),
        }
    }

    #[test]
    fn truncated_scan() {
        let payload = [
            TAG_U8, 8, TAG_BOOL, 0, TAG_I32, 1, 0, 0, 0, TAG_I32, 1, 0, 0, 0, TAG_I32, 64, 0, 0,
            0, TAG_BOOL, 0, TAG_BOOL, 1, TAG_U8, 0xff,
        ];
        match Request::decode_payload(&payload) {
            Err(ReadError::Truncated) => {}
            other => panic!("expected Truncated, got {:?}", other),
        }
    }

    #[test]
    fn invalid_state_and_bool() {
        let payload = [TAG_U8, Opcode::StateMove as u8, TAG_I32, 16, 0, 0, 0];
        assert!(matches!(
            Request::decode_payload(&payload),
            Err(ReadError::InvalidFormat(_))
        ));
        let payload = [TAG_U8, Opcode::SetTunnelMode as u8, TAG_BOOL, 2];
        assert!(matches!(
            Request::decode_payload(&payload),
            Err(ReadError::InvalidFormat(_))
        ));
    }

    #[test]
    fn too_large_frame() {
        let data = 2048u32.to_le_bytes().to_vec();
        match Request::from_reader(&mut Cursor::new(data), 1024) {
            Err(ReadError::TooManyBytes { max, got }) => {
                assert_eq!(max, 1024);
                assert_eq!(got, 2048);
            }
            other => panic!("expected TooManyBytes, got {:?}", other),
        }
    }

    #[test]
    fn short_output_buffer_is_rejected() {
        let scan = ScanCommand {
            register: Register::Data,
            end_state: TapState::Idle,
            fields: vec![ScanField::output(16, &[0x01])],
        };
        let err = Request::Execute(Operation::Scan(scan))
            .encode_payload()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
