use fpjtag_protocol::{
    Opcode, Operation, Request, Response, ScanCommand, TrstAction,
    tap::TapState,
};

use crate::{
    config::Config,
    error::ClientError,
    launcher::{Launcher, ProcessLauncher},
    session::Session,
};

/// Converts a TCK frequency in kHz to the value expected by [`Client::set_speed`].
pub fn khz_to_speed(khz: i32) -> i32 {
    khz.saturating_mul(1000)
}

/// High-level access to a companion: one method per request kind.
///
/// Transport failures are fatal. With [`Config::fail_stop`] set they terminate
/// the process, otherwise they are returned and the client should be dropped.
pub struct Client<L: Launcher = ProcessLauncher> {
    session: Session<L>,
}

impl Client<ProcessLauncher> {
    pub fn new(config: Config) -> Result<Client, ClientError> {
        let enabled = config.fail_stop;
        let session = Session::new(config).map_err(ClientError::Transport);
        Ok(Client {
            session: fail_stop(enabled, session)?,
        })
    }
}

fn fail_stop<T>(enabled: bool, result: Result<T, ClientError>) -> Result<T, ClientError> {
    if let Err(err) = &result
        && enabled
        && err.is_fatal()
    {
        log::error!("{}, terminating", err);
        std::process::exit(1);
    }
    result
}

impl<L: Launcher> Client<L> {
    pub fn with_session(session: Session<L>) -> Client<L> {
        Client { session }
    }

    pub fn session(&self) -> &Session<L> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session<L> {
        &mut self.session
    }

    fn call(&mut self, request: &Request) -> Result<Response, ClientError> {
        let opcode = request.opcode();
        let response = self
            .session
            .send(request)
            .map_err(ClientError::Transport);
        let response = fail_stop(self.session.config().fail_stop, response)?;
        if !response.is_ok() {
            return Err(ClientError::Status {
                opcode,
                code: response.status(),
            });
        }
        Ok(response)
    }

    fn call_ok(&mut self, request: Request) -> Result<(), ClientError> {
        self.call(&request).map(|_| ())
    }

    /// Returns the companion's code and API version.
    pub fn hello(&mut self) -> Result<(i32, i32), ClientError> {
        match self.call(&Request::Hello)? {
            Response::Hello {
                code_version,
                api_version,
            } => Ok((code_version, api_version)),
            _ => Err(ClientError::UnexpectedResponse {
                opcode: Opcode::Hello,
            }),
        }
    }

    pub fn set_port(&mut self, port: &str) -> Result<(), ClientError> {
        self.call_ok(Request::SetPort {
            port: port.to_string(),
        })
    }

    pub fn set_logging(&mut self, enable: bool) -> Result<(), ClientError> {
        self.call_ok(Request::SetLogging { enable })
    }

    pub fn initialize(&mut self) -> Result<(), ClientError> {
        self.call_ok(Request::Initialize)
    }

    /// Closes the programmer and the session.
    pub fn quit(&mut self) -> Result<(), ClientError> {
        let result = self.call_ok(Request::Quit);
        self.session.close();
        result
    }

    pub fn set_tunnel_mode(&mut self, enable: bool) -> Result<(), ClientError> {
        self.call_ok(Request::SetTunnelMode { enable })
    }

    pub fn set_speed(&mut self, hz: i32) -> Result<(), ClientError> {
        self.call_ok(Request::SetSpeed { hz })
    }

    /// Returns the TCK frequency in use, in kHz.
    pub fn speed_divisor(&mut self, speed: i32) -> Result<i32, ClientError> {
        match self.call(&Request::SetSpeedDivisor { speed })? {
            Response::SpeedDivisor { khz } => Ok(khz),
            _ => Err(ClientError::UnexpectedResponse {
                opcode: Opcode::SetSpeedDivisor,
            }),
        }
    }

    /// Executes one operation. Captured scan data is copied into the
    /// operation's capture buffers.
    pub fn execute(&mut self, operation: &mut Operation) -> Result<(), ClientError> {
        let response = self.call(&Request::Execute(operation.clone()))?;
        match (operation, response) {
            (Operation::Scan(scan), Response::Scan(answer)) => {
                if !answer_matches(scan, &answer) {
                    log::error!(
                        "Scan answer with {} fields does not match the {} requested",
                        answer.fields.len(),
                        scan.fields.len()
                    );
                    return Err(ClientError::UnexpectedResponse {
                        opcode: Opcode::Scan,
                    });
                }
                for (field, answered) in scan.fields.iter_mut().zip(answer.fields) {
                    let needed = field.byte_len();
                    if let (Some(capture), Some(captured)) =
                        (field.capture.as_deref_mut(), answered.capture)
                    {
                        capture[..needed].copy_from_slice(&captured);
                    }
                }
                Ok(())
            }
            (Operation::Scan(_), _) => Err(ClientError::UnexpectedResponse {
                opcode: Opcode::Scan,
            }),
            _ => Ok(()),
        }
    }

    pub fn scan(&mut self, command: &mut ScanCommand) -> Result<(), ClientError> {
        let mut operation = Operation::Scan(ScanCommand {
            register: command.register,
            end_state: command.end_state,
            fields: std::mem::take(&mut command.fields),
        });
        let result = self.execute(&mut operation);
        if let Operation::Scan(scanned) = operation {
            *command = scanned;
        }
        result
    }

    pub fn state_move(&mut self, end_state: TapState) -> Result<(), ClientError> {
        self.execute(&mut Operation::StateMove { end_state })
    }

    pub fn run_test(&mut self, cycles: u32, end_state: TapState) -> Result<(), ClientError> {
        self.execute(&mut Operation::RunTest { cycles, end_state })
    }

    pub fn reset(&mut self, trst: TrstAction) -> Result<(), ClientError> {
        self.execute(&mut Operation::Reset { trst })
    }

    pub fn path_move(&mut self, path: &[TapState]) -> Result<(), ClientError> {
        self.execute(&mut Operation::PathMove {
            path: path.to_vec(),
        })
    }

    pub fn sleep(&mut self, microseconds: u32) -> Result<(), ClientError> {
        self.execute(&mut Operation::Sleep { microseconds })
    }

    /// Stops the companion and closes the session.
    pub fn shutdown(&mut self) -> Result<(), ClientError> {
        let result = self.call_ok(Request::Shutdown);
        self.session.close();
        result
    }

    pub fn profiling(&mut self) -> Result<String, ClientError> {
        match self.call(&Request::Profiling)? {
            Response::Profiling { report } => Ok(report),
            _ => Err(ClientError::UnexpectedResponse {
                opcode: Opcode::Profiling,
            }),
        }
    }

    pub fn set_timeouts(&mut self, hardware_ms: i32, client_ms: i32) -> Result<(), ClientError> {
        self.call_ok(Request::SetTimeouts {
            hardware_ms,
            client_ms,
        })
    }

    /// Asks the companion to wait `milliseconds` before answering.
    pub fn stall(&mut self, milliseconds: u32) -> Result<(), ClientError> {
        self.call_ok(Request::Stall { milliseconds })
    }

    pub fn set_file_logging(&mut self, enable: bool) -> Result<(), ClientError> {
        self.call_ok(Request::SetFileLogging { enable })
    }

    /// Executes `operations` in order and stops at the first failure.
    pub fn execute_queue(&mut self, operations: &mut [Operation]) -> Result<(), ClientError> {
        for (index, operation) in operations.iter_mut().enumerate() {
            let opcode = operation.opcode();
            self.execute(operation)
                .map_err(|source| ClientError::Queue {
                    index,
                    opcode,
                    source: Box::new(source),
                })?;
        }
        Ok(())
    }

    /// Greets the companion and brings the programmer up as configured.
    /// Returns the companion's code and API version.
    pub fn open(&mut self) -> Result<(i32, i32), ClientError> {
        let config = self.session.config().clone();
        let versions = self.hello()?;
        log::info!(
            "Companion code version {}, API version {}",
            versions.0,
            versions.1
        );
        self.set_port(&config.programmer_port)?;
        self.set_logging(config.logging)?;
        self.initialize()?;
        self.set_tunnel_mode(config.tunnel_mode)?;
        self.set_timeouts(
            millis(config.hardware_timeout),
            millis(config.client_timeout),
        )?;
        Ok(versions)
    }
}

/// Every requested capture must come back with exactly the field's byte length.
fn answer_matches(request: &ScanCommand, answer: &ScanCommand) -> bool {
    request.fields.len() == answer.fields.len()
        && request
            .fields
            .iter()
            .zip(&answer.fields)
            .all(|(field, answered)| {
                field.num_bits == answered.num_bits
                    && match (&field.capture, &answered.capture) {
                        (Some(capture), Some(captured)) => {
                            captured.len() == field.byte_len() && capture.len() >= field.byte_len()
                        }
                        (None, _) => true,
                        (Some(_), None) => false,
                    }
            })
}

fn millis(duration: std::time::Duration) -> i32 {
    i32::try_from(duration.as_millis()).unwrap_or(i32::MAX)
}

#[test]
fn khz_conversion() {
    assert_eq!(khz_to_speed(6000), 6_000_000);
    assert_eq!(khz_to_speed(i32::MAX), i32::MAX);
}

#[cfg(test)]
mod test {
    use std::{net::TcpListener, sync::Arc, thread};

    use fpjtag_protocol::{ScanField, codec::MAX_FRAME_SIZE, tap::Register};

    use super::*;
    use crate::{config::Builder, watchdog::ExpiryAction};

    /// A companion that answers every scan with the fields `answer` makes of the request.
    fn client_with_answers(answer: fn(ScanCommand) -> ScanCommand) -> Client {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (mut tcp, _) = listener.accept().unwrap();
            while let Ok(request) = Request::from_reader(&mut tcp, MAX_FRAME_SIZE) {
                let Request::Execute(Operation::Scan(scan)) = request else {
                    panic!("expected scan request")
                };
                Response::Scan(answer(scan)).write_to(&mut tcp).unwrap();
            }
        });
        let config = Builder::new().port(port).fail_stop(false).build();
        let launcher = ProcessLauncher::new(&config.server_path, Vec::new());
        let action: ExpiryAction = Arc::new(|opcode, _| panic!("'{}' expired", opcode));
        Client::with_session(Session::with_launcher(config, launcher, action).unwrap())
    }

    fn two_captures() -> ScanCommand {
        ScanCommand {
            register: Register::Data,
            end_state: TapState::Idle,
            fields: vec![ScanField::capture(8), ScanField::capture(12)],
        }
    }

    fn assert_rejected(client: &mut Client) {
        let mut scan = two_captures();
        match client.scan(&mut scan) {
            Err(ClientError::UnexpectedResponse {
                opcode: Opcode::Scan,
            }) => {}
            other => panic!("expected unexpected response, got {:?}", other),
        }
        assert_eq!(scan, two_captures());
    }

    #[test]
    fn answer_without_fields_is_rejected() {
        let mut client = client_with_answers(|scan| ScanCommand {
            fields: vec![],
            ..scan
        });
        assert_rejected(&mut client);
    }

    #[test]
    fn answer_without_capture_is_rejected() {
        let mut client = client_with_answers(|mut scan| {
            scan.fields[1].capture = None;
            scan
        });
        assert_rejected(&mut client);
    }

    #[test]
    fn answer_with_short_field_is_rejected() {
        let mut client = client_with_answers(|mut scan| {
            scan.fields[1] = ScanField::capture(4);
            scan
        });
        assert_rejected(&mut client);
    }

    #[test]
    fn matching_answer_fills_captures() {
        let mut client = client_with_answers(|mut scan| {
            scan.fields[0].capture = Some(vec![0xa5].into_boxed_slice());
            scan.fields[1].capture = Some(vec![0x34, 0x0c].into_boxed_slice());
            scan
        });
        let mut scan = two_captures();
        client.scan(&mut scan).unwrap();
        assert_eq!(scan.fields[0].capture.as_deref(), Some(&[0xa5][..]));
        assert_eq!(scan.fields[1].capture.as_deref(), Some(&[0x34, 0x0c][..]));
    }
}
