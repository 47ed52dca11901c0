use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind, Read, Write},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use fpjtag_protocol::{
    API_VERSION, CODE_VERSION, Opcode, Operation, Request, Response, codec::MAX_FRAME_SIZE,
    error::ReadError, framing::RequestCodec, status,
};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Programmer, driver::Driver, error::DriverError, profile::Profile};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct Config {
    pub max_frame_size: usize,
    pub read_write_timeout: Duration,
    /// Stop serving after this long without a client or without a request.
    pub idle_timeout: Option<Duration>,
    pub api_log_path: PathBuf,
    pub leading_bypass: u32,
    pub trailing_bypass: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            read_write_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(120)),
            api_log_path: PathBuf::from("fpserver-api.log"),
            leading_bypass: 0,
            trailing_bypass: 0,
        }
    }
}

#[derive(Debug)]
pub struct Server<P: Programmer> {
    driver: Driver<P>,
    config: Config,
    profile: Profile,
    api_log: Option<File>,
}

/// Builder to create a [Server] instance and modify configuration options
///
/// # Example
///
/// ```ignore
/// use fpjtag_server::server::Builder;
/// use std::time::Duration;
///
/// let server = Builder::new()
///     .idle_timeout(None)
///     .rw_timeout(Duration::from_secs(20))
///     .build(my_programmer);
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Set the largest request frame this server accepts.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the TCP write timeout
    pub fn rw_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_write_timeout = timeout;
        self
    }

    /// Set the idle timeout. `None` keeps the server running until a shutdown request.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set the file that receives one line per request while file logging is on.
    pub fn api_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.api_log_path = path.into();
        self
    }

    /// Set the number of bypassed TAPs around the FPGA for tunnel mode.
    pub fn bypass(mut self, leading: u32, trailing: u32) -> Self {
        self.config.leading_bypass = leading;
        self.config.trailing_bypass = trailing;
        self
    }

    /// Build and return the server
    pub fn build<P: Programmer>(self, programmer: P) -> Server<P> {
        Server::new(programmer, self.config)
    }
}

/// Why a client connection ended.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum SessionEnd {
    Disconnected,
    Idle,
    Shutdown,
}

impl<P: Programmer> Server<P> {
    pub fn new(programmer: P, config: Config) -> Server<P> {
        let driver = Driver::new(programmer).with_bypass(config.leading_bypass, config.trailing_bypass);
        Server {
            driver,
            config,
            profile: Profile::new(),
            api_log: None,
        }
    }

    pub fn driver(&self) -> &Driver<P> {
        &self.driver
    }

    pub fn listen(&mut self, addr: impl ToSocketAddrs) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(addr)?;
        self.serve(listener)?;
        Ok(())
    }

    /// Serves clients of `listener`, one at a time, until a shutdown request
    /// or until the idle timeout elapses.
    pub fn serve(&mut self, listener: TcpListener) -> io::Result<()> {
        listener.set_nonblocking(true)?;
        log::info!("Server listening for connections on {}", listener.local_addr()?);

        let mut idle_since = Instant::now();
        loop {
            match listener.accept() {
                Ok((tcp, addr)) => {
                    log::info!("New client connection from {}", addr);
                    match self.handle_client(tcp) {
                        Ok(SessionEnd::Disconnected) => log::info!("Client disconnected"),
                        Ok(SessionEnd::Idle) => {
                            log::info!("No request received, shutting down");
                            break;
                        }
                        Ok(SessionEnd::Shutdown) => {
                            log::info!("Shutdown requested");
                            break;
                        }
                        Err(e) => log::error!("Client error: {}", e),
                    }
                    idle_since = Instant::now();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if let Some(idle) = self.config.idle_timeout
                        && idle_since.elapsed() >= idle
                    {
                        log::info!("No client for {:?}, shutting down", idle);
                        break;
                    }
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => log::error!("Connection error: {}", e),
            }
        }

        if self.driver.info().is_some()
            && let Err(e) = self.driver.quit()
        {
            log::warn!("{}", e);
        }
        Ok(())
    }

    fn handle_client(&mut self, mut tcp: TcpStream) -> Result<SessionEnd, ReadError> {
        tcp.set_nonblocking(false)?;
        tcp.set_read_timeout(self.config.idle_timeout)?;
        tcp.set_write_timeout(Some(self.config.read_write_timeout))?;

        let mut codec = RequestCodec::new(self.config.max_frame_size);
        let mut input = BytesMut::with_capacity(4096);
        let mut output = BytesMut::new();
        let mut chunk = [0u8; 4096];

        loop {
            loop {
                let response = match codec.decode(&mut input) {
                    Ok(Some(request)) => {
                        let shutdown = request == Request::Shutdown;
                        let response = self.process_request(request);
                        write_response(&mut tcp, &mut codec, &mut output, response)?;
                        if shutdown {
                            return Ok(SessionEnd::Shutdown);
                        }
                        continue;
                    }
                    Ok(None) => break,
                    Err(err) if err.is_recoverable() => {
                        log::error!("Malformed request: {}", err);
                        Response::Status(status::SYNTAX_ERROR)
                    }
                    Err(err) => return Err(err),
                };
                write_response(&mut tcp, &mut codec, &mut output, response)?;
            }

            match tcp.read(&mut chunk) {
                Ok(0) => return Ok(SessionEnd::Disconnected),
                Ok(n) => input.extend_from_slice(&chunk[..n]),
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(SessionEnd::Idle);
                }
                Err(err)
                    if err.kind() == ErrorKind::ConnectionAborted
                        || err.kind() == ErrorKind::ConnectionReset =>
                {
                    return Ok(SessionEnd::Disconnected);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Handles one request and records its timing.
    fn process_request(&mut self, request: Request) -> Response {
        let opcode = request.opcode();
        log::debug!("Received {} request", opcode);
        let started = Instant::now();
        let response = self.dispatch(request);
        let elapsed = started.elapsed();
        self.profile.record(opcode, elapsed);
        self.log_api(opcode, response.status(), elapsed);
        if !response.is_ok() {
            log::debug!("{} answered with status {}", opcode, response.status());
        }
        response
    }

    fn dispatch(&mut self, request: Request) -> Response {
        match request {
            Request::Hello => Response::Hello {
                code_version: CODE_VERSION,
                api_version: API_VERSION,
            },
            Request::SetPort { port } => {
                self.driver.set_port(&port);
                Response::ok()
            }
            Request::SetLogging { enable } => {
                self.driver.set_logging(enable);
                Response::ok()
            }
            Request::Initialize => match self.driver.initialize() {
                Ok(_) => Response::ok(),
                Err(_) => Response::Status(status::INIT_FAILED),
            },
            Request::Quit => status_of(self.driver.quit()),
            Request::SetTunnelMode { enable } => {
                self.driver.set_tunnel_mode(enable);
                Response::ok()
            }
            Request::SetSpeed { hz } => status_of(self.driver.set_speed(hz)),
            Request::SetSpeedDivisor { .. } => match self.driver.tck_khz() {
                Ok(khz) => Response::SpeedDivisor { khz: khz as i32 },
                Err(err) => {
                    log::error!("{}", err);
                    Response::Status(err.status())
                }
            },
            Request::Execute(mut operation) => match self.driver.execute(&mut operation) {
                Ok(()) => match operation {
                    Operation::Scan(scan) => Response::Scan(scan),
                    _ => Response::ok(),
                },
                Err(err) => Response::Status(err.status()),
            },
            Request::Shutdown => Response::ok(),
            Request::Profiling => Response::Profiling {
                report: self.profile.report(),
            },
            Request::SetTimeouts {
                hardware_ms,
                client_ms,
            } => {
                log::info!(
                    "Client timeouts: hardware {} ms, client {} ms",
                    hardware_ms,
                    client_ms
                );
                self.profile.set_timeouts(hardware_ms, client_ms);
                Response::ok()
            }
            Request::Stall { milliseconds } => {
                thread::sleep(Duration::from_millis(u64::from(milliseconds)));
                Response::ok()
            }
            Request::SetFileLogging { enable } => match self.set_file_logging(enable) {
                Ok(()) => Response::ok(),
                Err(err) => {
                    log::error!(
                        "Cannot open {}: {}",
                        self.config.api_log_path.display(),
                        err
                    );
                    Response::Status(status::FAIL)
                }
            },
        }
    }

    fn set_file_logging(&mut self, enable: bool) -> io::Result<()> {
        self.api_log = if enable {
            Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.config.api_log_path)?,
            )
        } else {
            None
        };
        Ok(())
    }

    fn log_api(&mut self, opcode: Opcode, status: i32, elapsed: Duration) {
        if let Some(file) = self.api_log.as_mut()
            && let Err(err) = writeln!(file, "{} {} {}", opcode.name(), status, elapsed.as_micros())
        {
            log::warn!("API log write failed: {}", err);
        }
    }
}

fn status_of(result: Result<(), DriverError>) -> Response {
    match result {
        Ok(()) => Response::ok(),
        Err(err) => {
            log::error!("{}", err);
            Response::Status(err.status())
        }
    }
}

fn write_response(
    tcp: &mut TcpStream,
    codec: &mut RequestCodec,
    output: &mut BytesMut,
    response: Response,
) -> Result<(), ReadError> {
    codec.encode(response, output)?;
    log::trace!("Response frame: {:02x?}", &output[..]);
    tcp.write_all(output)?;
    output.clear();
    Ok(())
}

#[cfg(test)]
mod test {
    use std::thread::JoinHandle;

    use fpjtag_protocol::{
        ScanCommand, ScanField,
        tap::{Register, TapState},
    };

    use super::*;
    use crate::sim::Loopback;

    fn start(builder: Builder) -> (std::net::SocketAddr, JoinHandle<io::Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut server = builder.build(Loopback::new());
        let handle = thread::spawn(move || server.serve(listener));
        (addr, handle)
    }

    fn call(tcp: &mut TcpStream, request: Request) -> Response {
        request.write_to(tcp).unwrap();
        Response::from_reader(tcp, request.opcode(), MAX_FRAME_SIZE).unwrap()
    }

    #[test]
    fn hello_scan_and_shutdown() {
        let (addr, handle) = start(Builder::new());
        let mut tcp = TcpStream::connect(addr).unwrap();
        assert_eq!(
            call(&mut tcp, Request::Hello),
            Response::Hello {
                code_version: 1,
                api_version: 1
            }
        );
        let scan = ScanCommand {
            register: Register::Data,
            end_state: TapState::Idle,
            fields: vec![ScanField::exchange(12, &[0x21, 0x03])],
        };
        let Response::Scan(answer) = call(&mut tcp, Operation::Scan(scan).into()) else {
            panic!("expected scan response")
        };
        assert_eq!(answer.fields[0].capture.as_deref(), Some(&[0x21, 0x03][..]));
        assert_eq!(answer.fields[0].output, None);

        assert_eq!(call(&mut tcp, Request::Shutdown), Response::ok());
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn malformed_request_keeps_connection() {
        let (addr, handle) = start(Builder::new());
        let mut tcp = TcpStream::connect(addr).unwrap();
        // opcode 14 is unassigned
        tcp.write_all(b"\x02\x00\x00\x00\x20\x0e").unwrap();
        let response = Response::from_reader(&mut tcp, Opcode::Hello, MAX_FRAME_SIZE).unwrap();
        assert_eq!(response, Response::Status(status::SYNTAX_ERROR));
        assert!(call(&mut tcp, Request::Hello).is_ok());
        call(&mut tcp, Request::Shutdown);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn oversized_frame_closes_connection() {
        let (addr, handle) = start(Builder::new().max_frame_size(16));
        let mut tcp = TcpStream::connect(addr).unwrap();
        tcp.write_all(&1024u32.to_le_bytes()).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(tcp.read(&mut buf).unwrap_or(0), 0);

        let mut tcp = TcpStream::connect(addr).unwrap();
        call(&mut tcp, Request::Shutdown);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn stops_without_client() {
        let (_, handle) = start(Builder::new().idle_timeout(Some(Duration::from_millis(100))));
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn stops_when_client_is_silent() {
        let (addr, handle) = start(Builder::new().idle_timeout(Some(Duration::from_millis(200))));
        let mut tcp = TcpStream::connect(addr).unwrap();
        assert!(call(&mut tcp, Request::Hello).is_ok());
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn failing_operation_reports_status() {
        let (addr, handle) = start(Builder::new());
        let mut tcp = TcpStream::connect(addr).unwrap();
        assert_eq!(
            call(&mut tcp, Request::SetSpeed { hz: 1_000_000 }),
            Response::Status(status::DEVICE_ERROR)
        );
        call(&mut tcp, Request::SetPort { port: "S2012".to_string() });
        assert_eq!(
            call(&mut tcp, Request::Initialize),
            Response::Status(status::INIT_FAILED)
        );
        call(&mut tcp, Request::SetPort { port: String::new() });
        assert!(call(&mut tcp, Request::Initialize).is_ok());
        assert_eq!(
            call(&mut tcp, Request::SetSpeedDivisor { speed: 0 }),
            Response::SpeedDivisor { khz: 6000 }
        );
        call(&mut tcp, Request::Shutdown);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn profiling_and_api_log() {
        let path = std::env::temp_dir().join(format!("fpserver-api-{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let (addr, handle) = start(Builder::new().api_log_path(&path));
        let mut tcp = TcpStream::connect(addr).unwrap();

        call(&mut tcp, Request::SetFileLogging { enable: true });
        call(&mut tcp, Request::Hello);
        call(&mut tcp, Request::SetFileLogging { enable: false });
        call(&mut tcp, Request::Hello);
        call(
            &mut tcp,
            Request::SetTimeouts {
                hardware_ms: 1700,
                client_ms: 0,
            },
        );
        let Response::Profiling { report } = call(&mut tcp, Request::Profiling) else {
            panic!("expected profiling report")
        };
        call(&mut tcp, Request::Shutdown);
        handle.join().unwrap().unwrap();

        assert!(report.contains("timeouts: hardware 1700 ms, client 0 ms"));
        let hello = report.lines().find(|l| l.starts_with("hello")).unwrap();
        assert!(hello.contains("2 calls"));

        let log = std::fs::read_to_string(&path).unwrap();
        let names: Vec<&str> = log.lines().filter_map(|l| l.split(' ').next()).collect();
        assert_eq!(names, ["set_server_file_logger", "hello"]);
        let _ = std::fs::remove_file(&path);
    }
}
