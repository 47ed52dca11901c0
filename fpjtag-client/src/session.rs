use std::{
    io::{self, ErrorKind},
    net::{Shutdown, SocketAddr, TcpStream},
    thread,
};

use fpjtag_protocol::{Request, Response, codec::MAX_FRAME_SIZE};

use crate::{
    config::Config,
    error::TransportError,
    launcher::{Companion, Launcher, ProcessLauncher},
    timeout::TimeoutPolicy,
    watchdog::{ExpiryAction, Watchdog, terminate_process},
};

/// The connection to one companion process.
///
/// Requests are sent one at a time and every request waits for its response.
/// The connection is made on first use; with `autostart` the companion is
/// started first.
pub struct Session<L: Launcher = ProcessLauncher> {
    config: Config,
    policy: TimeoutPolicy,
    launcher: L,
    watchdog: Watchdog,
    tcp: Option<TcpStream>,
    companion: Option<Box<dyn Companion>>,
}

impl Session<ProcessLauncher> {
    /// A session that starts the configured companion binary and terminates
    /// the process when a call expires.
    pub fn new(config: Config) -> Result<Session, TransportError> {
        let launcher = ProcessLauncher::new(&config.server_path, config.server_args.clone());
        Session::with_launcher(config, launcher, terminate_process())
    }
}

impl<L: Launcher> Session<L> {
    pub fn with_launcher(
        config: Config,
        launcher: L,
        on_expiry: ExpiryAction,
    ) -> Result<Session<L>, TransportError> {
        Ok(Session {
            policy: TimeoutPolicy::from_config(&config),
            config,
            launcher,
            watchdog: Watchdog::new(on_expiry)?,
            tcp: None,
            companion: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn policy_mut(&mut self) -> &mut TimeoutPolicy {
        &mut self.policy
    }

    pub fn is_connected(&self) -> bool {
        self.tcp.is_some()
    }

    /// Process id of the companion started by this session.
    pub fn companion_id(&self) -> Option<u32> {
        self.companion.as_ref().map(|c| c.id())
    }

    /// Connects to the companion unless already connected.
    pub fn connect(&mut self) -> Result<(), TransportError> {
        if self.tcp.is_some() {
            return Ok(());
        }
        let addr = SocketAddr::new(self.config.ip, self.config.port);
        let tcp = if self.config.autostart {
            if self.companion.is_none() {
                let companion = self
                    .launcher
                    .launch(self.config.port, self.config.companion_idle_timeout())
                    .map_err(TransportError::Spawn)?;
                self.companion = Some(companion);
            }
            self.connect_with_retry(addr)?
        } else {
            TcpStream::connect(addr).map_err(|source| TransportError::Connect { addr, source })?
        };
        tcp.set_nodelay(true)?;
        log::info!("Connected to companion at {}", addr);
        self.tcp = Some(tcp);
        Ok(())
    }

    fn connect_with_retry(&self, addr: SocketAddr) -> Result<TcpStream, TransportError> {
        let retry = self.config.connect_retry;
        let mut last_error = io::Error::from(ErrorKind::TimedOut);
        for attempt in 1..=retry.attempts {
            match TcpStream::connect(addr) {
                Ok(tcp) => {
                    thread::sleep(retry.settle);
                    return Ok(tcp);
                }
                Err(err) => {
                    log::debug!("Connection attempt {} to {} failed: {}", attempt, addr, err);
                    last_error = err;
                    thread::sleep(retry.delay);
                }
            }
        }
        Err(TransportError::Connect {
            addr,
            source: last_error,
        })
    }

    /// Sends `request` and waits for its response under the call's deadline.
    ///
    /// After an error the connection is dropped.
    pub fn send(&mut self, request: &Request) -> Result<Response, TransportError> {
        let opcode = request.opcode();
        let guard = self
            .policy
            .allowed_duration(opcode, self.is_connected())
            .map(|allowed| self.watchdog.arm(opcode, allowed));

        let result = self.exchange(request);
        if let Some(guard) = guard {
            guard.disarm();
        }
        if let Err(err) = &result {
            log::error!("'{}' to companion failed: {}", opcode, err);
            self.tcp = None;
        }
        result
    }

    fn exchange(&mut self, request: &Request) -> Result<Response, TransportError> {
        self.connect()?;
        let tcp = self
            .tcp
            .as_mut()
            .ok_or_else(|| io::Error::from(ErrorKind::NotConnected))?;
        request.write_to(tcp)?;
        Ok(Response::from_reader(tcp, request.opcode(), MAX_FRAME_SIZE)?)
    }

    /// Closes the connection and, with `autokill`, stops a companion started by
    /// this session.
    pub fn close(&mut self) {
        if let Some(tcp) = self.tcp.take() {
            match tcp.shutdown(Shutdown::Both) {
                Ok(()) => log::debug!("Connection to companion closed"),
                Err(err) => log::debug!("Closing connection to companion: {}", err),
            }
        }
        if let Some(mut companion) = self.companion.take() {
            if !self.config.autokill {
                log::debug!("Leaving companion {} running", companion.id());
            } else if let Err(err) = companion.terminate() {
                log::warn!("Cannot stop companion {}: {}", companion.id(), err);
            }
        }
    }
}

impl<L: Launcher> Drop for Session<L> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use std::{
        net::TcpListener,
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use fpjtag_protocol::Opcode;

    use super::*;
    use crate::config::Builder;

    struct FakeCompanion {
        terminated: Arc<AtomicBool>,
    }

    impl Companion for FakeCompanion {
        fn id(&self) -> u32 {
            4242
        }

        fn terminate(&mut self) -> io::Result<()> {
            self.terminated.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Starts a thread that answers hello requests after a short start-up delay.
    #[derive(Default)]
    struct FakeLauncher {
        launches: Arc<AtomicUsize>,
        terminated: Arc<AtomicBool>,
    }

    impl Launcher for FakeLauncher {
        fn launch(&mut self, port: u16, idle_timeout: Duration) -> io::Result<Box<dyn Companion>> {
            assert_eq!(idle_timeout, Duration::from_secs(120));
            self.launches.fetch_add(1, Ordering::SeqCst);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(200));
                let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
                let (mut tcp, _) = listener.accept().unwrap();
                while let Ok(request) = Request::from_reader(&mut tcp, MAX_FRAME_SIZE) {
                    assert_eq!(request, Request::Hello);
                    Response::Hello {
                        code_version: 1,
                        api_version: 1,
                    }
                    .write_to(&mut tcp)
                    .unwrap();
                }
            });
            Ok(Box::new(FakeCompanion {
                terminated: self.terminated.clone(),
            }))
        }
    }

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn no_expiry() -> ExpiryAction {
        Arc::new(|opcode, _| panic!("'{}' expired", opcode))
    }

    #[test]
    fn autostart_launches_once_and_retries() {
        let launcher = FakeLauncher::default();
        let launches = launcher.launches.clone();
        let terminated = launcher.terminated.clone();
        let config = Builder::new()
            .port(free_port())
            .autostart(true)
            .autokill(true)
            .build();
        let mut session = Session::with_launcher(config, launcher, no_expiry()).unwrap();

        for _ in 0..3 {
            assert_eq!(
                session.send(&Request::Hello).unwrap(),
                Response::Hello {
                    code_version: 1,
                    api_version: 1
                }
            );
        }
        assert_eq!(launches.load(Ordering::SeqCst), 1);
        assert_eq!(session.companion_id(), Some(4242));

        session.close();
        assert!(!session.is_connected());
        assert!(terminated.load(Ordering::SeqCst));
    }

    #[test]
    fn companion_survives_without_autokill() {
        let launcher = FakeLauncher::default();
        let terminated = launcher.terminated.clone();
        let config = Builder::new().port(free_port()).autostart(true).build();
        let mut session = Session::with_launcher(config, launcher, no_expiry()).unwrap();
        session.send(&Request::Hello).unwrap();
        drop(session);
        assert!(!terminated.load(Ordering::SeqCst));
    }

    #[test]
    fn connect_failure_without_autostart() {
        let config = Builder::new().port(free_port()).build();
        let mut session =
            Session::with_launcher(config, FakeLauncher::default(), no_expiry()).unwrap();
        match session.send(&Request::Hello) {
            Err(TransportError::Connect { .. }) => {}
            other => panic!("expected connect error, got {:?}", other),
        }
        assert!(!session.is_connected());
    }

    #[test]
    fn close_after_companion_hung_up() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || drop(listener.accept().unwrap()));
        let config = Builder::new().port(port).build();
        let mut session =
            Session::with_launcher(config, FakeLauncher::default(), no_expiry()).unwrap();
        session.connect().unwrap();
        server.join().unwrap();

        assert!(session.is_connected());
        session.close();
        assert!(!session.is_connected());
        session.close();
    }

    #[test]
    fn cold_start_grace_applies_before_connecting() {
        let config = Builder::new()
            .port(free_port())
            .client_timeout(Duration::from_millis(1))
            .build();
        let session =
            Session::with_launcher(config, FakeLauncher::default(), no_expiry()).unwrap();
        assert_eq!(
            session
                .policy
                .allowed_duration(Opcode::Hello, session.is_connected()),
            Some(Duration::from_millis(1) + Duration::from_secs(14))
        );
    }
}
