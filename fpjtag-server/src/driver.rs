use fpjtag_protocol::{
    Operation, ScanCommand, TrstAction,
    error::TapError,
    tap::{TapState, tms_path},
};

use crate::{
    PinLevel, Programmer, ProgrammerInfo, ProgrammerKind, error::DriverError,
    tunnel::TunnelEncoder,
};

/// Executes JTAG operations on a [`Programmer`].
///
/// Operations either drive the programmer's TAP directly or, in tunnel mode,
/// are re-framed by a [`TunnelEncoder`] for a TAP behind a UJTAG bridge.
#[derive(Debug)]
pub struct Driver<P: Programmer> {
    programmer: P,
    port: String,
    info: Option<ProgrammerInfo>,
    tunnel_mode: bool,
    encoder: TunnelEncoder,
    logging: bool,
}

impl<P: Programmer> Driver<P> {
    pub fn new(programmer: P) -> Driver<P> {
        Driver {
            programmer,
            port: String::new(),
            info: None,
            tunnel_mode: false,
            encoder: TunnelEncoder::new(),
            logging: false,
        }
    }

    /// Number of bypassed TAPs before and after the FPGA, used in tunnel mode.
    pub fn with_bypass(mut self, leading: u32, trailing: u32) -> Driver<P> {
        self.encoder.set_bypass(leading, trailing);
        self
    }

    pub fn programmer(&self) -> &P {
        &self.programmer
    }

    pub fn programmer_mut(&mut self) -> &mut P {
        &mut self.programmer
    }

    /// Selects the port for the next [`Driver::initialize`]. An empty name
    /// selects the first port, otherwise any unique prefix of a port name works.
    pub fn set_port(&mut self, port: &str) {
        self.port = port.to_string();
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn info(&self) -> Option<&ProgrammerInfo> {
        self.info.as_ref()
    }

    pub fn set_logging(&mut self, enable: bool) {
        self.logging = enable;
        log::info!("Operation logging {}", if enable { "on" } else { "off" });
    }

    pub fn set_tunnel_mode(&mut self, enable: bool) {
        self.tunnel_mode = enable;
        log::info!("Tunnel mode {}", if enable { "on" } else { "off" });
    }

    pub fn tunnel_mode(&self) -> bool {
        self.tunnel_mode
    }

    /// The tracked state of the tunnelled TAP.
    pub fn shadow_state(&self) -> TapState {
        self.encoder.shadow()
    }

    fn level(&self) -> log::Level {
        if self.logging {
            log::Level::Info
        } else {
            log::Level::Debug
        }
    }

    /// Opens the programmer on the selected port.
    pub fn initialize(&mut self) -> Result<ProgrammerInfo, DriverError> {
        let result = self.open();
        if let Err(err) = &result {
            log::error!("Initialization failed: {}", err);
            if let Err(close_err) = self.programmer.close() {
                log::warn!("{}", close_err);
            }
            self.info = None;
        }
        result
    }

    fn open(&mut self) -> Result<ProgrammerInfo, DriverError> {
        let ports: Vec<String> = self
            .programmer
            .enumerate_ports()?
            .into_iter()
            .filter(|p| !p.to_ascii_lowercase().starts_with("lpt"))
            .collect();
        log::info!(
            "Available ports: {}",
            if ports.is_empty() {
                "none".to_string()
            } else {
                ports.join(", ")
            }
        );

        let requested = self.port.to_ascii_lowercase();
        let selected = ports
            .iter()
            .find(|p| p.to_ascii_lowercase().starts_with(&requested))
            .cloned()
            .or_else(|| (requested == "usb").then(|| "usb".to_string()))
            .ok_or_else(|| DriverError::NoMatchingPort {
                requested: self.port.clone(),
                available: ports.clone(),
            })?;

        let info = self.programmer.open(&selected)?;
        log::info!(
            "Using {} {} ({}, id {}) on port {}",
            info.kind,
            info.revision,
            info.connection,
            info.id,
            selected
        );
        self.port = selected;
        self.info = Some(info.clone());
        Ok(info)
    }

    /// Releases the programmer.
    pub fn quit(&mut self) -> Result<(), DriverError> {
        self.info = None;
        self.programmer.close()?;
        log::info!("Programmer closed");
        Ok(())
    }

    /// Sets the TCK frequency, checked against what the programmer family supports.
    pub fn set_speed(&mut self, hz: i32) -> Result<(), DriverError> {
        let info = self.info.as_ref().ok_or(DriverError::NotInitialized)?;
        if !speed_supported(info.family(), hz) {
            return Err(DriverError::UnsupportedSpeed {
                kind: info.kind.clone(),
                hz,
            });
        }
        self.programmer.set_tck_frequency(hz as u32)?;
        log::info!("TCK frequency set to {} kHz", hz / 1000);
        Ok(())
    }

    /// The TCK frequency in use, in kHz.
    pub fn tck_khz(&mut self) -> Result<u32, DriverError> {
        if self.info.is_none() {
            return Err(DriverError::NotInitialized);
        }
        Ok(self.programmer.tck_frequency()? / 1000)
    }

    /// Executes one operation. Captured scan data is written into the
    /// operation's fields.
    pub fn execute(&mut self, operation: &mut Operation) -> Result<(), DriverError> {
        log::log!(
            self.level(),
            "{}{}",
            describe(operation),
            if self.tunnel_mode { " (tunnel)" } else { "" }
        );
        let result = if self.tunnel_mode {
            self.execute_tunnelled(operation)
        } else {
            self.execute_direct(operation)
        };
        if let Err(err) = &result {
            log::error!("{} failed: {}", operation.opcode(), err);
        }
        result
    }

    fn execute_direct(&mut self, operation: &mut Operation) -> Result<(), DriverError> {
        match operation {
            Operation::Scan(scan) => {
                validate_scan(scan)?;
                for field in scan.fields.iter_mut().filter(|f| f.num_bits > 0) {
                    let capture = field.capture.as_deref_mut();
                    match field.output.as_deref() {
                        Some(output) => {
                            log::trace!("{} out: {:02x?}", scan.register, output);
                            self.programmer
                                .scan(scan.register, field.num_bits, output, capture)?
                        }
                        None => self.programmer.scan_constant(
                            scan.register,
                            field.num_bits,
                            false,
                            capture,
                        )?,
                    }
                    if let Some(capture) = field.capture.as_deref() {
                        log::trace!("{} in: {:02x?}", scan.register, capture);
                    }
                }
                self.move_direct(scan.end_state)
            }
            Operation::StateMove { end_state } => self.move_direct(*end_state),
            Operation::RunTest { cycles, end_state } => {
                self.move_direct(TapState::Idle)?;
                self.programmer.delay_tck(*cycles)?;
                self.move_direct(*end_state)
            }
            Operation::Reset { trst } => {
                let level = match trst {
                    TrstAction::Deassert => PinLevel::High,
                    TrstAction::Assert => PinLevel::Low,
                    TrstAction::Unchanged => return Ok(()),
                };
                self.programmer.set_trst(level)?;
                log::debug!("TRST is {:?}", self.programmer.trst()?);
                Ok(())
            }
            Operation::PathMove { path } => {
                validate_path(path)?;
                for state in path.iter() {
                    self.move_direct(*state)?;
                }
                Ok(())
            }
            Operation::Sleep { microseconds } => Ok(self.programmer.delay_us(*microseconds)?),
        }
    }

    fn move_direct(&mut self, target: TapState) -> Result<(), DriverError> {
        if target == TapState::Undefined {
            return Err(TapError::UndefinedState.into());
        }
        if self.programmer.state()? != target {
            self.programmer.set_state(target)?;
        }
        Ok(())
    }

    fn execute_tunnelled(&mut self, operation: &mut Operation) -> Result<(), DriverError> {
        let programmer = &mut self.programmer;
        let encoder = &mut self.encoder;
        match operation {
            Operation::Scan(scan) => {
                validate_scan(scan)?;
                for field in scan.fields.iter_mut() {
                    encoder.scan_field(programmer, scan.register, field)?;
                }
                encoder.move_to(programmer, scan.end_state)?;
            }
            Operation::StateMove { end_state } => encoder.move_to(programmer, *end_state)?,
            Operation::RunTest { cycles, end_state } => {
                encoder.run_test(programmer, *cycles, *end_state)?
            }
            // TRST does not reach the tunnelled TAP
            Operation::Reset { .. } => encoder.move_to(programmer, TapState::Reset)?,
            Operation::PathMove { path } => {
                validate_path(path)?;
                for state in path.iter() {
                    encoder.move_to(programmer, *state)?;
                }
            }
            Operation::Sleep { microseconds } => programmer.delay_us(*microseconds)?,
        }
        Ok(())
    }
}

fn speed_supported(kind: ProgrammerKind, hz: i32) -> bool {
    match kind {
        ProgrammerKind::FlashPro3 => {
            matches!(hz, 1_000_000 | 2_000_000 | 3_000_000 | 4_000_000 | 6_000_000)
        }
        ProgrammerKind::FlashPro4 => hz % 1_000_000 == 0 && (1_000_000..=6_000_000).contains(&hz),
        ProgrammerKind::FlashPro5 => (1_000..=30_000_000).contains(&hz),
        ProgrammerKind::Unknown => false,
    }
}

fn validate_scan(scan: &ScanCommand) -> Result<(), DriverError> {
    for (i, field) in scan.fields.iter().enumerate() {
        let needed = field.byte_len();
        let short = |buf: &Option<Box<[u8]>>| buf.as_ref().is_some_and(|b| b.len() < needed);
        if short(&field.output) || short(&field.capture) {
            return Err(DriverError::InvalidOperation(format!(
                "Field {} of {} bits needs {} bytes",
                i, field.num_bits, needed
            )));
        }
    }
    tms_path(TapState::pause(scan.register), scan.end_state)?;
    Ok(())
}

fn validate_path(path: &[TapState]) -> Result<(), DriverError> {
    match (path.first(), path.last()) {
        (Some(first), Some(last)) if first.is_stable() && last.is_stable() => Ok(()),
        (Some(first), Some(last)) => Err(DriverError::InvalidOperation(format!(
            "Path from {} to {} must start and end in stable states",
            first, last
        ))),
        // nothing to visit
        _ => Ok(()),
    }
}

fn describe(operation: &Operation) -> String {
    match operation {
        Operation::Scan(scan) => format!(
            "{} scan of {} bits in {} fields, end {}",
            scan.register,
            scan.num_bits(),
            scan.fields.len(),
            scan.end_state
        ),
        Operation::StateMove { end_state } => format!("State move to {}", end_state),
        Operation::RunTest { cycles, end_state } => {
            format!("Run test {} cycles, end {}", cycles, end_state)
        }
        Operation::Reset { trst } => format!("Reset, TRST {:?}", trst),
        Operation::PathMove { path } => format!("Path move through {} states", path.len()),
        Operation::Sleep { microseconds } => format!("Sleep {} us", microseconds),
    }
}

#[cfg(test)]
mod test {
    use fpjtag_protocol::{ScanField, status, tap::Register};

    use super::*;
    use crate::sim::{Device, Loopback, SimProgrammer};

    fn initialized(loopback: Loopback) -> Driver<Loopback> {
        let mut driver = Driver::new(loopback);
        driver.initialize().unwrap();
        driver
    }

    #[test]
    fn port_prefix_expands_to_full_name() {
        let mut driver =
            Driver::new(Loopback::new().with_ports(&["LPT1", "usb12345", "usb99001"]));
        driver.set_port("USB99");
        driver.initialize().unwrap();
        assert_eq!(driver.port(), "usb99001");
    }

    #[test]
    fn empty_port_selects_first_usb_port() {
        let mut driver = Driver::new(Loopback::new().with_ports(&["lpt2", "usb12345"]));
        let info = driver.initialize().unwrap();
        assert_eq!(driver.port(), "usb12345");
        assert_eq!(info.kind, "FlashPro5");
    }

    #[test]
    fn usb_is_always_accepted() {
        let mut driver = Driver::new(Loopback::new().with_ports(&[]));
        driver.set_port("usb");
        driver.initialize().unwrap();
        assert_eq!(driver.port(), "usb");
    }

    #[test]
    fn unknown_port_fails_initialization() {
        let mut driver = Driver::new(Loopback::new());
        driver.set_port("S2012");
        let err = driver.initialize().unwrap_err();
        assert_eq!(err.status(), status::INIT_FAILED);
        assert!(driver.info().is_none());
    }

    #[test]
    fn speed_needs_initialization() {
        let mut driver = Driver::new(Loopback::new());
        assert_eq!(driver.set_speed(1_000_000), Err(DriverError::NotInitialized));
    }

    #[test]
    fn speed_limits_follow_programmer_family() {
        let mut fp3 = initialized(Loopback::new().with_kind("FlashPro3"));
        assert!(fp3.set_speed(5_000_000).is_err());
        fp3.set_speed(6_000_000).unwrap();
        assert_eq!(fp3.tck_khz().unwrap(), 6000);

        let mut fp4 = initialized(Loopback::new().with_kind("FlashPro4"));
        assert!(fp4.set_speed(2_500_000).is_err());
        fp4.set_speed(5_000_000).unwrap();

        let mut fp5 = initialized(Loopback::new());
        fp5.set_speed(30_000_000).unwrap();
        fp5.set_speed(1_000).unwrap();
        let err = fp5.set_speed(31_000_000).unwrap_err();
        assert_eq!(err.status(), status::DEVICE_ERROR);

        let mut other = initialized(Loopback::new().with_kind("FlashPro2000"));
        assert!(matches!(
            other.set_speed(1_000_000),
            Err(DriverError::UnsupportedSpeed { .. })
        ));
    }

    #[test]
    fn direct_scan_fills_capture() {
        let mut driver = Driver::new(Loopback::new());
        let mut operation = Operation::Scan(ScanCommand {
            register: Register::Instruction,
            end_state: TapState::Idle,
            fields: vec![
                ScanField::exchange(4, &[0x05]),
                ScanField::capture(0),
                ScanField::output(8, &[0xaa]),
            ],
        });
        driver.execute(&mut operation).unwrap();
        let Operation::Scan(scan) = operation else {
            unreachable!()
        };
        assert_eq!(scan.fields[0].capture.as_deref(), Some(&[0x05][..]));
        assert_eq!(driver.programmer_mut().state().unwrap(), TapState::Idle);
        assert_eq!(driver.programmer().calls(), 3);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let mut driver = Driver::new(Loopback::new());
        let mut operation = Operation::Scan(ScanCommand {
            register: Register::Data,
            end_state: TapState::Idle,
            fields: vec![ScanField::output(16, &[0xff])],
        });
        let err = driver.execute(&mut operation).unwrap_err();
        assert_eq!(err.status(), status::SYNTAX_ERROR);
        assert_eq!(driver.programmer().calls(), 0);
    }

    #[test]
    fn path_move_needs_stable_endpoints() {
        let mut driver = Driver::new(Loopback::new());
        let mut operation = Operation::PathMove {
            path: vec![TapState::DrSelect, TapState::DrCapture, TapState::DrShift],
        };
        assert!(matches!(
            driver.execute(&mut operation),
            Err(DriverError::InvalidOperation(_))
        ));
        let mut operation = Operation::PathMove {
            path: vec![
                TapState::Idle,
                TapState::DrSelect,
                TapState::DrCapture,
                TapState::DrShift,
            ],
        };
        driver.execute(&mut operation).unwrap();
        assert_eq!(driver.programmer_mut().state().unwrap(), TapState::DrShift);
    }

    #[test]
    fn empty_path_move_does_nothing() {
        let mut driver = Driver::new(Loopback::new());
        driver
            .execute(&mut Operation::PathMove { path: vec![] })
            .unwrap();
        assert_eq!(driver.programmer().calls(), 0);

        driver.set_tunnel_mode(true);
        driver
            .execute(&mut Operation::PathMove { path: vec![] })
            .unwrap();
        assert_eq!(driver.programmer().calls(), 0);
        assert_eq!(driver.shadow_state(), TapState::Reset);
    }

    #[test]
    fn reset_drives_trst() {
        let mut driver = Driver::new(Loopback::new());
        driver
            .execute(&mut Operation::Reset {
                trst: TrstAction::Assert,
            })
            .unwrap();
        assert_eq!(driver.programmer_mut().trst().unwrap(), PinLevel::Low);
        driver
            .execute(&mut Operation::Reset {
                trst: TrstAction::Unchanged,
            })
            .unwrap();
        assert_eq!(driver.programmer_mut().trst().unwrap(), PinLevel::Low);
        driver
            .execute(&mut Operation::Reset {
                trst: TrstAction::Deassert,
            })
            .unwrap();
        assert_eq!(driver.programmer_mut().trst().unwrap(), PinLevel::High);
    }

    #[test]
    fn run_test_clocks_in_idle() {
        let mut driver = Driver::new(SimProgrammer::direct(Device::with_pattern(&[])));
        driver
            .execute(&mut Operation::RunTest {
                cycles: 40,
                end_state: TapState::Idle,
            })
            .unwrap();
        assert_eq!(driver.programmer().device().idle_clocks(), 40);
    }

    fn queue() -> Vec<Operation> {
        vec![
            Operation::Reset {
                trst: TrstAction::Unchanged,
            },
            Operation::StateMove {
                end_state: TapState::Idle,
            },
            Operation::Scan(ScanCommand {
                register: Register::Instruction,
                end_state: TapState::IrPause,
                fields: vec![ScanField::exchange(8, &[0x0f])],
            }),
            Operation::Scan(ScanCommand {
                register: Register::Data,
                end_state: TapState::Idle,
                fields: vec![ScanField::capture(3), ScanField::exchange(100, &[0x3c; 13])],
            }),
            Operation::RunTest {
                cycles: 9,
                end_state: TapState::DrPause,
            },
            Operation::PathMove {
                path: vec![
                    TapState::DrPause,
                    TapState::DrExit2,
                    TapState::DrUpdate,
                    TapState::Idle,
                ],
            },
        ]
    }

    #[test]
    fn tunnel_mode_matches_direct_access() {
        let pattern: Vec<u8> = (0..13u8).map(|i| i.wrapping_mul(91) ^ 0x5a).collect();

        let mut direct = Driver::new(SimProgrammer::direct(Device::with_pattern(&pattern)));
        let mut expected = queue();
        for operation in expected.iter_mut() {
            direct.execute(operation).unwrap();
        }

        let mut tunnelled = Driver::new(SimProgrammer::bridged(Device::with_pattern(&pattern)));
        tunnelled.set_tunnel_mode(true);
        let mut actual = queue();
        for operation in actual.iter_mut() {
            tunnelled.execute(operation).unwrap();
        }

        assert_eq!(actual, expected);
        assert_eq!(tunnelled.shadow_state(), TapState::Idle);
        assert_eq!(tunnelled.programmer().device().state(), TapState::Idle);
        assert_eq!(
            tunnelled.programmer().device().idle_clocks(),
            direct.programmer().device().idle_clocks()
        );
    }
}
