//! # FlashPro companion server
//!
//! Command-line front-end of [`fpjtag_server`]. It binds a TCP port, wires the
//! selected programmer backend into the server and serves one client at a time
//! until it is asked to shut down or stays idle for too long.
use std::error::Error;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use env_logger::Env;
use fpjtag_protocol::{API_VERSION, CODE_VERSION};
use fpjtag_server::{
    Programmer,
    server::Builder,
    sim::{Device, Loopback, SimProgrammer},
};

/// Data register contents of the simulated device.
const SIM_PATTERN: [u8; 8] = [0x93, 0x60, 0x0a, 0x1c, 0xde, 0xc0, 0xad, 0x0b];

#[derive(Parser, Eq, PartialEq, Clone)]
enum Backend {
    /// Echo every scan back to the client
    Loopback,
    /// Drive a simulated TAP controller
    Sim {
        #[arg(long, help = "Hide the device behind a simulated UJTAG bridge")]
        bridged: bool,
    },
}

fn bypass_count(s: &str) -> Result<u32, String> {
    clap_num::number_range(s, 0, 32)
}

#[derive(Parser)]
#[command(about = "Companion server for FlashPro JTAG programmers", long_about=None)]
struct Args {
    #[arg(short, long, default_value = "3334")]
    port: u16,

    #[arg(short, long, default_value = "127.0.0.1")]
    ip: IpAddr,

    #[arg(
        short = 'o',
        long,
        default_value = "120",
        help = "Shut down after this many seconds without a request, 0 to never shut down"
    )]
    idle_timeout: u64,

    #[arg(long, default_value = "0", value_parser = bypass_count)]
    leading_bypass: u32,

    #[arg(long, default_value = "0", value_parser = bypass_count)]
    trailing_bypass: u32,

    #[clap(subcommand)]
    backend: Option<Backend>,
}

fn serve<P: Programmer>(args: &Args, programmer: P) -> Result<(), Box<dyn Error>> {
    let idle_timeout = (args.idle_timeout > 0).then(|| Duration::from_secs(args.idle_timeout));
    let mut server = Builder::new()
        .idle_timeout(idle_timeout)
        .bypass(args.leading_bypass, args.trailing_bypass)
        .build(programmer);

    let addr = SocketAddr::new(args.ip, args.port);
    log::info!("Binding to address: {}", addr);
    server.listen(addr)
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    log::info!(
        "Starting FlashPro companion (code version {}, API version {})",
        CODE_VERSION,
        API_VERSION
    );

    let args = Args::parse();
    log::debug!(
        "Parsed arguments: ip={}, port={}, idle_timeout={}s, bypass={}/{}",
        args.ip,
        args.port,
        args.idle_timeout,
        args.leading_bypass,
        args.trailing_bypass
    );

    match args.backend.clone() {
        Some(Backend::Loopback) => {
            log::info!("Using loopback backend");
            serve(&args, Loopback::new())?
        }
        Some(Backend::Sim { bridged: false }) => {
            log::info!("Using simulated TAP controller");
            serve(&args, SimProgrammer::direct(Device::with_pattern(&SIM_PATTERN)))?
        }
        Some(Backend::Sim { bridged: true }) => {
            log::info!("Using simulated TAP controller behind a UJTAG bridge");
            let programmer = SimProgrammer::bridged(Device::with_pattern(&SIM_PATTERN))
                .with_bypass(args.leading_bypass, args.trailing_bypass);
            serve(&args, programmer)?
        }
        None => {
            println!(
                "No programmer backend selected. Use fpserver loopback or fpserver sim [--bridged]."
            )
        }
    }
    log::info!("Companion stopped");
    Ok(())
}
