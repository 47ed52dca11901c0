//! Deadline enforcement for companion calls.
//!
//! A single background thread waits for the armed deadline. When a call does
//! not finish in time the [`ExpiryAction`] runs; by default it terminates the
//! process, since a request stuck halfway on the wire cannot be recovered.
use std::{
    io,
    sync::{
        Arc,
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use fpjtag_protocol::Opcode;

/// Runs when an armed deadline expires, with the opcode and the time it was allowed.
pub type ExpiryAction = Arc<dyn Fn(Opcode, Duration) + Send + Sync>;

/// Logs the expired call and exits the process.
pub fn terminate_process() -> ExpiryAction {
    Arc::new(|opcode, allowed| {
        log::error!(
            "Call '{}' to the companion expired after {:?}, terminating",
            opcode,
            allowed
        );
        std::process::exit(1);
    })
}

enum Command {
    Arm {
        generation: u64,
        opcode: Opcode,
        allowed: Duration,
        deadline: Instant,
    },
    Disarm {
        generation: u64,
    },
}

struct Armed {
    generation: u64,
    opcode: Opcode,
    allowed: Duration,
    deadline: Instant,
}

pub struct Watchdog {
    commands: Option<Sender<Command>>,
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn new(action: ExpiryAction) -> io::Result<Watchdog> {
        let (commands, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("fpjtag-watchdog".to_string())
            .spawn(move || run(receiver, action))?;
        Ok(Watchdog {
            commands: Some(commands),
            generation: 0,
            handle: Some(handle),
        })
    }

    /// Arms the watchdog for `allowed` from now. It is disarmed when the
    /// returned guard is dropped.
    pub fn arm(&mut self, opcode: Opcode, allowed: Duration) -> WatchdogGuard {
        self.generation += 1;
        let commands = self.commands.clone();
        if let Some(sender) = &commands {
            let armed = sender.send(Command::Arm {
                generation: self.generation,
                opcode,
                allowed,
                deadline: Instant::now() + allowed,
            });
            if armed.is_err() {
                log::warn!("Watchdog thread is gone, '{}' runs without deadline", opcode);
            }
        }
        WatchdogGuard {
            commands,
            generation: self.generation,
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        // closing the channel stops the thread
        self.commands.take();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            log::error!("Watchdog thread panicked");
        }
    }
}

/// Keeps a deadline armed while alive.
pub struct WatchdogGuard {
    commands: Option<Sender<Command>>,
    generation: u64,
}

impl WatchdogGuard {
    pub fn disarm(self) {}
}

impl Drop for WatchdogGuard {
    fn drop(&mut self) {
        if let Some(sender) = &self.commands {
            let _ = sender.send(Command::Disarm {
                generation: self.generation,
            });
        }
    }
}

fn run(commands: Receiver<Command>, action: ExpiryAction) {
    let mut armed: Option<Armed> = None;
    loop {
        let received = match &armed {
            Some(current) => {
                let now = Instant::now();
                if now >= current.deadline {
                    Err(RecvTimeoutError::Timeout)
                } else {
                    commands.recv_timeout(current.deadline - now)
                }
            }
            None => commands.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(Command::Arm {
                generation,
                opcode,
                allowed,
                deadline,
            }) => {
                armed = Some(Armed {
                    generation,
                    opcode,
                    allowed,
                    deadline,
                })
            }
            Ok(Command::Disarm { generation }) => {
                if armed.as_ref().is_some_and(|a| a.generation == generation) {
                    armed = None;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Some(expired) = armed.take() {
                    action(expired.opcode, expired.allowed);
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::*;

    fn recorder() -> (ExpiryAction, Arc<Mutex<Vec<Opcode>>>) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        let action: ExpiryAction = Arc::new(move |opcode, _| sink.lock().unwrap().push(opcode));
        (action, fired)
    }

    #[test]
    fn fires_once_after_deadline() {
        let (action, fired) = recorder();
        let mut watchdog = Watchdog::new(action).unwrap();
        let guard = watchdog.arm(Opcode::Stall, Duration::from_millis(20));
        thread::sleep(Duration::from_millis(150));
        drop(guard);
        assert_eq!(*fired.lock().unwrap(), [Opcode::Stall]);
    }

    #[test]
    fn disarmed_deadline_does_not_fire() {
        let (action, fired) = recorder();
        let mut watchdog = Watchdog::new(action).unwrap();
        watchdog.arm(Opcode::Scan, Duration::from_millis(50)).disarm();
        let guard = watchdog.arm(Opcode::Hello, Duration::from_secs(10));
        thread::sleep(Duration::from_millis(120));
        guard.disarm();
        drop(watchdog);
        assert!(fired.lock().unwrap().is_empty());
    }
}
