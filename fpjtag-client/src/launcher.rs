use std::{
    env, io,
    path::{Path, PathBuf},
    process::{Child, Command},
    time::Duration,
};

/// A running companion process.
pub trait Companion: Send {
    fn id(&self) -> u32;

    /// Stops the companion and waits for it to exit.
    fn terminate(&mut self) -> io::Result<()>;
}

/// Starts companion processes for a session.
pub trait Launcher {
    /// Starts a companion that listens on `port` and shuts itself down after
    /// `idle_timeout` without a request.
    fn launch(&mut self, port: u16, idle_timeout: Duration) -> io::Result<Box<dyn Companion>>;
}

/// Launches the companion binary as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    path: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(path: impl Into<PathBuf>, args: Vec<String>) -> ProcessLauncher {
        ProcessLauncher {
            path: path.into(),
            args,
        }
    }

    /// The companion binary. Relative paths are taken relative to the
    /// directory of the running executable.
    pub fn resolve(&self) -> io::Result<PathBuf> {
        if self.path.is_absolute() {
            return Ok(self.path.clone());
        }
        let exe = env::current_exe()?;
        let dir = exe.parent().unwrap_or(Path::new("."));
        Ok(dir.join(&self.path))
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&mut self, port: u16, idle_timeout: Duration) -> io::Result<Box<dyn Companion>> {
        let binary = self.resolve()?;
        let mut command = Command::new(&binary);
        command
            .arg("-p")
            .arg(port.to_string())
            .arg("-o")
            .arg(idle_timeout.as_secs().to_string())
            .args(&self.args);
        if let Some(dir) = binary.parent() {
            command.current_dir(dir);
        }
        log::info!("Starting companion {}", binary.display());
        log::debug!("Companion command: {:?}", command);
        let child = command.spawn()?;
        log::info!("Companion started with pid {}", child.id());
        Ok(Box::new(ChildCompanion { child }))
    }
}

struct ChildCompanion {
    child: Child,
}

impl Companion for ChildCompanion {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn terminate(&mut self) -> io::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        #[cfg(unix)]
        {
            use nix::{
                sys::signal::{Signal, kill},
                unistd::Pid,
            };
            kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM)?;
        }
        #[cfg(not(unix))]
        self.child.kill()?;
        let status = self.child.wait()?;
        log::info!("Companion {} exited with {}", self.child.id(), status);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn relative_path_is_next_to_executable() {
        let launcher = ProcessLauncher::new("fpserver", Vec::new());
        let resolved = launcher.resolve().unwrap();
        let exe = env::current_exe().unwrap();
        assert_eq!(resolved.parent(), exe.parent());
        assert_eq!(resolved.file_name().unwrap(), "fpserver");
    }

    #[test]
    fn absolute_path_is_kept() {
        let path = env::temp_dir().join("fpserver");
        let launcher = ProcessLauncher::new(&path, Vec::new());
        assert_eq!(launcher.resolve().unwrap(), path);
    }

    #[test]
    fn missing_binary_fails_to_launch() {
        let mut launcher =
            ProcessLauncher::new(env::temp_dir().join("fpjtag-no-such-companion"), Vec::new());
        assert!(launcher.launch(3334, Duration::from_secs(1)).is_err());
    }
}
