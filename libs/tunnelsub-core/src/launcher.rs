use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, info, warn};

use crate::error::{CoreError, IoContext, Result};
use crate::store::InstallPaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Engine,
    Tunnel,
    Subscription,
}

impl Component {
    pub const ALL: [Component; 3] = [Component::Engine, Component::Tunnel, Component::Subscription];

    pub fn name(&self) -> &'static str {
        match self {
            Component::Engine => "engine",
            Component::Tunnel => "tunnel",
            Component::Subscription => "subscription",
        }
    }

    pub fn log_name(&self) -> &'static str {
        match self {
            Component::Engine => "engine.log",
            Component::Tunnel => "argo.log",
            Component::Subscription => "subscription.log",
        }
    }

    /// Command-line fragment identifying this component's processes.
    pub fn match_pattern(&self, paths: &InstallPaths) -> String {
        match self {
            Component::Engine => paths.engine_bin().display().to_string(),
            Component::Tunnel => paths.tunnel_bin().display().to_string(),
            Component::Subscription => format!("{} serve", paths.root.display()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Running(u32),
    /// Not running; carries the pid of a leftover pid file, if any.
    Stopped(Option<u32>),
}

impl ComponentState {
    pub fn is_running(&self) -> bool {
        matches!(self, ComponentState::Running(_))
    }
}

/// `/proc/<pid>` exists and the process is not a zombie.
pub fn pid_alive(pid: u32) -> bool {
    let stat = Path::new("/proc").join(pid.to_string()).join("stat");
    match std::fs::read_to_string(stat) {
        // state follows the parenthesised command name
        Ok(s) => s
            .rsplit_once(')')
            .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
            .unwrap_or(true),
        Err(_) => false,
    }
}

fn send_signal(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe { libc::kill(pid, signal) == 0 }
}

/// Force-kills every process whose command line contains `pattern`,
/// except the current one. Returns how many were signalled.
pub fn kill_matching(pattern: &str) -> usize {
    if pattern.trim().is_empty() {
        return 0;
    }
    let own = sysinfo::get_current_pid().ok();
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let mut killed = 0;
    for (pid, process) in sys.processes() {
        if Some(*pid) == own {
            continue;
        }
        let cmdline = process
            .cmd()
            .iter()
            .map(|s| s.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        if cmdline.contains(pattern) && process.kill() {
            debug!("Killed {} ({})", pid, cmdline);
            killed += 1;
        }
    }
    killed
}

/// Starts and stops the managed processes, tracking them through pid files.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    paths: InstallPaths,
}

impl ProcessLauncher {
    pub fn new(paths: InstallPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &InstallPaths {
        &self.paths
    }

    /// Spawns `spec` in its own process group with output appended to the
    /// component log, then records the pid.
    pub fn launch(&self, component: Component, spec: &LaunchSpec) -> Result<u32> {
        self.paths.ensure_root()?;
        let log_path = self.paths.log_file(component);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_path(&log_path)?;
        let log_err = log.try_clone().with_path(&log_path)?;

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&self.paths.root)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .process_group(0)
            .spawn()
            .map_err(|e| CoreError::Launch {
                component: component.name().to_string(),
                reason: format!("{}: {e}", spec.program.display()),
            })?;

        let pid = child.id();
        // Reap the child if it exits while we are still around.
        std::thread::spawn(move || {
            let _ = child.wait();
        });

        let pid_path = self.paths.pid_file(component);
        std::fs::write(&pid_path, pid.to_string()).with_path(&pid_path)?;
        info!("Started {} (pid {pid})", component.name());
        Ok(pid)
    }

    pub fn read_pid(&self, component: Component) -> Option<u32> {
        std::fs::read_to_string(self.paths.pid_file(component))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn state(&self, component: Component) -> ComponentState {
        match self.read_pid(component) {
            Some(pid) if pid_alive(pid) => ComponentState::Running(pid),
            other => ComponentState::Stopped(other),
        }
    }

    pub fn status(&self) -> Vec<(Component, ComponentState)> {
        Component::ALL.iter().map(|&c| (c, self.state(c))).collect()
    }

    /// SIGTERM the recorded pid, escalate to SIGKILL after a grace period,
    /// then sweep stragglers by command-line pattern. Returns whether
    /// anything was running.
    pub async fn stop(&self, component: Component) -> bool {
        let mut stopped = false;
        if let Some(pid) = self.read_pid(component) {
            if pid_alive(pid) && send_signal(pid, libc::SIGTERM) {
                stopped = true;
                let mut waited = Duration::ZERO;
                while pid_alive(pid) && waited < Duration::from_secs(2) {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    waited += Duration::from_millis(100);
                }
                if pid_alive(pid) {
                    warn!("{} (pid {pid}) ignored SIGTERM, killing", component.name());
                    send_signal(pid, libc::SIGKILL);
                }
            }
        }

        let swept = kill_matching(&component.match_pattern(&self.paths));
        if swept > 0 {
            debug!("Swept {swept} leftover {} process(es)", component.name());
            stopped = true;
        }

        let _ = std::fs::remove_file(self.paths.pid_file(component));
        if stopped {
            info!("Stopped {}", component.name());
        }
        stopped
    }

    pub async fn stop_all(&self) {
        for component in Component::ALL {
            self.stop(component).await;
        }
    }
}
