use std::fmt;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{CoreError, IoContext, Result};

pub const SYSTEMD_UNIT_PATH: &str = "/etc/systemd/system/tunnelsub.service";

/// How the installation is brought back after a reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceMode {
    #[default]
    Cron,
    Systemd,
    None,
}

impl fmt::Display for PersistenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PersistenceMode::Cron => "cron",
            PersistenceMode::Systemd => "systemd",
            PersistenceMode::None => "none",
        })
    }
}

impl FromStr for PersistenceMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cron" | "crontab" => Ok(PersistenceMode::Cron),
            "systemd" => Ok(PersistenceMode::Systemd),
            "none" | "off" => Ok(PersistenceMode::None),
            other => Err(CoreError::config(format!("unknown persistence mode: {other}"))),
        }
    }
}

/// Whether `line` mentions `root` as a whole path, not a prefix of a longer one.
fn references(line: &str, root: &str) -> bool {
    line.match_indices(root).any(|(i, _)| {
        matches!(line[i + root.len()..].chars().next(), None | Some(' ' | '/' | '\t' | '"' | '\''))
    })
}

pub fn crontab_entry(exe: &Path, root: &Path) -> String {
    format!(
        "@reboot {} --dir {} start >/dev/null 2>&1",
        exe.display(),
        root.display()
    )
}

/// Drops every line referencing `root`, then appends `entry` if given.
pub fn merge_crontab(current: &str, root: &Path, entry: Option<&str>) -> String {
    let root = root.display().to_string();
    let mut lines: Vec<&str> = current
        .lines()
        .filter(|l| !l.trim().is_empty() && !references(l, &root))
        .collect();
    if let Some(entry) = entry {
        lines.push(entry);
    }
    if lines.is_empty() {
        return String::new();
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn read_crontab() -> Result<String> {
    let output = Command::new("crontab")
        .arg("-l")
        .stderr(Stdio::null())
        .output()
        .map_err(|e| CoreError::config(format!("crontab is not available: {e}")))?;
    // `crontab -l` exits non-zero when the user has no crontab yet
    if !output.status.success() {
        return Ok(String::new());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn write_crontab(content: &str) -> Result<()> {
    let mut child = Command::new("crontab")
        .arg("-")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| CoreError::config(format!("crontab is not available: {e}")))?;
    if let Some(stdin) = child.stdin.as_mut() {
        stdin.write_all(content.as_bytes()).with_path("crontab")?;
    }
    let output = child.wait_with_output().with_path("crontab")?;
    if !output.status.success() {
        return Err(CoreError::config(format!(
            "crontab rejected the new table: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

pub fn systemd_unit(exe: &Path, root: &Path) -> String {
    format!(
        r#"[Unit]
Description=tunnelsub proxy tunnel
After=network-online.target
Wants=network-online.target

[Service]
Type=oneshot
RemainAfterExit=yes
WorkingDirectory={root}
ExecStart={exe} --dir {root} start
ExecStop={exe} --dir {root} stop

[Install]
WantedBy=multi-user.target
"#,
        exe = exe.display(),
        root = root.display()
    )
}

fn is_root() -> bool {
    // SAFETY: geteuid(2) cannot fail and touches no memory.
    unsafe { libc::geteuid() == 0 }
}

fn systemctl(args: &[&str]) {
    match Command::new("systemctl").args(args).output() {
        Ok(out) if out.status.success() => debug!("systemctl {}", args.join(" ")),
        Ok(out) => warn!(
            "systemctl {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        ),
        Err(e) => warn!("systemctl unavailable: {e}"),
    }
}

/// Registers `exe --dir root start` to run at boot.
pub fn install(mode: PersistenceMode, exe: &Path, root: &Path) -> Result<()> {
    match mode {
        PersistenceMode::None => Ok(()),
        PersistenceMode::Cron => {
            let entry = crontab_entry(exe, root);
            let merged = merge_crontab(&read_crontab()?, root, Some(&entry));
            write_crontab(&merged)?;
            info!("Added @reboot crontab entry");
            Ok(())
        }
        PersistenceMode::Systemd => {
            if !is_root() {
                return Err(CoreError::config("systemd persistence must be installed as root"));
            }
            std::fs::write(SYSTEMD_UNIT_PATH, systemd_unit(exe, root)).with_path(SYSTEMD_UNIT_PATH)?;
            systemctl(&["daemon-reload"]);
            systemctl(&["enable", "tunnelsub.service"]);
            info!("Installed systemd unit {SYSTEMD_UNIT_PATH}");
            Ok(())
        }
    }
}

/// Removes crontab lines and the systemd unit that reference `root`.
/// Returns a description of each removed entry.
pub fn remove(root: &Path) -> Result<Vec<String>> {
    let mut removed = Vec::new();

    if let Ok(current) = read_crontab() {
        let filtered = merge_crontab(&current, root, None);
        if filtered.lines().count() != current.lines().filter(|l| !l.trim().is_empty()).count() {
            if filtered.is_empty() {
                let _ = Command::new("crontab").arg("-r").output();
            } else {
                write_crontab(&filtered)?;
            }
            removed.push("crontab entries".to_string());
        }
    }

    let unit = Path::new(SYSTEMD_UNIT_PATH);
    let ours = std::fs::read_to_string(unit)
        .map(|body| references(&body, &root.display().to_string()))
        .unwrap_or(false);
    if ours {
        systemctl(&["disable", "tunnelsub.service"]);
        std::fs::remove_file(unit).with_path(unit)?;
        systemctl(&["daemon-reload"]);
        removed.push(SYSTEMD_UNIT_PATH.to_string());
    }

    Ok(removed)
}
