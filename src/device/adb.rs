//! ADB-backed device for Android emulators.
//!
//! Every operation is one `adb` subprocess with a timeout. Text commands merge
//! stdout and stderr; screenshots read raw stdout.

use anyhow::{anyhow, bail, Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::Device;
use crate::automation::config::AppConfig;

/// Locations emulator installers put their adb binary in.
const COMMON_ADB_PATHS: &[&str] = &[
    r"C:\Program Files\BlueStacks\HD-Adb.exe",
    r"C:\Program Files (x86)\BlueStacks\HD-Adb.exe",
    r"C:\Program Files\BlueStacks_nxt\HD-Adb.exe",
    r"C:\Program Files (x86)\BlueStacks_nxt\HD-Adb.exe",
];

const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub struct AdbDevice {
    adb_path: PathBuf,
    device_id: String,
    timeout: Duration,
    connect_timeout: Duration,
    connected: bool,
}

impl AdbDevice {
    pub fn new(config: &AppConfig) -> Self {
        let adb_path = if config.adb_path.trim().is_empty() {
            find_adb_path()
        } else {
            PathBuf::from(&config.adb_path)
        };
        if adb_path.components().count() > 1 && !adb_path.exists() {
            warn!("ADB path not found: {}", adb_path.display());
        }

        Self {
            adb_path,
            device_id: config.device_id.clone(),
            timeout: Duration::from_secs(config.adb_timeout_secs),
            connect_timeout: Duration::from_secs(config.adb_connect_timeout_secs),
            connected: false,
        }
    }

    /// Swipes from one point to another over `duration_ms`.
    pub fn send_swipe(&mut self, from: (u32, u32), to: (u32, u32), duration_ms: u32) -> Result<()> {
        let output = self.run_text(&swipe_args(from, to, duration_ms), self.timeout)?;
        if output.to_ascii_lowercase().contains("error") {
            bail!("Swipe failed: {}", output.trim());
        }
        Ok(())
    }

    /// Runs `adb -s <device> <args>` and returns stdout + stderr as text.
    fn run_text(&self, args: &[String], timeout: Duration) -> Result<String> {
        let mut full = vec!["-s".to_string(), self.device_id.clone()];
        full.extend_from_slice(args);
        let out = run_with_timeout(&self.adb_path, &full, timeout)?;
        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        );
        debug!("adb {} -> {}", args.join(" "), text.trim());
        Ok(text)
    }
}

impl Device for AdbDevice {
    fn connect(&mut self) -> Result<()> {
        match run_with_timeout(&self.adb_path, &["devices".to_string()], self.connect_timeout) {
            Ok(devices) if is_listed(&String::from_utf8_lossy(&devices.stdout), &self.device_id) => {
                info!("Already connected to device {}", self.device_id);
                self.connected = true;
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to list adb devices, trying to connect anyway: {:#}", e),
        }

        info!("Connecting to device {}", self.device_id);
        let out = run_with_timeout(
            &self.adb_path,
            &["connect".to_string(), self.device_id.clone()],
            self.connect_timeout,
        )
        .context("adb connect failed")?;
        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        );

        if connect_succeeded(&text) {
            info!("Successfully connected to {}", self.device_id);
            self.connected = true;
            Ok(())
        } else {
            Err(anyhow!("Failed to connect to {}: {}", self.device_id, text.trim()))
        }
    }

    fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        let args = ["disconnect".to_string(), self.device_id.clone()];
        match run_with_timeout(&self.adb_path, &args, self.timeout) {
            Ok(_) => info!("Disconnected from {}", self.device_id),
            Err(e) => error!("Disconnect error: {:#}", e),
        }
        self.connected = false;
    }

    fn capture_screenshot(&mut self) -> Result<Vec<u8>> {
        let args = ["-s", self.device_id.as_str(), "exec-out", "screencap", "-p"].map(str::to_string);
        let out = run_with_timeout(&self.adb_path, &args, self.timeout)?;
        if !out.success {
            bail!("screencap failed: {}", String::from_utf8_lossy(&out.stderr).trim());
        }
        if out.stdout.is_empty() {
            bail!("screencap returned no data");
        }
        Ok(out.stdout)
    }

    fn send_tap(&mut self, x: u32, y: u32) -> Result<()> {
        self.run_text(&tap_args(x, y), self.timeout)
            .with_context(|| format!("Tap at ({}, {}) failed", x, y))?;
        Ok(())
    }

    fn screen_size(&mut self) -> Result<(u32, u32)> {
        let args = ["shell", "wm", "size"].map(str::to_string);
        let text = self.run_text(&args, self.timeout)?;
        parse_wm_size(&text).ok_or_else(|| anyhow!("Failed to parse screen size from: {}", text.trim()))
    }
}

/// Finds adb: known emulator locations first, then whatever is on PATH.
pub fn find_adb_path() -> PathBuf {
    for path in COMMON_ADB_PATHS {
        let p = PathBuf::from(path);
        if p.exists() {
            return p;
        }
    }
    PathBuf::from("adb")
}

fn tap_args(x: u32, y: u32) -> Vec<String> {
    ["shell", "input", "tap"]
        .into_iter()
        .map(str::to_string)
        .chain([x, y].map(|v| v.to_string()))
        .collect()
}

fn swipe_args(from: (u32, u32), to: (u32, u32), duration_ms: u32) -> Vec<String> {
    ["shell", "input", "swipe"]
        .into_iter()
        .map(str::to_string)
        .chain([from.0, from.1, to.0, to.1, duration_ms].map(|v| v.to_string()))
        .collect()
}

/// Whether `adb devices` output lists `device_id`.
fn is_listed(listing: &str, device_id: &str) -> bool {
    listing.lines().skip(1).any(|line| line.split_whitespace().next() == Some(device_id))
}

/// `adb connect` prints "connected to ..." or "already connected to ...".
fn connect_succeeded(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    lower.contains("connected") && !lower.contains("cannot") && !lower.contains("failed")
}

/// Parses `wm size` output. `Physical size:` wins over `Override size:`.
pub fn parse_wm_size(output: &str) -> Option<(u32, u32)> {
    for label in ["Physical size:", "Override size:"] {
        if let Some(rest) = output.split(label).nth(1) {
            let size = rest.lines().next()?.trim();
            let (w, h) = size.split_once('x')?;
            return Some((w.trim().parse().ok()?, h.trim().parse().ok()?));
        }
    }
    None
}

struct ProcessOutput {
    success: bool,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// Spawns `program args`, killing it when `timeout` elapses.
fn run_with_timeout(program: &Path, args: &[String], timeout: Duration) -> Result<ProcessOutput> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to run {}", program.display()))?;

    // Drain the pipes on their own threads so a large screenshot cannot block the child.
    let mut stdout_pipe = child.stdout.take().ok_or_else(|| anyhow!("stdout not captured"))?;
    let mut stderr_pipe = child.stderr.take().ok_or_else(|| anyhow!("stderr not captured"))?;
    let stdout_reader = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf);
        buf
    });
    let stderr_reader = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf);
        buf
    });

    let start = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if start.elapsed() > timeout {
            let _ = child.kill();
            let _ = child.wait();
            bail!("adb command timed out after {:?}: {}", timeout, args.join(" "));
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();
    Ok(ProcessOutput { success: status.success(), stdout, stderr })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_physical_size() {
        assert_eq!(parse_wm_size("Physical size: 1080x1920\n"), Some((1080, 1920)));
    }

    #[test]
    fn test_parse_override_size() {
        assert_eq!(parse_wm_size("Override size: 540x960"), Some((540, 960)));
    }

    #[test]
    fn test_physical_preferred_over_override() {
        let out = "Physical size: 1080x1920\nOverride size: 540x960\n";
        assert_eq!(parse_wm_size(out), Some((1080, 1920)));
    }

    #[test]
    fn test_parse_garbage() {
        assert_eq!(parse_wm_size("error: device offline"), None);
        assert_eq!(parse_wm_size("Physical size: axb"), None);
    }

    #[test]
    fn test_input_commands() {
        assert_eq!(tap_args(270, 480), ["shell", "input", "tap", "270", "480"]);
        assert_eq!(
            swipe_args((100, 800), (100, 200), 300),
            ["shell", "input", "swipe", "100", "800", "100", "200", "300"]
        );
    }

    #[test]
    fn test_connect_output() {
        assert!(connect_succeeded("connected to 127.0.0.1:5555"));
        assert!(connect_succeeded("already connected to 127.0.0.1:5555"));
        assert!(!connect_succeeded("cannot connect to 127.0.0.1:5555: Connection refused"));
        assert!(!connect_succeeded("failed to connect to '127.0.0.1:5555'"));
    }

    #[test]
    fn test_device_listing() {
        let listing = "List of devices attached\n127.0.0.1:5555\tdevice\nemulator-5554\toffline\n";
        assert!(is_listed(listing, "127.0.0.1:5555"));
        assert!(is_listed(listing, "emulator-5554"));
        assert!(!is_listed(listing, "127.0.0.1:5556"));
        assert!(!is_listed("List of devices attached\n", "127.0.0.1:5555"));
    }

    #[test]
    fn test_connect_attempted_when_listing_fails() {
        let config = AppConfig {
            adb_path: "/nonexistent/adb-binary".to_string(),
            adb_connect_timeout_secs: 1,
            ..AppConfig::default()
        };
        let mut device = AdbDevice::new(&config);

        // Both commands fail to spawn; the error comes from the connect attempt
        let err = device.connect().unwrap_err();
        assert!(format!("{:#}", err).contains("adb connect failed"), "{:#}", err);
    }

    #[test]
    fn test_missing_binary_is_an_error() {
        let result = run_with_timeout(
            Path::new("/nonexistent/adb-binary"),
            &["devices".to_string()],
            Duration::from_secs(1),
        );
        assert!(result.is_err());
    }
}
