//! Tunnel daemon control
//!
//! The core talks to the running WireGuard daemon only through the
//! `DaemonController` trait. `WgQuickController` implements it by shelling
//! out to `wg` and `wg-quick`; tests substitute a mock.

use crate::error::{ProvisionError, Result};
use crate::wireguard::dump::{parse_dump, PeerDump};
use crate::wireguard::keys::{KeyMaterialProvider, KeyPair, PresharedKey, PrivateKey};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Narrow interface to the tunnel daemon
#[cfg_attr(test, mockall::automock)]
pub trait DaemonController: Send + Sync {
    /// Current per-peer statistics for `interface`
    ///
    /// An interface that does not exist yields `DaemonUnavailable`.
    fn dump_peers(&self, interface: &str) -> Result<Vec<PeerDump>>;

    /// Bring `interface` down (tolerating "already down") and up again
    /// with the configuration at `config_path`
    fn reload(&self, interface: &str, config_path: &Path) -> Result<()>;

    /// Interface carrying the default route, if it can be determined
    fn default_route_interface(&self) -> Option<String> {
        None
    }
}

/// Captured output of a finished command
struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Upper bound on any single `wg`, `wg-quick` or `ip` invocation
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Run `program` with `args`, optionally feeding `stdin`
///
/// A child still running at `timeout` is killed and reaped, and the call
/// fails with `ErrorKind::TimedOut`.
fn run_command(
    program: &str,
    args: &[&str],
    stdin: Option<&str>,
    timeout: Duration,
) -> std::io::Result<CommandOutput> {
    debug!("Executing command: {} {:?}", program, args);

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    // drained on their own threads so a chatty child cannot fill the pipe
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        if let Err(e) = pipe.write_all(input.as_bytes()) {
            terminate(&mut child);
            return Err(e);
        }
    }

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            terminate(&mut child);
            warn!("Killed {} after {:?}", program, timeout);
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("{} did not finish within {:?}", program, timeout),
            ));
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(CommandOutput {
        success: status.success(),
        stdout: collect(stdout),
        stderr: collect(stderr).trim().to_string(),
    })
}

fn terminate(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!("Failed to kill child {}: {}", child.id(), e);
    }
    let _ = child.wait();
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Extract the device name from `ip route show default` output
pub fn parse_default_route(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        tokens.find(|t| *t == "dev")?;
        tokens.next().map(str::to_string)
    })
}

/// Daemon controller backed by the `wg` and `wg-quick` tools
#[derive(Debug, Clone)]
pub struct WgQuickController {
    wg: String,
    wg_quick: String,
    timeout: Duration,
}

impl WgQuickController {
    /// Use `wg` and `wg-quick` from `PATH`
    pub fn new() -> Self {
        Self {
            wg: "wg".to_string(),
            wg_quick: "wg-quick".to_string(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Use explicit binaries
    pub fn with_binaries(wg: impl Into<String>, wg_quick: impl Into<String>) -> Self {
        Self {
            wg: wg.into(),
            wg_quick: wg_quick.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Kill any invocation still running after `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn run(&self, program: &str, args: &[&str], stdin: Option<&str>) -> std::io::Result<CommandOutput> {
        run_command(program, args, stdin, self.timeout)
    }

    fn wg_key_command(&self, subcommand: &str, stdin: Option<&str>) -> Result<Zeroizing<String>> {
        let output = self.run(&self.wg, &[subcommand], stdin).map_err(|e| {
            ProvisionError::KeyGenerationFailed(format!("Failed to execute {} {}: {}", self.wg, subcommand, e))
        })?;
        let stdout = Zeroizing::new(output.stdout);
        if !output.success {
            return Err(ProvisionError::KeyGenerationFailed(format!(
                "{} {} failed: {}",
                self.wg, subcommand, output.stderr
            )));
        }
        Ok(Zeroizing::new(stdout.trim().to_string()))
    }
}

impl Default for WgQuickController {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonController for WgQuickController {
    fn dump_peers(&self, interface: &str) -> Result<Vec<PeerDump>> {
        let output = self.run(&self.wg, &["show", interface, "dump"], None).map_err(|e| {
            ProvisionError::DaemonUnavailable(format!("Failed to execute {}: {}", self.wg, e))
        })?;

        if !output.success {
            return Err(ProvisionError::DaemonUnavailable(format!(
                "{} show {} dump: {}",
                self.wg, interface, output.stderr
            )));
        }

        Ok(parse_dump(&output.stdout))
    }

    fn reload(&self, interface: &str, config_path: &Path) -> Result<()> {
        let config = config_path.to_string_lossy();

        match self.run(&self.wg_quick, &["down", &config], None) {
            Ok(out) if !out.success => debug!("{} down {}: {}", self.wg_quick, interface, out.stderr),
            Ok(_) => debug!("Interface {} brought down", interface),
            Err(e) => warn!("Failed to execute {} down: {}", self.wg_quick, e),
        }

        let output = self.run(&self.wg_quick, &["up", &config], None).map_err(|e| {
            ProvisionError::ReloadFailed(format!("Failed to execute {} up: {}", self.wg_quick, e))
        })?;

        if !output.success {
            return Err(ProvisionError::ReloadFailed(format!(
                "{} up {}: {}",
                self.wg_quick, config, output.stderr
            )));
        }

        info!("Interface {} reloaded from {}", interface, config);
        Ok(())
    }

    fn default_route_interface(&self) -> Option<String> {
        match self.run("ip", &["route", "show", "default"], None) {
            Ok(out) if out.success => parse_default_route(&out.stdout),
            Ok(out) => {
                debug!("ip route show default failed: {}", out.stderr);
                None
            }
            Err(e) => {
                debug!("Failed to execute ip: {}", e);
                None
            }
        }
    }
}

/// Key material from `wg genkey`, `wg pubkey` and `wg genpsk`
impl KeyMaterialProvider for WgQuickController {
    fn generate_keypair(&self) -> Result<KeyPair> {
        let private = self.wg_key_command("genkey", None)?;
        let public = self.wg_key_command("pubkey", Some(&format!("{}\n", private.as_str())))?;

        let keypair = KeyPair::from_private(PrivateKey::from_base64(&private)?);
        if keypair.public.to_base64() != *public {
            return Err(ProvisionError::KeyGenerationFailed(
                "wg pubkey output does not match the generated private key".to_string(),
            ));
        }
        Ok(keypair)
    }

    fn generate_preshared_key(&self) -> Result<PresharedKey> {
        let psk = self.wg_key_command("genpsk", None)?;
        PresharedKey::from_base64(&psk)
            .map_err(|e| ProvisionError::KeyGenerationFailed(e.to_string()))
    }
}
