//! Launching worker processes and stopping them again
//!
//! Workers are started either directly or through the session respawn shim.
//! The shim starts a lightweight primary process that relaunches the worker
//! into the interactive session; the primary and everything it starts live
//! and die together.

use crate::config::{Config, License};
use crate::error::LaunchError;
use crate::logging::{forward_lines, LogLevel};
use crate::slot::{RenderingMode, SlotId};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Stop attempts (SIGTERM, then forced kills) before giving up on a worker
pub const MAX_STOP_ATTEMPTS: u32 = 3;

/// Tag for respawn-primary output when no `log_suffix` is configured
pub const DEFAULT_PRIMARY_LOG_SUFFIX: &str = "_respawner";

/// Everything needed to start one worker
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub slot_id: SlotId,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub stdout_level: LogLevel,
    pub stderr_level: LogLevel,
}

impl LaunchSpec {
    /// Build the worker command line for a slot
    pub fn for_slot(
        config: &Config,
        slot_id: SlotId,
        port: u16,
        rendering: RenderingMode,
        gpu_index: Option<u32>,
        model: Option<&str>,
    ) -> Self {
        let spawn = &config.spawn;
        let logging = &config.logging;
        let scheme = if config.tls.enable_spawn_server {
            "https"
        } else {
            "http"
        };
        let liveliness_url = format!(
            "{}://{}:{}/api/liveliness/{}",
            scheme,
            config.server.loopback_host(),
            config.server.spawn_server_port,
            slot_id
        );

        let mut args: Vec<OsString> = Vec::new();
        let mut push = |flag: &str, value: OsString| {
            args.push(flag.into());
            args.push(value);
        };

        push("--id", slot_id.to_string().into());
        push("--port", port.to_string().into());
        push("--liveliness-url", liveliness_url.into());
        push(
            "--liveliness-interval",
            spawn.liveliness_report_interval_secs.to_string().into(),
        );
        push(
            "--initial-use-duration",
            spawn.initial_use_duration_secs.to_string().into(),
        );
        push("--rendering", rendering.as_str().into());
        if let Some(index) = gpu_index {
            push("--gpu-index", index.to_string().into());
        }
        if let Some(model) = model {
            push("--model", model.into());
        }
        for dir in spawn.model_paths() {
            push("--model-dirs", dir.into_os_string());
        }
        push("--workspace-dir", spawn.workspace_path().into_os_string());

        let log_file = logging
            .log_path(&spawn.communicator_path())
            .join(format!("stream_cache_{}.log", slot_id));
        push("--log-file", log_file.into_os_string());
        push(
            "--log-file-categories",
            logging.spawn_file_categories.bits().to_string().into(),
        );
        push(
            "--log-stdout-categories",
            logging.spawn_stdout_categories.bits().to_string().into(),
        );

        if config.tls.enable_sc_server {
            let base = spawn.communicator_path();
            if let (Some(cert), Some(key)) =
                (&config.tls.certificate_file, &config.tls.private_key_file)
            {
                push(
                    "--ssl-cert",
                    crate::config::resolve_path(&base, cert).into_os_string(),
                );
                push(
                    "--ssl-key",
                    crate::config::resolve_path(&base, key).into_os_string(),
                );
            }
        }

        match config.license() {
            Some(License::Key(key)) => push("--license", key.into()),
            Some(License::File(path)) => push("--license-file", path.into_os_string()),
            None => {}
        }

        if logging.spawn_use_delta_time {
            args.push("--log-delta-time".into());
        }
        if rendering == RenderingMode::Server && spawn.ssr_use_egl {
            args.push("--egl".into());
        }

        // Validated at startup
        if let Ok(extra) = spawn.extra_args() {
            args.extend(extra.into_iter().map(OsString::from));
        }

        Self {
            slot_id,
            program: spawn.executable_path(),
            args,
            stdout_level: logging.stdout_as_level,
            stderr_level: logging.stderr_as_level,
        }
    }
}

/// Starts worker processes
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<WorkerProcess, LaunchError>;
}

/// Pick the launcher for this platform and configuration
pub fn for_config(config: &Config) -> Arc<dyn WorkerLauncher> {
    if config.respawn.enabled {
        if cfg!(windows) {
            info!("Launching workers through the session respawn shim");
            return Arc::new(RespawnLauncher::new(config.respawn.suffix()));
        }
        warn!("Session respawn is only available on Windows; launching workers directly");
    }
    Arc::new(DirectLauncher)
}

/// Starts the worker executable itself
#[derive(Debug, Default)]
pub struct DirectLauncher;

impl WorkerLauncher for DirectLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<WorkerProcess, LaunchError> {
        let mut cmd = base_command(spec);
        let mut child = spawn_command(&mut cmd, spec)?;
        let output = forward_output(&mut child, spec, "");
        Ok(WorkerProcess {
            pid: child.id(),
            child,
            group: false,
            link_id: None,
            output,
        })
    }
}

/// Starts the worker through a primary process that relaunches it into the
/// privileged session
#[derive(Debug, Default)]
pub struct RespawnLauncher {
    log_suffix: Option<String>,
}

impl RespawnLauncher {
    pub fn new(log_suffix: Option<&str>) -> Self {
        Self {
            log_suffix: log_suffix.map(str::to_string),
        }
    }

    /// Suffix on the primary's forwarded output sources
    pub fn output_suffix(&self) -> &str {
        self.log_suffix.as_deref().unwrap_or(DEFAULT_PRIMARY_LOG_SUFFIX)
    }

    fn command(&self, spec: &LaunchSpec, link_id: &str) -> Command {
        let mut cmd = base_command(spec);
        cmd.arg("--respawn-link").arg(link_id);
        // The worker only renames its own log when asked to
        if let Some(ref suffix) = self.log_suffix {
            cmd.arg("--log-suffix").arg(suffix);
        }

        // The primary leads its own group so the pair can be signalled at once
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(windows)]
        cmd.creation_flags(0x0000_0200); // CREATE_NEW_PROCESS_GROUP
        cmd
    }
}

impl WorkerLauncher for RespawnLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<WorkerProcess, LaunchError> {
        let link_id = format!("respawn-{}", spec.slot_id);
        let mut cmd = self.command(spec, &link_id);
        let mut child = spawn_command(&mut cmd, spec)?;
        let output = forward_output(&mut child, spec, self.output_suffix());
        debug!(slot_id = %spec.slot_id, link_id = %link_id, "Primary process started");

        Ok(WorkerProcess {
            pid: child.id(),
            child,
            group: true,
            link_id: Some(link_id),
            output,
        })
    }
}

fn base_command(spec: &LaunchSpec) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);
    cmd.stdin(Stdio::null());
    cmd.stdout(stdio_for(spec.stdout_level));
    cmd.stderr(stdio_for(spec.stderr_level));
    cmd.kill_on_drop(true);
    cmd
}

fn stdio_for(level: LogLevel) -> Stdio {
    if level == LogLevel::Off {
        Stdio::null()
    } else {
        Stdio::piped()
    }
}

fn spawn_command(cmd: &mut Command, spec: &LaunchSpec) -> Result<Child, LaunchError> {
    let child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            LaunchError::ExecutableMissing(spec.program.clone())
        } else {
            LaunchError::Spawn(e)
        }
    })?;
    info!(
        slot_id = %spec.slot_id,
        pid = child.id().unwrap_or(0),
        program = %spec.program.display(),
        "Worker process spawned"
    );
    Ok(child)
}

fn forward_output(child: &mut Child, spec: &LaunchSpec, suffix: &str) -> Vec<JoinHandle<()>> {
    let slot_id = spec.slot_id.to_string();
    let mut handles = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        handles.push(forward_lines(
            stdout,
            spec.stdout_level,
            slot_id.clone(),
            output_source("stdout", suffix),
        ));
    }
    if let Some(stderr) = child.stderr.take() {
        handles.push(forward_lines(
            stderr,
            spec.stderr_level,
            slot_id,
            output_source("stderr", suffix),
        ));
    }
    handles
}

fn output_source(stream: &str, suffix: &str) -> String {
    format!("{}{}", stream, suffix)
}

/// A running worker (or respawn primary)
pub struct WorkerProcess {
    child: Child,
    /// Pid at launch; also the process group id for grouped workers
    pid: Option<u32>,
    /// Signals go to the whole process group led by the child
    group: bool,
    link_id: Option<String>,
    output: Vec<JoinHandle<()>>,
}

impl WorkerProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn respawn_link_id(&self) -> Option<&str> {
        self.link_id.as_deref()
    }

    /// Wait for the process to exit by itself
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        // Fail together: nothing the primary started may outlive it
        if self.group {
            self.kill_group();
        }
        Ok(status)
    }

    /// Ask the process (group) to exit
    pub fn signal_terminate(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            let rc = unsafe {
                if self.group {
                    libc::killpg(pid as i32, libc::SIGTERM)
                } else {
                    libc::kill(pid as i32, libc::SIGTERM)
                }
            };
            if rc != 0 {
                debug!(pid, error = %std::io::Error::last_os_error(), "SIGTERM failed");
            }
        }

        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }
    }

    /// Kill the process (group) without waiting
    pub fn force_kill(&mut self) {
        if self.group {
            self.kill_group();
        }
        let _ = self.child.start_kill();
    }

    #[cfg(unix)]
    fn kill_group(&self) {
        if let Some(pid) = self.pid {
            unsafe {
                libc::killpg(pid as i32, libc::SIGKILL);
            }
        }
    }

    #[cfg(not(unix))]
    fn kill_group(&self) {}

    /// Stop the worker: SIGTERM, wait `grace`, then forced kills.
    ///
    /// Returns false if exit could not be confirmed after
    /// [`MAX_STOP_ATTEMPTS`] attempts.
    pub async fn shutdown(&mut self, slot_id: SlotId, grace: Duration) -> bool {
        info!(%slot_id, pid = self.pid().unwrap_or(0), "Sending SIGTERM to worker");
        self.signal_terminate();

        for attempt in 1..=MAX_STOP_ATTEMPTS {
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(Ok(status)) => {
                    info!(%slot_id, ?status, attempt, "Worker process exited");
                    if self.group {
                        self.kill_group();
                    }
                    return true;
                }
                Ok(Err(e)) => {
                    warn!(%slot_id, attempt, error = %e, "Error waiting for worker to exit");
                }
                Err(_) => {
                    warn!(
                        %slot_id,
                        attempt,
                        grace_period_secs = grace.as_secs_f64(),
                        "Worker still running, sending SIGKILL"
                    );
                }
            }
            self.force_kill();
        }

        error!(
            %slot_id,
            attempts = MAX_STOP_ATTEMPTS,
            "Worker exit could not be confirmed; slot keeps its port"
        );
        false
    }

    /// Wait for forwarded output to drain
    pub async fn join_output(&mut self) {
        for handle in self.output.drain(..) {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(program: &str, args: &[&str]) -> LaunchSpec {
        LaunchSpec {
            slot_id: SlotId::new(),
            program: PathBuf::from(program),
            args: args.iter().map(OsString::from).collect(),
            stdout_level: LogLevel::Info,
            stderr_level: LogLevel::Off,
        }
    }

    fn args_of(spec: &LaunchSpec) -> Vec<String> {
        spec.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn value_after(args: &[String], flag: &str) -> Option<String> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1).cloned())
    }

    #[test]
    fn test_worker_command_line() {
        let toml = r#"
[server]
spawn_server_port = 9000
ip_version = "force-ipv4"

[spawn]
communicator_dir = "/opt/c"
model_dirs = ["/srv/models"]
extra_args = "--trace 'a b'"
ssr_use_egl = true

[logging]
log_dir = "/var/log/sc"
spawn_file_categories = ["error", "warn"]

[license]
key = "k123"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let id = SlotId::new();
        let spec = LaunchSpec::for_slot(
            &config,
            id,
            11003,
            RenderingMode::Server,
            Some(1),
            Some("microengine"),
        );
        let args = args_of(&spec);

        assert_eq!(spec.program, PathBuf::from("/opt/c/bin").join(if cfg!(windows) {
            "stream_cache_server.exe"
        } else {
            "stream_cache_server"
        }));
        assert_eq!(value_after(&args, "--id"), Some(id.to_string()));
        assert_eq!(value_after(&args, "--port").as_deref(), Some("11003"));
        assert_eq!(
            value_after(&args, "--liveliness-url"),
            Some(format!("http://127.0.0.1:9000/api/liveliness/{}", id))
        );
        assert_eq!(value_after(&args, "--liveliness-interval").as_deref(), Some("5"));
        assert_eq!(value_after(&args, "--rendering").as_deref(), Some("ssr"));
        assert_eq!(value_after(&args, "--gpu-index").as_deref(), Some("1"));
        assert_eq!(value_after(&args, "--model").as_deref(), Some("microengine"));
        assert_eq!(value_after(&args, "--model-dirs").as_deref(), Some("/srv/models"));
        assert_eq!(value_after(&args, "--log-file-categories").as_deref(), Some("3"));
        assert_eq!(value_after(&args, "--log-stdout-categories").as_deref(), Some("0"));
        assert_eq!(value_after(&args, "--license").as_deref(), Some("k123"));
        assert!(value_after(&args, "--log-file")
            .unwrap()
            .starts_with("/var/log/sc/stream_cache_"));
        assert!(args.contains(&"--egl".to_string()));
        assert!(!args.contains(&"--ssl-cert".to_string()));
        assert_eq!(&args[args.len() - 2..], ["--trace", "a b"]);
    }

    #[test]
    fn test_csr_command_line_has_no_gpu() {
        let config = Config::default();
        let spec = LaunchSpec::for_slot(&config, SlotId::new(), 11000, RenderingMode::Client, None, None);
        let args = args_of(&spec);
        assert_eq!(value_after(&args, "--rendering").as_deref(), Some("csr"));
        assert!(!args.contains(&"--gpu-index".to_string()));
        assert!(!args.contains(&"--egl".to_string()));
        assert!(!args.contains(&"--model".to_string()));
        assert!(value_after(&args, "--liveliness-url")
            .unwrap()
            .starts_with("http://localhost:11182/"));
    }

    #[test]
    fn test_respawn_ignored_off_windows() {
        let mut config = Config::default();
        config.respawn.enabled = true;
        // Selection only differs on Windows; this just must not panic
        let _launcher = for_config(&config);
    }

    #[test]
    fn test_primary_output_is_tagged_without_suffix() {
        let launcher = RespawnLauncher::new(None);
        assert_eq!(launcher.output_suffix(), "_respawner");
        assert_eq!(output_source("stdout", launcher.output_suffix()), "stdout_respawner");
        assert_ne!(
            output_source("stderr", launcher.output_suffix()),
            output_source("stderr", "")
        );

        let custom = RespawnLauncher::new(Some("_primary"));
        assert_eq!(output_source("stderr", custom.output_suffix()), "stderr_primary");
    }

    #[test]
    fn test_log_suffix_flag_only_when_configured() {
        let spec = spec("worker", &["--port", "11000"]);
        let flags = |launcher: &RespawnLauncher| -> Vec<String> {
            launcher
                .command(&spec, "respawn-x")
                .as_std()
                .get_args()
                .map(|a| a.to_string_lossy().into_owned())
                .collect()
        };

        let args = flags(&RespawnLauncher::new(None));
        assert_eq!(args, ["--port", "11000", "--respawn-link", "respawn-x"]);

        let args = flags(&RespawnLauncher::new(Some("_primary")));
        assert_eq!(&args[args.len() - 2..], ["--log-suffix", "_primary"]);
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let result = DirectLauncher.launch(&spec("/nonexistent/stream_cache_server", &[]));
        assert!(matches!(result, Err(LaunchError::ExecutableMissing(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_direct_launch_and_shutdown() {
        let mut worker = DirectLauncher.launch(&spec("sleep", &["60"])).unwrap();
        assert!(worker.pid().is_some());
        assert!(worker.respawn_link_id().is_none());

        let stopped = worker
            .shutdown(SlotId::new(), Duration::from_secs(2))
            .await;
        assert!(stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_ignored_escalates_to_kill() {
        let mut worker = DirectLauncher
            .launch(&spec("sh", &["-c", "trap '' TERM; sleep 60"]))
            .unwrap();
        // Give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stopped = worker
            .shutdown(SlotId::new(), Duration::from_millis(300))
            .await;
        assert!(stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_self_exit_is_observed() {
        let mut worker = DirectLauncher
            .launch(&spec("sh", &["-c", "echo ready; exit 3"]))
            .unwrap();
        let status = worker.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
        worker.join_output().await;
    }

    /// Running, as opposed to gone or a zombie nobody reaped yet
    #[cfg(target_os = "linux")]
    fn process_running(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map(|rest| !rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_respawn_group_terminates_together() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("grandchild.pid");
        let script = format!("sleep 60 & echo $! > {}; wait", pid_file.display());

        let launcher = RespawnLauncher::new(Some("_respawner"));
        let mut worker = launcher.launch(&spec("sh", &["-c", &script])).unwrap();
        assert!(worker.respawn_link_id().unwrap().starts_with("respawn-"));

        // Wait for the background process to be started
        let mut grandchild = None;
        for _ in 0..50 {
            if let Ok(content) = std::fs::read_to_string(&pid_file) {
                if let Ok(pid) = content.trim().parse::<i32>() {
                    grandchild = Some(pid);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let grandchild = grandchild.expect("background process started");

        assert!(worker.shutdown(SlotId::new(), Duration::from_secs(2)).await);

        // The grandchild was in the same group and must be gone too
        let mut alive = true;
        for _ in 0..50 {
            if !process_running(grandchild) {
                alive = false;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!alive, "grandchild {} outlived its group", grandchild);
    }
}
