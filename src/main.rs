use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use scspawn::api::{PKG_NAME, VERSION};
use scspawn::config::Config;
use scspawn::launcher;
use scspawn::logging::init_tracing;
use scspawn::monitor::LivelinessMonitor;
use scspawn::proxy::GatewayServer;
use scspawn::spawner::SpawnPool;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            // Logging is configured from the file, so report on stderr
            eprintln!(
                "Failed to load configuration from {}: {}",
                config_path.display(),
                e
            );
            return Err(e);
        }
    };

    // Initialize logging
    init_tracing(&config.logging)?;
    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let tls_acceptor = if config.tls.enable_spawn_server {
        Some(build_tls_acceptor(&config)?)
    } else {
        None
    };

    let config = Arc::new(config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool = SpawnPool::new(Arc::clone(&config), launcher::for_config(&config));

    // Spawn liveliness monitor
    let monitor = LivelinessMonitor::new(Arc::clone(&pool), shutdown_rx.clone());
    let monitor_handle = tokio::spawn(monitor.run());

    let bind_addr = config.server.bind_addr().map_err(|e| {
        error!(bind = %config.server.bind, port = config.server.spawn_server_port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address: {}", e)
    })?;

    let mut gateway = GatewayServer::new(bind_addr, Arc::clone(&pool), shutdown_rx.clone());
    if let Some(acceptor) = tls_acceptor {
        gateway = gateway.with_tls(acceptor);
    }
    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = gateway.run().await {
            error!(error = %e, "Spawn server error");
        }
    });

    wait_for_shutdown_signal(config.server.console_enter_shutdown).await;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping all workers...");
    pool.shutdown_all().await;

    // Wait for tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = gateway_handle.await;
        let _ = monitor_handle.await;
    })
    .await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C, SIGTERM, or Enter on the console when enabled
async fn wait_for_shutdown_signal(console_enter: bool) {
    let enter_pressed = async {
        if !console_enter {
            return std::future::pending::<()>().await;
        }
        info!("Press Enter to shut down");
        let mut line = String::new();
        let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
        match stdin.read_line(&mut line).await {
            // Closed stdin must not trigger a shutdown
            Ok(0) | Err(_) => std::future::pending::<()>().await,
            Ok(_) => {}
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
                    _ = enter_pressed => info!("Enter pressed, shutting down..."),
                }
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
            _ = enter_pressed => info!("Enter pressed, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
            _ = enter_pressed => info!("Enter pressed, shutting down..."),
        }
    }
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another spawn server is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting spawn server");
    info!(
        bind = %config.server.bind,
        port = config.server.spawn_server_port,
        public_host = %config.server.public_host(),
        ip_version = ?config.server.ip_version,
        proxy_viewer_connections = config.server.proxy_viewer_connections,
        tls = config.tls.enable_spawn_server,
        "Server configuration"
    );
    let range = config.spawn.port_range();
    info!(
        max_spawn_count = config.spawn.max_spawn_count,
        ports_begin = *range.start(),
        ports_end = *range.end(),
        csr = config.spawn.csr_enabled,
        ssr = config.spawn.ssr_enabled,
        gpu_count = config.spawn.ssr_gpu_count.map(|n| n.get()),
        executable = %config.spawn.executable_path().display(),
        "Worker pool settings"
    );
    info!(
        liveliness_interval_secs = config.spawn.liveliness_report_interval_secs,
        liveliness_timeout_secs = config.spawn.liveliness_timeout().as_secs(),
        initial_use_duration_secs = config.spawn.initial_use_duration_secs,
        shutdown_grace_period_secs = config.spawn.shutdown_grace_period_secs,
        "Timeout settings"
    );
    info!(
        log_dir = %config.logging.log_path(&config.spawn.communicator_path()).display(),
        file_categories = %config.logging.spawn_file_categories,
        stdout_categories = %config.logging.spawn_stdout_categories,
        respawn = config.respawn.enabled,
        "Worker logging"
    );
}

fn build_tls_acceptor(config: &Config) -> anyhow::Result<TlsAcceptor> {
    let base = config.spawn.communicator_path();
    let (cert_file, key_file) = match (&config.tls.certificate_file, &config.tls.private_key_file) {
        (Some(cert), Some(key)) => (cert, key),
        _ => anyhow::bail!("TLS requires tls.certificate_file and tls.private_key_file"),
    };
    let cert_path = scspawn::config::resolve_path(&base, cert_file);
    let key_path = scspawn::config::resolve_path(&base, key_file);

    let certs = load_certs(&cert_path)?;
    let key = load_key(&key_path)?;
    info!(cert = %cert_path.display(), key = %key_path.display(), "TLS enabled with provided certificates");

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path.display(), e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path.display());
    }

    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path.display(), e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in {}", path.display())
}
