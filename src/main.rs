use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use wsdd::config::ConfigError;
use wsdd::control::ControlServer;
use wsdd::{AddressMonitor, Config, DeviceRegistry, WsdContext};

fn main() -> ExitCode {
    let mut config = Config::parse();
    let user_supplied_uuid = config.uuid.is_some();

    if let Err(e) = config.finalize() {
        eprintln!("wsdd: {}", e);
        return match e {
            ConfigError::AddressFamilyConflict => ExitCode::from(4),
            ConfigError::Hostname(_) => ExitCode::from(1),
        };
    }

    init_logging(&config);

    if user_supplied_uuid {
        info!("user-supplied device UUID is {}", config.device_uuid());
    } else {
        info!("using pre-defined UUID {}", config.device_uuid());
    }
    if config.interface.is_empty() {
        warn!("no interface given, using all interfaces");
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("cannot create runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    let code = runtime.block_on(run(Arc::new(config)));
    ExitCode::from(code)
}

async fn run(config: Arc<Config>) -> u8 {
    let ctx = Arc::new(WsdContext::new(Arc::clone(&config)));
    let registry = Arc::new(DeviceRegistry::new());

    // the monitor opens its kernel socket here, before privileges go away
    let monitor = match AddressMonitor::new(Arc::clone(&ctx), Arc::clone(&registry)) {
        Ok(monitor) => monitor,
        Err(e) => {
            error!("cannot create address monitor: {}", e);
            return 1;
        }
    };

    if !config.no_autostart {
        if let Err(e) = monitor.enumerate() {
            error!("address enumeration failed: {}", e);
            return 1;
        }
    }

    let control = match &config.listen {
        Some(listen) => {
            match ControlServer::bind(
                listen,
                Arc::clone(&monitor),
                Arc::clone(&registry),
                Arc::clone(&config),
            )
            .await
            {
                Ok(server) => Some(server),
                Err(e) => {
                    error!("cannot bind control API to {}: {}", listen, e);
                    return 1;
                }
            }
        }
        None => None,
    };

    // get uid:gid before potential chroot'ing
    let ids = match &config.user {
        Some(spec) => match lookup_user(spec) {
            Some(ids) => Some(ids),
            None => return 3,
        },
        None => None,
    };

    if let Some(root) = &config.chroot {
        if !enter_chroot(root) {
            return 2;
        }
    }

    if let Some((uid, gid)) = ids {
        if !drop_privileges(&config, uid, gid) {
            return 3;
        }
    }

    if config.chroot.is_some() && unsafe { libc::getuid() == 0 || libc::getgid() == 0 } {
        warn!("chrooted but running as root, consider -u option");
    }

    let event_loop = monitor.spawn_event_loop();

    wait_for_signal().await;
    info!("shutting down gracefully...");

    if let Some(control) = control {
        control.shutdown();
    }
    event_loop.abort();
    monitor.teardown().await;

    info!("Done.");
    0
}

fn init_logging(config: &Config) {
    let default_level = match config.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if config.shortlog {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(signal) => signal,
        Err(e) => {
            error!("cannot install SIGINT handler: {}", e);
            return;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(e) => {
            error!("cannot install SIGTERM handler: {}", e);
            return;
        }
    };

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    info!("received termination/interrupt signal, tearing down");
}

/// Resolves a `user[:group]` specification to numeric ids
fn lookup_user(spec: &str) -> Option<(Option<libc::uid_t>, Option<libc::gid_t>)> {
    let (user, group) = match spec.split_once(':') {
        Some((user, group)) => (user, group),
        None => (spec, ""),
    };

    let mut uid = None;
    let mut gid = None;

    if !user.is_empty() {
        let name = CString::new(user).ok()?;
        // SAFETY: getpwnam with a valid NUL-terminated name; the result is
        // only read before any other call that could reuse its buffer.
        let pw = unsafe { libc::getpwnam(name.as_ptr()) };
        if pw.is_null() {
            error!("could not get uid for {}", spec);
            return None;
        }
        uid = Some(unsafe { (*pw).pw_uid });
    }

    if !group.is_empty() {
        let name = CString::new(group).ok()?;
        // SAFETY: same contract as getpwnam above.
        let gr = unsafe { libc::getgrnam(name.as_ptr()) };
        if gr.is_null() {
            error!("could not get gid for {}", spec);
            return None;
        }
        gid = Some(unsafe { (*gr).gr_gid });
    }

    Some((uid, gid))
}

/// Chroots into the given directory to isolate the process
fn enter_chroot(root: &Path) -> bool {
    let Ok(path) = CString::new(root.as_os_str().as_bytes()) else {
        error!("invalid chroot path {}", root.display());
        return false;
    };

    // SAFETY: both calls take valid NUL-terminated paths.
    let ret = unsafe { libc::chroot(path.as_ptr()) };
    if ret != 0 {
        error!(
            "could not chroot to {}: {}",
            root.display(),
            std::io::Error::last_os_error()
        );
        return false;
    }
    let ret = unsafe { libc::chdir(b"/\0".as_ptr() as *const libc::c_char) };
    if ret != 0 {
        error!("could not chdir after chroot: {}", std::io::Error::last_os_error());
        return false;
    }

    info!("chrooted successfully to {}", root.display());
    true
}

/// Drops group then user privileges
fn drop_privileges(config: &Config, uid: Option<libc::uid_t>, gid: Option<libc::gid_t>) -> bool {
    if let Some(gid) = gid {
        // SAFETY: plain setgid/setegid calls with a resolved gid.
        let ret = unsafe { libc::setgid(gid) | libc::setegid(gid) };
        if ret != 0 {
            error!(
                "dropping privileges failed: {}",
                std::io::Error::last_os_error()
            );
            return false;
        }
        debug!("switched gid to {}", gid);
    }

    if let Some(uid) = uid {
        // SAFETY: plain setuid/seteuid calls with a resolved uid.
        let ret = unsafe { libc::setuid(uid) | libc::seteuid(uid) };
        if ret != 0 {
            error!(
                "dropping privileges failed: {}",
                std::io::Error::last_os_error()
            );
            return false;
        }
        debug!("switched uid to {}", uid);
    }

    info!(
        "running as {} ({:?}:{:?})",
        config.user.as_deref().unwrap_or(""),
        uid,
        gid
    );
    true
}
