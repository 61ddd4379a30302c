use std::io;
use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;
use uuid::Uuid;

use crate::multicast::AddressFamily;

/// Configuration for the WSD daemon
///
/// Values come from command-line arguments; `finalize` fills in the
/// hostname and device UUID when they were not given explicitly.
#[derive(Debug, Clone, Parser)]
#[command(name = "wsdd")]
#[command(version)]
#[command(about = "Web Services Discovery daemon for Windows network browsing")]
pub struct Config {
    /// Interface name or address to use (repeatable, default: all interfaces)
    #[arg(short = 'i', long = "interface")]
    pub interface: Vec<String>,

    /// Hop limit for multicast packets
    #[arg(short = 'H', long, default_value_t = 1)]
    pub hoplimit: u32,

    /// UUID for the target device (default: derived from the hostname)
    #[arg(short = 'U', long)]
    pub uuid: Option<Uuid>,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Set domain name (disables workgroup)
    #[arg(short = 'd', long)]
    pub domain: Option<String>,

    /// Override the (NetBIOS) hostname to be used
    #[arg(short = 'n', long)]
    pub hostname: Option<String>,

    /// Set workgroup name
    #[arg(short = 'w', long, default_value = "WORKGROUP")]
    pub workgroup: String,

    /// Do not start networking after launch
    #[arg(short = 'A', long)]
    pub no_autostart: bool,

    /// Disable the HTTP metadata service
    #[arg(short = 't', long)]
    pub no_http: bool,

    /// Use only IPv4
    #[arg(short = '4', long)]
    pub ipv4only: bool,

    /// Use only IPv6
    #[arg(short = '6', long)]
    pub ipv6only: bool,

    /// Log only level and message
    #[arg(short = 's', long)]
    pub shortlog: bool,

    /// Preserve case of the provided/detected hostname
    #[arg(short = 'p', long)]
    pub preserve_case: bool,

    /// Directory to chroot into after socket setup
    #[arg(short = 'c', long)]
    pub chroot: Option<PathBuf>,

    /// Drop privileges to user:group
    #[arg(short = 'u', long)]
    pub user: Option<String>,

    /// Enable discovery operation mode (client role)
    #[arg(short = 'D', long)]
    pub discovery: bool,

    /// Listen on path or localhost port for control commands
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Disable host operation (host will be undiscoverable)
    #[arg(short = 'o', long)]
    pub no_host: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("both --ipv4only and --ipv6only given, listening to no address family")]
    AddressFamilyConflict,
    #[error("could not determine hostname: {0}")]
    Hostname(#[from] io::Error),
}

impl Config {
    /// Validates the option combination and resolves the hostname and the
    /// device UUID. Must be called once before the config is handed to the
    /// rest of the daemon.
    pub fn finalize(&mut self) -> Result<(), ConfigError> {
        if self.ipv4only && self.ipv6only {
            return Err(ConfigError::AddressFamilyConflict);
        }

        if self.hostname.as_deref().map(str::is_empty).unwrap_or(true) {
            let full = system_hostname()?;
            // use only the local part of a possible FQDN
            let short = full.split('.').next().unwrap_or(&full);
            self.hostname = Some(short.to_string());
        }

        if self.uuid.is_none() {
            let full = system_hostname()?;
            self.uuid = Some(Uuid::new_v5(&Uuid::NAMESPACE_DNS, full.as_bytes()));
        }

        Ok(())
    }

    /// Hostname used in metadata responses. Only valid after `finalize`.
    pub fn hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or("")
    }

    /// Device UUID. Only valid after `finalize`.
    pub fn device_uuid(&self) -> Uuid {
        self.uuid.unwrap_or(Uuid::nil())
    }

    /// Whether the given address family passes the `-4`/`-6` restrictions
    pub fn handles_family(&self, family: AddressFamily) -> bool {
        match family {
            AddressFamily::V4 => !self.ipv6only,
            AddressFamily::V6 => !self.ipv4only,
        }
    }
}

/// Queries the OS hostname (possibly an FQDN)
pub fn system_hostname() -> io::Result<String> {
    let mut buf = [0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(args).expect("should parse arguments")
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["wsdd"]);
        assert!(config.interface.is_empty());
        assert_eq!(config.hoplimit, 1);
        assert_eq!(config.workgroup, "WORKGROUP");
        assert!(!config.discovery);
        assert!(!config.no_host);
        assert!(config.uuid.is_none());
    }

    #[test]
    fn test_family_conflict_rejected() {
        let mut config = parse(&["wsdd", "-4", "-6"]);
        assert!(matches!(
            config.finalize(),
            Err(ConfigError::AddressFamilyConflict)
        ));
    }

    #[test]
    fn test_family_restrictions() {
        let config = parse(&["wsdd", "--ipv4only"]);
        assert!(config.handles_family(AddressFamily::V4));
        assert!(!config.handles_family(AddressFamily::V6));

        let config = parse(&["wsdd", "--ipv6only"]);
        assert!(!config.handles_family(AddressFamily::V4));
        assert!(config.handles_family(AddressFamily::V6));
    }

    #[test]
    fn test_finalize_derives_uuid_and_hostname() {
        let mut config = parse(&["wsdd"]);
        config.finalize().expect("finalize should succeed");

        let hostname = config.hostname().to_string();
        assert!(!hostname.is_empty());
        assert!(!hostname.contains('.'));

        // derivation is stable for a fixed hostname
        let expected = Uuid::new_v5(
            &Uuid::NAMESPACE_DNS,
            system_hostname().expect("hostname").as_bytes(),
        );
        assert_eq!(config.device_uuid(), expected);
    }

    #[test]
    fn test_user_supplied_uuid_kept() {
        let mut config = parse(&["wsdd", "-U", "11111111-2222-3333-4444-555555555555"]);
        config.finalize().expect("finalize should succeed");
        assert_eq!(
            config.device_uuid().to_string(),
            "11111111-2222-3333-4444-555555555555"
        );
    }
}
