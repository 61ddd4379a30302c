//! Local control API.
//!
//! A line-based command interface on a localhost TCP port or a Unix stream
//! socket: `probe`, `clear` and `list` operate on the discovery side,
//! `start`/`stop` drive the address monitor, `quit` closes the connection.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::Config;
use crate::monitor::AddressMonitor;
use crate::registry::DeviceRegistry;

enum CommandResult {
    None,
    Reply(String),
    Quit,
}

pub struct ControlServer {
    accept_task: JoinHandle<()>,
    socket_path: Option<PathBuf>,
}

impl ControlServer {
    /// Binds the control endpoint: a numeric value is a localhost TCP
    /// port, anything else a filesystem path for a Unix stream socket.
    pub async fn bind(
        listen: &str,
        monitor: Arc<AddressMonitor>,
        registry: Arc<DeviceRegistry>,
        config: Arc<Config>,
    ) -> io::Result<Self> {
        if let Ok(port) = listen.parse::<u16>() {
            let listener = TcpListener::bind(("127.0.0.1", port)).await?;
            let accept_task = tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, _)) => {
                            let monitor = Arc::clone(&monitor);
                            let registry = Arc::clone(&registry);
                            let config = Arc::clone(&config);
                            tokio::spawn(async move {
                                serve_client(stream, monitor, registry, config).await;
                            });
                        }
                        Err(e) => warn!("control API accept error: {}", e),
                    }
                }
            });
            Ok(ControlServer {
                accept_task,
                socket_path: None,
            })
        } else {
            let listener = UnixListener::bind(listen)?;
            let accept_task = tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, _)) => {
                            let monitor = Arc::clone(&monitor);
                            let registry = Arc::clone(&registry);
                            let config = Arc::clone(&config);
                            tokio::spawn(async move {
                                serve_client(stream, monitor, registry, config).await;
                            });
                        }
                        Err(e) => warn!("control API accept error: {}", e),
                    }
                }
            });
            Ok(ControlServer {
                accept_task,
                socket_path: Some(PathBuf::from(listen)),
            })
        }
    }

    pub fn shutdown(&self) {
        self.accept_task.abort();
        if let Some(path) = &self.socket_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

async fn serve_client<S>(
    stream: S,
    monitor: Arc<AddressMonitor>,
    registry: Arc<DeviceRegistry>,
    config: Arc<Config>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                match handle_command(&line, &monitor, &registry, &config).await {
                    CommandResult::None => {}
                    CommandResult::Reply(reply) => {
                        if writer.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                        let _ = writer.flush().await;
                    }
                    CommandResult::Quit => return,
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!("error reading from API client: {}", e);
                return;
            }
        }
    }
}

async fn handle_command(
    line: &str,
    monitor: &Arc<AddressMonitor>,
    registry: &Arc<DeviceRegistry>,
    config: &Arc<Config>,
) -> CommandResult {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some(&command) = words.first() else {
        return CommandResult::None;
    };

    match command {
        "probe" if config.discovery => {
            let interface = words.get(1).copied();
            debug!("probing devices on {:?} upon request", interface);
            for client in monitor.clients(interface) {
                client.send_probe();
            }
            CommandResult::None
        }
        "clear" if config.discovery => {
            debug!("clearing list of known devices");
            registry.clear();
            CommandResult::None
        }
        "list" if config.discovery => CommandResult::Reply(registry.list_reply()),
        "quit" => CommandResult::Quit,
        "start" => {
            if let Err(e) = monitor.enumerate() {
                warn!("address enumeration failed: {}", e);
            }
            CommandResult::None
        }
        "stop" => {
            monitor.teardown().await;
            CommandResult::None
        }
        _ => {
            debug!("could not handle API request: {}", line);
            CommandResult::None
        }
    }
}
