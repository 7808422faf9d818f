use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use serde::{Deserialize, Serialize};
use socket2::{Domain, Socket, Type};

use crate::server::error::ServerError;

/// frida-server's own default port
pub const DEFAULT_PORT: u16 = 27042;

/// Whether frida-server accepts network connections, and on which port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self { enabled: false, port: DEFAULT_PORT }
    }
}

impl ListenConfig {
    pub fn new(enabled: bool, port: u32) -> Result<Self, ServerError> {
        match u16::try_from(port) {
            Ok(p) if p >= 1 => Ok(Self { enabled, port: p }),
            _ => Err(ServerError::InvalidPort(port)),
        }
    }

    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port))
    }

    /// Extra frida-server arguments; empty when listening is disabled.
    pub fn args(&self) -> Vec<String> {
        if self.enabled {
            vec!["--listen".to_string(), self.bind_address().to_string()]
        } else {
            Vec::new()
        }
    }
}

/// Checks that nobody is listening on the port before spawning.
///
/// Only `AddrInUse` is conclusive. Other failures (e.g. privileged ports when
/// the companion runs through `su`) are left to the startup grace check.
pub fn probe_port(config: &ListenConfig) -> Result<(), ServerError> {
    if !config.enabled {
        return Ok(());
    }
    let socket = match Socket::new(Domain::IPV4, Type::STREAM, None) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("[Listen] probe socket unavailable: {}", e);
            return Ok(());
        }
    };
    if let Err(e) = socket.set_reuse_address(true) {
        tracing::debug!("[Listen] SO_REUSEADDR failed: {}", e);
    }
    match socket.bind(&config.bind_address().into()) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => Err(ServerError::Bind { port: config.port }),
        Err(e) => {
            tracing::debug!("[Listen] probe on port {} inconclusive: {}", config.port, e);
            Ok(())
        }
    }
}
