//! How the companion gets launched: directly, or wrapped in `su -c`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::server::error::ServerError;

pub(crate) const SU_BINARIES: &[&str] = &[
    "/system/bin/su",
    "/system/xbin/su",
    "/sbin/su",
    "/su/bin/su",
    "/debug_ramdisk/su",
    "/usr/bin/su",
    "/bin/su",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeMode {
    /// Run the binary as the current user.
    None,
    /// Always go through `su -c`; no helper is a `Permission` error.
    Su,
    /// Direct when already root, `su -c` when a helper exists, else direct.
    #[default]
    Auto,
}

#[cfg(unix)]
pub fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
pub fn running_as_root() -> bool {
    false
}

pub fn find_su() -> Option<PathBuf> {
    SU_BINARIES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
        .or_else(|| {
            let path = std::env::var_os("PATH")?;
            std::env::split_paths(&path)
                .map(|dir| dir.join("su"))
                .find(|p| p.is_file())
        })
}

/// Single-quote for `sh -c`, which is what `su -c` hands the string to.
fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

fn su_command_line(binary: &Path, args: &[String]) -> String {
    let mut line = format!("exec {}", shell_quote(&binary.to_string_lossy()));
    for arg in args {
        line.push(' ');
        line.push_str(&shell_quote(arg));
    }
    line
}

/// Builds the launch command for `binary`; stdio and process group are left
/// to the caller.
pub fn build_command(mode: PrivilegeMode, binary: &Path, args: &[String]) -> Result<Command, ServerError> {
    let wrap = match mode {
        PrivilegeMode::None => None,
        PrivilegeMode::Su => Some(find_su().ok_or_else(|| {
            ServerError::Permission(format!("no su binary found (tried {:?} and PATH)", SU_BINARIES))
        })?),
        PrivilegeMode::Auto if running_as_root() => None,
        PrivilegeMode::Auto => {
            let su = find_su();
            if su.is_none() {
                tracing::warn!("[Privilege] not root and no su helper, launching frida-server unprivileged");
            }
            su
        }
    };

    let command = match wrap {
        Some(su) => {
            tracing::debug!("[Privilege] launching via {}", su.display());
            let mut cmd = Command::new(su);
            cmd.arg("-c").arg(su_command_line(binary, args));
            cmd
        }
        None => {
            let mut cmd = Command::new(binary);
            cmd.args(args);
            cmd
        }
    };
    Ok(command)
}
