//! Process attribution for intercepted flows.
//!
//! Reads the `/proc` filesystem. Lookups are read-only and may race with the
//! process exiting, in which case only the fields still readable are
//! reported; everything else is left as `None`.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::ProcessLookupError;

/// Point-in-time snapshot of a process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub path: Option<PathBuf>,
    pub name: Option<String>,
    pub arguments: Option<Vec<String>>,
    pub cwd: Option<PathBuf>,
    pub ppid: Option<u32>,
    pub uid: Option<u32>,
}

impl ProcessIdentity {
    /// An identity carrying only the pid, used when lookup timed out.
    pub fn unresolved(pid: u32) -> Self {
        Self {
            pid,
            ..Self::default()
        }
    }

    /// Names of the fields that could not be resolved.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.path.is_none() {
            missing.push("path");
        }
        if self.name.is_none() {
            missing.push("name");
        }
        if self.arguments.is_none() {
            missing.push("arguments");
        }
        if self.cwd.is_none() {
            missing.push("cwd");
        }
        missing
    }

    /// `Err(PartiallyResolved)` when any core field is absent.
    pub fn completeness(&self) -> Result<(), ProcessLookupError> {
        let missing = self.missing();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ProcessLookupError::PartiallyResolved {
                pid: self.pid,
                missing,
            })
        }
    }
}

/// Source of process metadata.
///
/// Implementations may block; callers bound them in time.
pub trait ProcessCorrelator: Send + Sync + 'static {
    /// Snapshot the process with the given pid.
    fn identify(&self, pid: u32) -> Result<ProcessIdentity, ProcessLookupError>;

    /// Find the pid owning the local UDP socket bound to `addr`.
    fn socket_owner(&self, _addr: SocketAddr) -> Option<u32> {
        None
    }
}

/// Correlator backed by a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcfsCorrelator {
    root: PathBuf,
}

impl ProcfsCorrelator {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Pids of every running process whose name is exactly `name`, ascending.
    pub fn find_by_name(&self, name: &str) -> Vec<u32> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };

        let mut pids: Vec<u32> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter(|pid: &u32| {
                let dir = self.root.join(pid.to_string());
                let comm = fs::read_to_string(dir.join("comm")).ok();
                let found = comm
                    .as_deref()
                    .map(|s| s.trim_end_matches('\n').to_string())
                    .filter(|s| !s.is_empty())
                    .or_else(|| name_from_path(fs::read_link(dir.join("exe")).ok().as_deref()));
                found.as_deref() == Some(name)
            })
            .collect();
        pids.sort_unstable();
        pids
    }

    fn socket_inode(&self, addr: SocketAddr) -> Option<u64> {
        let table = match addr {
            SocketAddr::V4(_) => "net/udp",
            SocketAddr::V6(_) => "net/udp6",
        };
        let content = fs::read_to_string(self.root.join(table)).ok()?;

        content
            .lines()
            .skip(1)
            .filter_map(parse_socket_line)
            .find(|(local, _)| {
                local.port() == addr.port()
                    && (local.ip() == addr.ip() || local.ip().is_unspecified())
            })
            .map(|(_, inode)| inode)
    }

    fn inode_owner(&self, inode: u64) -> Option<u32> {
        let socket_link = format!("socket:[{inode}]");

        for entry in fs::read_dir(&self.root).ok()?.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) else {
                continue;
            };
            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            for fd in fds.flatten() {
                if let Ok(link) = fs::read_link(fd.path()) {
                    if link.to_string_lossy() == socket_link {
                        return Some(pid);
                    }
                }
            }
        }

        None
    }
}

impl Default for ProcfsCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessCorrelator for ProcfsCorrelator {
    fn identify(&self, pid: u32) -> Result<ProcessIdentity, ProcessLookupError> {
        let dir = self.root.join(pid.to_string());
        if !dir.is_dir() {
            return Err(ProcessLookupError::NotFound(pid));
        }

        let path = fs::read_link(dir.join("exe")).ok();
        let name = fs::read_to_string(dir.join("comm"))
            .ok()
            .map(|s| s.trim_end_matches('\n').to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| name_from_path(path.as_deref()));
        let arguments = fs::read(dir.join("cmdline"))
            .ok()
            .map(|raw| split_cmdline(&raw))
            .filter(|args| !args.is_empty());
        let cwd = fs::read_link(dir.join("cwd")).ok();
        let status = fs::read_to_string(dir.join("status")).ok();

        Ok(ProcessIdentity {
            pid,
            path,
            name,
            arguments,
            cwd,
            ppid: status.as_deref().and_then(|s| status_field(s, "PPid:")),
            uid: status.as_deref().and_then(|s| status_field(s, "Uid:")),
        })
    }

    fn socket_owner(&self, addr: SocketAddr) -> Option<u32> {
        self.socket_inode(addr)
            .and_then(|inode| self.inode_owner(inode))
    }
}

fn name_from_path(path: Option<&Path>) -> Option<String> {
    path?.file_name().map(|n| n.to_string_lossy().into_owned())
}

fn split_cmdline(raw: &[u8]) -> Vec<String> {
    raw.split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect()
}

fn status_field(status: &str, key: &str) -> Option<u32> {
    status
        .lines()
        .find(|line| line.starts_with(key))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

/// Parse one row of `/proc/net/udp{,6}` into (local address, inode).
fn parse_socket_line(line: &str) -> Option<(SocketAddr, u64)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }
    let (ip_hex, port_hex) = fields[1].split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let inode = fields[9].parse().ok()?;

    // The kernel prints each 32-bit word of the address in host byte order.
    let word = |i: usize| -> Option<[u8; 4]> {
        let hex = ip_hex.get(i * 8..i * 8 + 8)?;
        Some(u32::from_str_radix(hex, 16).ok()?.to_ne_bytes())
    };
    let ip = match ip_hex.len() {
        8 => IpAddr::V4(Ipv4Addr::from(word(0)?)),
        32 => {
            let mut octets = [0u8; 16];
            for i in 0..4 {
                octets[i * 4..i * 4 + 4].copy_from_slice(&word(i)?);
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };

    Some((SocketAddr::new(ip, port), inode))
}
