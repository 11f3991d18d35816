//! Block list of denied domains.
//!
//! Loaded once at startup and read-only afterwards. Matching is exact and
//! case-insensitive; a listed domain does not cover its subdomains.

use std::fs;
use std::path::Path;

use rustc_hash::FxHashSet;

use crate::error::BlocklistError;

/// A set of blocked domains for efficient lookup.
#[derive(Debug, Default, Clone)]
pub struct Blocklist {
    domains: FxHashSet<String>,
}

impl Blocklist {
    /// Create an empty blocklist that blocks nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a blocklist from an iterator of domain names.
    pub fn from_domains<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .map(|d| normalize(d.as_ref()))
            .filter(|d| !d.is_empty())
            .collect();

        Self { domains }
    }

    /// Parse a block list in plain or hosts-file format.
    ///
    /// Plain lines hold one domain; blank lines and `#` comments are skipped.
    /// Hosts lines contribute every name after a `0.0.0.0` or `127.0.0.1`
    /// address, except the system names a stock hosts file carries. Lines
    /// mapping names to any other address are not block entries.
    pub fn parse(text: &str) -> Self {
        Self::from_domains(text.lines().flat_map(|line| {
            let line = line.split('#').next().unwrap_or_default().trim();
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [domain] if !is_ip_like(domain) => vec![*domain],
                [ip, names @ ..] if BLOCK_IPS.contains(ip) => names
                    .iter()
                    .copied()
                    .filter(|name| !is_system_name(name) && !is_ip_like(name))
                    .collect(),
                _ => Vec::new(),
            }
        }))
    }

    /// Read and parse a block list file.
    pub fn load(path: &Path) -> Result<Self, BlocklistError> {
        let text = fs::read_to_string(path).map_err(|source| BlocklistError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self::parse(&text))
    }

    /// Return the listed entry matching `domain`, if any.
    pub fn matches(&self, domain: &str) -> Option<&str> {
        self.domains.get(&normalize(domain)).map(String::as_str)
    }

    /// Returns the number of domains in the blocklist.
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

/// Addresses hosts-format lists use to sink a name.
const BLOCK_IPS: &[&str] = &["0.0.0.0", "127.0.0.1"];

/// Names a stock hosts file maps that must never be blocked.
const SYSTEM_NAMES: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "local",
    "broadcasthost",
    "ip6-localhost",
    "ip6-loopback",
    "ip6-localnet",
    "ip6-mcastprefix",
    "ip6-allnodes",
    "ip6-allrouters",
    "ip6-allhosts",
];

fn is_system_name(name: &str) -> bool {
    SYSTEM_NAMES.contains(&normalize(name).as_str())
}

/// Addresses and address-shaped junk such as `0.0.0.0.0.0.0.0`.
fn is_ip_like(s: &str) -> bool {
    if s.contains(':') {
        return true;
    }
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() >= 2 && parts.iter().all(|p| p.parse::<u8>().is_ok())
}

fn normalize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocklist() -> Blocklist {
        Blocklist::parse(
            "# trackers\n\
             doubleclick.com\n\
             \n\
             0.0.0.0 ads.example.org # hosts style\n\
             Telemetry.Example.NET.\n",
        )
    }

    #[test]
    fn parse_skips_comments_and_blank_lines() {
        assert_eq!(blocklist().len(), 3);
    }

    #[test]
    fn matches_exact_domain() {
        assert_eq!(blocklist().matches("doubleclick.com"), Some("doubleclick.com"));
    }

    #[test]
    fn matches_case_insensitively() {
        let blocklist = blocklist();

        assert_eq!(blocklist.matches("DOUBLECLICK.COM"), Some("doubleclick.com"));
        assert_eq!(
            blocklist.matches("telemetry.example.net"),
            Some("telemetry.example.net")
        );
    }

    #[test]
    fn matches_ignores_trailing_dot() {
        assert!(blocklist().matches("ads.example.org.").is_some());
    }

    #[test]
    fn subdomains_are_not_matched() {
        assert_eq!(blocklist().matches("ads.doubleclick.com"), None);
        assert_eq!(blocklist().matches("example.org"), None);
    }

    #[test]
    fn empty_input_is_not_blocked() {
        assert_eq!(blocklist().matches(""), None);
        assert!(Blocklist::new().is_empty());
    }

    #[test]
    fn hosts_line_contributes_every_name() {
        let blocklist = Blocklist::parse("0.0.0.0 a.example b.example\t c.example\n");

        assert_eq!(blocklist.len(), 3);
        assert!(blocklist.matches("b.example").is_some());
        assert!(blocklist.matches("c.example").is_some());
    }

    #[test]
    fn hosts_system_entries_are_not_blocked() {
        let blocklist = Blocklist::parse(
            "127.0.0.1 localhost\n\
             127.0.0.1 LocalHost.localdomain\n\
             255.255.255.255 broadcasthost\n\
             ::1 localhost ip6-localhost ip6-loopback\n\
             0.0.0.0 0.0.0.0\n\
             0.0.0.0 tracker.example\n",
        );

        assert_eq!(blocklist.len(), 1);
        assert_eq!(blocklist.matches("localhost"), None);
        assert_eq!(blocklist.matches("broadcasthost"), None);
        assert!(blocklist.matches("tracker.example").is_some());
    }

    #[test]
    fn hosts_lines_for_other_addresses_are_skipped() {
        let blocklist = Blocklist::parse("192.168.1.1 router.lan\n10.0.0.1 nas.lan\n");

        assert!(blocklist.is_empty());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Blocklist::load(Path::new("/nonexistent/blocklist.txt")).unwrap_err();

        assert!(err.to_string().contains("/nonexistent/blocklist.txt"));
    }
}
