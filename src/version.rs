//! C2: VersionProbe — determines the master's own version and compares
//! peer-reported commit strings against it (spec §4.2).

use std::process::Command;
use tracing::warn;

const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone)]
pub struct VersionProbe {
    master_version: String,
}

impl VersionProbe {
    /// Computed once at boot, out-of-band, by shelling out to `git`. If
    /// unavailable, falls back to `"unknown"` and version checks are skipped
    /// with a warning (spec §4.2).
    pub fn probe_at_boot() -> Self {
        let master_version = Command::new("git")
            .args(["rev-parse", "--short=12", "HEAD"])
            .output()
            .ok()
            .filter(|o| o.status.success())
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .map(|s| s.trim().to_lowercase())
            .filter(|s| is_valid_commit_id(s))
            .unwrap_or_else(|| {
                warn!("could not determine master version from git; version checks disabled");
                UNKNOWN.to_string()
            });

        Self { master_version }
    }

    pub fn with_version(master_version: impl Into<String>) -> Self {
        Self {
            master_version: master_version.into(),
        }
    }

    pub fn master_version(&self) -> &str {
        &self.master_version
    }

    pub fn checks_enabled(&self) -> bool {
        self.master_version != UNKNOWN
    }

    /// Exact lowercase string equality (spec §4.2). A single differing
    /// character is a mismatch, never a "close enough" match (spec §8
    /// boundary behavior).
    pub fn matches(&self, peer_commit: &str) -> bool {
        if !self.checks_enabled() {
            return true;
        }
        self.master_version == peer_commit.trim().to_lowercase()
    }
}

fn is_valid_commit_id(s: &str) -> bool {
    (7..=40).contains(&s.len()) && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_required() {
        let probe = VersionProbe::with_version("abc1234");
        assert!(probe.matches("abc1234"));
        assert!(!probe.matches("abc1235"));
        assert!(!probe.matches("deadbee"));
    }

    #[test]
    fn unknown_version_skips_checks() {
        let probe = VersionProbe::with_version(UNKNOWN);
        assert!(!probe.checks_enabled());
        assert!(probe.matches("anything"));
    }

    #[test]
    fn commit_id_validation() {
        assert!(is_valid_commit_id("abc1234"));
        assert!(!is_valid_commit_id("ABC1234"));
        assert!(!is_valid_commit_id("zz"));
    }
}
