// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Terminal-command severity analysis feeding the approval gate.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Analyzed danger level of a terminal command.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::None => "none",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

struct SeverityTable {
    critical: Vec<Regex>,
    high: Vec<Regex>,
    medium: Vec<Regex>,
    low: Vec<Regex>,
}

fn table() -> &'static SeverityTable {
    static TABLE: OnceLock<SeverityTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        let compile = |patterns: &[&str]| -> Vec<Regex> {
            patterns
                .iter()
                .map(|p| Regex::new(p).expect("severity pattern must compile"))
                .collect()
        };
        SeverityTable {
            critical: compile(&[
                // Recursive force-delete of anything outside the workspace:
                // absolute paths, `~`, or `$HOME`.  These always prompt.
                r"\brm\s+(-[a-zA-Z]*r[a-zA-Z]*f|-[a-zA-Z]*f[a-zA-Z]*r)[a-zA-Z]*\s+(/|~|\$HOME)",
                r"\bdd\s+if=",
                r"\bmkfs(\.\w+)?\b",
                r">\s*/dev/(sd|nvme|hd)",
                r":\(\)\s*\{.*:\|:",
                r"\b(shutdown|reboot|halt|poweroff)\b",
                r"\bchmod\s+(-R\s+)?777\s+/",
                r"curl[^|]*\|\s*(sudo\s+)?(ba)?sh",
                r"wget[^|]*\|\s*(sudo\s+)?(ba)?sh",
            ]),
            high: compile(&[
                r"\brm\s+-[a-zA-Z]*r",
                r"\bsudo\b",
                r"\bgit\s+push\s+.*--force",
                r"\bgit\s+reset\s+--hard",
                r"\bgit\s+clean\s+-[a-zA-Z]*f",
                r"\bkill\s+-9\b",
                r"\btruncate\b",
                r"\bdocker\s+(rm|rmi|system\s+prune)",
            ]),
            medium: compile(&[
                r"\brm\b",
                r"\bmv\b",
                r"\bgit\s+(commit|checkout|rebase|merge|stash)",
                r"\b(npm|pnpm|yarn)\s+install\b",
                r"\bpip3?\s+install\b",
                r"\bcargo\s+install\b",
                r"\bchmod\b",
                r"\bchown\b",
                r"\bln\s+-s",
            ]),
            low: compile(&[
                r">\s*\S",
                r"\btouch\b",
                r"\bmkdir\b",
                r"\bcp\b",
                r"\bgit\s+add\b",
                r"\b(npm|cargo|make|pytest|go)\s+(run|test|build|check)\b",
            ]),
        }
    })
}

/// Classify a command string.  Unmatched commands are `None` (read-only
/// lookups like `ls`, `cat`, `rg`).
pub fn analyze_command(command: &str) -> Severity {
    let t = table();
    if t.critical.iter().any(|re| re.is_match(command)) {
        return Severity::Critical;
    }
    if t.high.iter().any(|re| re.is_match(command)) {
        return Severity::High;
    }
    if t.medium.iter().any(|re| re.is_match(command)) {
        return Severity::Medium;
    }
    if t.low.iter().any(|re| re.is_match(command)) {
        return Severity::Low;
    }
    Severity::None
}

/// Pure approval decision: critical always prompts; anything else prompts
/// only when the session is not auto-approving.
pub fn requires_approval(severity: Severity, auto_approve: bool) -> bool {
    severity == Severity::Critical || !auto_approve
}

/// The severity shown to the user in the approval dialog is clamped to at
/// least `medium` — a prompt labelled "none" would invite rubber-stamping.
pub fn displayed_severity(severity: Severity) -> Severity {
    severity.max(Severity::Medium)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rm_rf_root_is_critical() {
        assert_eq!(analyze_command("rm -rf /"), Severity::Critical);
        assert_eq!(analyze_command("rm -rf /*"), Severity::Critical);
    }

    #[test]
    fn rm_rf_any_absolute_path_is_critical() {
        assert_eq!(analyze_command("rm -rf /tmp/foo"), Severity::Critical);
        assert_eq!(analyze_command("rm -fr /var/lib/data"), Severity::Critical);
    }

    #[test]
    fn rm_rf_home_paths_are_critical() {
        assert_eq!(analyze_command("rm -rf ~/projects"), Severity::Critical);
        assert_eq!(analyze_command("rm -rf $HOME/work"), Severity::Critical);
    }

    #[test]
    fn rm_rf_relative_path_is_high() {
        assert_eq!(analyze_command("rm -rf build"), Severity::High);
        assert_eq!(analyze_command("rm -r target"), Severity::High);
    }

    #[test]
    fn plain_rm_is_medium() {
        assert_eq!(analyze_command("rm stale.log"), Severity::Medium);
    }

    #[test]
    fn dd_and_mkfs_are_critical() {
        assert_eq!(analyze_command("dd if=/dev/zero of=/dev/sda"), Severity::Critical);
        assert_eq!(analyze_command("mkfs.ext4 /dev/sdb1"), Severity::Critical);
    }

    #[test]
    fn pipe_to_shell_is_critical() {
        assert_eq!(
            analyze_command("curl https://x.sh | sh"),
            Severity::Critical
        );
    }

    #[test]
    fn sudo_is_high() {
        assert_eq!(analyze_command("sudo apt update"), Severity::High);
    }

    #[test]
    fn force_push_is_high() {
        assert_eq!(
            analyze_command("git push origin main --force"),
            Severity::High
        );
    }

    #[test]
    fn package_install_is_medium() {
        assert_eq!(analyze_command("npm install leftpad"), Severity::Medium);
        assert_eq!(analyze_command("pip install requests"), Severity::Medium);
    }

    #[test]
    fn build_and_test_are_low() {
        assert_eq!(analyze_command("cargo test --workspace"), Severity::Low);
        assert_eq!(analyze_command("npm run lint"), Severity::Low);
    }

    #[test]
    fn redirects_are_low() {
        assert_eq!(analyze_command("echo hi > out.txt"), Severity::Low);
    }

    #[test]
    fn read_only_commands_are_none() {
        assert_eq!(analyze_command("ls -la"), Severity::None);
        assert_eq!(analyze_command("cat src/main.rs"), Severity::None);
        assert_eq!(analyze_command("rg TODO"), Severity::None);
    }

    #[test]
    fn critical_always_requires_approval() {
        assert!(requires_approval(Severity::Critical, true));
        assert!(requires_approval(Severity::Critical, false));
    }

    #[test]
    fn auto_approve_never_bypasses_a_critical_delete() {
        let severity = analyze_command("rm -rf /tmp/foo");
        assert!(requires_approval(severity, true));
    }

    #[test]
    fn auto_approve_skips_non_critical() {
        assert!(!requires_approval(Severity::High, true));
        assert!(!requires_approval(Severity::None, true));
        assert!(requires_approval(Severity::Low, false));
    }

    #[test]
    fn displayed_severity_clamped_to_medium() {
        assert_eq!(displayed_severity(Severity::None), Severity::Medium);
        assert_eq!(displayed_severity(Severity::Low), Severity::Medium);
        assert_eq!(displayed_severity(Severity::High), Severity::High);
        assert_eq!(displayed_severity(Severity::Critical), Severity::Critical);
    }
}
