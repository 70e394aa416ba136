//! Pattern-based screening of shell command strings.
//!
//! This is a heuristic filter for model-generated commands, not a sandbox.
//! Argv-form commands never reach a shell and are not screened.

use std::sync::LazyLock;

use regex::Regex;

static SHELL_OPERATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[;&|`\n\r]|\$\(|\$\{|>|<").expect("valid shell operator regex"));

static DANGEROUS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (
            r"\brm\s+(-[a-z]*r[a-z]*f[a-z]*|-[a-z]*f[a-z]*r[a-z]*|(-r\s+-f|-f\s+-r))\s+(--no-preserve-root\s+)?(/|/\*|~|~/|\*|\.|\.\.|\$home)(\s|$)",
            "recursive force delete of a root-like path",
        ),
        (r"--no-preserve-root", "rm --no-preserve-root"),
        (r"\bmkfs(\.[a-z0-9]+)?\b", "filesystem format utility"),
        (r"\bdd\b[^\n]*\bof=/dev/", "raw block device write"),
        (r">\s*/dev/(sd|hd|nvme|vd|xvd|disk|mmcblk)", "raw block device write"),
        (r"\b(shutdown|reboot|halt|poweroff)\b", "shutdown or reboot"),
    ]
    .into_iter()
    .map(|(pattern, label)| (Regex::new(pattern).expect("valid dangerous command regex"), label))
    .collect()
});

/// Why a shell command string was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellBlock {
    /// Contains shell metacharacters (chaining, substitution, redirection, newlines).
    Operators,
    /// Matches the destructive-command deny list.
    Dangerous(&'static str),
}

impl ShellBlock {
    pub fn describe(&self) -> String {
        match self {
            Self::Operators => "contains shell operators".to_string(),
            Self::Dangerous(label) => format!("matches dangerous pattern ({label})"),
        }
    }
}

/// Screen a shell command string. `None` means it may be passed to a shell.
pub fn screen_shell_command(command: &str) -> Option<ShellBlock> {
    let lowered = command.to_lowercase();
    if let Some((_, label)) = DANGEROUS.iter().find(|(re, _)| re.is_match(&lowered)) {
        return Some(ShellBlock::Dangerous(label));
    }
    if SHELL_OPERATORS.is_match(command) {
        return Some(ShellBlock::Operators);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_commands_pass() {
        for cmd in ["echo OK", "python3 out.py --flag", "ls -la src", "rm -rf build"] {
            assert_eq!(screen_shell_command(cmd), None, "{cmd}");
        }
    }

    #[test]
    fn operators_are_blocked() {
        for cmd in [
            "echo a; echo b",
            "a && b",
            "a | b",
            "echo `id`",
            "echo $(id)",
            "echo ${HOME}",
            "echo a >> log",
            "cat < file",
            "echo a\necho b",
        ] {
            assert_eq!(screen_shell_command(cmd), Some(ShellBlock::Operators), "{cmd:?}");
        }
    }

    #[test]
    fn destructive_commands_are_blocked() {
        for cmd in [
            "rm -rf /",
            "rm -fr ~",
            "sudo rm -rf /*",
            "rm -r -f /",
            "rm --no-preserve-root -rf /",
            "mkfs.ext4 /dev/sdb1",
            "dd if=/dev/zero of=/dev/sda",
            "shutdown -h now",
            "REBOOT",
        ] {
            assert!(
                matches!(screen_shell_command(cmd), Some(ShellBlock::Dangerous(_))),
                "{cmd}"
            );
        }
    }
}
