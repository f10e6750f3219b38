//! Whitelist rule data
//!
//! The rule table is plain data: it ships with a built-in set covering the
//! commands an ops assistant reaches for daily, and operators can replace it
//! with a TOML file of the same shape without rebuilding.

use super::RiskLevel;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// One whitelist rule. More specific rules (with a subcommand) win over
/// base-command-only rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRule {
    pub base_command: String,
    #[serde(default)]
    pub subcommand: Option<String>,
    #[serde(default)]
    pub risk: RiskLevel,
    /// Flags that turn an otherwise-allowed command into a denial.
    #[serde(default)]
    pub blocked_flags: Vec<String>,
    #[serde(default)]
    pub description: String,
}

/// Full rule table plus the hard denial and pipe allow lists.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub rules: Vec<CommandRule>,
    pub blocked_commands: HashSet<String>,
    pub allowed_pipe_commands: HashSet<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RuleSetFile {
    #[serde(default)]
    rules: Vec<CommandRule>,
    #[serde(default)]
    blocked_commands: Vec<String>,
    #[serde(default)]
    allowed_pipe_commands: Vec<String>,
}

fn rule(base: &str, sub: Option<&str>, risk: RiskLevel, blocked: &[&str], desc: &str) -> CommandRule {
    CommandRule {
        base_command: base.to_string(),
        subcommand: sub.map(str::to_string),
        risk,
        blocked_flags: blocked.iter().map(|s| s.to_string()).collect(),
        description: desc.to_string(),
    }
}

impl RuleSet {
    /// Built-in rule table.
    pub fn builtin() -> Self {
        use RiskLevel::{High, Medium, Safe};
        let rules = vec![
            // Filesystem, read-only
            rule("ls", None, Safe, &[], "list directory contents"),
            rule("ll", None, Safe, &[], "list directory details"),
            rule("cat", None, Safe, &[], "print file contents"),
            rule("head", None, Safe, &[], "file head"),
            rule("tail", None, Safe, &[], "file tail"),
            rule("less", None, Safe, &[], "page through a file"),
            rule("more", None, Safe, &[], "page through a file"),
            rule("wc", None, Safe, &[], "count lines/words"),
            rule("file", None, Safe, &[], "file type"),
            rule("stat", None, Safe, &[], "file status"),
            rule("test", None, Safe, &[], "test a path or condition"),
            rule("find", None, Safe, &["-delete", "-exec"], "find files"),
            rule("which", None, Safe, &[], "locate a command"),
            rule("whereis", None, Safe, &[], "locate a command"),
            rule("readlink", None, Safe, &[], "resolve a symlink"),
            rule("realpath", None, Safe, &[], "resolve a path"),
            // Text processing, read-only
            rule("grep", None, Safe, &[], "text search"),
            rule("egrep", None, Safe, &[], "extended regex search"),
            rule("fgrep", None, Safe, &[], "fixed-string search"),
            rule("awk", None, Safe, &[], "text processing"),
            rule("sed", None, Safe, &["-i"], "stream editing, no in-place"),
            rule("sort", None, Safe, &[], "sort lines"),
            rule("uniq", None, Safe, &[], "deduplicate lines"),
            rule("cut", None, Safe, &[], "column extraction"),
            rule("tr", None, Safe, &[], "character translation"),
            rule("diff", None, Safe, &[], "compare files"),
            rule("comm", None, Safe, &[], "compare sorted files"),
            rule("tee", None, Medium, &[], "write to file and stdout"),
            // System information
            rule("df", None, Safe, &[], "disk usage"),
            rule("du", None, Safe, &[], "directory sizes"),
            rule("free", None, Safe, &[], "memory usage"),
            rule("top", None, Safe, &[], "process monitor"),
            rule("htop", None, Safe, &[], "process monitor"),
            rule("ps", None, Safe, &[], "process list"),
            rule("pgrep", None, Safe, &[], "process search"),
            rule("lsof", None, Safe, &[], "open files and sockets"),
            rule("netstat", None, Safe, &[], "network status"),
            rule("ss", None, Safe, &[], "socket status"),
            rule("ip", None, Safe, &[], "network configuration"),
            rule("ifconfig", None, Safe, &[], "interface configuration"),
            rule("hostname", None, Safe, &[], "host name"),
            rule("uname", None, Safe, &[], "kernel info"),
            rule("uptime", None, Safe, &[], "uptime and load"),
            rule("whoami", None, Safe, &[], "current user"),
            rule("id", None, Safe, &[], "user identity"),
            rule("w", None, Safe, &[], "logged-in users"),
            rule("who", None, Safe, &[], "logged-in users"),
            rule("last", None, Safe, &[], "login history"),
            rule("date", None, Safe, &[], "current time"),
            rule("env", None, Safe, &[], "environment variables"),
            rule("printenv", None, Safe, &[], "environment variables"),
            rule("echo", None, Safe, &[], "print text"),
            rule("printf", None, Safe, &[], "formatted print"),
            rule("pwd", None, Safe, &[], "working directory"),
            rule("history", None, Safe, &[], "command history"),
            rule("dmesg", None, Safe, &[], "kernel messages"),
            rule("lscpu", None, Safe, &[], "CPU info"),
            rule("lsmem", None, Safe, &[], "memory info"),
            rule("lsblk", None, Safe, &[], "block devices"),
            rule("vmstat", None, Safe, &[], "virtual memory stats"),
            rule("iostat", None, Safe, &[], "I/O stats"),
            rule("journalctl", None, Safe, &[], "systemd journal"),
            // Network tools
            rule("ping", None, Safe, &[], "connectivity check"),
            rule("curl", None, Safe, &[], "HTTP request"),
            rule("wget", None, Medium, &[], "download a file"),
            rule("dig", None, Safe, &[], "DNS lookup"),
            rule("nslookup", None, Safe, &[], "DNS lookup"),
            rule("host", None, Safe, &[], "DNS lookup"),
            rule("traceroute", None, Safe, &[], "route trace"),
            rule("nc", None, Medium, &[], "raw network connection"),
            rule("telnet", None, Medium, &[], "remote connection"),
            rule("open", None, Medium, &[], "open an application (macOS)"),
            // Docker
            rule("docker", Some("ps"), Safe, &[], "list containers"),
            rule("docker", Some("images"), Safe, &[], "list images"),
            rule("docker", Some("logs"), Safe, &[], "container logs"),
            rule("docker", Some("inspect"), Safe, &[], "inspect object"),
            rule("docker", Some("stats"), Safe, &[], "resource stats"),
            rule("docker", Some("top"), Safe, &[], "container processes"),
            rule("docker", Some("port"), Safe, &[], "port mappings"),
            rule("docker", Some("version"), Safe, &[], "docker version"),
            rule("docker", Some("info"), Safe, &[], "daemon info"),
            rule("docker", Some("network"), Safe, &[], "network info"),
            rule("docker", Some("volume"), Safe, &[], "volume info"),
            rule("docker", Some("exec"), Medium, &[], "run command in container"),
            rule("docker", Some("cp"), Medium, &[], "copy files to/from container"),
            rule("docker", Some("start"), Medium, &[], "start container"),
            rule("docker", Some("stop"), Medium, &[], "stop container"),
            rule("docker", Some("restart"), Medium, &[], "restart container"),
            rule("docker", Some("pull"), Medium, &[], "pull image"),
            rule("docker", Some("build"), Medium, &[], "build image"),
            rule("docker", Some("run"), High, &[], "run container"),
            rule("docker", Some("rm"), High, &[], "remove container"),
            rule("docker", Some("rmi"), High, &[], "remove image"),
            rule("docker", Some("kill"), High, &[], "kill container"),
            rule("docker", Some("prune"), High, &[], "prune resources"),
            // Docker compose (the `docker compose` form normalizes to this)
            rule("docker-compose", Some("ps"), Safe, &[], "list services"),
            rule("docker-compose", Some("logs"), Safe, &[], "service logs"),
            rule("docker-compose", Some("config"), Safe, &[], "validate config"),
            rule("docker-compose", Some("start"), Medium, &[], "start services"),
            rule("docker-compose", Some("stop"), Medium, &[], "stop services"),
            rule("docker-compose", Some("restart"), Medium, &[], "restart services"),
            rule("docker-compose", Some("up"), Medium, &[], "bring services up"),
            rule("docker-compose", Some("pull"), Medium, &[], "pull images"),
            rule("docker-compose", Some("build"), Medium, &[], "build services"),
            rule("docker-compose", Some("down"), High, &[], "stop and remove"),
            rule("docker-compose", Some("rm"), High, &[], "remove containers"),
            // Git
            rule("git", Some("status"), Safe, &[], "repo status"),
            rule("git", Some("log"), Safe, &[], "commit history"),
            rule("git", Some("diff"), Safe, &[], "diff"),
            rule("git", Some("show"), Safe, &[], "show object"),
            rule("git", Some("branch"), Safe, &[], "branches"),
            rule("git", Some("remote"), Safe, &[], "remotes"),
            rule("git", Some("config"), Safe, &[], "configuration"),
            rule("git", Some("blame"), Safe, &[], "line attribution"),
            rule("git", Some("fetch"), Medium, &[], "fetch remote"),
            rule("git", Some("pull"), Medium, &[], "pull updates"),
            rule("git", Some("clone"), Medium, &[], "clone repository"),
            rule("git", Some("checkout"), Medium, &[], "switch branches"),
            rule("git", Some("switch"), Medium, &[], "switch branches"),
            rule("git", Some("add"), Medium, &[], "stage files"),
            rule("git", Some("commit"), Medium, &[], "commit changes"),
            rule("git", Some("stash"), Medium, &[], "stash changes"),
            rule("git", Some("push"), High, &[], "push to remote"),
            rule("git", Some("reset"), High, &["--hard"], "reset, no --hard"),
            rule("git", Some("clean"), High, &[], "remove untracked files"),
            // Systemd
            rule("systemctl", Some("status"), Safe, &[], "service status"),
            rule("systemctl", Some("is-active"), Safe, &[], "activity check"),
            rule("systemctl", Some("is-enabled"), Safe, &[], "enablement check"),
            rule("systemctl", Some("list-units"), Safe, &[], "unit list"),
            rule("systemctl", Some("show"), Safe, &[], "unit properties"),
            rule("systemctl", Some("cat"), Safe, &[], "unit file"),
            rule("systemctl", Some("start"), Medium, &[], "start service"),
            rule("systemctl", Some("stop"), Medium, &[], "stop service"),
            rule("systemctl", Some("restart"), Medium, &[], "restart service"),
            rule("systemctl", Some("reload"), Medium, &[], "reload service"),
            rule("systemctl", Some("enable"), High, &[], "enable service"),
            rule("systemctl", Some("disable"), High, &[], "disable service"),
            rule("systemctl", Some("mask"), High, &[], "mask service"),
            // Package managers, read-only
            rule("apt", Some("list"), Safe, &[], "list packages"),
            rule("apt", Some("show"), Safe, &[], "package details"),
            rule("apt", Some("search"), Safe, &[], "search packages"),
            rule("dpkg", None, Safe, &[], "package queries"),
            rule("yum", Some("list"), Safe, &[], "list packages"),
            rule("yum", Some("info"), Safe, &[], "package info"),
            rule("rpm", None, Safe, &[], "package queries"),
            rule("pip", Some("list"), Safe, &[], "python packages"),
            rule("pip", Some("show"), Safe, &[], "package details"),
            rule("pip", Some("freeze"), Safe, &[], "dependency list"),
            rule("npm", Some("list"), Safe, &[], "node packages"),
            rule("npm", Some("view"), Safe, &[], "package details"),
            rule("npm", Some("outdated"), Safe, &[], "outdated packages"),
            // File operations, writing
            rule("touch", None, Medium, &[], "create empty file"),
            rule("mkdir", None, Medium, &[], "create directory"),
            rule("cp", None, Medium, &[], "copy files"),
            rule("mv", None, Medium, &[], "move files"),
            rule("ln", None, Medium, &[], "create link"),
            rule("rm", None, High, &["-rf", "-fr", "--recursive"], "delete files"),
            rule("rmdir", None, Medium, &[], "remove empty directory"),
            rule("chmod", None, High, &["-R", "777"], "change permissions"),
            rule("chown", None, High, &["-R"], "change ownership"),
            // Process management
            rule("kill", None, High, &["-9", "-KILL"], "terminate process"),
            rule("pkill", None, High, &[], "terminate by name"),
            rule("killall", None, High, &[], "terminate all matching"),
            // Misc tooling
            rule("jq", None, Safe, &[], "JSON processing"),
            rule("yq", None, Safe, &[], "YAML processing"),
            rule("xargs", None, Medium, &[], "argument passing"),
            rule("tar", None, Medium, &[], "archives"),
            rule("gzip", None, Medium, &[], "compression"),
            rule("gunzip", None, Medium, &[], "decompression"),
            rule("base64", None, Safe, &[], "base64 codec"),
            rule("md5sum", None, Safe, &[], "MD5 checksum"),
            rule("sha256sum", None, Safe, &[], "SHA256 checksum"),
            rule("openssl", None, Safe, &[], "SSL toolkit"),
            rule("crontab", Some("-l"), Safe, &[], "list cron jobs"),
        ];

        let blocked_commands = [
            "dd", "mkfs", "fdisk", "parted", "mount", "umount", "sudo", "su", "passwd",
            "useradd", "userdel", "groupadd", "groupdel", "visudo", "shutdown", "reboot",
            "init", "poweroff", "halt", "iptables", "firewall-cmd", "ufw", "nft", "eval",
            "exec", "source", ".",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let allowed_pipe_commands = [
            "grep", "egrep", "fgrep", "awk", "sed", "sort", "uniq", "cut", "tr", "head",
            "tail", "wc", "jq", "yq", "less", "more", "cat", "tee", "xargs", "base64",
            "column",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        Self {
            rules,
            blocked_commands,
            allowed_pipe_commands,
        }
    }

    /// Load a rule table from a TOML file. Missing lists fall back to the
    /// built-in blocked/pipe sets so a rules file only has to carry rules.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read rules file {}", path.display()))?;
        let parsed: RuleSetFile = toml::from_str(&raw)
            .with_context(|| format!("invalid rules file {}", path.display()))?;

        let builtin = Self::builtin();
        Ok(Self {
            rules: if parsed.rules.is_empty() {
                builtin.rules
            } else {
                parsed.rules
            },
            blocked_commands: if parsed.blocked_commands.is_empty() {
                builtin.blocked_commands
            } else {
                parsed.blocked_commands.into_iter().collect()
            },
            allowed_pipe_commands: if parsed.allowed_pipe_commands.is_empty() {
                builtin.allowed_pipe_commands
            } else {
                parsed.allowed_pipe_commands.into_iter().collect()
            },
        })
    }

    /// Most specific rule for (base, subcommand): exact subcommand match
    /// first, then a base-only rule.
    pub fn find_rule(&self, base: &str, subcommand: Option<&str>) -> Option<&CommandRule> {
        self.rules
            .iter()
            .find(|r| r.base_command == base && r.subcommand.as_deref() == subcommand)
            .or_else(|| {
                self.rules
                    .iter()
                    .find(|r| r.base_command == base && r.subcommand.is_none())
            })
    }

    pub fn has_any_rule_for(&self, base: &str) -> bool {
        self.rules.iter().any(|r| r.base_command == base)
    }

    pub fn is_blocked_command(&self, base: &str) -> bool {
        if self.blocked_commands.contains(base) {
            return true;
        }
        // mkfs.ext4 and friends match their prefix.
        match base.split('.').next() {
            Some(prefix) if !prefix.is_empty() => self.blocked_commands.contains(prefix),
            _ => false,
        }
    }
}
