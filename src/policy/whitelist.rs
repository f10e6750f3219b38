//! Whitelist fast path
//!
//! Checks a command against the rule table. Chains (`&&`, `||`) are split
//! quote-aware and every segment must pass; the combined risk is the worst
//! segment. `;`, command substitution and backticks are rejected outright.
//! Redirects are allowed only toward /dev/null (plus `2>&1`); `echo` gets a
//! dedicated lane that permits `$()` and file redirects for the
//! config-file-generation idiom.
//!
//! Returns [`PolicyDecision::Unmatched`] for commands the table does not
//! know, signalling the caller to fall through to the risk analyzer.

use super::risk::{split_on_unquoted, split_tokens};
use super::rules::{CommandRule, RuleSet};
use super::{MatchSource, PolicyDecision, RiskLevel};

const MULTI_COMMAND_TOOLS: &[&str] = &[
    "docker",
    "docker-compose",
    "git",
    "systemctl",
    "apt",
    "apt-get",
    "yum",
    "dnf",
    "brew",
    "npm",
    "yarn",
    "pnpm",
    "pip",
    "pip3",
    "kubectl",
    "helm",
];

const SYSTEM_WRITE_PREFIXES: &[&str] = &[
    "/etc/", "/sys/", "/proc/", "/dev/", "/root/", "/boot/", "/usr/", "/var/", "/bin/",
    "/sbin/", "/lib/",
];

const INFO_ONLY_FLAGS: &[&str] = &["--version", "--help", "-v", "-V", "-h", "version", "help"];

/// Parse a command into (base, subcommand, args). `docker compose …`
/// normalizes to the `docker-compose` rules; path-qualified commands reduce
/// to their basename.
pub fn parse_command(command: &str) -> (String, Option<String>, Vec<String>) {
    let tokens = split_tokens(command);
    if tokens.is_empty() {
        return (String::new(), None, Vec::new());
    }

    let mut base = tokens[0]
        .rsplit('/')
        .next()
        .unwrap_or(&tokens[0])
        .to_string();
    let mut rest_start = 1;

    if base == "docker" && tokens.get(1).map(String::as_str) == Some("compose") {
        base = "docker-compose".to_string();
        rest_start = 2;
    }

    if MULTI_COMMAND_TOOLS.contains(&base.as_str()) {
        // First non-flag token is the subcommand.
        for (i, token) in tokens.iter().enumerate().skip(rest_start) {
            if !token.starts_with('-') {
                return (base, Some(token.clone()), tokens[i + 1..].to_vec());
            }
        }
        return (base, None, tokens[rest_start..].to_vec());
    }

    (base, None, tokens[rest_start..].to_vec())
}

/// Check one command against the whitelist.
pub fn check(rules: &RuleSet, command: &str) -> PolicyDecision {
    let command = command.trim();
    if command.is_empty() {
        return deny("empty command");
    }

    let is_echo = first_token(command) == "echo";
    if is_echo {
        return check_echo(command);
    }

    // Hard rejects that no chain segment may contain.
    for pattern in ["$(", "`", ";", "${"] {
        if command.contains(pattern) {
            return deny(&format!("dangerous pattern detected: '{pattern}'"));
        }
    }

    let mut worst = RiskLevel::Safe;
    let mut worst_reason = String::new();
    let mut any_unmatched = false;

    for segment in split_on_unquoted(command, &["&&", "||"]) {
        match check_segment(rules, &segment) {
            PolicyDecision::Denied { reason, .. } => {
                return deny(&format!("chain segment '{segment}' blocked: {reason}"));
            }
            PolicyDecision::Unmatched => any_unmatched = true,
            PolicyDecision::Allowed { risk, reason, .. } => {
                if risk >= worst {
                    worst = risk;
                    worst_reason = reason;
                }
            }
        }
    }

    if any_unmatched {
        return PolicyDecision::Unmatched;
    }

    PolicyDecision::Allowed {
        risk: worst,
        reason: worst_reason,
        matched_by: MatchSource::Whitelist,
    }
}

/// One pipeline, already free of `&&`/`||`.
fn check_segment(rules: &RuleSet, segment: &str) -> PolicyDecision {
    if first_token(segment) == "echo" {
        return check_echo(segment);
    }

    if let Some(reason) = check_redirects(segment) {
        return deny(&reason);
    }

    let (base, subcommand, args) = parse_command(segment);
    if base.is_empty() {
        return deny("empty command");
    }

    if rules.is_blocked_command(&base) {
        return deny(&format!("command '{base}' is blocked for security reasons"));
    }

    // A recursive-force deletion aimed at the filesystem root is the one
    // combination that gets named explicitly rather than generically.
    if base == "rm"
        && args.iter().any(|a| is_force_recursive_flag(a))
        && args.iter().any(|a| a == "/")
    {
        return deny("flag '-rf' against root path '/' is forbidden");
    }

    let rule = match rules.find_rule(&base, subcommand.as_deref()) {
        Some(rule) => rule,
        None => {
            // `docker --version` style queries are safe for any command the
            // table knows at all, even without a matching subcommand rule.
            let mut all: Vec<&str> = Vec::new();
            if let Some(sub) = subcommand.as_deref() {
                all.push(sub);
            }
            all.extend(args.iter().map(String::as_str));
            if !all.is_empty()
                && all.iter().all(|a| INFO_ONLY_FLAGS.contains(a))
                && rules.has_any_rule_for(&base)
            {
                return PolicyDecision::Allowed {
                    risk: RiskLevel::Safe,
                    reason: format!("{base} version/help query"),
                    matched_by: MatchSource::Whitelist,
                };
            }
            return PolicyDecision::Unmatched;
        }
    };

    if let Some(reason) = check_blocked_flags(rule, &args) {
        return deny(&reason);
    }

    if let Some(reason) = check_pipe_safety(rules, segment) {
        return deny(&reason);
    }

    let mut risk = rule.risk;
    let mut reason = format!("allowed: {}", rule.description);
    if let Some(lifted) = xargs_wrapped_risk(segment) {
        if lifted > risk {
            risk = lifted;
            reason = "allowed, risk lifted: xargs wraps a dangerous command".to_string();
        }
    }

    PolicyDecision::Allowed {
        risk,
        reason,
        matched_by: MatchSource::Whitelist,
    }
}

/// Dedicated lane for `echo`: `$()` and `>`/`>>` are fine for generating
/// config files, but never into system directories, and never chained.
fn check_echo(command: &str) -> PolicyDecision {
    for pattern in ["&&", "||", ";", "`", "${"] {
        if command.contains(pattern) {
            return deny(&format!("'{pattern}' is not allowed in echo commands"));
        }
    }
    if command.contains('&') {
        return deny("backgrounding is not allowed in echo commands");
    }

    if let Some(target) = echo_redirect_target(command) {
        if target == "/"
            || SYSTEM_WRITE_PREFIXES
                .iter()
                .any(|p| target.starts_with(p) || format!("{target}/") == *p)
        {
            return deny(&format!("echo redirect into protected path '{target}'"));
        }
    }

    PolicyDecision::Allowed {
        risk: RiskLevel::Safe,
        reason: "allowed: echo".to_string(),
        matched_by: MatchSource::Whitelist,
    }
}

/// Redirects outside quotes: only /dev/null sinks and `2>&1` pass.
fn check_redirects(segment: &str) -> Option<String> {
    let stripped = strip_quoted(segment);
    let mut normalized = stripped.replace("2>&1", " ");
    for allowed in ["2>>/dev/null", "2> /dev/null", "2>/dev/null", ">/dev/null", "> /dev/null"] {
        normalized = normalized.replace(allowed, " ");
    }

    if normalized.contains('>') {
        return Some("file redirect is not allowed (use the file-ops worker)".to_string());
    }
    if normalized.contains('<') {
        return Some("input redirect is not allowed".to_string());
    }
    None
}

fn check_blocked_flags(rule: &CommandRule, args: &[String]) -> Option<String> {
    if rule.blocked_flags.is_empty() {
        return None;
    }

    for arg in args {
        for blocked in &rule.blocked_flags {
            if arg == blocked || arg.starts_with(&format!("{blocked}=")) {
                return Some(format!(
                    "flag '{blocked}' is not allowed for command '{}'",
                    rule.base_command
                ));
            }
            // Combined short flags: `-rf` also matches `-rfv`.
            if arg.starts_with('-') && !arg.starts_with("--") && blocked.starts_with('-') {
                let blocked_chars: Vec<char> = blocked[1..].chars().collect();
                if !blocked_chars.is_empty()
                    && blocked_chars.iter().all(|c| arg[1..].contains(*c))
                {
                    return Some(format!(
                        "flag '{blocked}' is not allowed for command '{}'",
                        rule.base_command
                    ));
                }
            }
        }
    }
    None
}

/// Every pipe target must be a read-only text tool; `xargs` additionally may
/// not wrap a hard-blocked command.
fn check_pipe_safety(rules: &RuleSet, segment: &str) -> Option<String> {
    let stages = split_on_unquoted(segment, &["|"]);
    if stages.len() < 2 {
        return None;
    }

    for stage in &stages[1..] {
        let (base, _, args) = parse_command(stage);
        if base.is_empty() {
            continue;
        }
        if !rules.allowed_pipe_commands.contains(&base) {
            return Some(format!("command '{base}' is not allowed in a pipe"));
        }
        if base == "xargs" {
            if let Some(wrapped) = xargs_wrapped(&args) {
                let wrapped_base = wrapped
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_string();
                if rules.is_blocked_command(&wrapped_base) {
                    return Some(format!(
                        "command '{wrapped_base}' via xargs is blocked for security reasons"
                    ));
                }
            }
        }
    }
    None
}

/// Risk level of the command `xargs` actually executes, if it is dangerous.
fn xargs_wrapped_risk(segment: &str) -> Option<RiskLevel> {
    let stages = split_on_unquoted(segment, &["|"]);
    for stage in stages.iter().skip(1) {
        let (base, _, args) = parse_command(stage);
        if base != "xargs" {
            continue;
        }
        let wrapped = xargs_wrapped(&args)?;
        if let Some((risk, _)) =
            super::PolicyEngine::danger_pattern_risk(&wrapped, &serde_json::Value::Null)
        {
            return Some(risk);
        }
    }
    None
}

fn xargs_wrapped(args: &[String]) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    let mut skip_next = false;
    for arg in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if ["-I", "-n", "-P", "-L", "-s", "-d"].contains(&arg.as_str()) {
            skip_next = true;
            continue;
        }
        if arg.starts_with('-') && parts.is_empty() {
            continue;
        }
        parts.push(arg);
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

fn is_force_recursive_flag(arg: &str) -> bool {
    if arg == "--force" || arg == "--recursive" {
        return true;
    }
    if arg.starts_with('-') && !arg.starts_with("--") {
        let chars: Vec<char> = arg[1..].chars().collect();
        return chars.contains(&'r') && chars.contains(&'f');
    }
    false
}

fn echo_redirect_target(command: &str) -> Option<String> {
    let stripped = strip_quoted(command);
    let idx = stripped.find('>')?;
    let rest = stripped[idx..].trim_start_matches('>').trim_start();
    let target: String = rest.chars().take_while(|c| !c.is_whitespace()).collect();
    if target.is_empty() {
        None
    } else {
        Some(target)
    }
}

/// Replace quoted spans with spaces so pattern checks cannot be confused by
/// operators inside string literals.
fn strip_quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_single = false;
    let mut in_double = false;
    for c in s.chars() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                out.push(' ');
            }
            '"' if !in_single => {
                in_double = !in_double;
                out.push(' ');
            }
            _ if in_single || in_double => out.push(' '),
            c => out.push(c),
        }
    }
    out
}

fn first_token(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or("")
}

fn deny(reason: &str) -> PolicyDecision {
    PolicyDecision::Denied {
        reason: reason.to_string(),
        matched_by: MatchSource::Whitelist,
    }
}
