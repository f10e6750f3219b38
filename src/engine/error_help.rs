//! Error helper
//!
//! Maps well-known failure messages to an actionable suggestion block that
//! gets appended to the final user-visible message when the loop gives up
//! on a failing operation.

use regex::Regex;

/// Suggestion block for a failed result message, if the failure is one we
/// recognize.
pub fn suggest_fix(message: &str) -> Option<String> {
    let lower = message.to_lowercase();

    if lower.contains("command not found") {
        let command = extract_command(&lower).unwrap_or_else(|| "<command>".to_string());
        return Some(format!(
            "Suggestions:\n\
             - install it: apt install {command} / yum install {command} / brew install {command}\n\
             - check whether it is on PATH: which {command}"
        ));
    }

    if lower.contains("no such container")
        || (lower.contains("not found") && lower.contains("container"))
    {
        return Some(
            "Suggestions:\n\
             - list all containers, including stopped ones: docker ps -a\n\
             - the name may differ; check for typos"
                .to_string(),
        );
    }

    if lower.contains("permission denied") || lower.contains("operation not permitted") {
        return Some(
            "Suggestions:\n\
             - check ownership and permissions: ls -la <path>\n\
             - retry with sudo if root is required\n\
             - for docker, make sure your user is in the docker group"
                .to_string(),
        );
    }

    if lower.contains("address already in use")
        || (lower.contains("bind") && lower.contains("port"))
    {
        let port = extract_port(&lower).unwrap_or_else(|| "<port>".to_string());
        return Some(format!(
            "Suggestions:\n\
             - find the process holding port {port}: lsof -i :{port}\n\
             - stop that process, or configure a different port"
        ));
    }

    if lower.contains("cannot connect to the docker daemon") {
        return Some(
            "Suggestions:\n\
             - start the daemon: sudo systemctl start docker\n\
             - on macOS/Windows, launch Docker Desktop"
                .to_string(),
        );
    }

    if lower.contains("no space left") || lower.contains("disk quota exceeded") {
        return Some(
            "Suggestions:\n\
             - inspect disk usage: df -h\n\
             - find large files: du -sh /* 2>/dev/null | sort -rh | head\n\
             - reclaim docker space: docker system prune"
                .to_string(),
        );
    }

    if lower.contains("connection refused")
        || lower.contains("connection timed out")
        || lower.contains("network unreachable")
        || lower.contains("no route to host")
    {
        return Some(
            "Suggestions:\n\
             - check basic connectivity: ping 8.8.8.8\n\
             - check DNS resolution: nslookup <host>\n\
             - check firewall and proxy settings"
                .to_string(),
        );
    }

    if lower.contains("no such file") || lower.contains("does not exist") {
        return Some(
            "Suggestions:\n\
             - verify the path (watch out for case)\n\
             - list the directory to see what is actually there"
                .to_string(),
        );
    }

    None
}

fn extract_command(message: &str) -> Option<String> {
    let patterns = [
        Regex::new(r"command not found:\s*([\w\-]+)").ok()?,
        Regex::new(r"([\w\-]+):\s*command not found").ok()?,
    ];
    for pattern in &patterns {
        if let Some(caps) = pattern.captures(message) {
            return Some(caps.get(1)?.as_str().to_string());
        }
    }
    None
}

fn extract_port(message: &str) -> Option<String> {
    let pattern = Regex::new(r"(?::|port\s*)(\d{2,5})").ok()?;
    Some(pattern.captures(message)?.get(1)?.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_in_use_names_the_port() {
        let suggestion = suggest_fix("address already in use: 8080").unwrap();
        assert!(suggestion.contains("lsof -i :8080"));
    }

    #[test]
    fn permission_denied_mentions_sudo() {
        let suggestion = suggest_fix("bash: /var/log/secure: Permission denied").unwrap();
        assert!(suggestion.contains("sudo"));
    }

    #[test]
    fn docker_daemon_down() {
        let suggestion =
            suggest_fix("Cannot connect to the Docker daemon at unix:///var/run/docker.sock")
                .unwrap();
        assert!(suggestion.contains("systemctl start docker"));
    }

    #[test]
    fn command_not_found_extracts_name() {
        let suggestion = suggest_fix("zsh: command not found: htop").unwrap();
        assert!(suggestion.contains("install htop"));
    }

    #[test]
    fn unknown_failures_get_no_suggestion() {
        assert!(suggest_fix("segmentation fault (core dumped)").is_none());
    }
}
