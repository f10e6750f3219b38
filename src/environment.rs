//! Host environment snapshot
//!
//! Collected once at startup; the prompt builder injects it into every
//! system prompt so the model picks OS-appropriate commands.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentContext {
    pub os_type: String,
    pub os_version: String,
    pub shell: String,
    pub cwd: String,
    pub user: String,
    pub docker_available: bool,
}

impl EnvironmentContext {
    /// Probe the current host. The docker probe is capped at two seconds so
    /// a wedged daemon cannot stall startup.
    pub async fn detect() -> Self {
        Self {
            os_type: std::env::consts::OS.to_string(),
            os_version: os_version(),
            shell: std::env::var("SHELL").unwrap_or_else(|_| "unknown".to_string()),
            cwd: std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            user: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
            docker_available: probe_docker().await,
        }
    }

    pub fn is_macos(&self) -> bool {
        self.os_type.eq_ignore_ascii_case("macos") || self.os_type.eq_ignore_ascii_case("darwin")
    }

    pub fn to_prompt_context(&self) -> String {
        let docker = if self.docker_available {
            "available"
        } else {
            "not available"
        };
        format!(
            "Current environment:\n\
             - OS: {} {}\n\
             - Shell: {}\n\
             - Working directory: {}\n\
             - Docker: {}\n\
             - User: {}",
            self.os_type, self.os_version, self.shell, self.cwd, docker, self.user
        )
    }
}

fn os_version() -> String {
    std::env::var("OSTYPE").unwrap_or_else(|_| "unknown".to_string())
}

async fn probe_docker() -> bool {
    let probe = tokio::process::Command::new("docker")
        .arg("info")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
    matches!(
        tokio::time::timeout(Duration::from_secs(2), probe).await,
        Ok(Ok(status)) if status.success()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed() -> EnvironmentContext {
        EnvironmentContext {
            os_type: "linux".to_string(),
            os_version: "6.1".to_string(),
            shell: "/bin/bash".to_string(),
            cwd: "/srv/app".to_string(),
            user: "ops".to_string(),
            docker_available: true,
        }
    }

    #[test]
    fn prompt_context_mentions_all_fields() {
        let text = fixed().to_prompt_context();
        assert!(text.contains("linux"));
        assert!(text.contains("/srv/app"));
        assert!(text.contains("Docker: available"));
    }

    #[test]
    fn macos_detection() {
        let mut env = fixed();
        assert!(!env.is_macos());
        env.os_type = "macos".to_string();
        assert!(env.is_macos());
    }
}
