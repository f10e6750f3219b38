//! Operation audit trail
//!
//! Every executed instruction is appended to a plain-text log, one line per
//! operation, so the history stays greppable without tooling. Dry-run
//! actions are never recorded. Appends are serialized through one lock.
//!
//! Line format:
//! `[<ISO-8601>] INPUT: <user> | WORKER: <w.a> | RISK: <level> | CONFIRMED: <yes/no/auto> | EXIT: <code> | OUTPUT: <first-100-chars>`

use crate::policy::RiskLevel;
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub user_input: String,
    pub worker: String,
    pub action: String,
    pub risk: RiskLevel,
    /// "yes" for human-approved, "no" for rejected, "auto" otherwise.
    pub confirmed: &'static str,
    pub exit_code: i32,
    pub output: String,
}

/// Append-only audit log.
pub struct AuditLog {
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            append_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub async fn record(&self, record: AuditRecord) -> Result<()> {
        let timestamp = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let output: String = record.output.chars().take(100).collect();
        // Keep the line a single line.
        let output = output.replace('\n', " ");
        let line = format!(
            "[{timestamp}] INPUT: {} | WORKER: {}.{} | RISK: {} | CONFIRMED: {} | EXIT: {} | OUTPUT: {}\n",
            record.user_input.replace('\n', " "),
            record.worker,
            record.action,
            record.risk,
            record.confirmed,
            record.exit_code,
            output,
        );

        let _guard = self.append_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open audit log {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;

        tracing::info!(
            worker = %record.worker,
            action = %record.action,
            risk = %record.risk,
            exit = record.exit_code,
            "audit"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_formatted_lines() {
        let dir = std::env::temp_dir().join(format!("opspilot-audit-{}", uuid::Uuid::new_v4()));
        let log = AuditLog::new(dir.join("audit.log"));

        log.record(AuditRecord {
            user_input: "restart nginx".to_string(),
            worker: "shell".to_string(),
            action: "execute_command".to_string(),
            risk: RiskLevel::Medium,
            confirmed: "yes",
            exit_code: 0,
            output: "restarted".to_string(),
        })
        .await
        .unwrap();

        let content = tokio::fs::read_to_string(log.path()).await.unwrap();
        assert!(content.contains("INPUT: restart nginx"));
        assert!(content.contains("WORKER: shell.execute_command"));
        assert!(content.contains("RISK: medium"));
        assert!(content.contains("CONFIRMED: yes"));
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn output_truncated_to_100_chars() {
        let dir = std::env::temp_dir().join(format!("opspilot-audit-{}", uuid::Uuid::new_v4()));
        let log = AuditLog::new(dir.join("audit.log"));

        log.record(AuditRecord {
            user_input: "x".to_string(),
            worker: "shell".to_string(),
            action: "execute_command".to_string(),
            risk: RiskLevel::Safe,
            confirmed: "auto",
            exit_code: 0,
            output: "a".repeat(500),
        })
        .await
        .unwrap();

        let content = tokio::fs::read_to_string(log.path()).await.unwrap();
        let line = content.lines().next().unwrap();
        let output_part = line.split("OUTPUT: ").nth(1).unwrap();
        assert_eq!(output_part.len(), 100);
        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
