//! System worker: local file operations
//!
//! Every mutating action snapshots the target through the change tracker
//! first and reports the resulting `change_id`, so the user can roll the
//! operation back later. Dry runs describe what would happen and touch
//! nothing.

use super::{ActionDescriptor, ActionParam, ParamType, Worker, WorkerResult};
use crate::changes::{ChangeKind, ChangeTracker};
use crate::policy::RiskLevel;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::PathBuf;

pub struct SystemWorker {
    changes: ChangeTracker,
}

impl SystemWorker {
    pub fn new(changes: ChangeTracker) -> Self {
        Self { changes }
    }

    fn resolve(path: &str) -> PathBuf {
        let expanded = if let Some(rest) = path.strip_prefix("~/") {
            match std::env::var("HOME") {
                Ok(home) => format!("{home}/{rest}"),
                Err(_) => path.to_string(),
            }
        } else {
            path.to_string()
        };
        PathBuf::from(expanded)
    }

    async fn write_file(&self, path: &str, content: &str, dry_run: bool) -> Result<WorkerResult> {
        let target = Self::resolve(path);
        if dry_run {
            return Ok(simulated(format!(
                "[DRY-RUN] Would write {} bytes to {}",
                content.len(),
                target.display()
            )));
        }

        let change_id = self
            .changes
            .snapshot(&target, ChangeKind::FileWrite, &format!("write {path}"))
            .await?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        tokio::fs::write(&target, content).await?;
        Ok(WorkerResult::ok(format!("Wrote {} bytes to {}", content.len(), target.display()))
            .with_data(json!({"path": target.display().to_string(), "change_id": change_id})))
    }

    async fn append_to_file(&self, path: &str, content: &str, dry_run: bool) -> Result<WorkerResult> {
        let target = Self::resolve(path);
        if dry_run {
            return Ok(simulated(format!(
                "[DRY-RUN] Would append {} bytes to {}",
                content.len(),
                target.display()
            )));
        }

        let change_id = self
            .changes
            .snapshot(&target, ChangeKind::FileAppend, &format!("append to {path}"))
            .await?;
        let mut existing = if target.exists() {
            tokio::fs::read_to_string(&target).await?
        } else {
            String::new()
        };
        existing.push_str(content);
        tokio::fs::write(&target, existing).await?;
        Ok(WorkerResult::ok(format!(
            "Appended {} bytes to {}",
            content.len(),
            target.display()
        ))
        .with_data(json!({"path": target.display().to_string(), "change_id": change_id})))
    }

    async fn replace_in_file(
        &self,
        path: &str,
        search: &str,
        replace: &str,
        dry_run: bool,
    ) -> Result<WorkerResult> {
        let target = Self::resolve(path);
        if !target.exists() {
            return Ok(WorkerResult::failure(format!(
                "file does not exist: {}",
                target.display()
            )));
        }

        let content = tokio::fs::read_to_string(&target).await?;
        let occurrences = content.matches(search).count();
        if occurrences == 0 {
            return Ok(WorkerResult::failure(format!(
                "pattern not found in {}: {search}",
                target.display()
            )));
        }

        if dry_run {
            return Ok(simulated(format!(
                "[DRY-RUN] Would replace {occurrences} occurrence(s) in {}",
                target.display()
            )));
        }

        let change_id = self
            .changes
            .snapshot(&target, ChangeKind::FileReplace, &format!("edit {path}"))
            .await?;
        tokio::fs::write(&target, content.replace(search, replace)).await?;
        Ok(WorkerResult::ok(format!(
            "Replaced {occurrences} occurrence(s) in {}",
            target.display()
        ))
        .with_data(json!({"path": target.display().to_string(), "change_id": change_id})))
    }

    async fn delete_files(&self, paths: &[String], dry_run: bool) -> Result<WorkerResult> {
        if dry_run {
            return Ok(simulated(format!(
                "[DRY-RUN] Would delete {} file(s): {}",
                paths.len(),
                paths.join(", ")
            )));
        }

        let mut change_ids = Vec::new();
        let mut deleted = 0usize;
        for path in paths {
            let target = Self::resolve(path);
            if !target.exists() {
                continue;
            }
            let change_id = self
                .changes
                .snapshot(&target, ChangeKind::FileDelete, &format!("delete {path}"))
                .await?;
            tokio::fs::remove_file(&target).await?;
            change_ids.push(change_id);
            deleted += 1;
        }

        Ok(
            WorkerResult::ok(format!("Deleted {deleted} of {} file(s)", paths.len()))
                .with_data(json!({"change_ids": change_ids})),
        )
    }

    async fn list_files(&self, path: &str) -> Result<WorkerResult> {
        let target = Self::resolve(path);
        let mut entries = match tokio::fs::read_dir(&target).await {
            Ok(entries) => entries,
            Err(err) => {
                return Ok(WorkerResult::failure(format!(
                    "cannot list {}: {err}",
                    target.display()
                )));
            }
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let suffix = if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                "/"
            } else {
                ""
            };
            names.push(format!("{}{suffix}", entry.file_name().to_string_lossy()));
        }
        names.sort();

        Ok(WorkerResult {
            success: true,
            message: format!("{} entries in {}", names.len(), target.display()),
            raw_output: Some(names.join("\n")),
            data: Some(json!({"path": target.display().to_string(), "count": names.len()})),
            ..Default::default()
        })
    }
}

fn simulated(message: String) -> WorkerResult {
    WorkerResult {
        success: true,
        message,
        simulated: true,
        ..Default::default()
    }
}

fn string_arg<'a>(args: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    args.get(name).and_then(Value::as_str)
}

#[async_trait]
impl Worker for SystemWorker {
    fn name(&self) -> &str {
        "system"
    }

    fn description(&self) -> &str {
        "Local file operations with automatic backup: every mutation records a change_id \
         that can be rolled back."
    }

    fn actions(&self) -> Vec<ActionDescriptor> {
        vec![
            ActionDescriptor::new("list_files", "List the entries of a directory").with_params(
                vec![ActionParam::required(
                    "path",
                    ParamType::String,
                    "Directory to list",
                )],
            ),
            ActionDescriptor::new("write_file", "Create or overwrite a file with given content")
                .with_params(vec![
                    ActionParam::required("path", ParamType::String, "Target file path"),
                    ActionParam::required("content", ParamType::String, "Full file content"),
                ])
                .risk_hint(RiskLevel::Medium)
                .dry_runnable(),
            ActionDescriptor::new("append_to_file", "Append content to a file")
                .with_params(vec![
                    ActionParam::required("path", ParamType::String, "Target file path"),
                    ActionParam::required("content", ParamType::String, "Content to append"),
                ])
                .risk_hint(RiskLevel::Medium)
                .dry_runnable(),
            ActionDescriptor::new(
                "replace_in_file",
                "Replace every occurrence of a string in a file",
            )
            .with_params(vec![
                ActionParam::required("path", ParamType::String, "Target file path"),
                ActionParam::required("search", ParamType::String, "Exact text to find"),
                ActionParam::required("replace", ParamType::String, "Replacement text"),
            ])
            .risk_hint(RiskLevel::Medium)
            .dry_runnable(),
            ActionDescriptor::new("delete_files", "Delete files (backed up first)")
                .with_params(vec![ActionParam::required(
                    "paths",
                    ParamType::Array,
                    "File paths to delete",
                )])
                .risk_hint(RiskLevel::High)
                .dry_runnable(),
        ]
    }

    async fn execute(
        &self,
        action: &str,
        args: &Map<String, Value>,
        dry_run: bool,
    ) -> Result<WorkerResult> {
        match action {
            "list_files" => {
                let path = string_arg(args, "path").unwrap_or(".");
                self.list_files(path).await
            }
            "write_file" => {
                let (Some(path), Some(content)) =
                    (string_arg(args, "path"), string_arg(args, "content"))
                else {
                    return Ok(WorkerResult::failure("path and content are required"));
                };
                self.write_file(path, content, dry_run).await
            }
            "append_to_file" => {
                let (Some(path), Some(content)) =
                    (string_arg(args, "path"), string_arg(args, "content"))
                else {
                    return Ok(WorkerResult::failure("path and content are required"));
                };
                self.append_to_file(path, content, dry_run).await
            }
            "replace_in_file" => {
                let (Some(path), Some(search), Some(replace)) = (
                    string_arg(args, "path"),
                    string_arg(args, "search"),
                    string_arg(args, "replace"),
                ) else {
                    return Ok(WorkerResult::failure("path, search and replace are required"));
                };
                self.replace_in_file(path, search, replace, dry_run).await
            }
            "delete_files" => {
                let paths: Vec<String> = args
                    .get("paths")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                if paths.is_empty() {
                    return Ok(WorkerResult::failure("paths must be a non-empty array"));
                }
                self.delete_files(&paths, dry_run).await
            }
            other => Ok(WorkerResult::failure(format!("unknown action: {other}"))),
        }
    }
}

impl SystemWorker {
    /// Direct access for the rollback CLI path.
    pub fn change_tracker(&self) -> &ChangeTracker {
        &self.changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use uuid::Uuid;

    fn worker_in(dir: &Path) -> SystemWorker {
        SystemWorker::new(ChangeTracker::new(dir.join("changes")))
    }

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("opspilot-system-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn write_file_reports_change_id() {
        let dir = temp_dir();
        let worker = worker_in(&dir);
        let path = dir.join("app.env");

        let result = worker
            .execute(
                "write_file",
                &obj(json!({"path": path.to_str().unwrap(), "content": "PORT=8080\n"})),
                false,
            )
            .await
            .unwrap();

        assert!(result.success);
        let change_id = result.data.unwrap()["change_id"].as_str().unwrap().to_string();
        assert!(!change_id.is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "PORT=8080\n");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let dir = temp_dir();
        let worker = worker_in(&dir);
        let path = dir.join("untouched.txt");

        let result = worker
            .execute(
                "write_file",
                &obj(json!({"path": path.to_str().unwrap(), "content": "x"})),
                true,
            )
            .await
            .unwrap();

        assert!(result.simulated);
        assert!(result.message.starts_with("[DRY-RUN]"));
        assert!(!path.exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn replace_requires_a_match() {
        let dir = temp_dir();
        let worker = worker_in(&dir);
        let path = dir.join("conf.txt");
        std::fs::write(&path, "listen 80;").unwrap();

        let missing = worker
            .execute(
                "replace_in_file",
                &obj(json!({"path": path.to_str().unwrap(), "search": "9090", "replace": "1"})),
                false,
            )
            .await
            .unwrap();
        assert!(!missing.success);

        let hit = worker
            .execute(
                "replace_in_file",
                &obj(json!({"path": path.to_str().unwrap(), "search": "80", "replace": "8080"})),
                false,
            )
            .await
            .unwrap();
        assert!(hit.success);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "listen 8080;");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn delete_backs_up_then_removes() {
        let dir = temp_dir();
        let worker = worker_in(&dir);
        let path = dir.join("old.log");
        std::fs::write(&path, "history").unwrap();

        let result = worker
            .execute(
                "delete_files",
                &obj(json!({"paths": [path.to_str().unwrap()]})),
                false,
            )
            .await
            .unwrap();

        assert!(result.success);
        assert!(!path.exists());

        let change_ids = result.data.unwrap()["change_ids"].clone();
        let change_id = change_ids[0].as_str().unwrap();
        worker.change_tracker().rollback(change_id).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "history");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn list_files_reports_entries() {
        let dir = temp_dir();
        let worker = worker_in(&dir);
        std::fs::write(dir.join("a.txt"), "x").unwrap();
        std::fs::create_dir(dir.join("sub")).unwrap();

        let result = worker
            .execute("list_files", &obj(json!({"path": dir.to_str().unwrap()})), false)
            .await
            .unwrap();
        assert!(result.success);
        let listing = result.raw_output.unwrap();
        assert!(listing.contains("a.txt"));
        assert!(listing.contains("sub/"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
