//! Request preprocessor
//!
//! Deterministic pass that runs before every LLM call: classify the user's
//! intent, pull out entities the model must not lose (repo URLs, port
//! numbers), and resolve "this"/"that" references against recent results.
//! No I/O; the same input and history always produce the same output.

use crate::engine::state::ConversationEntry;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Chat,
    Greeting,
    Identity,
    List,
    Explain,
    Execute,
    Deploy,
    Monitor,
    Unknown,
}

#[derive(Debug, Clone, Default)]
pub struct Entities {
    pub repo_url: Option<String>,
    /// Literal port tokens mentioned by the user, deduplicated, in order.
    pub ports: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PreprocessResult {
    pub intent: Intent,
    pub entities: Entities,
    /// Input rewritten with a concrete identifier when a reference like
    /// "this container" could be resolved from history.
    pub resolved_input: Option<String>,
}

pub struct Preprocessor {
    repo_url: Regex,
    port_patterns: Vec<Regex>,
    reference: Regex,
    deploy_verbs: Regex,
    greeting: Regex,
    identity: Regex,
    explain: Regex,
    list: Regex,
    monitor: Regex,
    execute: Regex,
    docker_name: Regex,
    port_in_output: Regex,
}

impl Preprocessor {
    pub fn new() -> Self {
        Self {
            repo_url: Regex::new(r"https?://(?:github|gitlab)\.com/[\w\-.]+/[\w\-.]+").unwrap(),
            port_patterns: vec![
                Regex::new(r"(?i)(\d{1,5})\s*(?:端口|port)").unwrap(),
                Regex::new(r"(?i)(?:端口|port)\s*(\d{1,5})").unwrap(),
                Regex::new(r":\s*(\d{1,5})").unwrap(),
                Regex::new(r"(?i)(?:在|on)\s*(\d{1,5})").unwrap(),
            ],
            reference: Regex::new(r"这个|那个|它|\bthis\b|\bthat\b|\bit\b").unwrap(),
            deploy_verbs: Regex::new(r"(?i)部署|deploy|安装|install|启动|运行|跑起来|run\s|start")
                .unwrap(),
            greeting: Regex::new(r"(?i)^你好|^hi$|^hello|^hey|^嗨").unwrap(),
            identity: Regex::new(r"你是谁|你是什么|你叫什么|who are you").unwrap(),
            explain: Regex::new(r"(?i)是干嘛的|有什么用|是什么|什么意思|解释|分析|explain|what is|what's")
                .unwrap(),
            list: Regex::new(r"(?i)列出|有哪些|显示|查看|list|show").unwrap(),
            monitor: Regex::new(r"(?i)系统状态|系统健康|系统资源|系统负载|system\s*status|system\s*health|资源使用")
                .unwrap(),
            execute: Regex::new(r"(?i)重启|停止|启动|restart|stop\b|kill\b").unwrap(),
            docker_name: Regex::new(r"[\w.-]+$").unwrap(),
            port_in_output: Regex::new(r":(\d{2,5})\b").unwrap(),
        }
    }

    pub fn preprocess(&self, user_input: &str, history: &[ConversationEntry]) -> PreprocessResult {
        let intent = self.detect_intent(user_input);
        let entities = Entities {
            repo_url: self
                .repo_url
                .find(user_input)
                .map(|m| m.as_str().to_string()),
            ports: self.extract_ports(user_input),
        };
        let resolved_input = self.resolve_reference(user_input, history);

        PreprocessResult {
            intent,
            entities,
            resolved_input,
        }
    }

    pub fn extract_ports(&self, text: &str) -> Vec<String> {
        let mut ports = Vec::new();
        for pattern in &self.port_patterns {
            for caps in pattern.captures_iter(text) {
                if let Some(m) = caps.get(1) {
                    let port = m.as_str().to_string();
                    if !ports.contains(&port) {
                        ports.push(port);
                    }
                }
            }
        }
        ports
    }

    fn detect_intent(&self, text: &str) -> Intent {
        // Deploy needs both a repo URL and a deploy verb.
        if self.repo_url.is_match(text) && self.deploy_verbs.is_match(text) {
            return Intent::Deploy;
        }
        if self.identity.is_match(text) {
            return Intent::Identity;
        }
        if self.monitor.is_match(text) {
            return Intent::Monitor;
        }
        if self.explain.is_match(text) {
            return Intent::Explain;
        }
        if self.greeting.is_match(text) {
            return Intent::Greeting;
        }
        if self.execute.is_match(text) {
            return Intent::Execute;
        }
        if self.list.is_match(text) {
            return Intent::List;
        }
        Intent::Unknown
    }

    /// When the user points at "this"/"that", look for a unique identifier
    /// in the most recent results and rewrite the input with it spelled out.
    fn resolve_reference(
        &self,
        user_input: &str,
        history: &[ConversationEntry],
    ) -> Option<String> {
        if !self.reference.is_match(user_input) {
            return None;
        }

        for entry in history.iter().rev() {
            let Some(raw) = entry.result.raw_output.as_deref() else {
                continue;
            };
            if let Some(name) = self.single_docker_container(raw) {
                return Some(format!("{user_input} (referring to: {name})"));
            }
            if let Some(port) = self
                .port_in_output
                .captures(raw)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str())
            {
                return Some(format!("{user_input} (referring to port {port})"));
            }
        }
        None
    }

    /// Parse `docker ps` table output; a single data row yields its NAMES
    /// column. Multiple rows are ambiguous and resolve to nothing.
    fn single_docker_container(&self, output: &str) -> Option<String> {
        let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.len() != 2 || !lines[0].contains("CONTAINER") {
            return None;
        }
        let name = self.docker_name.find(lines[1].trim())?;
        Some(name.as_str().to_string())
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new()
    }
}
