//! `codex` engine adapter.
//!
//! Unlike `claude-code`, codex reads provider/auth configuration from
//! in-container files under `~/.codex/` rather than flags — exercising the
//! `get_config_files` extension point from spec §4.1.

use super::output::parse_stream_json;
use super::{ContainerSpec, EngineAdapter, ExecOptions, ParsedOutput, SessionInfo};
use crate::agent_config::AgentConfig;
use crate::error::{AdapterError, Result};
use std::collections::HashMap;

const REQUIRED_ENV: &[&str] = &["OPENAI_API_KEY"];

pub struct CodexAdapter;

impl CodexAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CodexAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineAdapter for CodexAdapter {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn display_name(&self) -> &'static str {
        "Codex"
    }

    fn image(&self) -> &'static str {
        "agentbox/codex:latest"
    }

    fn required_env(&self) -> &'static [&'static str] {
        REQUIRED_ENV
    }

    fn prepare_container(&self, session: &SessionInfo, agent_config: &AgentConfig) -> ContainerSpec {
        let mut labels = HashMap::new();
        labels.insert("managed".to_string(), "true".to_string());
        labels.insert("agent".to_string(), self.name().to_string());
        labels.insert("session.id".to_string(), session.session_id.to_string());

        ContainerSpec {
            image: self.image().to_string(),
            env: HashMap::new(),
            mounts: vec![(session.workspace_path.clone(), "/workspace".to_string())],
            labels,
            network_mode: session.network_mode.clone(),
            cpus: agent_config.resources.cpus,
            memory_mb: agent_config.resources.memory_mb,
        }
    }

    fn get_config_files(&self, agent_config: &AgentConfig, api_key: &str) -> HashMap<String, String> {
        let mut files = HashMap::new();

        let mut toml = String::new();
        toml.push_str(&format!("model = \"{}\"\n", agent_config.model_config.name));
        if let Some(base_url) = &agent_config.model_config.base_url {
            toml.push_str(&format!("base_url = \"{base_url}\"\n"));
        }
        if let Some(effort) = &agent_config.model_config.reasoning_effort {
            toml.push_str(&format!("model_reasoning_effort = \"{effort}\"\n"));
        }
        files.insert("~/.codex/config.toml".to_string(), toml);

        let auth = serde_json::json!({ "OPENAI_API_KEY": api_key }).to_string();
        files.insert("~/.codex/auth.json".to_string(), auth);

        files
    }

    fn prepare_exec(&self, exec: &ExecOptions, agent_config: &AgentConfig) -> Result<Vec<String>> {
        let mut argv = vec!["codex".to_string(), "exec".to_string()];
        argv.push("--json".to_string());

        if let Some(thread_id) = &exec.thread_id {
            argv.push("resume".to_string());
            argv.push(thread_id.clone());
        }

        let max_turns = exec.max_turns.unwrap_or(agent_config.resources.max_turns);
        argv.push("--config".to_string());
        argv.push(format!("max_turns={max_turns}"));

        if !agent_config.permission_config.allowed_tools.is_empty() {
            argv.push("--config".to_string());
            argv.push(format!(
                "allowed_tools={}",
                agent_config.permission_config.allowed_tools.join(",")
            ));
        }

        argv.push(exec.prompt.clone());
        Ok(argv)
    }

    fn parse_output(&self, raw_stdout: &str, include_events: bool) -> ParsedOutput {
        parse_stream_json(raw_stdout, include_events)
    }

    fn validate_config(&self, agent_config: &AgentConfig) -> Result<()> {
        if agent_config.permission_config.sandbox_mode == "full-access"
            && !agent_config.permission_config.skip_all
        {
            return Err(AdapterError::Parse(
                "codex sandbox_mode=full-access requires skip_all permission approval".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_config::{ModelConfig, PermissionConfig, PermissionMode, Resources};

    fn config() -> AgentConfig {
        AgentConfig {
            id: uuid::Uuid::new_v4(),
            name: "echo".to_string(),
            adapter: "codex".to_string(),
            model_config: ModelConfig {
                name: "o4-mini".to_string(),
                provider: "openai".to_string(),
                base_url: None,
                bearer_token: Some("sk-test".to_string()),
                reasoning_effort: Some("high".to_string()),
                tier_models: Default::default(),
                timeout_secs: 60,
                max_output_tokens: None,
            },
            permission_config: PermissionConfig {
                mode: PermissionMode::Full,
                sandbox_mode: "workspace-write".to_string(),
                allowed_tools: vec![],
                disallowed_tools: vec![],
                additional_dirs: vec![],
                skip_all: false,
                approval_policy: "never".to_string(),
            },
            resources: Resources {
                cpus: 1.0,
                memory_mb: 1024,
                max_turns: 10,
                max_budget_usd: None,
                max_tokens: None,
                wall_timeout_secs: 60,
            },
            system_prompt: None,
            mcp_servers: vec![],
            output_schema: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn resume_token_pairs_with_thread_id() {
        let adapter = CodexAdapter::new();
        let exec = ExecOptions {
            prompt: "continue".to_string(),
            thread_id: Some("t-1".to_string()),
            max_turns: None,
            allowed_tools: vec![],
            disallowed_tools: vec![],
            wall_timeout: std::time::Duration::from_secs(30),
        };
        let argv = adapter.prepare_exec(&exec, &config()).unwrap();
        let pos = argv.iter().position(|a| a == "resume").unwrap();
        assert_eq!(argv[pos + 1], "t-1");
    }

    #[test]
    fn config_files_embed_reasoning_effort() {
        let adapter = CodexAdapter::new();
        let files = adapter.get_config_files(&config(), "sk-test");
        let toml = files.get("~/.codex/config.toml").unwrap();
        assert!(toml.contains("model_reasoning_effort = \"high\""));
    }
}
