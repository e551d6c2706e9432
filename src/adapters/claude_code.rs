//! `claude-code` engine adapter.

use super::output::parse_stream_json;
use super::{ContainerSpec, EngineAdapter, ExecOptions, ParsedOutput, SessionInfo};
use crate::agent_config::{AgentConfig, PermissionMode};
use crate::error::{AdapterError, Result};
use std::collections::HashMap;

const REQUIRED_ENV: &[&str] = &["ANTHROPIC_API_KEY"];

pub struct ClaudeCodeAdapter;

impl ClaudeCodeAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ClaudeCodeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineAdapter for ClaudeCodeAdapter {
    fn name(&self) -> &'static str {
        "claude-code"
    }

    fn display_name(&self) -> &'static str {
        "Claude Code"
    }

    fn image(&self) -> &'static str {
        "agentbox/claude-code:latest"
    }

    fn required_env(&self) -> &'static [&'static str] {
        REQUIRED_ENV
    }

    fn prepare_container(&self, session: &SessionInfo, agent_config: &AgentConfig) -> ContainerSpec {
        let mut env = HashMap::new();
        if let Some(token) = &agent_config.model_config.bearer_token {
            env.insert("ANTHROPIC_API_KEY".to_string(), token.clone());
        }
        if let Some(base_url) = &agent_config.model_config.base_url {
            env.insert("ANTHROPIC_BASE_URL".to_string(), base_url.clone());
        }

        let mut labels = HashMap::new();
        labels.insert("managed".to_string(), "true".to_string());
        labels.insert("agent".to_string(), self.name().to_string());
        labels.insert("session.id".to_string(), session.session_id.to_string());

        ContainerSpec {
            image: self.image().to_string(),
            env,
            mounts: vec![(session.workspace_path.clone(), "/workspace".to_string())],
            labels,
            network_mode: session.network_mode.clone(),
            cpus: agent_config.resources.cpus,
            memory_mb: agent_config.resources.memory_mb,
        }
    }

    fn prepare_exec(&self, exec: &ExecOptions, agent_config: &AgentConfig) -> Result<Vec<String>> {
        let mut argv = vec!["claude".to_string()];

        match &exec.thread_id {
            None => {
                argv.push("--output-format".to_string());
                argv.push("stream-json".to_string());
                if let Some(prompt) = &agent_config.system_prompt {
                    argv.push("--system-prompt".to_string());
                    argv.push(prompt.clone());
                }
                for tool in &agent_config.permission_config.allowed_tools {
                    argv.push("--allowedTools".to_string());
                    argv.push(tool.clone());
                }
                for tool in &agent_config.permission_config.disallowed_tools {
                    argv.push("--disallowedTools".to_string());
                    argv.push(tool.clone());
                }
                if agent_config.permission_config.skip_all {
                    argv.push("--dangerously-skip-permissions".to_string());
                }
            }
            Some(thread_id) => {
                argv.push("--resume".to_string());
                argv.push(thread_id.clone());
                argv.push("--output-format".to_string());
                argv.push("stream-json".to_string());
            }
        }

        // Request-level max-turns replaces the agent-config default rather
        // than being appended alongside it (spec §4.1).
        let max_turns = exec.max_turns.unwrap_or(agent_config.resources.max_turns);
        argv.push("--max-turns".to_string());
        argv.push(max_turns.to_string());

        argv.push("--print".to_string());
        argv.push(exec.prompt.clone());

        Ok(argv)
    }

    fn parse_output(&self, raw_stdout: &str, include_events: bool) -> ParsedOutput {
        parse_stream_json(raw_stdout, include_events)
    }

    fn validate_config(&self, agent_config: &AgentConfig) -> Result<()> {
        if agent_config.permission_config.mode == PermissionMode::ReadOnly
            && agent_config.permission_config.skip_all
        {
            return Err(AdapterError::Parse(
                "read-only permission mode cannot be combined with skip_all".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_config::{ModelConfig, PermissionConfig, Resources};

    fn config() -> AgentConfig {
        AgentConfig {
            id: uuid::Uuid::new_v4(),
            name: "echo".to_string(),
            adapter: "claude-code".to_string(),
            model_config: ModelConfig {
                name: "claude-sonnet".to_string(),
                provider: "anthropic".to_string(),
                base_url: None,
                bearer_token: Some("sk-ant-test".to_string()),
                reasoning_effort: None,
                tier_models: Default::default(),
                timeout_secs: 60,
                max_output_tokens: None,
            },
            permission_config: PermissionConfig {
                mode: PermissionMode::Full,
                sandbox_mode: "workspace-write".to_string(),
                allowed_tools: vec!["Bash".to_string()],
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
    fn first_turn_uses_full_flag_set() {
        let adapter = ClaudeCodeAdapter::new();
        let exec = ExecOptions {
            prompt: "say hi".to_string(),
            thread_id: None,
            max_turns: None,
            allowed_tools: vec![],
            disallowed_tools: vec![],
            wall_timeout: std::time::Duration::from_secs(30),
        };
        let argv = adapter.prepare_exec(&exec, &config()).unwrap();
        assert!(argv.contains(&"--allowedTools".to_string()));
        assert!(!argv.contains(&"--resume".to_string()));
    }

    #[test]
    fn resume_turn_uses_thread_id() {
        let adapter = ClaudeCodeAdapter::new();
        let exec = ExecOptions {
            prompt: "continue".to_string(),
            thread_id: Some("t-1".to_string()),
            max_turns: None,
            allowed_tools: vec![],
            disallowed_tools: vec![],
            wall_timeout: std::time::Duration::from_secs(30),
        };
        let argv = adapter.prepare_exec(&exec, &config()).unwrap();
        let resume_pos = argv.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(argv[resume_pos + 1], "t-1");
    }

    #[test]
    fn request_level_max_turns_replaces_default() {
        let adapter = ClaudeCodeAdapter::new();
        let exec = ExecOptions {
            prompt: "hi".to_string(),
            thread_id: None,
            max_turns: Some(3),
            allowed_tools: vec![],
            disallowed_tools: vec![],
            wall_timeout: std::time::Duration::from_secs(30),
        };
        let argv = adapter.prepare_exec(&exec, &config()).unwrap();
        let pos = argv.iter().position(|a| a == "--max-turns").unwrap();
        assert_eq!(argv[pos + 1], "3");
    }
}
