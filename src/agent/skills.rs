//! Slash-command skills dispatched by name.
//!
//! A session message starting with `/` is routed here instead of to the
//! agent. Handlers are registered at startup.

use crate::error::{GatewayError, GatewayResult};
use crate::types::Session;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What a skill sees when it runs.
#[derive(Debug, Clone)]
pub struct SkillContext {
    pub session: Session,
    /// Everything after the command name, trimmed.
    pub args: String,
    /// Registered commands with their descriptions.
    pub available: Vec<(String, String)>,
}

#[async_trait]
pub trait SkillHandler: Send + Sync {
    /// Command name without the leading slash.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn execute(&self, ctx: &SkillContext) -> Result<String>;
}

#[derive(Default, Clone)]
pub struct SkillRegistry {
    handlers: BTreeMap<String, Arc<dyn SkillHandler>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `/help` and `/session` commands.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(HelpSkill));
        registry.register(Arc::new(SessionSkill));
        registry
    }

    /// Register `handler`, replacing any handler with the same name.
    pub fn register(&mut self, handler: Arc<dyn SkillHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Split `/name args` into its parts. `None` for ordinary prompts.
    pub fn parse(prompt: &str) -> Option<(&str, &str)> {
        let rest = prompt.trim_start().strip_prefix('/')?;
        let (name, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        (!name.is_empty()).then(|| (name, args.trim()))
    }

    /// Run the command in `prompt` for `session`.
    pub async fn dispatch(&self, prompt: &str, session: &Session) -> GatewayResult<String> {
        let (name, args) = Self::parse(prompt)
            .ok_or_else(|| GatewayError::InvalidInput("not a command".into()))?;
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| GatewayError::InvalidInput(format!("unknown command '/{name}'")))?;

        let ctx = SkillContext {
            session: session.clone(),
            args: args.to_string(),
            available: self
                .handlers
                .values()
                .map(|h| (h.name().to_string(), h.description().to_string()))
                .collect(),
        };
        handler
            .execute(&ctx)
            .await
            .map_err(|err| GatewayError::Internal(format!("/{name}: {err:#}")))
    }
}

struct HelpSkill;

#[async_trait]
impl SkillHandler for HelpSkill {
    fn name(&self) -> &str {
        "help"
    }

    fn description(&self) -> &str {
        "List available commands"
    }

    async fn execute(&self, ctx: &SkillContext) -> Result<String> {
        Ok(ctx
            .available
            .iter()
            .map(|(name, description)| format!("/{name} - {description}"))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

struct SessionSkill;

#[async_trait]
impl SkillHandler for SessionSkill {
    fn name(&self) -> &str {
        "session"
    }

    fn description(&self) -> &str {
        "Show this session's usage"
    }

    async fn execute(&self, ctx: &SkillContext) -> Result<String> {
        let s = &ctx.session;
        Ok(format!(
            "session {}: {}/{} messages, started {}",
            s.id,
            s.message_count,
            s.max_messages,
            s.created_at.to_rfc3339()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn session() -> Session {
        let now = Utc::now();
        Session {
            id: "s1".into(),
            created_at: now,
            last_active_at: now,
            message_count: 2,
            max_messages: 10,
        }
    }

    #[test]
    fn parse_splits_name_and_args() {
        assert_eq!(SkillRegistry::parse("/help"), Some(("help", "")));
        assert_eq!(SkillRegistry::parse("  /echo  a b "), Some(("echo", "a b")));
        assert_eq!(SkillRegistry::parse("hello"), None);
        assert_eq!(SkillRegistry::parse("/"), None);
    }

    #[tokio::test]
    async fn builtins_dispatch() {
        let registry = SkillRegistry::with_builtins();
        let help = registry.dispatch("/help", &session()).await.unwrap();
        assert!(help.contains("/session - "));
        let usage = registry.dispatch("/session", &session()).await.unwrap();
        assert!(usage.contains("2/10 messages"));
    }

    #[tokio::test]
    async fn registered_handler_replaces_and_runs() {
        struct Echo;

        #[async_trait]
        impl SkillHandler for Echo {
            fn name(&self) -> &str {
                "echo"
            }
            fn description(&self) -> &str {
                "Repeat the arguments"
            }
            async fn execute(&self, ctx: &SkillContext) -> Result<String> {
                Ok(ctx.args.clone())
            }
        }

        let mut registry = SkillRegistry::new();
        registry.register(Arc::new(Echo));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["echo"]);
        assert_eq!(
            registry.dispatch("/echo hi there", &session()).await.unwrap(),
            "hi there"
        );
        assert!(matches!(
            registry.dispatch("/nope", &session()).await,
            Err(GatewayError::InvalidInput(_))
        ));
    }
}
