//! Agent invocation and the slash-command skill registry.
//!
//! The gateway does not talk to model providers itself. It hands a prompt
//! to an [`AgentInvoker`] and relays the text reply.

pub mod command;
pub mod skills;

pub use command::CommandInvoker;
pub use skills::{SkillContext, SkillHandler, SkillRegistry};

use crate::config::AgentSection;
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Send a prompt, get a text reply.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, prompt: &str) -> Result<String>;
}

/// Build the configured invoker, if `agent.command` is set.
pub fn invoker_from_config(
    section: &AgentSection,
    workspace_dir: &Path,
) -> Option<Arc<dyn AgentInvoker>> {
    let (program, args) = section.command.split_first()?;
    Some(Arc::new(CommandInvoker::new(
        program,
        args,
        workspace_dir,
        Duration::from_secs(section.timeout_secs),
    )))
}
