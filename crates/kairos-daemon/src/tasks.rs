//! Built-in handlers, registered under the `demo` module.

use std::time::Duration;

use async_trait::async_trait;
use kairos_scheduler::{HandlerRegistry, TaskContext, TaskHandler};
use serde::Deserialize;
use tracing::info;

/// Returns its message unchanged. Handy for checking that a schedule fires.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Echo {
    #[serde(default = "default_message")]
    message: String,
}

fn default_message() -> String {
    "pong".to_string()
}

#[async_trait]
impl TaskHandler for Echo {
    async fn main(&self, ctx: &TaskContext) -> anyhow::Result<String> {
        info!(job_id = %ctx.job_id, message = %self.message, "echo");
        Ok(self.message.clone())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Greeter {
    name: String,
    #[serde(default)]
    age: Option<u32>,
}

#[async_trait]
impl TaskHandler for Greeter {
    async fn main(&self, ctx: &TaskContext) -> anyhow::Result<String> {
        // simulate a little work so process_time is visible in the records
        tokio::time::sleep(Duration::from_millis(250)).await;
        let greeting = match self.age {
            Some(age) => format!("hello {}, {age} years young", self.name),
            None => format!("hello {}", self.name),
        };
        info!(job_id = %ctx.job_id, scheduled_at = %ctx.scheduled_at, "{greeting}");
        Ok(greeting)
    }
}

pub fn register_builtin(registry: &HandlerRegistry) {
    registry.register::<Echo>("demo.Echo");
    registry.register::<Greeter>("demo.Greeter");
}
