use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use task_queue::config::{self, BrokerConfig};
use task_queue::rabbitmq::{ConnectionManager, TaskDispatcher, TaskError};
use task_queue::{TaskMessage, DEFAULT_QUEUE};

const USAGE: &str = "usage: task_queue [consume [QUEUE] | submit TASK PARAMS_JSON [QUEUE] | declare QUEUE | init-config [PATH]]";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("consume");

    match command {
        "init-config" => {
            let path = args
                .get(1)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("TaskQueue.json"));
            config::write_default_config(&path)
        }
        "consume" => {
            let queue = args.get(1).map(String::as_str).unwrap_or(DEFAULT_QUEUE);
            let manager = Arc::new(build_manager()?);
            run_worker(manager, queue).await
        }
        "submit" => {
            let task = args.get(1).ok_or_else(|| anyhow!(USAGE))?;
            let params: serde_json::Value = match args.get(2) {
                Some(raw) => serde_json::from_str(raw).context("PARAMS_JSON is not valid JSON")?,
                None => serde_json::Value::Null,
            };
            let queue = args.get(3).map(String::as_str).unwrap_or(DEFAULT_QUEUE);

            let manager = build_manager()?;
            manager
                .submit_task(task, &params, queue)
                .await
                .with_context(|| format!("Failed to submit task `{}`", task))?;
            info!(task = %task, queue, "Task submitted");
            Ok(())
        }
        "declare" => {
            let queue = args.get(1).ok_or_else(|| anyhow!(USAGE))?;
            let manager = build_manager()?;
            let declared = manager.declare_queue(queue).await?;
            info!(
                queue = %declared.name,
                messages = declared.message_count,
                consumers = declared.consumer_count,
                "Queue ready"
            );
            Ok(())
        }
        other => bail!("unknown command `{}`\n{}", other, USAGE),
    }
}

/// Config file if one is found, otherwise the `RABBITMQ_*` environment.
fn load_broker_config() -> Result<BrokerConfig> {
    match config::find_config_file() {
        Ok(path) => {
            info!("Loading configuration from {}", path.display());
            config::load_config(&path)
        }
        Err(e) => {
            warn!("{}; falling back to environment variables", e);
            BrokerConfig::from_env().context("Invalid RabbitMQ environment configuration")
        }
    }
}

fn build_manager() -> Result<ConnectionManager> {
    let config = load_broker_config()?;
    info!(address = %config.address(), vhost = %config.vhost, "Using RabbitMQ broker");
    Ok(ConnectionManager::amqp(config)?)
}

async fn run_worker(manager: Arc<ConnectionManager>, queue: &str) -> Result<()> {
    let dispatcher = TaskDispatcher::new(|message: TaskMessage| async move {
        info!(task = %message.task, params = %message.params, "Received task");
        Ok::<(), TaskError>(())
    });

    info!(queue, "Worker running. Press Ctrl+C to exit.");
    let summary = manager.consume_until_ctrl_c(queue, &dispatcher).await?;
    summary.log();
    Ok(())
}
