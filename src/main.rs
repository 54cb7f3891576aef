use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use taskq::cli::{Cli, Command};
use taskq::config::ClientConfig;
use taskq::ui::RequestProgress;
use taskq::{Error, StageType, TaskConsumer, TaskId, logging};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.json_logs);

    let mut config = match &cli.config {
        Some(path) => ClientConfig::load_from(path)?,
        None => ClientConfig::load()?,
    };
    if let Some(url) = cli.base_url {
        config.base_url = Some(url);
    }
    if let Some(max_retries) = cli.max_retries {
        config.retry.max_retries = max_retries;
    }

    let consumer = match TaskConsumer::from_config(&config) {
        Ok(consumer) => consumer,
        Err(err) => {
            eprintln!("[{}] {err}", err.kind());
            return Ok(ExitCode::FAILURE);
        }
    };

    // Ctrl-C cancels whatever request is pending, including retry waits.
    let token = consumer.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling");
            token.cancel();
        }
    });

    let outcome = match cli.command {
        Command::Dequeue { stage_type } => {
            let progress = RequestProgress::start(&format!("Dequeuing from '{stage_type}'"));
            match consumer.dequeue(&StageType::new(stage_type.as_str())).await {
                Ok(Some(task)) => {
                    progress.finish_task(&task);
                    Ok(())
                }
                Ok(None) => {
                    progress.finish_empty(&stage_type);
                    Ok(())
                }
                Err(err) => Err((progress, err)),
            }
        }
        Command::Show { task_id } => {
            let progress = RequestProgress::start(&format!("Fetching task {task_id}"));
            match consumer.fetch_task(&TaskId::new(task_id)).await {
                Ok(task) => {
                    progress.finish_task(&task);
                    Ok(())
                }
                Err(err) => Err((progress, err)),
            }
        }
        Command::Complete { task_id } => {
            let progress = RequestProgress::start(&format!("Completing task {task_id}"));
            finish(progress, consumer.mark_completed(&TaskId::new(task_id)).await)
        }
        Command::Fail { task_id } => {
            let progress = RequestProgress::start(&format!("Failing task {task_id}"));
            finish(progress, consumer.mark_failed(&TaskId::new(task_id)).await)
        }
    };

    match outcome {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err((progress, err)) => {
            progress.finish_error(&err);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn finish(
    progress: RequestProgress,
    result: Result<taskq::Task, Error>,
) -> Result<(), (RequestProgress, Error)> {
    match result {
        Ok(task) => {
            progress.finish_task(&task);
            Ok(())
        }
        Err(err) => Err((progress, err)),
    }
}
