use std::time::Duration;

use args::{Args, Command, DenyListCommand};
use clap::Parser;
use rate_limit::RateLimiter;
use serde_json::{Value, json};

mod args;
mod logger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.config()?;

    logger::init(&args);

    let telemetry = telemetry::init(&config.telemetry)?;

    let limiter = match RateLimiter::from_config(&config).await {
        Ok(limiter) => limiter,
        Err(e) => {
            log::error!("Failed to create the rate limiter: {e}");
            std::process::exit(1);
        }
    };

    let output = run(&limiter, args.command).await;

    limiter.wait_for_pending().await;

    if let Err(e) = telemetry.force_flush() {
        log::warn!("{e}");
    }

    match output {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    }
}

async fn run(limiter: &RateLimiter, command: Command) -> anyhow::Result<Value> {
    let output = match command {
        Command::Limit { identifier, request } => {
            let response = limiter.limit(&identifier, &request.request()).await?;
            let record = response.record();

            if let Err(e) = response.pending.wait().await {
                log::warn!("Background work for '{identifier}' failed: {e}");
            }

            serde_json::to_value(record)?
        }
        Command::Wait {
            identifier,
            timeout,
            request,
        } => {
            let response = limiter
                .block_until_ready(&identifier, &request.request(), timeout.as_duration())
                .await?;

            serde_json::to_value(response.record())?
        }
        Command::Remaining { identifier } => serde_json::to_value(limiter.get_remaining(&identifier).await?)?,
        Command::Reset { identifier } => {
            limiter.reset_used_tokens(&identifier).await?;
            log::info!("Reset the tokens used by '{identifier}'");

            json!({ "reset": identifier })
        }
        Command::DenyList(DenyListCommand::Refresh) => json!({ "ips": limiter.refresh_deny_list().await? }),
        Command::DenyList(DenyListCommand::Disable) => {
            limiter.disable_ip_deny_list().await?;
            json!({ "disabled": true })
        }
        Command::DenyList(DenyListCommand::Add { values }) => json!({ "added": limiter.deny(&values).await? }),
        Command::DenyList(DenyListCommand::Remove { values }) => json!({ "removed": limiter.allow(&values).await? }),
        Command::Usage { since } => {
            let since = jiff::Timestamp::now().as_millisecond() - since_millis(since.as_duration());
            serde_json::to_value(limiter.usage(since).await?)?
        }
    };

    Ok(output)
}

fn since_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
