use anyhow::Result;
use prsync_core::{RequestDescriptor, SyncConfig};
use serde_json::json;

use crate::exit_codes;

pub async fn run(config: SyncConfig) -> Result<i32> {
    let layer = super::build_layer(config, false)?;

    if let Err(e) = layer.start().await {
        eprintln!("authentication failed: {}", e);
        return Ok(exit_codes::SYNC_FAILED);
    }

    // GET /rate_limit does not count against the quota.
    let gateway = layer.gateway();
    if let Err(e) = gateway
        .call::<serde_json::Value>(RequestDescriptor::get("rate_limit", "/rate_limit"))
        .await
    {
        eprintln!("rate limit lookup failed: {}", e);
        return Ok(exit_codes::SYNC_FAILED);
    }

    let context = layer.tokens().context();
    let status = json!({
        "user": context.current_user,
        "auth_state": layer.tokens().current_state().to_string(),
        "api_url": layer.config().gateway.api_url,
        "rate_limit": gateway.rate_limit(),
        "pacing_interval_ms": gateway.pacing_interval().as_millis() as u64,
        "last_error": context.last_error,
        "last_synced": layer.last_synced().get(),
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(exit_codes::SUCCESS)
}
