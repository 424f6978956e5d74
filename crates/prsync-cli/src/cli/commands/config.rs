use anyhow::Result;
use prsync_core::SyncConfig;

use crate::exit_codes;

pub fn run(config: &SyncConfig) -> Result<i32> {
    print!("{}", serde_yaml::to_string(config)?);
    Ok(exit_codes::SUCCESS)
}
