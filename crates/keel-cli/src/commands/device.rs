use std::path::Path;

use crate::commands::common::open_store;
use crate::error::CliError;

pub async fn run_device(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let device = store.local_device().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&device)?);
    } else {
        println!("ID:       {}", device.device_id);
        println!("Name:     {}", device.device_name);
        println!("Platform: {}", device.platform);
    }
    Ok(())
}
