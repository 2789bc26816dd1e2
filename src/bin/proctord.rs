//! proctord - recovery service for exam clients and proctors
//!
//! This daemon:
//! 1. Opens the violation log
//! 2. Serves lock state and passkey recovery to exam clients
//! 3. Serves the staff violation routes behind a capability token

use anyhow::{anyhow, Result};
use std::sync::mpsc;

use proctor_kernel::{
    api::{ApiConfig, ApiServer},
    config::ProctorConfig,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ProctorConfig::load()?;
    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
        db_path: config.db_path.clone(),
        token_path: config.api_token_path.clone(),
        max_redeem_attempts: config.max_redeem_attempts,
    };
    let api_handle = ApiServer::new(api_config).spawn()?;
    log::info!("proctor api listening on {}", api_handle.addr);
    if let Some(path) = &api_handle.token_path {
        log::info!("proctor api capability token written to {}", path.display());
    } else {
        log::warn!(
            "proctor api capability token (handle securely): {}",
            api_handle.token
        );
    }
    log::info!("proctord running. serving {}", config.db_path);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("proctord waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
