//! Reverse-tunnel fabric server: control-plane state machine, matchmaker,
//! and public listeners (SPEC_FULL.md §4-§5).

pub mod config;
pub mod control;
pub mod listeners;
pub mod matchmaker;
pub mod state;

use std::sync::Arc;

use config::Config;
use state::ServerState;

/// Brings up every listener the config enables and runs until one of them
/// exits. Split out of `main` so integration tests can drive a whole
/// server in-process.
pub async fn startup(config: Config) -> anyhow::Result<()> {
    let state = ServerState::new(config)?;

    log::info!("control channel listening on {}", state.config.bind_addr);
    let control = tokio::spawn(control::serve_control(state.clone(), state.config.bind_addr));
    let http = tokio::spawn(listeners::serve_http_vhost(state.clone()));
    let https = tokio::spawn(listeners::serve_https_vhost(state.clone()));

    tokio::select! {
        res = control => { res??; }
        res = http => { res?; }
        res = https => { res?; }
    }

    Ok(())
}
