//! Reverse-tunnel fabric client: control-plane state machine, proxy
//! registration, and visitor drivers (SPEC_FULL.md §4 mirrored from the
//! client's side, §6 client config).

pub mod config;
pub mod control;
pub mod local;
pub mod proxy;
pub mod state;
pub mod visitor;

use std::sync::Arc;

use config::Config;
use state::ClientState;

/// Brings up every visitor listener the config enables, then runs the
/// control-channel reconnect loop if this client has anything (proxies or
/// an XTCP visitor) that needs one. A pure STCP/SUDP-visitor client never
/// logs in at all and just keeps its listeners alive.
pub async fn startup(config: Config) -> anyhow::Result<()> {
    let state = ClientState::new(config)?;

    visitor::spawn_stcp_sudp_visitors(&state);

    if control::needs_control_channel(&state) {
        control::run(state).await
    } else {
        log::info!("no proxies or XTCP visitors configured, running as a pure visitor client");
        idle_forever(&state).await
    }
}

async fn idle_forever(_state: &Arc<ClientState>) -> anyhow::Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}
