/**
 * FLEET SYNC - Point d'entrée du client de synchronisation
 *
 * RÔLE : Charge la config, ouvre la connexion push (token si FLEET_SYNC_TOKEN est défini,
 * sinon mode public) et journalise l'état de la flotte jusqu'à Ctrl-C.
 */

use anyhow::{Context, Result};
use symbion_fleet_sync::{load_config, AuthState, Credential, FleetSync};
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().init();

    let config = load_config().await;
    config.validate().context("invalid fleet-sync configuration")?;

    let auth = match std::env::var("FLEET_SYNC_TOKEN") {
        Ok(token) if !token.trim().is_empty() => AuthState::Authenticated(Credential::new(token.trim())),
        _ => {
            warn!("FLEET_SYNC_TOKEN absent, connexion publique");
            AuthState::Anonymous
        }
    };
    let (_auth_tx, auth_rx) = watch::channel(auth);

    let engine = FleetSync::from_config(config);
    engine.init(auth_rx).await;

    let mut fleet = engine.fleet().watch();
    loop {
        tokio::select! {
            changed = fleet.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = fleet.borrow_and_update().clone();
                let counts = engine.fleet().counts();
                info!(
                    status = %state.status,
                    servers = counts.total,
                    online = counts.online,
                    offline = counts.offline,
                    error = state.error.as_deref().unwrap_or("-"),
                    "fleet update"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("arrêt demandé");
                break;
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}
