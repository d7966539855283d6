//! Duo Sync demo client
//!
//! Connects (or resumes the stored identity), logs every engine event and
//! keeps polling until Ctrl-C. Without `DUO_SERVER_URL` it runs against the
//! in-memory service with a simulated second player.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use duo_sync::{
    EngineSettings, EventKind, HttpTransport, HttpTransportConfig, MemoryTransport,
    ReconnectOutcome, SettingsStore, StorageConfig, SyncClient, Transport,
};

/// Settings read from the environment
#[derive(Debug, Clone)]
struct ClientConfig {
    server_url: Option<String>,
    storage_path: String,
    display_name: String,
    poll_interval: Option<Duration>,
}

impl ClientConfig {
    fn from_env() -> Self {
        let poll_interval = std::env::var("DUO_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis);

        Self {
            server_url: std::env::var("DUO_SERVER_URL").ok().filter(|u| !u.is_empty()),
            storage_path: std::env::var("DUO_STORAGE_PATH")
                .unwrap_or_else(|_| "./data/duo-sync.sled".to_string()),
            display_name: std::env::var("DUO_DISPLAY_NAME").unwrap_or_else(|_| "Player".to_string()),
            poll_interval,
        }
    }
}

/// Second player on the in-memory service who asks us to pair
fn simulate_partner(memory: &MemoryTransport, own_user_id: String) {
    let memory = memory.clone();
    memory.add_user("demo-partner", "Demo Partner", "demo-token");
    tokio::spawn(async move {
        let partner = duo_sync::Identity::new("demo-partner", "demo", "demo-token", "Demo Partner");
        tokio::time::sleep(Duration::from_secs(1)).await;
        if let Err(e) = memory.request_pairing(&partner, &own_user_id).await {
            warn!("Simulated partner could not send a request: {}", e);
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "duo_sync=info".into()),
        )
        .init();

    let config = ClientConfig::from_env();

    info!("Opening settings store at: {}", config.storage_path);
    let store = SettingsStore::open(StorageConfig::new(&config.storage_path))
        .context("failed to open settings store")?;

    let memory = MemoryTransport::new();
    let transport: Arc<dyn Transport> = match &config.server_url {
        Some(url) => {
            info!("Using service at {}", url);
            Arc::new(HttpTransport::new(HttpTransportConfig::new(url)).context("failed to build HTTP client")?)
        }
        None => {
            info!("DUO_SERVER_URL not set, using the in-memory service");
            Arc::new(memory.clone())
        }
    };

    let client = SyncClient::builder(transport).with_store(store).build();

    if let Some(interval) = config.poll_interval {
        let settings = client.settings();
        client.update_settings(EngineSettings {
            poll_interval: interval,
            ..settings
        });
    }

    for kind in EventKind::ALL {
        client.on(kind, |event| info!("{}: {}", event.kind(), event.to_json()));
    }

    // Answer incoming requests automatically in the demo
    let responder = Arc::downgrade(&client);
    client.on(EventKind::PairingRequestsUpdated, move |event| {
        if let duo_sync::EngineEvent::PairingRequestsUpdated { incoming, .. } = event {
            let (Some(request), Some(client)) = (incoming.first(), responder.upgrade()) else {
                return;
            };
            let request_id = request.request_id.clone();
            tokio::spawn(async move {
                if let Err(e) = client.respond_to_pairing_request(&request_id, true).await {
                    warn!("Could not approve {}: {}", request_id, e);
                }
            });
        }
    });

    let identity = match client.resume().await {
        Ok(Some(ReconnectOutcome::Resumed(identity))) => {
            info!("Resumed as {}", identity.user_id);
            identity
        }
        Ok(Some(ReconnectOutcome::InvalidToken))
        | Ok(Some(ReconnectOutcome::StaleToken(_)))
        | Ok(None) => client
            .connect(&config.display_name)
            .await
            .context("failed to connect")?,
        Err(e) => {
            warn!("Resume failed ({}), registering a new identity", e);
            client
                .connect(&config.display_name)
                .await
                .context("failed to connect")?
        }
    };
    info!("Connected as {} ({})", identity.display_name, identity.user_id);

    if config.server_url.is_none() {
        simulate_partner(&memory, identity.user_id.clone());
    }

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;

    info!("Shutting down");
    client.disconnect().await;
    Ok(())
}
