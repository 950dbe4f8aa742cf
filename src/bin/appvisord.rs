//! Appvisor daemon entrypoint.
//!
//! Usage: `appvisord [config.json]`
//!
//! Boot order: read configuration (the only fatal failure) → initialize
//! logging → seed the registry from `Applications` → re-attach survivors
//! from the snapshot → run the supervision loop until a signal.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use appvisor::{Config, ConfigFile, LogSubscriber, RegisterOptions, SupervisorBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("appvisor.json"));

    let (cfg, seed) = if config_path.exists() {
        let file = ConfigFile::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?;
        let cfg = file.runtime_config(&config_path, Config::default());
        (cfg, file.applications)
    } else {
        info!(path = %config_path.display(), "no configuration file; starting empty");
        (Config::default(), Vec::new())
    };

    let sup = SupervisorBuilder::new(cfg)
        .with_subscribers(vec![Arc::new(LogSubscriber)])
        .build();

    for spec_json in &seed {
        let spec = match appvisor::AppSpec::from_json(spec_json) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "skipping invalid application in configuration");
                continue;
            }
        };
        let name = spec.name.clone();
        if let Err(e) = sup.registry().add(spec, RegisterOptions::default()).await {
            warn!(app = %name, error = %e, "could not register application");
        }
    }

    let attached = sup.recover().await;
    info!(
        applications = sup.registry().list().len(),
        reattached = attached,
        "appvisor starting"
    );

    sup.run().await?;
    info!("appvisor stopped");
    Ok(())
}
