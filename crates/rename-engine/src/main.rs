use rename_engine::{EngineConfig, RenameCoordinator, RenameInput};
use std::io::Read;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

/// Stand-in for the out-of-scope JSON-RPC tool server: reads a single
/// request as JSON from stdin, performs one rename, and writes the result
/// as JSON to stdout.
#[derive(Debug, serde::Deserialize)]
struct RenameRequest {
    old_path: String,
    new_path: String,
    #[serde(default = "default_true")]
    update_links: bool,
    #[serde(default)]
    case_sensitive: bool,
    correlation_id: Option<Uuid>,
}

fn default_true() -> bool {
    true
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let config = EngineConfig::from_env()?;
    tracing::info!("Vault path: {}", config.vault_path.display());

    let recovery = rename_engine::recover_pending(config.wal_dir.clone(), config.quiescence_secs).await;
    tracing::info!(
        recovered = recovery.recovered,
        failed = recovery.failed,
        "boot recovery complete"
    );

    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let request: RenameRequest = serde_json::from_str(&input)?;

    let coordinator = RenameCoordinator::new(&config);
    let output = coordinator
        .rename_note(RenameInput {
            old_path: request.old_path.into(),
            new_path: request.new_path.into(),
            update_links: request.update_links,
            case_sensitive: request.case_sensitive,
            correlation_id: request.correlation_id,
            cancellation: None,
        })
        .await?;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
