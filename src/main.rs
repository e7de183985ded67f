use anyhow::Context;
use kafka_oauthbearer::sasl::{self, Credentials};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let provider = match sasl::from_env().context("loading SASL configuration")? {
        Some(provider) => provider,
        None => {
            warn!("No SASL credentials configured, connections would be unauthenticated");
            return Ok(());
        }
    };

    let mechanism = provider.mechanism();
    info!(message = "SASL configured", %mechanism);

    let credentials = provider
        .credentials()
        .await
        .with_context(|| format!("{mechanism} authentication failed"))?;

    match credentials {
        Credentials::Static { username, .. } => {
            info!(message = "Static credentials ready", %username);
        }
        Credentials::Bearer(token) => {
            info!(
                message = "Bearer token acquired",
                principal = %token.principal_name,
                lifetime_ms = token.lifetime_ms,
            );
        }
    }

    if let Some(diagnostics) = provider.diagnostics() {
        let diagnostics = serde_json::to_string(&diagnostics).context("encoding diagnostics")?;
        println!("{diagnostics}");
    }

    Ok(())
}
