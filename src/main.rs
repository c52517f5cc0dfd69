//! mailbridge - Diagnostic entry point for the driver layer
//!
//! ```text
//! mailbridge scope <provider>    print the OAuth scopes a provider needs
//! mailbridge whoami <provider>   fetch the profile for MAILBRIDGE_ACCESS_TOKEN
//! ```

use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;
use mailbridge::config::Settings;
use mailbridge::domain::{Connection, ConnectionId};
use mailbridge::providers::{DriverConfig, DriverFactory, MailDriver, StaticTokenSupplier};
use mailbridge::storage::MemoryConnectionStore;

const USAGE: &str = "usage: mailbridge <scope|whoami> <provider>";

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(std::env::args().skip(1).collect()).await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Vec<String>) -> anyhow::Result<()> {
    let [command, provider] = args.as_slice() else {
        bail!(USAGE);
    };

    let settings = Settings::load(&Settings::default_path()?).context("loading settings")?;
    let factory = DriverFactory::new(settings)?;

    match command.as_str() {
        "scope" => {
            let driver = build_driver(&factory, provider, "unused".to_string())?;
            println!("{}", driver.get_scope());
        }
        "whoami" => {
            let token = std::env::var("MAILBRIDGE_ACCESS_TOKEN")
                .context("MAILBRIDGE_ACCESS_TOKEN is not set")?;
            let driver = build_driver(&factory, provider, token)?;
            let info = driver.get_user_info().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        other => bail!("unknown command {:?}\n{}", other, USAGE),
    }

    Ok(())
}

/// Builds a driver for a throwaway connection authenticated with `token`.
fn build_driver(
    factory: &DriverFactory,
    provider: &str,
    token: String,
) -> anyhow::Result<Box<dyn MailDriver>> {
    let connection = Connection {
        id: ConnectionId::from(format!("cli-{}", Utc::now().timestamp())),
        user_id: "cli".to_string(),
        provider_id: provider.to_string(),
        email: String::new(),
        access_token: Some(token.clone()),
        refresh_token: None,
        scope: String::new(),
        expires_at: None,
    };
    let config = DriverConfig::new(connection, Arc::new(MemoryConnectionStore::new()))
        .with_token_supplier(Arc::new(StaticTokenSupplier::new(token)));

    Ok(factory.create(provider, config)?)
}
