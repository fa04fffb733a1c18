//! Sponsor gateway - co-signs fee-sponsored ledger transaction groups

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sponsor_gateway::{
    auth::JwtValidator,
    cache::spawn_cleanup_task,
    clock::system_clock,
    config::Args,
    crypto::{SponsorKeyFile, SponsorSigner},
    ledger::{HttpLedgerClient, InMemoryLedger, LedgerClient, LedgerParams},
    server::{self, AppState, GatewayParts},
    wire::address_to_hex,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialize tracing/logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("sponsor_gateway={},info", args.log_level).into());
    if args.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let sponsor = Arc::new(load_sponsor(&args)?);
    let clock = system_clock();

    let ledger: Arc<dyn LedgerClient> = match &args.ledger_url {
        Some(url) => Arc::new(HttpLedgerClient::new(url.clone(), args.ledger_timeout())),
        None => {
            warn!("No LEDGER_URL - using in-memory ledger");
            Arc::new(InMemoryLedger::new(LedgerParams::default(), clock.clone()))
        }
    };

    let jwt = match args.jwt_secret() {
        Some(secret) => JwtValidator::new(secret, args.jwt_expiry_seconds)?,
        None => JwtValidator::new_dev(),
    };

    info!("======================================");
    info!("  Sponsor gateway");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("Ledger: {}", args.ledger_url.as_deref().unwrap_or("in-memory"));
    info!("Sponsor: {}", address_to_hex(&sponsor.address()));
    info!("Pending TTL: {}s", args.pending_ttl_secs);
    info!("======================================");

    let state = AppState::build(GatewayParts {
        ledger,
        sponsor,
        jwt,
        clock,
        pending: args.pending_config(),
        preparer: args.preparer_config(),
        dev_mode: args.dev_mode,
    });

    spawn_cleanup_task(Arc::clone(&state.pending));

    server::run(state, args.listen).await?;
    Ok(())
}

/// Sponsor key from hex, an encrypted key file, or (dev mode) a fresh key
fn load_sponsor(args: &Args) -> anyhow::Result<SponsorSigner> {
    if let Some(secret) = &args.sponsor_secret_key {
        return SponsorSigner::from_secret_hex(secret).context("invalid SPONSOR_SECRET_KEY");
    }

    if let Some(path) = &args.sponsor_key_file {
        let passphrase = args
            .sponsor_key_passphrase
            .as_deref()
            .context("SPONSOR_KEY_PASSPHRASE is required with SPONSOR_KEY_FILE")?;
        let file = SponsorKeyFile::load(path)
            .with_context(|| format!("reading sponsor key file {}", path.display()))?;
        return file.open(passphrase).context("unlocking sponsor key file");
    }

    warn!("No sponsor key configured - generated an ephemeral one");
    Ok(SponsorSigner::generate())
}
