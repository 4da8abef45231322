//! Audio Saver daemon
//!
//! Restores the saved audio state at login, then keeps the saved copy up to
//! date as devices and settings change.
//!
//! Usage: `audio-saver [CONFIG] [--simulate] [--dump]`

use anyhow::{Context as _, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audio_saver::{
    config::AppConfig,
    engine::Reconciler,
    pulse::{delivery_channel, Backend, Context, DeliverySender, MemoryBackend},
    service::ContextAudioService,
    state::StateStore,
};

struct Args {
    config: Option<PathBuf>,
    simulate: bool,
    dump: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut parsed = Args {
        config: None,
        simulate: false,
        dump: false,
    };
    for arg in args {
        match arg.as_str() {
            "--simulate" => parsed.simulate = true,
            "--dump" => parsed.dump = true,
            flag if flag.starts_with("--") => anyhow::bail!("unknown option {}", flag),
            _ if parsed.config.is_some() => anyhow::bail!("unexpected argument {}", arg),
            _ => parsed.config = Some(PathBuf::from(&arg)),
        }
    }
    Ok(parsed)
}

#[cfg(feature = "pulse")]
fn native_backend(tx: DeliverySender) -> Result<Arc<dyn Backend>> {
    let backend = audio_saver::pulse::native::PulseBackend::connect("audio-saver", tx)?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "pulse"))]
fn native_backend(_tx: DeliverySender) -> Result<Arc<dyn Backend>> {
    anyhow::bail!("built without the `pulse` feature, use --simulate")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1))?;

    let config_path = match args.config {
        Some(path) => path,
        None => AppConfig::default_path()?,
    };
    let first_run = !config_path.exists();
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.filter.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if first_run {
        match config.save(&config_path) {
            Ok(()) => tracing::info!("Wrote default config to {}", config_path.display()),
            Err(e) => tracing::warn!("Write default config failed: {}", e),
        }
    }

    let store = StateStore::new(&config.state.path);

    if args.dump {
        let state = store
            .load()
            .with_context(|| format!("reading {}", store.path().display()))?;
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    tracing::info!("Starting Audio Saver");

    let (tx, rx) = delivery_channel();
    let backend: Arc<dyn Backend> = if args.simulate {
        tracing::info!("Using in-memory backend");
        Arc::new(MemoryBackend::with_builtin_card(tx))
    } else {
        native_backend(tx)?
    };

    let ctx = Context::new(
        backend,
        rx,
        tokio::runtime::Handle::current(),
        config.backend.query_timeout(),
    )?;
    let service = Arc::new(ContextAudioService::new(ctx.clone()));
    let reconciler = Reconciler::new(ctx.clone(), service, store, &config);

    {
        let reconciler = reconciler.clone();
        tokio::task::spawn_blocking(move || {
            reconciler.start();
            reconciler.subscribe();
        })
        .await?;
    }

    tokio::select! {
        reason = ctx.disconnected() => {
            tracing::error!("Lost audio server connection: {}", reason);
            std::process::exit(1);
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Shutting down, last state: {}", reconciler.current());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args> {
        parse_args(args.iter().map(|a| a.to_string()))
    }

    #[test]
    fn test_flags_and_config_path() {
        let args = parse(&["--simulate", "/tmp/audio.toml", "--dump"]).unwrap();
        assert!(args.simulate);
        assert!(args.dump);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/audio.toml")));

        let bare = parse(&[]).unwrap();
        assert!(!bare.simulate && !bare.dump && bare.config.is_none());
    }

    #[test]
    fn test_unknown_option_is_rejected() {
        assert!(parse(&["--simlate"]).is_err());
        assert!(parse(&["a.toml", "b.toml"]).is_err());
    }
}
