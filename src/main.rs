use anyhow::Result;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use livevoice::audio::capture::AlsaCapture;
use livevoice::audio::playback::AlsaOutput;
use livevoice::config::Config;
use livevoice::session::{LiveSession, run_session};
use livevoice::transport::WsConnector;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("livevoice=info")),
        )
        .init();

    let config = Config::from_env()?;
    tracing::info!(url = %config.server_url, "livevoice starting");

    let connector = WsConnector::from_config(&config);
    let capture = AlsaCapture::new(&config);
    let outputs = AlsaOutput::new(&config);
    let mut session = LiveSession::new(
        config,
        Box::new(connector),
        Box::new(capture),
        Box::new(outputs),
    );

    let streams = session.start().await?;
    tracing::info!("session open, speak when ready (ctrl-c to stop)");

    tokio::select! {
        _ = run_session(&mut session, streams) => {
            tracing::info!("session ended");
        }
        _ = signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
        }
    }
    session.stop().await;

    if let Some(error) = session.last_error() {
        tracing::warn!(%error, "session ended with error");
    }
    for turn in session.turns() {
        println!("{}: {}", turn.role, turn.text);
    }

    Ok(())
}
