use anyhow::Context;
use audio_plugin_rs::{
    config::{ServerAddress, Settings},
    host::{event_channel, FileProgramContext, HeadlessAudio, Host, StandaloneGame},
    Session,
};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "audio-plugin")]
#[command(about = "Connects to a game server and plays the audio it directs")]
struct Args {
    /// Server host name or IP address
    #[arg(short = 'a', long, env = "AUDIO_SERVER_HOST")]
    address: String,

    /// Server port
    #[arg(short, long, env = "AUDIO_SERVER_PORT")]
    port: u16,

    /// Player name sent when authenticating
    #[arg(short, long, env = "AUDIO_PLAYER_NAME")]
    name: String,

    /// Directory for settings, the log file and downloaded audio packs
    #[arg(short, long, env = "AUDIO_SAVE_PATH", default_value = "audio-plugin")]
    save_path: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    log::info!("🚀 Initializing audio-plugin");

    let settings = Settings::init_save_path(&args.save_path)
        .with_context(|| format!("preparing {}", args.save_path.display()))?;
    let server = ServerAddress::new(args.address, args.port)?;

    let (events_tx, events_rx) = event_channel();
    let host = Host::new(
        HeadlessAudio::new(events_tx.clone()),
        StandaloneGame::new(events_tx),
        FileProgramContext::new(&args.save_path, settings.enable_logging)
            .context("opening the log file")?,
    );

    let session = Session::new(settings, server, args.name, host, events_rx)?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("🛑 Ctrl+C received");
            signal.cancel();
        }
    });

    session.run(shutdown).await;
    log::info!("👋 Goodbye");
    Ok(())
}
