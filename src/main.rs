use anyhow::Result;
use clap::Parser;
use std::fs::File;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter, warn};
use webphone::backend::HttpBackend;
use webphone::config::{Cli, Config};
use webphone::media::MediaBackend;
use webphone::signaling::ws::{DeviceInfo, RegisterOptions, WsSignalingClient};
use webphone::{console, version, ClientSessionBuilder};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let cli = Cli::parse();
    let mut config = match cli.conf.as_deref() {
        Some(path) if std::path::Path::new(path).exists() => Config::load(path)?,
        _ => Config::default(),
    };
    config.apply_overrides(&cli);

    let mut log_fmt = tracing_subscriber::fmt();
    if let Some(ref level) = config.log_level {
        if let Ok(lv) = level.as_str().parse::<LevelFilter>() {
            log_fmt = log_fmt.with_max_level(lv);
        }
    }
    // keep the guard alive or buffered lines are lost on exit
    let _guard = match config.log_file {
        Some(ref log_file) => {
            let file = File::create(log_file)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            log_fmt.with_writer(non_blocking).try_init().ok();
            Some(guard)
        }
        None => {
            log_fmt.with_writer(std::io::stderr).try_init().ok();
            None
        }
    };
    info!("{}", version::get_version_info());

    let backend = Arc::new(HttpBackend::new(&config.backend)?);
    let options = RegisterOptions {
        codec_preferences: config.signaling.codec_preferences.clone(),
        enable_ringing_state: config.signaling.enable_ringing_state,
        debug: config.signaling.debug,
        device_info: DeviceInfo {
            sdk_version: version::get_useragent(),
            platform: std::env::consts::OS.to_string(),
        },
        ..Default::default()
    };
    let signaling = Arc::new(
        WsSignalingClient::new(config.signaling.url.clone(), options)
            .with_connect_timeout(config.signaling.connect_timeout()),
    );

    #[cfg(feature = "audio-devices")]
    let media: Arc<dyn MediaBackend> = Arc::new(webphone::media::cpal_backend::CpalMedia::new());
    #[cfg(not(feature = "audio-devices"))]
    let media: Arc<dyn MediaBackend> = Arc::new(webphone::media::HeadlessMedia::new());

    let token = CancellationToken::new();
    let identity = config.backend.identity.clone();
    let session = ClientSessionBuilder::new()
        .with_config(Some(config))
        .with_cancel_token(token.clone())
        .with_token_supplier(backend.clone())
        .with_call_control(backend)
        .with_signaling(signaling)
        .with_media(media)
        .build()?;
    let handle = session.handle();
    let mut serve = tokio::spawn(session.serve());

    info!(identity, "starting webphone");
    // end of input only closes the console; `quit` stops the session
    let console = tokio::spawn(async move {
        let stdin = BufReader::new(tokio::io::stdin());
        if let Err(e) = console::run(handle, stdin, tokio::io::stdout()).await {
            warn!("console failed: {}", e);
        }
    });
    select! {
        result = &mut serve => {
            console.abort();
            return Ok(result??);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received CTRL+C, shutting down");
        }
    }
    console.abort();
    token.cancel();
    match serve.await? {
        Ok(()) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
