//! Live mode: subscribe to one view over a Unix socket channel and print
//! every page change as a JSON line.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Args;
use serde_json::json;
use viewsync_core::{load_config, ChannelManager, SyncEngine, UnixSocketTransport};

use crate::view_args::ViewArgs;

#[derive(Args, Debug)]
pub struct FollowArgs {
    #[command(flatten)]
    pub view: ViewArgs,

    /// Unix socket the server pushes events on
    #[arg(long, value_name = "PATH")]
    pub socket: PathBuf,

    #[arg(long, default_value = "local")]
    pub recipient: String,

    /// Treat the socket as dead after this long without any frame
    #[arg(long, default_value_t = 30_000)]
    pub liveness_ms: u64,

    /// Stop after this many milliseconds instead of running until killed
    #[arg(long)]
    pub duration_ms: Option<u64>,
}

pub fn run(args: &FollowArgs, config: Option<PathBuf>) -> Result<(), String> {
    let config = load_config(config)?;
    let descriptor = args.view.descriptor()?;

    let transport = UnixSocketTransport::new(&args.socket)
        .with_liveness_timeout(Duration::from_millis(args.liveness_ms));
    let manager = ChannelManager::new(Arc::new(transport), config.channel.clone());
    let _state_watch = manager.on_state_change(|state| {
        tracing::info!(state = ?state, "Channel state");
    });

    let channel = manager.connect();
    let engine = Arc::new(SyncEngine::from_config(args.recipient.as_str(), &config));
    let _handlers = engine.attach(&channel);
    let _flusher = if config.views.quiescence().is_zero() {
        None
    } else {
        Some(
            engine
                .views()
                .spawn_flusher(config.views.flush_interval())
                .map_err(|e| format!("Failed to start view flusher: {e}"))?,
        )
    };

    let _view = engine.open_view(&channel, &descriptor, |descriptor, page| {
        let line = json!({ "viewKey": descriptor.view_key(), "page": page.as_ref() });
        println!("{line}");
    });

    let deadline = args
        .duration_ms
        .map(|ms| Instant::now() + Duration::from_millis(ms));
    loop {
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                thread::sleep(deadline - now);
            }
            None => thread::park(),
        }
    }
    tracing::info!("Follow finished");
    Ok(())
}
