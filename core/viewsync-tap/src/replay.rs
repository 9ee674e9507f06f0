//! Offline replay: seed a row store, open one view, push an NDJSON event
//! stream through the engine and print where the view ended up.
//!
//! Output is a single JSON object on stdout:
//!
//! ```text
//! { "viewKey": ..., "view": {...}, "page": {...},
//!   "events": { "applied": n, "dropped": n },
//!   "notifications": { "count": n, "unread": n } }
//! ```

use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use serde_json::json;
use viewsync_core::store::load_rows_file;
use viewsync_core::view::FieldPredicates;
use viewsync_core::{load_config, MemoryRowStore, RowSource, SyncEngine};
use viewsync_protocol::{decode_frame, RawFrame};

use crate::view_args::ViewArgs;

#[derive(Args, Debug)]
pub struct ReplayArgs {
    #[command(flatten)]
    pub view: ViewArgs,

    /// JSON array of rows that make up the initial store
    #[arg(long, value_name = "FILE")]
    pub seed: Option<PathBuf>,

    /// NDJSON event file, or `-` for stdin
    #[arg(long, value_name = "FILE")]
    pub events: Option<String>,

    /// Recipient whose notifications are tracked
    #[arg(long, default_value = "local")]
    pub recipient: String,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReplayCounts {
    pub applied: usize,
    pub dropped: usize,
}

pub fn run(args: &ReplayArgs, config: Option<PathBuf>) -> Result<(), String> {
    let config = load_config(config)?;
    let descriptor = args.view.descriptor()?;

    let store = MemoryRowStore::new(descriptor.resource_type(), Arc::new(FieldPredicates::new()));
    if let Some(seed) = &args.seed {
        let seeded = store.seed(load_rows_file(seed)?);
        tracing::debug!(rows = seeded, "Seeded row store");
    }

    let engine = SyncEngine::from_config(args.recipient.as_str(), &config);
    let _view = engine.views().subscribe(&descriptor, |_, _| {});
    engine
        .views()
        .load(&descriptor, &store as &dyn RowSource)?;

    let counts = match args.events.as_deref() {
        None => ReplayCounts::default(),
        Some("-") => replay_lines(&engine, BufReader::new(io::stdin().lock()))?,
        Some(path) => {
            let file = fs_err::File::open(path).map_err(|e| e.to_string())?;
            replay_lines(&engine, BufReader::new(file))?
        }
    };
    engine.views().flush_all();

    let page = engine
        .views()
        .snapshot(&descriptor)
        .ok_or("view was closed during replay")?;
    let summary = json!({
        "viewKey": descriptor.view_key(),
        "view": descriptor,
        "page": page.as_ref(),
        "events": { "applied": counts.applied, "dropped": counts.dropped },
        "notifications": {
            "count": engine.recent_notifications().len(),
            "unread": engine.notifications().unread_count(engine.recipient_id()),
        },
    });
    let rendered = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    println!("{rendered}");
    Ok(())
}

/// Applies one frame per non-blank line. Unparseable or undecodable lines
/// are logged and counted, never fatal.
pub fn replay_lines<R: Read>(
    engine: &SyncEngine,
    reader: BufReader<R>,
) -> Result<ReplayCounts, String> {
    let mut counts = ReplayCounts::default();
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| format!("Failed to read events: {e}"))?;
        if line.trim().is_empty() {
            continue;
        }
        let event = RawFrame::parse_line(line.trim().as_bytes())
            .and_then(|frame| decode_frame(&frame));
        match event {
            Ok(event) => {
                engine.handle_event(&event);
                counts.applied += 1;
            }
            Err(err) => {
                tracing::warn!(line = index + 1, error = %err, "Skipping event");
                counts.dropped += 1;
            }
        }
    }
    Ok(counts)
}
