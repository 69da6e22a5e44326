use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use clap::Parser;

use indicatif::ProgressStyle;
use tracing::{info, info_span, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{filter::LevelFilter, prelude::*};

use flowcam::config::Config;
use flowcam::error::FlowError;
use flowcam::publisher::{CancelToken, FramePublisher, StreamMode};

#[derive(Parser)]
pub struct Args {
    /// `index` for raw frames, `opticalflow` for motion trails.
    #[clap(long, default_value = "opticalflow")]
    pub mode: StreamMode,
    /// Stop after this many frames.
    #[clap(long)]
    pub frames: Option<u64>,
    /// Record the published frames from the first one on.
    #[clap(long)]
    pub record: bool,
    /// Write the last published JPEG here.
    #[clap(long)]
    pub snapshot: Option<PathBuf>,
    #[clap(flatten)]
    pub config: Config,
}

fn main() -> Result<()> {
    let args = Args::parse();
    args.config.validate()?;

    // setup logging
    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(indicatif_layer.get_stdout_writer())
                .with_filter(LevelFilter::INFO),
        )
        .with(indicatif_layer)
        .init();

    let publisher = Arc::new(FramePublisher::open(&args.config)?);
    info!(source = %args.config.source, mode = %args.mode, "publishing");

    if args.record {
        publisher.begin_recording()?;
    }

    let header_span = info_span!("header");
    match args.frames {
        Some(frames) => {
            header_span.pb_set_style(&ProgressStyle::default_bar());
            header_span.pb_set_length(frames);
        }
        None => header_span.pb_set_style(&ProgressStyle::default_spinner()),
    }
    let header_span_enter = header_span.enter();

    let mut published = 0u64;
    let mut last = None;
    for item in publisher.stream(args.mode, CancelToken::new()) {
        match item {
            Ok(jpeg) => {
                published += 1;
                last = Some(jpeg);
                header_span.pb_inc(1);
            }
            Err(FlowError::SourceExhausted) => {
                info!("Stream ended");
                break;
            }
            Err(err) => {
                warn!(%err, "stream stopped");
                break;
            }
        }
        if args.frames.map_or(false, |frames| published >= frames) {
            break;
        }
    }

    std::mem::drop(header_span_enter);
    std::mem::drop(header_span);

    publisher.end_recording()?;
    info!(published, "done");

    if let (Some(path), Some(jpeg)) = (&args.snapshot, &last) {
        std::fs::write(path, jpeg)
            .with_context(|| format!("failed to write snapshot {}", path.display()))?;
    }

    Ok(())
}
