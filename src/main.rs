use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use segscribe::config::{self, Config};
use segscribe::{
    DetectionStage, Detector, Enrichment, EnrichmentStage, HttpCaptioner, OcrsRecognizer,
    PrecomputedDetector, SegmentId, ServingDetector, Session,
};

const DEFAULT_CONFIG_FILE: &str = "segscribe.toml";

#[derive(Parser)]
#[command(name = "segscribe")]
#[command(about = "Segment objects in an image, read and caption them, and report the results")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Configuration file (TOML); written with defaults if it does not exist
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the data directory from the configuration
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Upload an image and make it the current one
    Upload {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,
    },
    /// Detect objects in the current image and store one crop per object
    Detect {
        /// Replay detector output from a JSON file instead of calling the model server
        #[arg(long, value_name = "FILE")]
        detections: Option<PathBuf>,
        /// Minimum confidence (exclusive) for a detection to become a segment
        #[arg(long, value_name = "T")]
        threshold: Option<f32>,
    },
    /// List the segments of the current run
    Segments,
    /// Extract text from segments (all unprocessed ones when none are given)
    ExtractText {
        #[arg(value_name = "SEGMENT")]
        segments: Vec<SegmentId>,
    },
    /// Caption segments (all unprocessed ones when none are given)
    Caption {
        #[arg(value_name = "SEGMENT")]
        segments: Vec<SegmentId>,
    },
    /// Merge all results and write the final report
    Report,
    /// Show the session state
    Status,
    /// Start a new session
    Reset,
}

fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")
}

fn resolve_config(args: &Cli) -> anyhow::Result<Config> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut config = if path.exists() {
        debug!("Loading configuration from {}", path.display());
        config::load_config(&path).with_context(|| format!("Failed to load {}", path.display()))?
    } else if args.config.is_some() {
        let config = Config::default();
        config::save_config(&config, &path)?;
        info!("Wrote default configuration to {}", path.display());
        config
    } else {
        Config::default()
    };

    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

fn build_detector(config: &Config, detections: Option<&Path>) -> anyhow::Result<Arc<dyn Detector>> {
    if let Some(path) = detections {
        return Ok(Arc::new(PrecomputedDetector::from_file(path)?));
    }
    match &config.detection.serving_url {
        Some(url) => Ok(Arc::new(ServingDetector::new(
            url.clone(),
            config.detection.byte_input,
            config.detection.timeout(),
        ))),
        None => bail!("No detector available: pass --detections FILE or set detection.serving_url"),
    }
}

fn print_enrichment(outcomes: &[(SegmentId, Enrichment)]) {
    if outcomes.is_empty() {
        println!("Nothing left to process.");
    }
    for (id, state) in outcomes {
        match state {
            Enrichment::Done(value) => println!("{}: {}", id.file_name(), value),
            Enrichment::Failed(reason) => println!("{}: FAILED ({})", id.file_name(), reason),
            Enrichment::Pending => println!("{}: pending", id.file_name()),
        }
    }
}

async fn enrich(session: &mut Session, stage: &EnrichmentStage, ids: &[SegmentId]) -> anyhow::Result<()> {
    if ids.is_empty() {
        let outcomes = session.enrich_pending(stage).await?;
        print_enrichment(&outcomes);
        return Ok(());
    }

    let mut outcomes = Vec::with_capacity(ids.len());
    for id in ids {
        let state = match session.enrich(stage, id).await {
            Ok(value) => Enrichment::Done(value),
            Err(segscribe::PipelineError::Processing { reason, .. }) => Enrichment::Failed(reason),
            Err(e) => return Err(e.into()),
        };
        outcomes.push((*id, state));
    }
    print_enrichment(&outcomes);
    Ok(())
}

async fn status(session: &Session) -> anyhow::Result<()> {
    if let Some(started) = session.started_at().await? {
        println!("Started: {}", started.format(&Rfc3339)?);
    }
    println!("Phase: {}", session.phase().await?);
    match session.current_image().await {
        Ok(image) => println!("Image: {} ({}x{})", image.file_name, image.width, image.height),
        Err(e) if e.is_not_found() => println!("Image: none"),
        Err(e) => return Err(e.into()),
    }
    if let Ok(run) = session.current_run() {
        let segments = session.segments().await?;
        let text = session.results(segscribe::StageKind::TextExtraction);
        let captions = session.results(segscribe::StageKind::Captioning);
        println!("Run: {run}");
        println!("Segments: {}", segments.len());
        println!("Text extracted: {}", segments.iter().filter(|id| text.get(id).is_done()).count());
        println!("Captioned: {}", segments.iter().filter(|id| captions.get(id).is_done()).count());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    init_logging(args.verbose)?;

    let config = resolve_config(&args)?;
    let mut session = Session::from_config(&config).await?;

    match args.command {
        Command::Upload { image } => {
            let uploaded = session.upload(&image).await?;
            println!("Uploaded {} ({}x{})", uploaded.file_name, uploaded.width, uploaded.height);
        }
        Command::Detect { detections, threshold } => {
            let detector = build_detector(&config, detections.as_deref())?;
            let mut stage = DetectionStage::new(detector, &config.detection);
            if let Some(t) = threshold {
                stage = stage.with_threshold(t)?;
            }
            let details = session.detect(&stage).await?;
            println!("{} objects detected", details.len());
            for detail in &details {
                println!(
                    "  {} {} ({:.2})",
                    detail.id.file_name(),
                    detail.label_name.as_deref().unwrap_or("unknown"),
                    detail.score
                );
            }
        }
        Command::Segments => {
            let details = session.segment_details().await?;
            if details.is_empty() {
                println!("No objects were detected.");
            }
            for detail in &details {
                let path = session.segment_path(&detail.id)?;
                println!(
                    "{:>3}  {:<14} {:<12} {:.2}  {}",
                    detail.id.object_number(),
                    detail.id.file_name(),
                    detail.label_name.as_deref().unwrap_or("unknown"),
                    detail.score,
                    path.display()
                );
            }
        }
        Command::ExtractText { segments } => {
            let recognizer = OcrsRecognizer::from_config(&config.ocr)?;
            let stage = EnrichmentStage::text(Arc::new(recognizer), config.ocr.timeout());
            enrich(&mut session, &stage, &segments).await?;
        }
        Command::Caption { segments } => {
            let captioner = HttpCaptioner::from_config(&config.caption);
            let stage = EnrichmentStage::caption(Arc::new(captioner), config.caption.timeout());
            enrich(&mut session, &stage, &segments).await?;
        }
        Command::Report => {
            let written = session.write_report().await?;
            if written.records.is_empty() {
                println!("No objects were detected.");
            } else {
                print!("{}", segscribe::report::documents::render_table(&written.records));
            }
            println!("\nWrote {} and {}", written.json_path.display(), written.markdown_path.display());
        }
        Command::Status => status(&session).await?,
        Command::Reset => {
            session.reset().await?;
            println!("Session reset.");
        }
    }

    session.close().await;
    Ok(())
}
