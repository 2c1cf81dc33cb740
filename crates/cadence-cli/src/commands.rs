//! CLI command implementations

use crate::output::{self, OutputFormat};
use anyhow::{bail, Context};
use cadence_core::{
    manifest, AdapterKind, ChannelListener, Decision, EngineConfig, EngineContext, HttpRequest, HttpTransport,
    LoadAttempt, LoadFailure, ParseErrorKind, PlaybackSession, PlaybackState, PolicySet, ProtocolKind,
    ProtocolResolver, ReqwestTransport, StreamCatalog, TrackType, TransportError, INLINE_MANIFEST_BASE,
};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tabled::{settings::Style, Table, Tabled};
use tokio::time::Instant;
use tracing::{info, warn};
use url::Url;

fn parse_url(raw: &str) -> anyhow::Result<Url> {
    Url::parse(raw).with_context(|| format!("invalid URL '{}'", raw))
}

fn parse_adapter(raw: &str) -> anyhow::Result<AdapterKind> {
    raw.parse::<AdapterKind>().map_err(anyhow::Error::msg)
}

fn catalog_from_args(url: &str, playlist: Option<&str>, hint: Option<&str>) -> anyhow::Result<StreamCatalog> {
    let mut catalog = StreamCatalog::from_manifest_url(parse_url(url)?);
    if let Some(playlist) = playlist {
        catalog = catalog.with_playlist_url(parse_url(playlist)?);
    }
    if let Some(hint) = hint {
        catalog = catalog.with_hint(parse_adapter(hint)?);
    }
    Ok(catalog)
}

#[derive(Serialize)]
struct ResolveReport {
    url: String,
    protocol: ProtocolKind,
    adapters: Vec<AdapterKind>,
    merged: bool,
}

/// Resolve the protocol of a URL, optionally probing it
pub async fn resolve(
    config: &EngineConfig,
    url: &str,
    playlist: Option<&str>,
    hint: Option<&str>,
    sniff: bool,
    format: &str,
) -> anyhow::Result<()> {
    let catalog = catalog_from_args(url, playlist, hint)?;
    let resolver = ProtocolResolver::new();
    let protocol = if sniff {
        let transport = ReqwestTransport::new(config)?;
        resolver.resolve_remote(&catalog, &transport).await?
    } else {
        resolver.resolve(&catalog)?
    };

    let report = ResolveReport {
        url: url.to_string(),
        protocol,
        adapters: protocol.adapters(),
        merged: protocol.is_merged(),
    };

    match OutputFormat::from(format) {
        OutputFormat::Json => println!("{}", output::to_json(&report)),
        OutputFormat::Table | OutputFormat::Text => {
            println!("Protocol: {}", style(protocol).cyan().bold());
            let adapters: Vec<_> = report.adapters.iter().map(|a| a.to_string()).collect();
            println!("Adapters: {}", adapters.join(", "));
        }
    }

    Ok(())
}

/// Parse a manifest from a URL or a local file
pub async fn inspect(
    config: &EngineConfig,
    source: &str,
    base_url: Option<&str>,
    protocol: Option<&str>,
    format: &str,
) -> anyhow::Result<()> {
    let (bytes, base) = if source.starts_with("http://") || source.starts_with("https://") {
        let url = parse_url(source)?;
        let transport = ReqwestTransport::new(config)?;
        let response = transport
            .fetch(&HttpRequest::get(url.clone()))
            .await
            .map_err(|e| anyhow::anyhow!("fetching {} failed: {}", url, e))?;
        if !response.is_success() {
            bail!("fetching {} failed with HTTP {}", url, response.status);
        }
        (response.body.to_vec(), url)
    } else {
        let bytes = tokio::fs::read(source)
            .await
            .with_context(|| format!("failed to read {}", source))?;
        let base = parse_url(base_url.unwrap_or(INLINE_MANIFEST_BASE))?;
        (bytes, base)
    };

    let kind = match protocol {
        Some(raw) => parse_adapter(raw)?,
        None => manifest::detect_from_extension(&base)
            .or_else(|| manifest::sniff_content(&bytes))
            .context("could not detect the manifest protocol; pass --protocol")?,
    };

    let parsed = manifest::parse_manifest(kind, &bytes, &base)?;
    info!(protocol = %kind, representations = parsed.representations.len(), "Manifest parsed");

    match OutputFormat::from(format) {
        OutputFormat::Json => println!("{}", output::to_json(&parsed.representations)),
        OutputFormat::Table | OutputFormat::Text => {
            println!("Protocol: {}", style(kind).cyan().bold());
            println!("Live: {}", parsed.timeline.is_live);
            match parsed.timeline.duration {
                Some(duration) => println!("Duration: {:.1}s", duration.as_secs_f64()),
                None => println!("Duration: unknown"),
            }
            for track_type in TrackType::ALL {
                let count = parsed
                    .representations
                    .iter()
                    .filter(|r| r.track_type == track_type)
                    .count();
                println!("{} representations: {}", track_type, count);
            }
            println!("{}", output::representation_table(&parsed.representations));
        }
    }

    Ok(())
}

/// Build the failure evaluated by `policy`
pub fn failure_from_args(status: Option<u16>, io: bool, parse: bool, message: &str) -> anyhow::Result<LoadFailure> {
    match (status, io, parse) {
        (Some(status), _, _) => Ok(LoadFailure::HttpStatus {
            status,
            message: message.to_string(),
        }),
        (None, true, _) if message.is_empty() => Ok(LoadFailure::Io(TransportError::Timeout)),
        (None, true, _) => Ok(LoadFailure::Io(TransportError::Other(message.to_string()))),
        (None, false, true) => Ok(LoadFailure::Parse(ParseErrorKind::MalformedManifest)),
        (None, false, false) => bail!("one of --status, --io or --parse is required"),
    }
}

#[derive(Serialize, Tabled)]
struct DecisionRow {
    #[tabled(rename = "Attempt")]
    attempt: u32,
    #[tabled(rename = "Elapsed (ms)")]
    elapsed_ms: u64,
    #[tabled(rename = "Decision")]
    decision: String,
}

/// Walk consecutive failures through the adapter's policy until it stops retrying
pub fn policy(
    config: &EngineConfig,
    failure: LoadFailure,
    attempts: u32,
    protocol: &str,
    format: &str,
) -> anyhow::Result<()> {
    let adapter = parse_adapter(protocol)?;
    let policy = PolicySet::protocol_defaults(&config.resilience)?.for_adapter(adapter);
    let url = parse_url("https://cdn.example.com/media/segment.m4s")?;

    let mut rows = Vec::new();
    let mut elapsed_ms = 0u64;
    for attempt in 1..=attempts.max(1) {
        let load = LoadAttempt::new(url.clone(), Some(TrackType::Video), failure.clone())
            .with_attempt(attempt, elapsed_ms);
        let decision = policy.on_load_failure(&load);
        rows.push(DecisionRow {
            attempt,
            elapsed_ms,
            decision: match decision {
                Decision::Retry(ms) => format!("retry in {}ms", ms),
                Decision::ExcludeTrack(ms) => format!("exclude for {}ms", ms),
                Decision::Fatal => "fatal".to_string(),
            },
        });
        match decision {
            Decision::Retry(ms) => elapsed_ms += ms,
            _ => break,
        }
    }

    match OutputFormat::from(format) {
        OutputFormat::Json => println!("{}", output::to_json(&rows)),
        OutputFormat::Table | OutputFormat::Text => {
            println!("Policy: {} ({})", policy.name(), adapter);
            println!("Failure: {}", failure);
            println!("{}", Table::new(&rows).with(Style::rounded()));
        }
    }

    Ok(())
}

fn format_position(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{:02}:{:02}.{:01}", secs / 60, secs % 60, (ms % 1000) / 100)
}

const TICK: Duration = Duration::from_millis(250);

/// Run a headless session, advancing the position while it plays
pub async fn play(
    config: EngineConfig,
    url: &str,
    playlist: Option<&str>,
    seconds: u64,
    speed: f32,
    paused: bool,
    format: &str,
) -> anyhow::Result<()> {
    let catalog = catalog_from_args(url, playlist, None)?.with_item_id(url);
    let ctx = Arc::new(EngineContext::with_reqwest(config)?);

    let (listener, mut events) = ChannelListener::new();
    let listener = Arc::new(listener);
    let session = PlaybackSession::builder(ctx.clone())
        .listener(listener.clone())
        .quality_sink(listener)
        .spawn()?;

    let event_format = format.to_string();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{}", output::event_line(&event, &event_format));
        }
    });

    let protocol = session.open(catalog).await?;
    info!(protocol = %protocol, "Stream opened");
    session.set_play_when_ready(!paused)?;
    session.set_speed(speed)?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.cyan} [{elapsed}] {msg}")?);
    spinner.enable_steady_tick(Duration::from_millis(120));

    let deadline = Instant::now() + Duration::from_secs(seconds);
    let mut ticker = tokio::time::interval(TICK);
    let mut position_ms = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted");
                break;
            }
        }
        if Instant::now() >= deadline {
            break;
        }

        let state = session.state();
        if state == PlaybackState::Playing {
            position_ms += (TICK.as_millis() as f64 * f64::from(speed)) as u64;
            session.report_position(position_ms)?;
        }
        if matches!(state, PlaybackState::Error(_)) {
            break;
        }
        spinner.set_message(format!("{} {}", state, format_position(position_ms)));
    }
    spinner.finish_and_clear();

    let snapshot = session.snapshot().await?;
    session.shutdown().await?;
    ctx.shutdown();
    // Ends once the session dropped its listener
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;

    match OutputFormat::from(format) {
        OutputFormat::Json => println!("{}", output::to_json(&snapshot)),
        OutputFormat::Table | OutputFormat::Text => {
            println!();
            println!("State: {}", style(snapshot.state).bold());
            println!("Protocol: {}", snapshot.protocol.map(|p| p.to_string()).unwrap_or_default());
            println!("Position: {}", format_position(snapshot.position_ms));
            if !snapshot.quality_label.is_empty() {
                println!("Quality: {}", snapshot.quality_label);
            }
            println!("Bandwidth: {:.2} Mbps", snapshot.bandwidth_estimate as f64 / 1_000_000.0);
            for (adapter, id) in &snapshot.excluded {
                println!("Excluded: {} {}", adapter, style(id).yellow());
            }
        }
    }

    if let PlaybackState::Error(kind) = snapshot.state {
        bail!("playback failed with a {} error", kind);
    }
    Ok(())
}
