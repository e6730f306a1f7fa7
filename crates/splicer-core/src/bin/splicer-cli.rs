use std::{
    io::{self, BufRead},
    path::PathBuf,
    thread,
    time::Duration,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use splicer_core::{
    AppConfig, AppContext, IoSpec, PortRef, RenderRequest, RenderTrack, Session, SplitOptions,
    StaticBed,
    assets::{probe_duration, probe_lengths, scan_audio_files},
    diagnostics::init_tracing,
    measure::measure,
    plan_render, render, split,
};

#[derive(Debug, Parser)]
#[command(name = "splicer-cli")]
#[command(about = "Crossfaded audio rendering and session recording over an ecasound server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file; defaults to discovery via SPLICER_CONFIG_PATH or the working directory.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Mix files (or every audio file under directories) into one crossfaded output.
    Render {
        inputs: Vec<PathBuf>,

        #[arg(long, short)]
        output: PathBuf,

        #[arg(long)]
        crossfade: Option<f64>,

        #[arg(long)]
        bed: Option<PathBuf>,

        #[arg(long)]
        seed: Option<u64>,
    },
    /// Print file durations in seconds as JSON.
    Measure {
        files: Vec<PathBuf>,

        /// Decode locally instead of asking the engine.
        #[arg(long)]
        local: bool,
    },
    /// Dry run: write descriptors and print the timeline and command list as JSON.
    Plan {
        inputs: Vec<PathBuf>,

        #[arg(long, short)]
        output: PathBuf,

        #[arg(long)]
        crossfade: Option<f64>,

        #[arg(long)]
        seed: Option<u64>,
    },
    /// Cut a recording into pieces between markers (seconds, comma separated).
    Split {
        file: PathBuf,

        #[arg(long, value_delimiter = ',')]
        markers: Vec<f64>,

        #[arg(long, default_value = "data/split")]
        output_dir: PathBuf,

        #[arg(long)]
        include_tail: bool,
    },
    Session {
        /// Session name; the configured default when omitted.
        #[arg(long)]
        name: Option<String>,

        #[command(subcommand)]
        command: SessionCommands,
    },
}

#[derive(Debug, Subcommand)]
enum SessionCommands {
    AddTrack {
        track: String,

        #[arg(long, default_value_t = 1)]
        channels: u16,

        /// Capture port as `owner:port`.
        #[arg(long)]
        capture: Option<String>,

        /// Engine-native input string.
        #[arg(long, conflicts_with = "capture")]
        input: Option<String>,

        /// Engine-native output string; the master output when omitted.
        #[arg(long)]
        output: Option<String>,

        #[arg(long = "operator")]
        operators: Vec<String>,
    },
    Arm {
        track: String,

        #[arg(long)]
        off: bool,
    },
    /// Start the session with recording enabled; stops after `--seconds` or on Enter.
    Record {
        #[arg(long)]
        seconds: Option<u64>,
    },
    Stop,
    Show,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load_or_default()?,
    };
    let _telemetry = init_tracing(&config.diagnostics)?;
    let mut context = AppContext::new(config);

    match cli.command {
        Commands::Render {
            inputs,
            output,
            crossfade,
            bed,
            seed,
        } => {
            let mut request = render_request(&context, &inputs, output, crossfade, seed)?;
            if let Some(source) = bed {
                request.options.static_bed = Some(StaticBed {
                    source,
                    amplitude_pct: context.config().render.bed_amplitude_pct,
                });
            }
            context.init_engine()?;
            let report = render(&context, request)?;
            tracing::info!(
                output = %report.output.display(),
                duration = report.timeline.duration(),
                "render written"
            );
        }
        Commands::Measure { files, local } => {
            let lengths = if local {
                files
                    .iter()
                    .map(PathBuf::as_path)
                    .map(probe_duration)
                    .collect::<anyhow::Result<Vec<_>>>()?
            } else {
                context.init_engine()?;
                let policy = context.poll_policy();
                context.with_engine(|engine| measure(engine, &files, &policy))?
            };
            let report: Vec<_> = files
                .iter()
                .zip(lengths)
                .map(|(file, length)| json!({ "file": file, "length": length }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Plan {
            inputs,
            output,
            crossfade,
            seed,
        } => {
            let mut request = render_request(&context, &inputs, output, crossfade, seed)?;
            probe_lengths(&mut request.tracks)?;
            let report = plan_render(&request, &context.config().render)?;
            let commands: Vec<String> = report.commands.iter().map(ToString::to_string).collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "timeline": report.timeline,
                    "commands": commands,
                }))?
            );
        }
        Commands::Split {
            file,
            markers,
            output_dir,
            include_tail,
        } => {
            let mut options = SplitOptions::new(output_dir);
            options.include_tail = include_tail;
            context.init_engine()?;
            let policy = context.poll_policy();
            let segments =
                context.with_engine(|engine| split(engine, &file, &markers, &options, &policy))?;
            for segment in segments {
                println!("{}", segment.output.display());
            }
        }
        Commands::Session { name, command } => {
            let name = name.unwrap_or_else(|| context.config().session.default_name.clone());
            context.select_session(&name)?;
            run_session_command(&mut context, command)?;
        }
    }

    Ok(())
}

fn render_request(
    context: &AppContext,
    inputs: &[PathBuf],
    output: PathBuf,
    crossfade: Option<f64>,
    seed: Option<u64>,
) -> anyhow::Result<RenderRequest> {
    let tracks = collect_tracks(inputs)?;
    let mut request = RenderRequest::from_config(tracks, output, &context.config().render);
    if let Some(crossfade) = crossfade {
        request.options.crossfade = crossfade;
    }
    request.seed = seed;
    Ok(request)
}

/// Files are taken as given; directories contribute their audio files in path order.
fn collect_tracks(inputs: &[PathBuf]) -> anyhow::Result<Vec<RenderTrack>> {
    let mut tracks = Vec::new();
    for input in inputs {
        if input.is_dir() {
            tracks.extend(scan_audio_files(input)?);
        } else {
            tracks.push(RenderTrack::new(input.clone()));
        }
    }
    if tracks.is_empty() {
        anyhow::bail!("no input files given");
    }
    Ok(tracks)
}

fn run_session_command(context: &mut AppContext, command: SessionCommands) -> anyhow::Result<()> {
    match command {
        SessionCommands::AddTrack {
            track,
            channels,
            capture,
            input,
            output,
            operators,
        } => {
            let session = current_session(context)?;
            let entry = session.track_or_create(&track)?;
            entry.channels = channels.max(1);
            entry.input = match (capture, input) {
                (Some(capture), _) => vec![IoSpec::RoutingPort(parse_port(&capture)?)],
                (None, Some(input)) => vec![IoSpec::Direct(input)],
                (None, None) => Vec::new(),
            };
            entry.output = vec![output.map_or(IoSpec::Master, IoSpec::Direct)];
            entry.operators = operators;
            entry.monitor = true;
            session.touch();
            let path = session.save()?;
            tracing::info!(track = %track, path = %path.display(), "track saved");
        }
        SessionCommands::Arm { track, off } => {
            let session = current_session(context)?;
            let entry = session
                .track_mut(&track)
                .with_context(|| format!("no such track: {track}"))?;
            entry.record = !off;
            session.touch();
            session.save()?;
        }
        SessionCommands::Record { seconds } => {
            context.set_record_enabled(true);
            context.init_engine()?;
            context.start_session()?;
            wait_for_stop(seconds)?;
            let advanced = context.stop_session()?;
            println!("{}", serde_json::to_string_pretty(&advanced)?);
        }
        SessionCommands::Stop => {
            context.init_engine()?;
            context.stop_session()?;
        }
        SessionCommands::Show => {
            let session = current_session(context)?;
            println!("{}", serde_json::to_string_pretty(&*session)?);
        }
    }
    Ok(())
}

fn current_session(context: &mut AppContext) -> anyhow::Result<&mut Session> {
    context.session_mut().context("no session selected")
}

fn parse_port(value: &str) -> anyhow::Result<PortRef> {
    let (owner, port) = value
        .split_once(':')
        .with_context(|| format!("expected owner:port, got {value:?}"))?;
    Ok(PortRef::new(owner, port))
}

fn wait_for_stop(seconds: Option<u64>) -> anyhow::Result<()> {
    match seconds {
        Some(seconds) => thread::sleep(Duration::from_secs(seconds)),
        None => {
            eprintln!("recording, press Enter to stop");
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
        }
    }
    Ok(())
}
