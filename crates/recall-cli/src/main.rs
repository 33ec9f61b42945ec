use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;
use recall_runner::{
    Experiment, HandshakeOptions, InitRequest, Message, ResumeReport, ResumeState, RunnerError,
    SessionPaths, Settings, StimMode,
};
use serde_json::{json, Value};
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "recall", version = "0.3.0", about = "Trial lists and session state for recognition memory experiments")]
struct Cli {
    /// Debug-level logging on stderr.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ExperimentArg {
    #[value(name = "associative_recognition")]
    AssociativeRecognition,
    #[value(name = "item_consolidation")]
    ItemConsolidation,
    #[value(name = "time_associative_recognition")]
    TimeAssociativeRecognition,
    #[value(name = "timed_sequence_recognition")]
    TimedSequenceRecognition,
    #[value(name = "stimulation_parameter_search")]
    StimulationParameterSearch,
}

impl From<ExperimentArg> for Experiment {
    fn from(value: ExperimentArg) -> Self {
        match value {
            ExperimentArg::AssociativeRecognition => Experiment::AssociativeRecognition,
            ExperimentArg::ItemConsolidation => Experiment::ItemConsolidation,
            ExperimentArg::TimeAssociativeRecognition => Experiment::TimeAssociativeRecognition,
            ExperimentArg::TimedSequenceRecognition => Experiment::TimedSequenceRecognition,
            ExperimentArg::StimulationParameterSearch => Experiment::StimulationParameterSearch,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StimModeArg {
    #[value(name = "none")]
    None,
    #[value(name = "open")]
    Open,
    #[value(name = "closed")]
    Closed,
}

impl From<StimModeArg> for StimMode {
    fn from(value: StimModeArg) -> Self {
        match value {
            StimModeArg::None => StimMode::None,
            StimModeArg::Open => StimMode::Open,
            StimModeArg::Closed => StimMode::Closed,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    Init {
        #[arg(value_enum)]
        experiment: ExperimentArg,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        session: String,
        #[arg(long)]
        data_dir: PathBuf,
        #[arg(long)]
        blocks: Option<u32>,
        #[arg(long, default_value = "resources")]
        resources: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    Resume {
        #[arg(value_enum)]
        experiment: ExperimentArg,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        session: String,
        #[arg(long)]
        data_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Status {
        #[arg(long)]
        subject: String,
        #[arg(long)]
        session: String,
        #[arg(long)]
        data_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Handshake {
        #[arg(long)]
        subject: String,
        #[arg(long)]
        session: String,
        #[arg(long)]
        data_dir: PathBuf,
        /// host:port of the stimulation server.
        #[arg(long)]
        server: String,
        #[arg(long, value_enum, default_value = "associative_recognition")]
        experiment: ExperimentArg,
        #[arg(long, value_enum, default_value = "none")]
        stim_mode: StimModeArg,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long, default_value_t = recall_runner::protocol::DEFAULT_HEARTBEATS)]
        heartbeats: usize,
        #[arg(long, default_value_t = 10)]
        timeout_seconds: u64,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&error_payload(&err));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Init {
            experiment,
            subject,
            session,
            data_dir,
            blocks,
            resources,
            config,
            seed,
            json,
        } => {
            let settings = Settings::load(config.as_deref())?;
            let seed = seed.unwrap_or_else(rand::random::<u64>);
            let mut rng = StdRng::seed_from_u64(seed);
            let request = InitRequest {
                experiment: experiment.into(),
                subject,
                session,
                data_dir,
                resources,
                blocks,
                seed: Some(seed),
            };
            let result = recall_runner::initialize(&request, &settings, &mut rng)?;
            let recorded_seed = result.created.then_some(seed);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "init",
                    "experiment": request.experiment.as_str(),
                    "session_dir": result.session_dir.display().to_string(),
                    "trial_list": result.trial_list.as_ref().map(|p| p.display().to_string()),
                    "created": result.created,
                    "blocks": result.blocks,
                    "seed": recorded_seed,
                    "block_list_digest": result.block_list_digest,
                    "created_logs": result
                        .created_logs
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>(),
                })));
            }
            println!("experiment: {}", request.experiment);
            println!("session_dir: {}", result.session_dir.display());
            match (&result.trial_list, result.created) {
                (Some(list), true) => {
                    println!("trial_list: {}", list.display());
                    println!("seed: {}", seed);
                    if let Some(digest) = &result.block_list_digest {
                        println!("block_list_digest: {}", digest);
                    }
                }
                (Some(list), false) => println!("already initialized: {}", list.display()),
                (None, _) => println!("stimulation off: logs only, no stimulus list"),
            }
        }
        Commands::Resume {
            experiment,
            subject,
            session,
            data_dir,
            json,
        } => {
            let paths = SessionPaths::new(&data_dir, &subject, &session);
            let report = recall_runner::resume(experiment.into(), &paths)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "resume",
                    "session_dir": paths.dir().display().to_string(),
                    "complete": report.is_complete(),
                    "remaining_trials": report.remaining_trials(),
                    "report": report,
                })));
            }
            print_resume(&paths, &report);
        }
        Commands::Status {
            subject,
            session,
            data_dir,
            json,
        } => {
            let paths = SessionPaths::new(&data_dir, &subject, &session);
            let status = recall_runner::status(&paths)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "session_dir": status.session_dir.display().to_string(),
                    "experiment": status.experiment,
                    "locked": status.locked,
                    "files": status.files,
                    "checkpoint_rows": status.checkpoint_rows,
                })));
            }
            println!("session_dir: {}", status.session_dir.display());
            println!("experiment: {}", status.experiment.as_deref().unwrap_or("unknown"));
            println!("locked: {}", status.locked);
            println!("checkpoint_rows: {}", status.checkpoint_rows);
            for (name, present) in &status.files {
                println!("  {} {}", if *present { "+" } else { "-" }, name);
            }
        }
        Commands::Handshake {
            subject,
            session,
            data_dir,
            server,
            experiment,
            stim_mode,
            tags,
            heartbeats,
            timeout_seconds,
            json,
        } => {
            Settings::default().validate_subject(&subject)?;
            let paths = SessionPaths::new(&data_dir, &subject, &session);
            let stream = TcpStream::connect(&server)
                .map_err(|e| anyhow!("connect_failed: {}: {}", server, e))?;
            stream.set_read_timeout(Some(Duration::from_secs(timeout_seconds)))?;
            tracing::info!(server = %server, heartbeats, "connected to stimulation server");
            let experiment: Experiment = experiment.into();
            let configure = Message::Configure {
                stim_mode: stim_mode.into(),
                experiment: experiment.as_str().to_string(),
                subject: subject.clone(),
                tags,
            };
            let options = HandshakeOptions {
                heartbeats,
                ..HandshakeOptions::default()
            };
            let ctx = recall_runner::handshake(stream, &paths, configure, &options)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "handshake",
                    "server": server,
                    "messages_sent": ctx.message_id(),
                    "heartbeats": ctx.heartbeat_count(),
                    "communications": paths.communications().display().to_string(),
                })));
            }
            println!("server: {}", server);
            println!("messages_sent: {}", ctx.message_id());
            println!("heartbeats: {}", ctx.heartbeat_count());
        }
    }
    Ok(None)
}

fn print_resume(paths: &SessionPaths, report: &ResumeReport) {
    println!("session_dir: {}", paths.dir().display());
    if report.is_complete() {
        println!("session already completed; nothing to run");
        return;
    }
    if report.state == ResumeState::NoTrials {
        println!("no trials: session runs without stimulation");
        return;
    }
    println!("state: {:?}", report.state);
    println!("skip_study_phase: {}", report.skip_study_phase);
    println!("remaining_trials: {}", report.remaining_trials());
    for segment in &report.remaining {
        let block = segment
            .block
            .map(|b| format!("block {} ", b))
            .unwrap_or_default();
        let phase = segment.phase.as_deref().unwrap_or("trials");
        println!("  {}{}: {}", block, phase, segment.trials);
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(err) => {
            let err = RunnerError::from(err);
            println!("{}", json_error(err.code(), err.to_string(), json!({})));
        }
    }
}

/// Library errors keep their own code; anything else is `command_failed`.
fn error_payload(err: &anyhow::Error) -> Value {
    let code = err
        .downcast_ref::<RunnerError>()
        .map(|e| e.code())
        .unwrap_or("command_failed");
    json_error(code, err.to_string(), json!({}))
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Init { json, .. }
        | Commands::Resume { json, .. }
        | Commands::Status { json, .. }
        | Commands::Handshake { json, .. } => *json,
    }
}
