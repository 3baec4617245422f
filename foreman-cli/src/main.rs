//! foreman CLI - command-line interface
//!
//! Two modes: `run` fires a single target and streams its output, `serve`
//! loads a TOML job file and schedules until interrupted.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use foreman::{
    ConcurrencyPolicy, Engine, EngineConfig, EngineEvent, JobOptions, RunState, Schedule,
    StreamKind, TargetSpec, Topic,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    /// Drop fire times that land while a prior run is active
    Skip,
    /// Queue runs behind the active one, FIFO
    Queue,
    /// Let runs overlap freely
    Overlap,
}

impl From<PolicyArg> for ConcurrencyPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Skip => ConcurrencyPolicy::Skip,
            PolicyArg::Queue => ConcurrencyPolicy::Queue,
            PolicyArg::Overlap => ConcurrencyPolicy::Overlap,
        }
    }
}

#[derive(Parser)]
#[command(name = "foreman")]
#[command(about = "Schedule and supervise commands, scripts and callables", long_about = None)]
struct Cli {
    /// Directory for the session log file
    #[arg(long, default_value = ".foreman")]
    log_dir: String,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run a target once, streaming its output; exits with its status
    Run {
        /// The command (or module/script path) to run
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,

        /// Interpret the command through `sh -c`
        #[arg(long)]
        shell: bool,

        /// Working directory for the target
        #[arg(long)]
        cwd: Option<PathBuf>,
    },
    /// Load a TOML job file and schedule until Ctrl-C
    Serve {
        /// Path to the job file
        #[arg(long)]
        config: PathBuf,
    },
}

/// One `[[job]]` table in the job file. Exactly one of `cron`,
/// `every_secs` or `once` selects the schedule.
#[derive(Debug, serde::Deserialize)]
struct JobEntry {
    target: String,
    name: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    kwargs: BTreeMap<String, String>,
    #[serde(default)]
    shell: bool,
    cwd: Option<PathBuf>,
    policy: ConcurrencyPolicy,
    cron: Option<String>,
    every_secs: Option<u64>,
    #[serde(default)]
    once: bool,
}

#[derive(Debug, serde::Deserialize)]
struct JobFile {
    timezone: Option<String>,
    interpreter: Option<String>,
    #[serde(default)]
    job: Vec<JobEntry>,
}

impl JobEntry {
    fn schedule(&self) -> Result<Schedule, String> {
        match (&self.cron, self.every_secs, self.once) {
            (Some(expr), None, false) => {
                Schedule::cron(expr).map_err(|e| e.to_string())
            }
            (None, Some(secs), false) => {
                Schedule::interval(Duration::from_secs(secs)).map_err(|e| e.to_string())
            }
            (None, None, true) => Ok(Schedule::immediate()),
            _ => Err(format!(
                "job {:?}: set exactly one of cron, every_secs, once",
                self.name.as_deref().unwrap_or(&self.target)
            )),
        }
    }

    fn spec(&self) -> TargetSpec {
        let mut spec = TargetSpec::command(&self.target)
            .with_args(self.args.clone())
            .with_kwargs(self.kwargs.clone())
            .shell(self.shell);
        if let Some(cwd) = &self.cwd {
            spec = spec.with_cwd(cwd.clone());
        }
        spec
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let _logging = match foreman::logging::init_logging(&cli.log_dir, "foreman.log") {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("error: failed to initialize logging: {err}");
            process::exit(1);
        }
    };

    let code = match cli.command {
        CliCommand::Run { command, shell, cwd } => run_once(command, shell, cwd).await,
        CliCommand::Serve { config } => serve(config).await,
    };
    process::exit(code);
}

/// Fires one ad-hoc run and mirrors its output until it finishes.
async fn run_once(command: Vec<String>, shell: bool, cwd: Option<PathBuf>) -> i32 {
    let engine = Engine::new(EngineConfig::default());

    let mut spec = if shell {
        TargetSpec::command(command.join(" ")).shell(true)
    } else if command.len() == 1 {
        TargetSpec::command(&command[0])
    } else {
        TargetSpec::argv(command)
    };
    if let Some(cwd) = cwd {
        spec = spec.with_cwd(cwd);
    }

    let (_, run_id) = match engine.run_job(spec, JobOptions::new(ConcurrencyPolicy::Overlap)) {
        Ok(ids) => ids,
        Err(err) => {
            eprintln!("error: {err}");
            return 1;
        }
    };

    let output = match engine.subscribe_output(run_id) {
        Ok(output) => output,
        Err(err) => {
            eprintln!("error: {err}");
            return 1;
        }
    };
    while let Some(chunk) = output.recv().await {
        use std::io::Write;
        match chunk.stream {
            StreamKind::Stdout => {
                let _ = std::io::stdout().write_all(&chunk.data);
            }
            StreamKind::Stderr => {
                let _ = std::io::stderr().write_all(&chunk.data);
            }
        }
    }

    let code = match engine.wait_run(run_id, None).await {
        Ok(_) => {
            let run = engine.get_run(run_id);
            match run {
                Some(run) => match (run.state(), run.outcome()) {
                    (RunState::Succeeded, _) => 0,
                    (_, Some(outcome)) => {
                        if let Some(error) = &outcome.error {
                            eprintln!("error: {error}");
                        }
                        outcome.exit_code.unwrap_or(1)
                    }
                    _ => 1,
                },
                None => 1,
            }
        }
        Err(err) => {
            eprintln!("error: {err}");
            1
        }
    };
    engine.shutdown().await;
    code
}

/// Schedules every job in the file and runs until Ctrl-C.
async fn serve(config: PathBuf) -> i32 {
    let file = match load_job_file(&config) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("error: {err}");
            return 1;
        }
    };

    let mut engine_config = EngineConfig::default();
    if let Some(tz) = &file.timezone {
        match tz.parse() {
            Ok(tz) => engine_config.timezone = tz,
            Err(_) => {
                eprintln!("error: unknown timezone {tz:?}");
                return 1;
            }
        }
    }
    if let Some(interpreter) = &file.interpreter {
        engine_config.interpreter = interpreter.clone();
    }

    let engine = Engine::new(engine_config);
    for entry in &file.job {
        let schedule = match entry.schedule() {
            Ok(schedule) => schedule,
            Err(err) => {
                eprintln!("error: {err}");
                return 1;
            }
        };
        let mut options = JobOptions::new(entry.policy);
        if let Some(name) = &entry.name {
            options = options.named(name.clone());
        }
        match engine.add_job(entry.spec(), schedule, options) {
            Ok(job_id) => tracing::info!(%job_id, target = %entry.target, "job loaded"),
            Err(err) => {
                eprintln!("error: job {:?}: {err}", entry.target);
                return 1;
            }
        }
    }

    // Surface run outcomes while serving.
    let events = engine.subscribe(Topic::All);
    let reporter = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let EngineEvent::RunFinished {
                job_id,
                run_id,
                state,
                exit_code,
                error,
            } = event
            {
                tracing::info!(%job_id, %run_id, %state, ?exit_code, ?error, "run finished");
            }
        }
    });

    if tokio::signal::ctrl_c().await.is_err() {
        eprintln!("error: failed to listen for shutdown signal");
    }
    tracing::info!("interrupt received, shutting down");
    engine.shutdown().await;
    reporter.abort();
    0
}

fn load_job_file(path: &PathBuf) -> Result<JobFile, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    toml::from_str(&text).map_err(|e| format!("cannot parse {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_file_parses() {
        let file: JobFile = toml::from_str(
            r#"
            timezone = "Asia/Shanghai"

            [[job]]
            target = "sync.py"
            name = "inventory"
            policy = "skip"
            cron = "0 3 * * *"

            [[job]]
            target = "echo tick"
            policy = "overlap"
            every_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(file.timezone.as_deref(), Some("Asia/Shanghai"));
        assert_eq!(file.job.len(), 2);
        assert!(file.job[0].schedule().is_ok());
        assert!(file.job[1].schedule().is_ok());
    }

    #[test]
    fn test_job_entry_requires_one_schedule() {
        let entry: JobEntry = toml::from_str(
            r#"
            target = "echo hi"
            policy = "overlap"
            "#,
        )
        .unwrap();
        assert!(entry.schedule().is_err());

        let entry: JobEntry = toml::from_str(
            r#"
            target = "echo hi"
            policy = "overlap"
            once = true
            every_secs = 5
            "#,
        )
        .unwrap();
        assert!(entry.schedule().is_err());
    }
}
