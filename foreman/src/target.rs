//! Executable target resolution.
//!
//! A [`TargetSpec`] describes *what to run* the way a user writes it: a
//! shell command, a registered callable, a dotted module path, or a script
//! path. Resolution normalizes the spec into a [`Descriptor`] holding a
//! closed [`Target`] variant plus the default execution [`Substrate`].
//! Resolution happens once, at a defined boundary — never per tick.
//!
//! String forms follow the conventions of the source material:
//!
//! - `"crawl.py:main"` → script entry (callable registry, thread substrate)
//! - `"crawl.prices:main"` → module entry (callable registry, thread)
//! - `"crawl.py"` → script (interpreter process)
//! - `"crawl.prices"` → module (interpreter `-m` process)
//! - anything else, or `shell=true` → shell command (process)
//!
//! Entry-point forms (`:entry`) resolve against the engine's
//! [`CallableRegistry`]; Rust cannot load code from a string, so the
//! registry is the explicit seam where in-process callables are named.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::backend::context::RunContext;
use crate::error::{Error, Result};

// =============================================================================
// Substrate
// =============================================================================

/// The concurrency primitive backing a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Substrate {
    /// A fresh blocking thread per run.
    ThreadDedicated,
    /// The bounded blocking-thread pool (FIFO beyond capacity).
    ThreadPooled,
    /// An OS process per run, dispatched immediately.
    ProcessDedicated,
    /// An OS process per run, gated by the bounded process pool.
    ProcessPooled,
}

impl Substrate {
    /// Returns true for the two process-backed substrates.
    pub fn is_process(&self) -> bool {
        matches!(self, Self::ProcessDedicated | Self::ProcessPooled)
    }

    /// Returns true for the two pooled substrates.
    pub fn is_pooled(&self) -> bool {
        matches!(self, Self::ThreadPooled | Self::ProcessPooled)
    }
}

impl fmt::Display for Substrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ThreadDedicated => write!(f, "thread"),
            Self::ThreadPooled => write!(f, "thread-pooled"),
            Self::ProcessDedicated => write!(f, "process"),
            Self::ProcessPooled => write!(f, "process-pooled"),
        }
    }
}

// =============================================================================
// Callables
// =============================================================================

/// Result of an in-process callable.
pub type CallableResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// An in-process callable target.
///
/// Callables receive a [`RunContext`] carrying their arguments, an output
/// writer, and a cooperative cancellation token. Long-running callables
/// should check [`RunContext::is_cancelled`] periodically; forced
/// preemption of a callable that never checks is not possible.
pub type Callable = Arc<dyn Fn(&RunContext) -> CallableResult + Send + Sync>;

/// Registry of named in-process callables.
///
/// Module-entry (`"pkg.mod:main"`) and script-entry (`"job.py:main"`)
/// targets are resolved against this registry by their full source string.
#[derive(Default)]
pub struct CallableRegistry {
    entries: DashMap<String, Callable>,
}

impl CallableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callable under a dotted `module:entry` or
    /// `script.py:entry` name. Replaces any previous registration.
    pub fn register<F>(&self, name: impl Into<String>, func: F)
    where
        F: Fn(&RunContext) -> CallableResult + Send + Sync + 'static,
    {
        self.entries.insert(name.into(), Arc::new(func));
    }

    /// Looks up a registered callable.
    pub fn get(&self, name: &str) -> Option<Callable> {
        self.entries.get(name).map(|e| e.value().clone())
    }
}

impl fmt::Debug for CallableRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallableRegistry")
            .field("entries", &self.entries.len())
            .finish()
    }
}

// =============================================================================
// Target spec (user-facing)
// =============================================================================

#[derive(Clone)]
enum TargetSource {
    /// A command string, split or shell-interpreted depending on the flag.
    Command(String),
    /// An explicit argv list; never shell-interpreted.
    Argv(Vec<String>),
    /// A directly supplied callable with a display name.
    Callable { name: String, func: Callable },
}

/// User-facing description of an executable, before resolution.
#[derive(Clone)]
pub struct TargetSpec {
    source: TargetSource,
    args: Vec<String>,
    kwargs: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
    shell: bool,
    substrate: Option<Substrate>,
}

impl TargetSpec {
    /// Target from a command string (shell command, module path, or script
    /// path — disambiguated at resolution).
    pub fn command(source: impl Into<String>) -> Self {
        Self {
            source: TargetSource::Command(source.into()),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            cwd: None,
            shell: false,
            substrate: None,
        }
    }

    /// Target from an explicit argv list; always a direct command.
    pub fn argv(argv: Vec<String>) -> Self {
        Self {
            source: TargetSource::Argv(argv),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            cwd: None,
            shell: false,
            substrate: None,
        }
    }

    /// Target from an in-process callable.
    pub fn callable<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&RunContext) -> CallableResult + Send + Sync + 'static,
    {
        Self {
            source: TargetSource::Callable {
                name: name.into(),
                func: Arc::new(func),
            },
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            cwd: None,
            shell: false,
            substrate: None,
        }
    }

    /// Positional arguments appended to the invocation.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Keyword arguments; rendered as `--key value` pairs for process
    /// targets, passed through the run context for callables.
    pub fn with_kwargs<I, K, V>(mut self, kwargs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.kwargs = kwargs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    /// Working directory for process targets.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Force shell interpretation of a command string.
    pub fn shell(mut self, shell: bool) -> Self {
        self.shell = shell;
        self
    }

    /// Override the default substrate chosen at resolution.
    pub fn on(mut self, substrate: Substrate) -> Self {
        self.substrate = Some(substrate);
        self
    }
}

impl fmt::Debug for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            TargetSource::Command(c) => c.clone(),
            TargetSource::Argv(a) => a.join(" "),
            TargetSource::Callable { name, .. } => format!("<callable {name}>"),
        };
        f.debug_struct("TargetSpec")
            .field("source", &source)
            .field("args", &self.args)
            .field("shell", &self.shell)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Resolved target
// =============================================================================

/// The closed set of invocable target kinds.
#[derive(Clone)]
pub enum Target {
    /// External command: argv list, or a raw string run via `sh -c`.
    ShellCommand { argv: Vec<String>, via_shell: bool },
    /// A directly supplied in-process callable.
    Callable { name: String, func: Callable },
    /// Dotted module path, with an optional in-process entry point.
    ModuleEntry {
        module: String,
        entry: Option<String>,
    },
    /// Script path, with an optional in-process entry point.
    ScriptEntry {
        path: PathBuf,
        entry: Option<String>,
    },
}

impl Target {
    /// Short kind name for logs and snapshots.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ShellCommand { .. } => "shell",
            Self::Callable { .. } => "callable",
            Self::ModuleEntry { .. } => "module",
            Self::ScriptEntry { .. } => "script",
        }
    }

    /// The source string a user would recognize.
    pub fn source(&self) -> String {
        match self {
            Self::ShellCommand { argv, .. } => argv.join(" "),
            Self::Callable { name, .. } => name.clone(),
            Self::ModuleEntry { module, entry } => match entry {
                Some(e) => format!("{module}:{e}"),
                None => module.clone(),
            },
            Self::ScriptEntry { path, entry } => match entry {
                Some(e) => format!("{}:{e}", path.display()),
                None => path.display().to_string(),
            },
        }
    }

    fn default_substrate(&self) -> Substrate {
        match self {
            // Callables and entry-point forms run in-process.
            Self::Callable { .. } => Substrate::ThreadPooled,
            Self::ModuleEntry { entry: Some(_), .. } => Substrate::ThreadPooled,
            Self::ScriptEntry { entry: Some(_), .. } => Substrate::ThreadPooled,
            // Everything else spawns a process.
            _ => Substrate::ProcessDedicated,
        }
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("kind", &self.kind())
            .field("source", &self.source())
            .finish()
    }
}

/// How `rerun` argument overrides combine with the original arguments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgsMode {
    /// Original args followed by the override args.
    Append,
    /// Override args exactly, original args discarded.
    Replace,
}

/// A resolved, invocable descriptor: target + bound arguments + substrate.
#[derive(Clone, Debug)]
pub struct Descriptor {
    pub target: Target,
    pub args: Vec<String>,
    pub kwargs: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub substrate: Substrate,
}

impl Descriptor {
    /// Resolves a spec into a descriptor.
    ///
    /// This validates the *shape* of the target (empty commands, malformed
    /// entry forms are rejected here with [`Error::Resolution`]). Registry
    /// lookups for entry-point forms are validated separately via
    /// [`Descriptor::resolve_callable`], which may be deferred to dispatch.
    pub fn resolve(spec: TargetSpec) -> Result<Self> {
        let target = match spec.source {
            TargetSource::Callable { name, func } => Target::Callable { name, func },
            TargetSource::Argv(argv) => {
                if argv.is_empty() {
                    return Err(Error::Resolution("empty argv".into()));
                }
                if spec.shell {
                    return Err(Error::Resolution(
                        "shell interpretation applies to command strings, not argv lists".into(),
                    ));
                }
                Target::ShellCommand {
                    argv,
                    via_shell: false,
                }
            }
            TargetSource::Command(source) => classify_command(&source, spec.shell)?,
        };

        let substrate = spec.substrate.unwrap_or_else(|| target.default_substrate());
        Ok(Self {
            target,
            args: spec.args,
            kwargs: spec.kwargs,
            cwd: spec.cwd,
            substrate,
        })
    }

    /// Returns the in-process callable for thread-backed targets.
    ///
    /// For entry-point forms this is the deferred half of resolution: a
    /// registry miss here is a [`Error::Resolution`] that the backend
    /// records on the run instead of raising.
    pub fn resolve_callable(&self, registry: &CallableRegistry) -> Result<Callable> {
        match &self.target {
            Target::Callable { func, .. } => Ok(func.clone()),
            Target::ModuleEntry {
                module,
                entry: Some(entry),
            } => {
                let key = format!("{module}:{entry}");
                registry
                    .get(&key)
                    .ok_or_else(|| Error::Resolution(format!("no callable registered for {key:?}")))
            }
            Target::ScriptEntry {
                path,
                entry: Some(entry),
            } => {
                let key = format!("{}:{entry}", path.display());
                registry
                    .get(&key)
                    .ok_or_else(|| Error::Resolution(format!("no callable registered for {key:?}")))
            }
            other => Err(Error::Resolution(format!(
                "{} target is not thread-invocable",
                other.kind()
            ))),
        }
    }

    /// Builds the program + argv for process-backed targets.
    ///
    /// Keyword arguments render as `--key value` pairs after the
    /// positional args.
    pub fn command_line(&self, interpreter: &str) -> Result<(String, Vec<String>)> {
        let mut tail = self.args.clone();
        for (key, value) in &self.kwargs {
            tail.push(format!("--{key}"));
            tail.push(value.clone());
        }

        match &self.target {
            Target::ShellCommand { argv, via_shell } => {
                if *via_shell {
                    // The whole string goes to the shell; extra args are
                    // appended to the command text.
                    let mut text = argv.join(" ");
                    for arg in &tail {
                        text.push(' ');
                        text.push_str(arg);
                    }
                    Ok(("sh".to_string(), vec!["-c".to_string(), text]))
                } else {
                    let mut full = argv.clone();
                    full.extend(tail);
                    let program = full.remove(0);
                    Ok((program, full))
                }
            }
            Target::ModuleEntry { module, entry: None } => {
                let mut full = vec!["-m".to_string(), module.clone()];
                full.extend(tail);
                Ok((interpreter.to_string(), full))
            }
            Target::ScriptEntry { path, entry: None } => {
                let mut full = vec![path.display().to_string()];
                full.extend(tail);
                Ok((interpreter.to_string(), full))
            }
            other => Err(Error::Resolution(format!(
                "{} target is not process-invocable",
                other.kind()
            ))),
        }
    }

    /// Rebinds positional arguments for a rerun.
    pub fn bind(&self, args_override: Vec<String>, mode: ArgsMode) -> Self {
        let args = match mode {
            ArgsMode::Replace => args_override,
            ArgsMode::Append => {
                let mut args = self.args.clone();
                args.extend(args_override);
                args
            }
        };
        Self {
            target: self.target.clone(),
            args,
            kwargs: self.kwargs.clone(),
            cwd: self.cwd.clone(),
            substrate: self.substrate,
        }
    }
}

// =============================================================================
// Command classification
// =============================================================================

/// Classifies a command string into its target kind.
///
/// Mirrors the single-token rules documented at module level; multi-token
/// strings are always external commands.
fn classify_command(source: &str, shell: bool) -> Result<Target> {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return Err(Error::Resolution("empty command".into()));
    }

    if shell {
        return Ok(Target::ShellCommand {
            argv: vec![trimmed.to_string()],
            via_shell: true,
        });
    }

    let parts = split_command(trimmed)?;
    if parts.len() == 1 {
        let token = &parts[0];
        if let Some((head, entry)) = token.split_once(':') {
            if head.is_empty() || entry.is_empty() {
                return Err(Error::Resolution(format!("malformed entry form {token:?}")));
            }
            if head.ends_with(".py") {
                return Ok(Target::ScriptEntry {
                    path: PathBuf::from(head),
                    entry: Some(entry.to_string()),
                });
            }
            return Ok(Target::ModuleEntry {
                module: head.to_string(),
                entry: Some(entry.to_string()),
            });
        }
        if token.ends_with(".py") {
            return Ok(Target::ScriptEntry {
                path: PathBuf::from(token.clone()),
                entry: None,
            });
        }
        if !token.starts_with('.') && token.contains('.') {
            return Ok(Target::ModuleEntry {
                module: token.clone(),
                entry: None,
            });
        }
    }

    Ok(Target::ShellCommand {
        argv: parts,
        via_shell: false,
    })
}

/// Splits a command string on whitespace, honoring single and double
/// quotes. Quotes delimit tokens; there is no escape processing beyond
/// that (users needing shell semantics set `shell=true`).
fn split_command(text: &str) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for ch in text.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None if ch == '\'' || ch == '"' => {
                quote = Some(ch);
                in_token = true;
            }
            None if ch.is_whitespace() => {
                if in_token {
                    parts.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(ch);
                in_token = true;
            }
        }
    }
    if quote.is_some() {
        return Err(Error::Resolution(format!("unbalanced quote in {text:?}")));
    }
    if in_token {
        parts.push(current);
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(source: &str) -> Descriptor {
        Descriptor::resolve(TargetSpec::command(source)).unwrap()
    }

    #[test]
    fn test_classify_shell_command() {
        let desc = resolve("ls -lh /tmp");
        assert_eq!(desc.target.kind(), "shell");
        assert_eq!(desc.substrate, Substrate::ProcessDedicated);
    }

    #[test]
    fn test_classify_script() {
        let desc = resolve("crawl.py");
        assert_eq!(desc.target.kind(), "script");
        assert_eq!(desc.substrate, Substrate::ProcessDedicated);
    }

    #[test]
    fn test_classify_module() {
        let desc = resolve("crawl.prices");
        assert_eq!(desc.target.kind(), "module");
        assert_eq!(desc.substrate, Substrate::ProcessDedicated);
    }

    #[test]
    fn test_classify_module_entry_defaults_to_thread() {
        let desc = resolve("crawl.prices:main");
        assert_eq!(desc.target.kind(), "module");
        assert_eq!(desc.substrate, Substrate::ThreadPooled);
    }

    #[test]
    fn test_classify_script_entry_defaults_to_thread() {
        let desc = resolve("crawl.py:main");
        assert_eq!(desc.target.kind(), "script");
        assert_eq!(desc.substrate, Substrate::ThreadPooled);
    }

    #[test]
    fn test_relative_path_is_command_not_module() {
        let desc = resolve("./run");
        assert_eq!(desc.target.kind(), "shell");
    }

    #[test]
    fn test_shell_flag_forces_shell() {
        let desc = Descriptor::resolve(TargetSpec::command("sleep 1 && date").shell(true)).unwrap();
        let (program, args) = desc.command_line("python3").unwrap();
        assert_eq!(program, "sh");
        assert_eq!(args[0], "-c");
        assert!(args[1].contains("&&"));
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(Descriptor::resolve(TargetSpec::command("  ")).is_err());
        assert!(Descriptor::resolve(TargetSpec::argv(vec![])).is_err());
    }

    #[test]
    fn test_shell_flag_on_argv_rejected() {
        let spec = TargetSpec::argv(vec!["ls".into(), "-l".into()]).shell(true);
        let err = Descriptor::resolve(spec).err().unwrap();
        assert!(matches!(err, Error::Resolution(_)));
    }

    #[test]
    fn test_kwargs_render_as_cli_options() {
        let desc = Descriptor::resolve(
            TargetSpec::command("ls")
                .with_args(["-l"])
                .with_kwargs([("color", "never")]),
        )
        .unwrap();
        let (program, args) = desc.command_line("python3").unwrap();
        assert_eq!(program, "ls");
        assert_eq!(args, vec!["-l", "--color", "never"]);
    }

    #[test]
    fn test_module_command_line_uses_interpreter() {
        let desc = resolve("crawl.prices");
        let (program, args) = desc.command_line("python3").unwrap();
        assert_eq!(program, "python3");
        assert_eq!(args, vec!["-m", "crawl.prices"]);
    }

    #[test]
    fn test_callable_registry_resolution() {
        let registry = CallableRegistry::new();
        registry.register("pkg.mod:main", |_ctx| Ok(()));

        let desc = resolve("pkg.mod:main");
        assert!(desc.resolve_callable(&registry).is_ok());

        let missing = resolve("pkg.other:main");
        let err = missing.resolve_callable(&registry).err().unwrap();
        assert!(matches!(err, Error::Resolution(_)));
    }

    #[test]
    fn test_bind_append_and_replace() {
        let desc = Descriptor::resolve(TargetSpec::command("ls").with_args(["-l"])).unwrap();

        let appended = desc.bind(vec!["-h".to_string()], ArgsMode::Append);
        assert_eq!(appended.args, vec!["-l", "-h"]);

        let replaced = desc.bind(vec!["-a".to_string()], ArgsMode::Replace);
        assert_eq!(replaced.args, vec!["-a"]);
    }

    #[test]
    fn test_split_command_quotes() {
        let parts = split_command("echo 'hello world' two").unwrap();
        assert_eq!(parts, vec!["echo", "hello world", "two"]);
        assert!(split_command("echo 'oops").is_err());
    }

    #[test]
    fn test_substrate_override() {
        let desc = Descriptor::resolve(TargetSpec::command("ls").on(Substrate::ProcessPooled))
            .unwrap();
        assert_eq!(desc.substrate, Substrate::ProcessPooled);
    }
}
