use std::collections::BTreeMap;
use std::io::Write as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand, ValueEnum};
use fs::RelativePath;
use hashing::{Digest, Fingerprint};
use native_engine::nail::SubprocessNail;
use native_engine::{Engine, EngineConfig, telemetry};
use process_execution::{Context, Process, ProcessCacheScope};
use task_executor::Executor;

/// Native build engine
///
/// Runs processes in hermetic sandboxes, stores their inputs and outputs in
/// a content-addressed store, and caches results by the digest of the
/// process description.
///
/// QUICK START:
///
///   engine run --input 'src/**/*.py' --output-dir dist -- ./build.sh
///   engine cas put README.md
///   engine cas get <hash> <size> -o copy.md
///
/// Settings are read from engine.toml (see --config). Logging goes to
/// stderr; set RUST_LOG to filter and ENGINE_LOG_FORMAT=json for JSON.
#[derive(Parser)]
#[command(name = "engine")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'engine <command> --help' for more information on a specific command.")]
struct Cli {
    /// Engine configuration file; missing means defaults
    #[arg(long, global = true, env = "ENGINE_CONFIG", default_value = "engine.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a process in a sandbox and print its output
    ///
    /// Inputs are captured from --root by glob, materialized into a fresh
    /// sandbox, and the declared outputs are captured afterwards. The exit
    /// code is the process's own (128 + N if it was killed by signal N).
    Run(RunArgs),

    /// Read and write the content-addressed store
    #[command(subcommand)]
    Cas(CasCommands),

    /// Run a command on a nailgun server
    Client(ClientArgs),

    /// Host a nailgun server that runs each request as a subprocess
    Serve(ServeArgs),

    /// Resolve a pex_binary entry point to a module
    ///
    /// Values ending in .py are resolved against the target directory and
    /// the source roots, e.g. `app.py:main` in src/python/project becomes
    /// `project.app:main` with source root src/python.
    EntryPoint(EntryPointArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CacheScopeArg {
    Always,
    Successful,
    Never,
}

impl From<CacheScopeArg> for ProcessCacheScope {
    fn from(scope: CacheScopeArg) -> Self {
        match scope {
            CacheScopeArg::Always => Self::Always,
            CacheScopeArg::Successful => Self::Successful,
            CacheScopeArg::Never => Self::Never,
        }
    }
}

#[derive(Args)]
struct RunArgs {
    /// Directory inputs are captured from
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Glob (relative to --root) of files to place in the sandbox
    #[arg(long = "input", value_name = "GLOB")]
    inputs: Vec<String>,

    /// File to capture after the run
    #[arg(long = "output-file", value_name = "PATH")]
    output_files: Vec<String>,

    /// Directory to capture after the run
    #[arg(long = "output-dir", value_name = "PATH")]
    output_directories: Vec<String>,

    /// Environment variable for the process (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    env: Vec<(String, String)>,

    /// Sandbox-relative directory to run in
    #[arg(long)]
    working_directory: Option<String>,

    /// Kill the process after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Human-readable label used in logs and timeout messages
    #[arg(long, default_value = "")]
    description: String,

    /// Which results are written to the cache
    #[arg(long, value_enum, default_value_t = CacheScopeArg::Successful)]
    cache_scope: CacheScopeArg,

    /// Write captured outputs here
    #[arg(long, value_name = "DIR")]
    materialize: Option<PathBuf>,

    /// The command and its arguments
    #[arg(trailing_var_arg = true, required = true, value_name = "ARGV")]
    argv: Vec<String>,
}

#[derive(Subcommand)]
enum CasCommands {
    /// Store a file and print `<hash> <size>`
    Put {
        path: PathBuf,
    },
    /// Print (or write) the blob `<hash> <size>`
    Get {
        hash: String,
        size: usize,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ClientArgs {
    /// Server address
    #[arg(long, env = "NAILGUN_ADDR", default_value = "127.0.0.1:2113")]
    addr: SocketAddr,

    /// The command and its arguments
    #[arg(trailing_var_arg = true, required = true, value_name = "ARGV")]
    argv: Vec<String>,
}

#[derive(Args)]
struct ServeArgs {
    /// Address to listen on (port 0 picks a free port)
    #[arg(long, default_value = "127.0.0.1:2113")]
    addr: SocketAddr,
}

#[derive(Args)]
struct EntryPointArgs {
    /// `module`, `module:func`, `file.py` or `file.py:func`
    value: String,

    /// Directory of the pex_binary target, relative to --build-root
    #[arg(long, default_value = "")]
    spec_path: String,

    /// Source root, relative to --build-root (repeatable; default: the
    /// build root itself)
    #[arg(long = "source-root")]
    source_roots: Vec<String>,

    #[arg(long, default_value = ".")]
    build_root: PathBuf,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))
}

fn relative_paths(paths: &[String]) -> Result<std::collections::BTreeSet<RelativePath>> {
    paths
        .iter()
        .map(|p| RelativePath::new(p).with_context(|| format!("invalid path {p:?}")))
        .collect()
}

/// Map an exit code (negative for signals) onto a process exit status.
fn exit_status(code: i32) -> ExitCode {
    ExitCode::from(exit_byte(code))
}

fn exit_byte(code: i32) -> u8 {
    let code = if code < 0 { 128i32.saturating_sub(code) } else { code };
    u8::try_from(code).unwrap_or(u8::MAX)
}

fn main() -> Result<ExitCode> {
    telemetry::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(&load_engine(&cli.config)?, args),
        Commands::Cas(cmd) => cas(&load_engine(&cli.config)?, cmd),
        Commands::Client(args) => client(args),
        Commands::Serve(args) => serve(&args),
        Commands::EntryPoint(args) => entry_point(&load_engine(&cli.config)?, args),
    }
}

fn load_engine(config_path: &std::path::Path) -> Result<Engine> {
    let config = EngineConfig::load(config_path)?;
    Engine::new(config).context("failed to start the engine")
}

fn run(engine: &Engine, args: RunArgs) -> Result<ExitCode> {
    let mut process = Process::new(args.argv)
        .env(args.env.into_iter().collect::<BTreeMap<_, _>>())
        .output_files(relative_paths(&args.output_files)?)
        .output_directories(relative_paths(&args.output_directories)?)
        .description(args.description)
        .cache_scope(args.cache_scope.into());
    if let Some(dir) = &args.working_directory {
        process = process.working_directory(
            RelativePath::new(dir).with_context(|| format!("invalid working directory {dir:?}"))?,
        );
    }
    if let Some(secs) = args.timeout_secs {
        process = process.timeout(Duration::from_secs(secs));
    }

    let (result, stdout, stderr) = engine.executor().block_on(async {
        if !args.inputs.is_empty() {
            let inputs = engine
                .capture(args.root.clone(), args.inputs.clone())
                .await
                .with_context(|| format!("failed to capture inputs from {}", args.root.display()))?;
            process = process.input_files(inputs);
        }
        let result = engine.run_process(Context::default(), process).await?;
        let stdout = engine.load_bytes(result.stdout_digest).await?;
        let stderr = engine.load_bytes(result.stderr_digest).await?;
        if let Some(dest) = &args.materialize {
            engine
                .materialize(dest.clone(), result.output_directory)
                .await
                .with_context(|| format!("failed to write outputs to {}", dest.display()))?;
        }
        anyhow::Ok((result, stdout, stderr))
    })?;

    std::io::stdout().write_all(&stdout.unwrap_or_default())?;
    std::io::stderr().write_all(&stderr.unwrap_or_default())?;
    tracing::info!(
        exit_code = result.exit_code,
        outputs = %result.output_directory,
        source = ?result.metadata.source,
        "process finished"
    );
    Ok(exit_status(result.exit_code))
}

fn cas(engine: &Engine, cmd: CasCommands) -> Result<ExitCode> {
    match cmd {
        CasCommands::Put { path } => {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let digest = engine
                .executor()
                .block_on(engine.store_bytes(Bytes::from(bytes)))?;
            println!("{} {}", digest.hash, digest.size_bytes);
        }
        CasCommands::Get { hash, size, output } => {
            let fingerprint = Fingerprint::from_hex_string(&hash)
                .with_context(|| format!("invalid hash {hash:?}"))?;
            let digest = Digest::new(fingerprint, size);
            let Some(bytes) = engine.executor().block_on(engine.load_bytes(digest))? else {
                bail!("{digest} is not in the store\n  To fix: store it first with `engine cas put <file>`");
            };
            match output {
                Some(path) => std::fs::write(&path, &bytes)
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => std::io::stdout().write_all(&bytes)?,
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn client(args: ClientArgs) -> Result<ExitCode> {
    let executor = Executor::new().context("failed to start the async runtime")?;
    let mut argv = args.argv.into_iter();
    let command = argv.next().context("no command given")?;
    let request = nailgun::Request {
        command,
        args: argv.collect(),
        env: std::env::vars().collect(),
        working_dir: std::env::current_dir().context("failed to read the current directory")?,
    };
    let code = executor.block_on(async {
        nailgun::client_execute(
            args.addr,
            &request,
            &mut tokio::io::stdin(),
            &mut tokio::io::stdout(),
            &mut tokio::io::stderr(),
        )
        .await
    })?;
    Ok(exit_status(code))
}

fn serve(args: &ServeArgs) -> Result<ExitCode> {
    let executor = Executor::new().context("failed to start the async runtime")?;
    executor.block_on(async {
        let server = nailgun::Server::bind(args.addr, Arc::new(SubprocessNail))
            .await
            .with_context(|| format!("failed to listen on {}", args.addr))?;
        println!("listening on {}", server.local_addr());
        tokio::signal::ctrl_c()
            .await
            .context("failed to wait for ctrl-c")?;
        server.shutdown().await;
        anyhow::Ok(())
    })?;
    Ok(ExitCode::SUCCESS)
}

fn entry_point(engine: &Engine, args: EntryPointArgs) -> Result<ExitCode> {
    let spec_path = RelativePath::new(&args.spec_path)
        .with_context(|| format!("invalid spec path {:?}", args.spec_path))?;
    let source_roots = if args.source_roots.is_empty() {
        vec![RelativePath::empty()]
    } else {
        relative_paths(&args.source_roots)?.into_iter().collect()
    };
    let resolved = engine.executor().block_on(engine.resolve_entry_point(
        &args.value,
        spec_path,
        &args.build_root,
        source_roots,
    ))?;
    println!("{}", serde_json::to_string_pretty(&resolved)?);
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses() {
        use clap::CommandFactory as _;
        Cli::command().debug_assert();
    }

    #[test]
    fn run_keeps_trailing_flags_for_the_process() {
        let cli = Cli::parse_from([
            "engine", "run", "--env", "A=1", "--output-file", "out.txt", "--", "ls", "-la",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.argv, ["ls", "-la"]);
        assert_eq!(args.env, [("A".to_owned(), "1".to_owned())]);
        assert_eq!(args.output_files, ["out.txt"]);
    }

    #[test]
    fn key_val_needs_equals() {
        assert_eq!(
            parse_key_val("K=a=b").unwrap(),
            ("K".to_owned(), "a=b".to_owned())
        );
        assert!(parse_key_val("K").is_err());
    }

    #[test]
    fn signals_map_above_128() {
        assert_eq!(exit_byte(0), 0);
        assert_eq!(exit_byte(3), 3);
        assert_eq!(exit_byte(-15), 143);
        assert_eq!(exit_byte(1000), 255);
        assert_eq!(exit_byte(i32::MIN), 255);
    }
}
