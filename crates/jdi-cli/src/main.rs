use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use jdi_config::{init_tracing, DebuggerConfig};
use tokio::sync::broadcast;

use jdi_model::{
    DebugEventKind, DebugTarget, ElementRef, EventDetail, JdiThread, StackFrame, ThreadId, WireSession,
};

#[derive(Parser)]
#[command(name = "jdi", version, about = "Inspect and step threads of a remote Java VM over JDWP")]
struct Cli {
    #[command(flatten)]
    connect: ConnectArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ConnectArgs {
    /// Config file (defaults to `$JDI_CONFIG`)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the configured debuggee host
    #[arg(long, global = true)]
    host: Option<String>,
    /// Override the configured debuggee port
    #[arg(long, global = true)]
    port: Option<u16>,
}

#[derive(Subcommand)]
enum Command {
    /// List the threads of the VM
    Threads,
    /// Print the stack of a suspended thread
    Stack(StackArgs),
    /// Step a thread and print where it stopped
    Step(StepArgs),
}

#[derive(Args)]
struct StackArgs {
    /// Thread id as listed by `threads`
    thread: ThreadId,
}

#[derive(Args)]
struct StepArgs {
    /// Thread id as listed by `threads`
    thread: ThreadId,
    #[arg(long, value_enum, default_value_t = StepMode::Over)]
    mode: StepMode,
    /// Seconds to wait for the step to complete
    #[arg(long, default_value_t = 30)]
    wait: u64,
}

#[derive(Clone, Copy, ValueEnum)]
enum StepMode {
    Over,
    Into,
    Return,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            2
        }
    };

    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<i32> {
    let config = load_config(&cli.connect)?;
    init_tracing(&config.logging);
    for warning in config.validate() {
        tracing::warn!(target: "jdi.cli", path = %warning.path, "{}", warning.message);
    }

    let address = config.connect.address();
    let session = WireSession::connect(&config)
        .await
        .with_context(|| format!("failed to connect to {address}"))?;
    let target = DebugTarget::attach(Arc::new(session), &config)
        .await
        .context("failed to attach to the VM")?;
    tracing::info!(target: "jdi.cli", address = %address, threads = target.threads().len(), "attached");

    let result = match cli.command {
        Command::Threads => list_threads(&target).await,
        Command::Stack(args) => {
            let thread = find_thread(&target, args.thread)?;
            print_stack(&thread).await
        }
        Command::Step(args) => step(&target, args).await,
    };

    target.shutdown();
    target.session().shutdown();
    result.map(|()| 0)
}

fn load_config(args: &ConnectArgs) -> Result<DebuggerConfig> {
    let mut config = match DebuggerConfig::discover_path(args.config.clone()) {
        Some(path) => DebuggerConfig::load_from_path(&path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => DebuggerConfig::default(),
    };
    if let Some(host) = &args.host {
        config.connect.host = host.clone();
    }
    if let Some(port) = args.port {
        config.connect.port = port;
    }
    Ok(config)
}

fn find_thread(target: &DebugTarget<WireSession>, id: ThreadId) -> Result<Arc<JdiThread<WireSession>>> {
    target.thread(id).ok_or_else(|| anyhow!("no thread with id {id}"))
}

async fn list_threads(target: &DebugTarget<WireSession>) -> Result<()> {
    let mut threads = target.threads();
    threads.sort_by_key(|thread| thread.id());
    for thread in threads {
        let name = thread.name().await.unwrap_or_else(|_| "<unknown>".to_owned());
        let state = if thread.is_terminated() {
            "terminated"
        } else if thread.is_suspended() {
            "suspended"
        } else {
            "running"
        };
        let system = if thread.is_system_thread() { " [system]" } else { "" };
        println!("{:>6}  {name:<32} {state}{system}", thread.id());
    }
    Ok(())
}

fn describe_frame(frame: &StackFrame) -> String {
    let Some(location) = frame.location() else {
        return "<invalid frame>".to_owned();
    };
    let line = location
        .line
        .map(|line| line.to_string())
        .unwrap_or_else(|| "?".to_owned());
    format!(
        "{}.{} line {line} (bci {})",
        location.method.declaring_type, location.method.name, location.code_index
    )
}

async fn print_stack(thread: &JdiThread<WireSession>) -> Result<()> {
    if !thread.is_suspended() {
        bail!("thread {} is not suspended", thread.id());
    }
    let frames = thread.stack_frames().await.context("failed to read the stack")?;
    for (depth, frame) in frames.iter().enumerate() {
        println!("#{depth:<3} {}", describe_frame(frame));
    }
    Ok(())
}

async fn step(target: &DebugTarget<WireSession>, args: StepArgs) -> Result<()> {
    let thread = find_thread(target, args.thread)?;
    if !thread.is_suspended() {
        if let Some(ticket) = thread.suspend().await.context("failed to suspend")? {
            let outcome = ticket.outcome().await.context("failed to suspend")?;
            tracing::debug!(target: "jdi.cli", thread = thread.id(), ?outcome, "suspended before stepping");
        }
    }

    let can_step = match args.mode {
        StepMode::Over => thread.can_step_over().await,
        StepMode::Into => thread.can_step_into().await,
        StepMode::Return => thread.can_step_return().await,
    };
    if !can_step {
        bail!("thread {} cannot step in its current state", thread.id());
    }

    let mut events = target.subscribe();
    match args.mode {
        StepMode::Over => thread.step_over().await,
        StepMode::Into => thread.step_into().await,
        StepMode::Return => thread.step_return().await,
    }
    .context("step failed")?;

    let source = ElementRef::Thread(thread.id());
    let wait = async {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => bail!("event stream closed"),
            };
            if event.source == source && event.kind == DebugEventKind::Suspend {
                return Ok::<_, anyhow::Error>(event.detail);
            }
        }
    };
    let detail = tokio::time::timeout(Duration::from_secs(args.wait), wait)
        .await
        .map_err(|_| anyhow!("step did not complete within {}s", args.wait))??;
    if detail != EventDetail::StepEnd {
        println!("stopped by {detail:?}");
    }

    match thread.top_stack_frame().await.context("failed to read the stack")? {
        Some(frame) => println!("{}", describe_frame(&frame)),
        None => println!("<no frames>"),
    }
    Ok(())
}
