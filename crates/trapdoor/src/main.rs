use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use trapdoor_core::events::{ChannelCallback, DebuggerEvent, DebuggerEventReceiver};
use trapdoor_core::platform::native_backend;
use trapdoor_core::target::{DebugBackend, LaunchInfo};
use trapdoor_core::types::{Address, CreateMethod, ProcessId};
use trapdoor_core::{DebugSession, DebuggerError, Result as DebuggerResult};
use trapdoor_utils::{info, init_logging, init_logging_with_level, warn, LogFormat, LogLevel, LoggingGuard};

/// A native debugger: software breakpoints, instruction stepping and event tracing.
#[derive(Parser, Debug)]
#[command(name = "trapdoor")]
#[command(version)]
#[command(about = "Native debugger: breakpoints, stepping and event tracing", long_about = None)]
struct Cli
{
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    run: RunOptions,

    /// Log level (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Log format: pretty or json (overrides TRAPDOOR_LOG_FORMAT)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Launch a new process under debugger control
    Launch
    {
        /// Program to launch, searched in PATH when it has no slash
        program: String,
        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Attach to a running process by PID
    Attach
    {
        /// Process ID (PID) to attach to
        pid: u32,
    },
}

/// What to do once the debuggee is loaded
#[derive(Args, Debug, Clone, Default)]
struct RunOptions
{
    /// Set a breakpoint (hex with 0x prefix, or decimal); repeatable
    #[arg(long = "break", value_name = "ADDRESS", value_parser = parse_address, global = true)]
    breakpoints: Vec<Address>,

    /// Step this many instructions after the loader breakpoint
    #[arg(long, value_name = "N", default_value_t = 0, global = true)]
    step: u32,

    /// Step over calls instead of into them
    #[arg(long, global = true)]
    step_over: bool,
}

fn parse_address(text: &str) -> Result<Address, String>
{
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => text.replace('_', "").parse::<u64>(),
    };
    parsed
        .map(Address::new)
        .map_err(|error| format!("invalid address '{text}': {error}"))
}

/// Resolve a program name the way a shell would.
fn resolve_program(program: &str, search_path: Option<&std::ffi::OsStr>) -> DebuggerResult<PathBuf>
{
    let path = Path::new(program);
    if program.contains('/') {
        return path
            .canonicalize()
            .map_err(|error| DebuggerError::InvalidArgument(format!("{program}: {error}")));
    }

    search_path
        .into_iter()
        .flat_map(std::env::split_paths)
        .map(|dir| dir.join(path))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| DebuggerError::InvalidArgument(format!("{program}: not found in PATH")))
}

fn init_cli_logging(cli: &Cli) -> Result<LoggingGuard, trapdoor_utils::LoggingError>
{
    match (cli.log_level, cli.log_format) {
        (None, None) => init_logging(),
        (level, format) => init_logging_with_level(level.unwrap_or_default(), format.unwrap_or_default()),
    }
}

fn main()
{
    let cli = Cli::parse();

    let logging = match init_cli_logging(&cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    };
    // flush the log file before exiting
    drop(logging);
    process::exit(code);
}

fn run(cli: Cli) -> DebuggerResult<i32>
{
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst))
            .map_err(|error| DebuggerError::InvalidArgument(format!("cannot install Ctrl-C handler: {error}")))?;
    }

    let (callback, events) = ChannelCallback::new();
    let mut session = DebugSession::new(native_backend()?, Box::new(callback));

    let pid = match cli.command {
        Commands::Launch { program, args } => {
            let program = resolve_program(&program, std::env::var_os("PATH").as_deref())?;
            info!(program = %program.display(), ?args, "Launching");
            let pid = session.launch(&LaunchInfo::new(&program).args(args))?;
            println!("Launched {} (PID: {pid})", program.display());
            pid
        }
        Commands::Attach { pid } => {
            let pid = ProcessId::from(pid);
            session.attach(pid)?;
            println!("Attached to process {pid}");
            pid
        }
    };

    Driver {
        session,
        events,
        pid,
        options: cli.run.clone(),
        steps_left: cli.run.step,
        interrupted,
        exit_code: 0,
    }
    .run()
}

/// Drives one debuggee from load to exit
struct Driver<B: DebugBackend>
{
    session: DebugSession<B>,
    events: DebuggerEventReceiver,
    pid: ProcessId,
    options: RunOptions,
    steps_left: u32,
    interrupted: Arc<AtomicBool>,
    exit_code: i32,
}

impl<B: DebugBackend> Driver<B>
{
    fn run(mut self) -> DebuggerResult<i32>
    {
        while self.session.has_live_processes() {
            if self.interrupted.swap(false, Ordering::SeqCst) {
                info!(pid = self.pid.0, "Interrupt requested");
                if let Err(error) = self.session.async_break(self.pid) {
                    warn!(pid = self.pid.0, %error, "Async break failed");
                }
            }

            if let Err(error) = self.session.wait_for_event() {
                eprintln!("Error: {error}");
            }

            let mut keep_stopped = false;
            let pending: Vec<DebuggerEvent> = self.events.try_iter().collect();
            for event in pending {
                println!("{}", event.describe());
                keep_stopped |= self.on_event(&event)?;
            }

            if !keep_stopped && self.is_stopped() {
                self.session.continue_process(self.pid, false)?;
            }
        }
        Ok(self.exit_code)
    }

    /// React to one notification; `true` when a new command is in flight.
    fn on_event(&mut self, event: &DebuggerEvent) -> DebuggerResult<bool>
    {
        match event {
            DebuggerEvent::LoadComplete { .. } => {
                for address in self.options.breakpoints.clone() {
                    match self.session.set_breakpoint(self.pid, address) {
                        Ok(()) => println!("Breakpoint set at {address}"),
                        Err(error) => eprintln!("Cannot set breakpoint at {address}: {error}"),
                    }
                }
                self.next_step()
            }
            DebuggerEvent::StepComplete { .. } => {
                self.print_pc();
                self.next_step()
            }
            DebuggerEvent::AsyncBreakComplete { .. } => {
                self.stop_debugging()?;
                Ok(true)
            }
            DebuggerEvent::ProcessExited { code, .. } => {
                self.exit_code = *code;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn next_step(&mut self) -> DebuggerResult<bool>
    {
        if self.steps_left == 0 {
            return Ok(false);
        }
        self.steps_left -= 1;
        self.session.step_instruction(self.pid, !self.options.step_over, false)?;
        Ok(true)
    }

    fn print_pc(&mut self)
    {
        match self.session.thread_context(self.pid) {
            Ok(context) => println!("  pc = {}", context.pc),
            Err(error) => warn!(pid = self.pid.0, %error, "Cannot read registers"),
        }
    }

    /// Ctrl-C ends the session: launched debuggees are killed, attached ones let go.
    fn stop_debugging(&mut self) -> DebuggerResult<()>
    {
        let attached = self
            .session
            .process(self.pid)
            .is_some_and(|process| process.create_method() == CreateMethod::Attach);
        if attached {
            self.session.detach(self.pid)?;
            println!("Detached from process {}", self.pid);
        } else {
            self.session.terminate(self.pid)?;
            println!("Terminating process {}", self.pid);
        }
        Ok(())
    }

    fn is_stopped(&self) -> bool
    {
        self.session
            .process(self.pid)
            .is_some_and(|process| process.is_stopped() && !process.is_deleted())
    }
}
