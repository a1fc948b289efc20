//! EDDI - event distribution daemon
//!
//! CLI entry point for the hub, the dispatcher and the filter tools.

use std::fs;
use std::io::{BufRead, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{CommandFactory, FromArgMatches};
use colored::Colorize;
use eddievent::{Event, WriteOptions};
use eyre::{Context, Result};
use tracing::{debug, info, warn};

use eddi::cli::{Cli, Command, OutputFormat, generate_after_help, get_log_path};
use eddi::config::Config;
use eddi::evbox::{ACCEPT_BOX, BoxRegistry};
use eddi::filter::{self, CompileOptions, Direction, FilterFlags, FilterSet, Verdict};
use eddi::link::{self, Link};
use eddi::{Dispatcher, Eddi, pool};

/// How long the printer blocks before checking for shutdown
const PRINT_POLL: Duration = Duration::from_millis(250);

/// How long `run` waits for queued frames on shutdown
const FLUSH_WAIT: Duration = Duration::from_secs(1);

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>, foreground: bool) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let level_str = cli_log_level.or(config_log_level);
    let level = match level_str.map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("INFO") | None => tracing::Level::INFO,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    };
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    if foreground {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .with_env_filter(filter)
            .init();
    } else {
        let log_path = get_log_path();
        if let Some(log_dir) = log_path.parent() {
            fs::create_dir_all(log_dir).context("Failed to create log directory")?;
        }
        let log_file = fs::File::create(&log_path).context("Failed to create log file")?;
        tracing_subscriber::fmt()
            .with_writer(log_file)
            .with_ansi(false)
            .with_env_filter(filter)
            .init();
    }

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cmd = Cli::command().after_help(generate_after_help());
    let cli = Cli::from_arg_matches(&cmd.get_matches())?;

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref(), cli.foreground)
        .context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Serve { socket } => {
            debug!(?socket, "main: matched Serve command");
            cmd_serve(&config, socket).await
        }
        Command::Run { socket, filter, format } => {
            debug!(?socket, ?filter, %format, "main: matched Run command");
            cmd_run(&config, socket, filter, format).await
        }
        Command::Send { socket, events } => {
            debug!(?socket, count = events.len(), "main: matched Send command");
            cmd_send(&config, socket, events).await
        }
        Command::Parse { format, events } => {
            debug!(%format, count = events.len(), "main: matched Parse command");
            cmd_parse(events, format)
        }
        Command::Check { file, strict } => {
            debug!(?file, strict, "main: matched Check command");
            cmd_check(&file, strict || config.dispatcher.strict_filters)
        }
        Command::Filter {
            file,
            out,
            format,
            events,
        } => {
            debug!(?file, out, %format, "main: matched Filter command");
            cmd_filter(&file, out, format, events)
        }
    }
}

/// Run the hub until interrupted
async fn cmd_serve(config: &Config, socket: Option<PathBuf>) -> Result<()> {
    let socket = socket.unwrap_or_else(|| config.link.socket_path());
    debug!(?socket, "cmd_serve: called");

    let (listener, path) = link::create_listener_at(&socket)?;
    println!("{} hub listening on {}", "eddi".green().bold(), path.display());

    let result = link::serve(listener, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cmd_serve: failed to listen for ctrl-c");
        }
    })
    .await;

    link::cleanup_socket(&path);
    println!("{} hub stopped", "eddi".green().bold());
    result
}

/// Run a dispatcher and print every event that reaches this process
async fn cmd_run(config: &Config, socket: Option<PathBuf>, filter: Option<PathBuf>, format: OutputFormat) -> Result<()> {
    debug!(?socket, ?filter, "cmd_run: called");
    let pool = pool::init(&config.pool_config());
    let registry = BoxRegistry::init(&config.boxes, pool.clone());

    let filter_id = match filter.or_else(|| config.dispatcher.filter.clone()) {
        Some(path) => {
            let opts = CompileOptions {
                strict: config.dispatcher.strict_filters,
            };
            let set = FilterSet::from_file(&path, opts).context(format!("Failed to load filter {}", path.display()))?;
            info!(?path, "cmd_run: dispatcher filter loaded");
            Some(filter::table().insert(set))
        }
        None => None,
    };

    let mut link_config = config.link.clone();
    let connect = link_config.enabled || socket.is_some();
    if let Some(socket) = socket {
        link_config.socket = Some(socket);
    }

    let dispatcher = Dispatcher::new(Arc::clone(&registry), pool.clone(), config.dispatcher.clone(), filter_id);
    let link = if connect {
        Some(Link::new(&link_config, dispatcher.inbox(), pool.clone()).spawn()?)
    } else {
        println!("{} link disabled, only local events will arrive", "warning:".yellow().bold());
        None
    };
    let dispatcher = match &link {
        Some(link) => dispatcher.with_link(link.clone()),
        None => dispatcher,
    };
    let mut handle = dispatcher.spawn().context("Failed to start dispatcher")?;

    if connect {
        println!(
            "{} dispatching events from {}",
            "eddi".green().bold(),
            link_config.socket_path().display()
        );
    }

    let stop = Arc::new(AtomicBool::new(false));
    let printer = {
        let stop = Arc::clone(&stop);
        let client = handle.client();
        tokio::task::spawn_blocking(move || print_events(&client, &stop, format))
    };

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    stop.store(true, Ordering::Release);
    let printed = printer.await.context("Event printer panicked")??;

    if let Some(link) = &link
        && !link.wait_for_sent(FLUSH_WAIT)
    {
        warn!("cmd_run: unsent frames discarded");
    }
    handle.shutdown();
    if let Some(link) = link {
        link.shutdown();
    }
    if let Some(id) = filter_id {
        filter::table().remove(id)?;
    }

    println!("{} stopped after {} events", "eddi".green().bold(), printed);
    Ok(())
}

fn print_events(client: &Eddi, stop: &AtomicBool, format: OutputFormat) -> Result<usize> {
    client.subscribe_global(true);
    let mut printed = 0;
    while !stop.load(Ordering::Acquire) {
        if let Some(event) = client.recv(ACCEPT_BOX, PRINT_POLL) {
            print_event(&event, format)?;
            printed += 1;
        }
    }
    let discarded = client.finish();
    debug!(printed, discarded, "print_events: done");
    Ok(printed)
}

fn print_event(event: &Event, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => println!("{}", event),
        OutputFormat::Json => println!("{}", serde_json::to_string(event).context("Failed to serialize event")?),
    }
    Ok(())
}

/// Event lines from the arguments, or from stdin when there are none
fn read_events(args: Vec<String>) -> Result<Vec<String>> {
    if !args.is_empty() {
        return Ok(args);
    }
    let mut lines = Vec::new();
    for line in std::io::stdin().lock().lines() {
        let line = line.context("Failed to read stdin")?;
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    Ok(lines)
}

fn parse_event(line: &str) -> Result<Event> {
    Event::parse(line).context(format!("Invalid event: {}", line))
}

/// Send events to the hub
async fn cmd_send(config: &Config, socket: Option<PathBuf>, events: Vec<String>) -> Result<()> {
    let socket = socket.unwrap_or_else(|| config.link.socket_path());
    debug!(?socket, "cmd_send: called");

    let frames = read_events(events)?
        .iter()
        .map(|line| {
            let event = parse_event(line)?;
            event
                .serialize(&WriteOptions::default())
                .context(format!("Cannot send event: {}", line))
        })
        .collect::<Result<Vec<_>>>()?;

    link::send_once(&socket, &frames).await?;
    println!("{} sent {} events", "eddi".green().bold(), frames.len());
    Ok(())
}

/// Parse events and print them back in canonical form
fn cmd_parse(events: Vec<String>, format: OutputFormat) -> Result<()> {
    let mut failed = 0;
    for line in read_events(events)? {
        match parse_event(&line) {
            Ok(event) => print_event(&event, format)?,
            Err(e) => {
                eprintln!("{} {:#}", "error:".red().bold(), e);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        return Err(eyre::eyre!("{} events failed to parse", failed));
    }
    Ok(())
}

/// Compile a filter file and report what it contains
fn cmd_check(file: &PathBuf, strict: bool) -> Result<()> {
    debug!(?file, strict, "cmd_check: called");
    let set = FilterSet::from_file(file, CompileOptions { strict }).context(format!("Failed to compile {}", file.display()))?;

    println!("{} {}", "ok".green().bold(), file.display());
    if set.shares_program() {
        println!("  [any] {} rules", set.input().len());
    } else {
        println!("  [in]  {} rules", set.input().len());
        println!("  [out] {} rules", set.output().len());
    }
    Ok(())
}

/// Run events through a filter and print each outcome
fn cmd_filter(file: &PathBuf, out: bool, format: OutputFormat, events: Vec<String>) -> Result<()> {
    debug!(?file, out, "cmd_filter: called");
    let set = FilterSet::from_file(file, CompileOptions::default()).context(format!("Failed to compile {}", file.display()))?;
    let direction = if out { Direction::Out } else { Direction::In };
    let flags = FilterFlags {
        set_target: out,
        ..Default::default()
    };

    for line in read_events(events)? {
        let mut event = parse_event(&line)?;
        let outcomes = set.apply(direction, &mut event, flags)?;
        for outcome in &outcomes {
            let result = outcome.event(&event);
            match format {
                OutputFormat::Text => {
                    let verdict = match outcome.verdict {
                        Verdict::Accept => "accept".green(),
                        Verdict::Reject => "reject".yellow(),
                        Verdict::Drop => "drop".red(),
                    };
                    match &outcome.target {
                        Some(target) => println!("{} -> {}: {}", verdict, target.name, result),
                        None => println!("{}: {}", verdict, result),
                    }
                }
                OutputFormat::Json => {
                    let value = serde_json::json!({
                        "verdict": outcome.verdict,
                        "target": outcome.target,
                        "event": result,
                    });
                    println!("{}", value);
                }
            }
        }
    }
    Ok(())
}
