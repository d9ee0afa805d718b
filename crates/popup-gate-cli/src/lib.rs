//! `popgate` command surface.
//!
//! Host tools embed popup gating through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_simulation`] for replaying page events against existing stores.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use popup_gate_core::{
    FixedClock, KeyValueStore, PageEvent, PageSession, PopupController, Presentation, Presenter,
    RecordingPresenter, TriggerConfig,
};
use popup_gate_store_sqlite::{SqliteKeyValueStore, StoredEntry};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "popgate")]
#[command(about = "Popup visibility and frequency control")]
pub struct Cli {
    #[arg(long, default_value = "./popup_gate.sqlite3")]
    db: PathBuf,

    /// Browser session to act in; a fresh session is started when omitted.
    #[arg(long)]
    session: Option<String>,

    /// Pin the clock to this epoch-millisecond instant.
    #[arg(long)]
    now_ms: Option<i64>,

    /// Trigger configuration file; the built-in site configuration otherwise.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Check(PopupArgs),
    Mark(PopupArgs),
    Present(PresentArgs),
    State(StateArgs),
    Reset(ResetArgs),
    Simulate(SimulateArgs),
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Args)]
pub struct PopupArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    scope: String,
}

#[derive(Debug, Args)]
pub struct PresentArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    scope: String,
    /// Element to reveal; defaults to `<id>Popup`.
    #[arg(long)]
    element: Option<String>,
}

#[derive(Debug, Args)]
pub struct StateArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ResetArgs {
    /// Keep visitor and day state; forget only the session named by `--session`.
    #[arg(long)]
    session_only: bool,
}

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// JSON array of page events; every `load` event starts a new page load.
    #[arg(long)]
    events: PathBuf,
    /// Seed for randomized trigger delays.
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Show,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PageReport {
    pub path: Option<String>,
    pub presented: Vec<Presentation>,
    pub open_at_end: Vec<String>,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate fails, configuration is invalid,
/// or the requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let session_id = cli
        .session
        .clone()
        .unwrap_or_else(|| Ulid::new().to_string());
    debug!(db = %cli.db.display(), session = %session_id, "popgate starting");

    match cli.command {
        Command::Config {
            command: ConfigCommand::Show,
        } => {
            let config = load_config(cli.config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::State(args) => {
            let (durable, session) = open_stores(&cli.db, &session_id)?;
            run_state(&args, &session_id, &durable, &session)
        }
        Command::Reset(args) => {
            if args.session_only && cli.session.is_none() {
                return Err(anyhow!("reset --session-only requires --session"));
            }
            let (durable, session) = open_stores(&cli.db, &session_id)?;
            let cleared_session = session.clear_namespace()?;
            let cleared_durable = if args.session_only {
                0
            } else {
                durable.clear_namespace()?
            };
            info!(cleared_durable, cleared_session, "popup state reset");
            print_json(&json!({
                "session": session_id,
                "cleared_durable": cleared_durable,
                "cleared_session": cleared_session,
            }))
        }
        Command::Simulate(args) => {
            let config = load_config(cli.config.as_deref())?;
            let events = load_events(&args.events)?;
            let (durable, session) = open_stores(&cli.db, &session_id)?;
            let pages = run_simulation(durable, session, &config, &events, cli.now_ms, args.seed)?;
            print_json(&json!({
                "session": session_id,
                "pages": pages,
            }))
        }
        command => {
            let (durable, session) = open_stores(&cli.db, &session_id)?;
            let controller = build_controller(durable, session, cli.now_ms);
            run_popup_command(command, controller, &session_id)
        }
    }
}

fn run_popup_command<D, S>(
    command: Command,
    mut controller: PopupController<D, S>,
    session_id: &str,
) -> Result<()>
where
    D: KeyValueStore,
    S: KeyValueStore,
{
    match command {
        Command::Check(args) => {
            let shown = controller.has_been_shown_raw(&args.id, &args.scope)?;
            print_json(&json!({
                "session": session_id,
                "id": args.id,
                "scope": args.scope,
                "shown": shown,
            }))
        }
        Command::Mark(args) => {
            controller.mark_shown_raw(&args.id, &args.scope)?;
            let shown = controller.has_been_shown_raw(&args.id, &args.scope)?;
            print_json(&json!({
                "session": session_id,
                "id": args.id,
                "scope": args.scope,
                "shown": shown,
            }))
        }
        Command::Present(args) => {
            let element = args
                .element
                .clone()
                .unwrap_or_else(|| format!("{}Popup", args.id));
            let mut presenter = RecordingPresenter::new();
            let presented = controller.try_present_raw(&args.id, &args.scope, || {
                presenter.toggle_visible(&element, true);
            })?;
            let visible = presenter.is_visible(&element);
            print_json(&json!({
                "session": session_id,
                "id": args.id,
                "scope": args.scope,
                "element": element,
                "presented": presented,
                "visible": visible,
            }))
        }
        Command::State(_)
        | Command::Reset(_)
        | Command::Simulate(_)
        | Command::Config { .. } => Err(anyhow!(
            "internal dispatch error: command should be handled before controller initialization"
        )),
    }
}

fn run_state(
    args: &StateArgs,
    session_id: &str,
    durable: &SqliteKeyValueStore,
    session: &SqliteKeyValueStore,
) -> Result<()> {
    let durable_entries = durable.entries()?;
    let session_entries = session.entries()?;

    if args.json {
        return print_json(&json!({
            "session": session_id,
            "durable": durable_entries,
            "session_entries": session_entries,
        }));
    }

    print_entries(durable.namespace(), &durable_entries);
    print_entries(session.namespace(), &session_entries);
    Ok(())
}

/// Replays `events` as consecutive page loads sharing one browser profile.
///
/// Every `load` event ends the previous page load, so `once` popups may
/// return while visitor, session and day state carry over.
///
/// # Errors
/// Returns an error when a page event is rejected by the controller.
pub fn run_simulation<D, S>(
    durable: D,
    session: S,
    config: &TriggerConfig,
    events: &[PageEvent],
    now_ms: Option<i64>,
    seed: Option<u64>,
) -> Result<Vec<PageReport>>
where
    D: KeyValueStore,
    S: KeyValueStore,
{
    let mut stores = (durable, session);
    let mut pages = Vec::new();

    for (index, chunk) in split_page_loads(events).into_iter().enumerate() {
        let mut controller = build_controller(stores.0, stores.1, now_ms);
        let mut presenter = RecordingPresenter::new();
        let report = {
            let mut page = match seed {
                Some(seed) => PageSession::with_seed(
                    &mut controller,
                    &mut presenter,
                    config,
                    seed.wrapping_add(index as u64),
                ),
                None => PageSession::new(&mut controller, &mut presenter, config),
            };
            let presented = page
                .run(chunk)
                .with_context(|| format!("page load {} failed", index + 1))?;
            PageReport {
                path: page.path().map(str::to_string),
                presented,
                open_at_end: page.open_elements().map(str::to_string).collect(),
            }
        };
        debug!(page = index + 1, presented = report.presented.len(), "page load replayed");
        pages.push(report);
        stores = controller.into_stores();
    }

    Ok(pages)
}

fn split_page_loads(events: &[PageEvent]) -> Vec<&[PageEvent]> {
    let mut chunks = Vec::new();
    let mut start = 0;
    for (index, event) in events.iter().enumerate() {
        if matches!(event, PageEvent::Load { .. }) && index > start {
            chunks.push(&events[start..index]);
            start = index;
        }
    }
    if start < events.len() {
        chunks.push(&events[start..]);
    }
    chunks
}

fn build_controller<D, S>(durable: D, session: S, now_ms: Option<i64>) -> PopupController<D, S>
where
    D: KeyValueStore,
    S: KeyValueStore,
{
    let controller = PopupController::new(durable, session);
    match now_ms {
        Some(now) => controller.with_clock(FixedClock::new(now)),
        None => controller,
    }
}

fn open_stores(
    db: &Path,
    session_id: &str,
) -> Result<(SqliteKeyValueStore, SqliteKeyValueStore)> {
    let durable = SqliteKeyValueStore::open_durable(db)?;
    let session = SqliteKeyValueStore::open_session(db, session_id)?;
    Ok((durable, session))
}

fn load_config(path: Option<&Path>) -> Result<TriggerConfig> {
    let Some(path) = path else {
        return Ok(TriggerConfig::builtin());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading trigger config {}", path.display()))?;
    TriggerConfig::from_json(&raw)
        .with_context(|| format!("invalid trigger config {}", path.display()))
}

fn load_events(path: &Path) -> Result<Vec<PageEvent>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading page events {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("invalid page events in {}", path.display()))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_entries(namespace: &str, entries: &[StoredEntry]) {
    println!("[{namespace}]");
    if entries.is_empty() {
        println!("  (empty)");
        return;
    }
    for entry in entries {
        println!("  {} = {} ({})", entry.key, entry.value, entry.updated_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use popup_gate_core::{MemoryStore, ScrollMetrics};

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn load(path: &str) -> PageEvent {
        PageEvent::Load {
            path: path.to_string(),
        }
    }

    fn scroll_to_end() -> PageEvent {
        PageEvent::Scroll(ScrollMetrics {
            scroll_y: 2_000.0,
            viewport_height: 1_000.0,
            document_height: 3_000.0,
        })
    }

    #[test]
    fn split_starts_a_chunk_at_every_load() {
        let events = vec![
            PageEvent::Elapsed { ms: 5 },
            load("/"),
            PageEvent::Elapsed { ms: 10 },
            load("/about.html"),
        ];
        let chunks = split_page_loads(&events);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].len(), 2);
        assert_eq!(chunks[2], &[load("/about.html")][..]);
    }

    #[test]
    fn simulation_carries_stores_across_loads() {
        let config = TriggerConfig::builtin();
        let events = vec![
            load("/about.html"),
            scroll_to_end(),
            load("/about.html"),
            scroll_to_end(),
        ];

        let pages = must(run_simulation(
            MemoryStore::new(),
            MemoryStore::new(),
            &config,
            &events,
            Some(0),
            Some(11),
        ));

        let ids: Vec<Vec<&str>> = pages
            .iter()
            .map(|page| page.presented.iter().map(|p| p.id.as_str()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["scroll", "story", "end"], vec!["end"]]);
        assert_eq!(pages[1].open_at_end, vec!["endPopup".to_string()]);
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = match Cli::try_parse_from([
            "popgate",
            "--db",
            "/tmp/x.sqlite3",
            "--session",
            "tab-1",
            "--now-ms",
            "1000",
            "check",
            "--id",
            "welcome",
            "--scope",
            "visitor",
        ]) {
            Ok(value) => value,
            Err(err) => panic!("parse failed: {err}"),
        };
        assert_eq!(cli.session.as_deref(), Some("tab-1"));
        assert_eq!(cli.now_ms, Some(1_000));
        assert!(matches!(cli.command, Command::Check(_)));
    }
}
