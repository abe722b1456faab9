//! wsync - drive a notebook-server worksheet from the command line.

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use log::{debug, info};
use tabled::{settings::Style, Table, Tabled};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use worksheet_sync::cell::{CellKind, CellSnapshot, RenderedOutput};
use worksheet_sync::clock::TokioClock;
use worksheet_sync::events::WorksheetEvent;
use worksheet_sync::session::InsertPosition;
use worksheet_sync::settings::{load_settings, settings_schema};
use worksheet_sync::transport::HttpTransport;
use worksheet_sync::{settings_json_path, spawn_session, CellId, SessionHandle, WorksheetSession};

#[derive(Parser, Debug)]
#[command(name = "wsync")]
#[command(author, version, about = "Drive a notebook-server worksheet", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Notebook server URL (default: from settings)
    #[arg(long, global = true)]
    server: Option<String>,

    /// Worksheet to open, as OWNER/ID
    #[arg(long, short, global = true)]
    worksheet: Option<String>,

    /// Log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the worksheet's cells
    Cells {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Evaluate a cell and print its output
    Eval {
        id: CellId,
        /// Replace the cell's input before evaluating
        #[arg(long)]
        input: Option<String>,
    },
    /// Evaluate every compute cell in order
    EvalAll,
    /// Show completions or the docstring at a cursor position
    Complete {
        id: CellId,
        /// Byte offset of the cursor (default: end of input)
        #[arg(long)]
        cursor: Option<usize>,
        /// Use this input instead of the cell's saved input
        #[arg(long)]
        input: Option<String>,
    },
    /// Interrupt the running computation
    Interrupt,
    /// Delete a cell
    Delete { id: CellId },
    /// Insert a new cell next to an existing one
    Insert {
        /// Insert after this cell
        #[arg(long, conflicts_with = "before", required_unless_present = "before")]
        after: Option<CellId>,
        /// Insert before this cell
        #[arg(long)]
        before: Option<CellId>,
        /// Create a text cell instead of a compute cell
        #[arg(long)]
        text: bool,
        /// Initial input of the new cell
        input: Option<String>,
    },
    /// Print worksheet events as JSON lines until interrupted
    Watch {
        /// Evaluate %auto cells on load
        #[arg(long)]
        auto: bool,
    },
    /// Show settings
    Settings {
        /// Print the JSON Schema of the settings file
        #[arg(long)]
        schema: bool,
        /// Print the settings file path
        #[arg(long)]
        path: bool,
    },
}

#[derive(Tabled)]
struct CellTableRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "TYPE")]
    kind: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "INPUT")]
    input: String,
    #[tabled(rename = "OUTPUT")]
    output: String,
}

impl From<&CellSnapshot> for CellTableRow {
    fn from(cell: &CellSnapshot) -> Self {
        let state = if cell.running {
            "running"
        } else if cell.evaluated {
            "evaluated"
        } else {
            "-"
        };
        CellTableRow {
            id: cell.id.to_string(),
            kind: match cell.kind {
                CellKind::Compute => "compute".to_string(),
                CellKind::Text => "text".to_string(),
            },
            state: state.to_string(),
            input: summarize(&cell.input, 40),
            output: summarize(output_text(&cell.output), 40),
        }
    }
}

/// First line of `text`, cut to `max_chars`.
fn summarize(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() <= max_chars {
        line.to_string()
    } else {
        let cut: String = line.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

fn output_text(output: &RenderedOutput) -> &str {
    match output {
        RenderedOutput::Empty => "",
        RenderedOutput::Text(s) | RenderedOutput::Html(s) | RenderedOutput::IsolatedViewer(s) => s,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    if let Commands::Settings { schema, path } = cli.command {
        return show_settings(schema, path);
    }

    let worksheet = cli
        .worksheet
        .clone()
        .ok_or_else(|| anyhow!("--worksheet OWNER/ID is required"))?;
    let (handle, task) = connect(cli.server.as_deref(), &worksheet)?;

    let result = run_command(&handle, cli.command).await;

    handle.shutdown().await?;
    task.await?;
    result
}

fn connect(server: Option<&str>, worksheet: &str) -> Result<(SessionHandle, JoinHandle<()>)> {
    let settings = load_settings();
    let server = server.unwrap_or(&settings.server_url).to_string();
    info!("[wsync] Opening {} on {}", worksheet, server);

    let transport = HttpTransport::new(&server, worksheet)?;
    let session = WorksheetSession::new(transport, TokioClock, settings);
    Ok(spawn_session(session))
}

async fn run_command(handle: &SessionHandle, command: Commands) -> Result<()> {
    match command {
        Commands::Cells { json } => {
            handle.load(false).await?;
            list_cells(handle, json).await
        }
        Commands::Eval { id, input } => {
            handle.load(false).await?;
            if let Some(input) = input {
                handle.edit_input(id.clone(), &input).await?;
            }
            let mut events = handle.subscribe().await?;
            handle.evaluate(id.clone()).await?;
            handle.wait_idle().await?;
            report_notices(&mut events);

            let cells = handle.get_cells().await?;
            let cell = cells
                .iter()
                .find(|c| c.id == id)
                .ok_or_else(|| anyhow!("cell {} disappeared", id))?;
            println!("{}", output_text(&cell.output));
            Ok(())
        }
        Commands::EvalAll => {
            handle.load(false).await?;
            let mut events = handle.subscribe().await?;
            handle.evaluate_all().await?;
            handle.wait_idle().await?;
            report_notices(&mut events);
            list_cells(handle, false).await
        }
        Commands::Complete { id, cursor, input } => {
            handle.load(false).await?;
            let input = match input {
                Some(input) => input,
                None => {
                    let cells = handle.get_cells().await?;
                    cells
                        .into_iter()
                        .find(|c| c.id == id)
                        .map(|c| c.input)
                        .ok_or_else(|| anyhow!("no cell {}", id))?
                }
            };
            let cursor = cursor.unwrap_or(input.len());

            let mut events = handle.subscribe().await?;
            handle.introspect(id, &input, cursor).await?;
            handle.wait_idle().await?;
            print_introspection(&mut events);
            Ok(())
        }
        Commands::Interrupt => {
            handle.load(false).await?;
            if handle.interrupt().await? {
                println!("Interrupted");
            } else {
                println!("Interrupt failed; the computation is still running");
            }
            Ok(())
        }
        Commands::Delete { id } => {
            handle.load(false).await?;
            if handle.delete_cell(id.clone()).await? {
                println!("Deleted cell {}", id);
            } else {
                println!("Server kept cell {}", id);
            }
            Ok(())
        }
        Commands::Insert {
            after,
            before,
            text,
            input,
        } => {
            handle.load(false).await?;
            let (anchor, position) = match (after, before) {
                (Some(anchor), _) => (anchor, InsertPosition::After),
                (None, Some(anchor)) => (anchor, InsertPosition::Before),
                (None, None) => bail!("one of --after or --before is required"),
            };
            let kind = if text {
                CellKind::Text
            } else {
                CellKind::Compute
            };
            let new_id = handle
                .insert_cell(anchor, position, kind, input.as_deref().unwrap_or(""))
                .await?;
            println!("{}", new_id);
            Ok(())
        }
        Commands::Watch { auto } => watch(handle, auto).await,
        Commands::Settings { schema, path } => show_settings(schema, path),
    }
}

async fn list_cells(handle: &SessionHandle, json: bool) -> Result<()> {
    let cells = handle.get_cells().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&cells)?);
        return Ok(());
    }
    if cells.is_empty() {
        println!("No cells");
        return Ok(());
    }
    let rows: Vec<CellTableRow> = cells.iter().map(CellTableRow::from).collect();
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
    Ok(())
}

fn report_notices(events: &mut mpsc::UnboundedReceiver<WorksheetEvent>) {
    while let Ok(event) = events.try_recv() {
        match event {
            WorksheetEvent::Notice { message, .. } | WorksheetEvent::Locked { message } => {
                eprintln!("{}", message)
            }
            WorksheetEvent::ConnectionError { message, .. } => {
                eprintln!("Connection error: {}", message)
            }
            WorksheetEvent::RestartRequired => {
                eprintln!("The worker died; run a restart before evaluating again")
            }
            other => debug!("[wsync] {:?}", other),
        }
    }
}

fn print_introspection(events: &mut mpsc::UnboundedReceiver<WorksheetEvent>) {
    let mut shown = false;
    while let Ok(event) = events.try_recv() {
        match event {
            WorksheetEvent::CompletionsShown { menu, .. } => {
                for row in menu.rows {
                    println!("{}", row.join("\t"));
                }
                shown = true;
            }
            WorksheetEvent::DocstringShown { html, .. } => {
                println!("{}", html);
                shown = true;
            }
            WorksheetEvent::InputReplaced { input, .. } => {
                println!("{}", input);
                shown = true;
            }
            WorksheetEvent::Notice { message, .. } => eprintln!("{}", message),
            _ => {}
        }
    }
    if !shown {
        println!("No completions");
    }
}

async fn watch(handle: &SessionHandle, auto: bool) -> Result<()> {
    let mut events = handle.subscribe().await?;
    handle.load(auto).await?;
    info!("[wsync] Watching; press Ctrl-C to stop");

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => println!("{}", serde_json::to_string(&event)?),
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

fn show_settings(schema: bool, path: bool) -> Result<()> {
    if schema {
        println!("{}", serde_json::to_string_pretty(&settings_schema())?);
    } else if path {
        println!("{}", settings_json_path().display());
    } else {
        println!("{}", serde_json::to_string_pretty(&load_settings())?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize() {
        assert_eq!(summarize("2+2\nprint(x)", 40), "2+2");
        assert_eq!(summarize("abcdefghij", 6), "abc...");
        assert_eq!(summarize("", 6), "");
    }

    #[test]
    fn test_parse_insert() {
        let cli = Cli::try_parse_from([
            "wsync", "-w", "admin/0", "insert", "--after", "3", "--text",
        ])
        .unwrap();
        match cli.command {
            Commands::Insert { after, text, .. } => {
                assert_eq!(after, Some(CellId::Number(3)));
                assert!(text);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_insert_needs_anchor() {
        assert!(Cli::try_parse_from(["wsync", "insert"]).is_err());
    }
}
