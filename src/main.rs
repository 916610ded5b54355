// ABOUTME: Entry point for clawlink — inspect or tail assistant session logs, query a live instance.
// ABOUTME: Parses CLI args, loads config, dispatches to the log reader or the process channel.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use clawlink::channel::{ChannelEvent, ProcessChannel};
use clawlink::config::Config;
use clawlink::session::{LogReader, LogRecord, ReaderEvent};

#[derive(Parser)]
#[command(name = "clawlink", about = "Session log reader and live channel for the claude CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse a session log and print its records.
    Show { file: PathBuf },
    /// Parse a session log, then follow it and print newly appended records.
    Tail { file: PathBuf },
    /// Send one prompt to a live assistant process and print the response.
    Query {
        prompt: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Session identifier to start under (or resume with --resume).
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        resume: bool,
        #[arg(long)]
        bypass_permissions: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Command::Show { file } => show(file).await,
        Command::Tail { file } => tail(file).await,
        Command::Query {
            prompt,
            model,
            cwd,
            session,
            resume,
            bypass_permissions,
        } => query(prompt, model, cwd, session, resume, bypass_permissions).await,
    }
}

async fn show(file: PathBuf) -> anyhow::Result<()> {
    let reader = LogReader::open(&file).await?;
    if let Some(sid) = reader.session_id().await {
        let side = if reader.is_sidechain().await { " (sidechain)" } else { "" };
        println!("session {sid}{side}");
    }
    for record in reader.records().await {
        println!("{}", describe(&record));
    }
    for err in reader.parse_errors().await {
        eprintln!("Warning: unparseable line: {}", err.error);
    }
    Ok(())
}

async fn tail(file: PathBuf) -> anyhow::Result<()> {
    let mut reader = LogReader::open(&file).await?;
    for record in reader.records().await {
        println!("{}", describe(&record));
    }

    let rx = reader.subscribe()?;
    let mut stream = BroadcastStream::new(rx);
    while let Some(event) = stream.next().await {
        match event {
            Ok(ReaderEvent::Record(record)) => println!("{}", describe(&record)),
            Ok(ReaderEvent::ParseError(err)) => {
                eprintln!("Warning: unparseable line: {}", err.error);
            }
            Ok(ReaderEvent::RefreshError(err)) => {
                eprintln!("Warning: refresh failed: {err}");
            }
            // Lagged behind the broadcast buffer; keep tailing.
            Err(_) => continue,
        }
    }
    Ok(())
}

async fn query(
    prompt: String,
    model: Option<String>,
    cwd: Option<PathBuf>,
    session: Option<String>,
    resume: bool,
    bypass_permissions: bool,
) -> anyhow::Result<()> {
    let config = Config::load()?;
    let mut options = config.channel_options();
    if model.is_some() {
        options.model = model;
    }
    options.working_dir = cwd;
    options.session_id = session;
    options.resume = resume;
    options.bypass_permissions = options.bypass_permissions || bypass_permissions;

    let channel = ProcessChannel::spawn(options)?;
    channel.wait_ready().await?;

    let rx = channel.subscribe();
    let printer = tokio::spawn(async move {
        let mut stream = BroadcastStream::new(rx);
        while let Some(Ok(event)) = stream.next().await {
            match event {
                ChannelEvent::Stderr(line) => eprintln!("Warning: {line}"),
                ChannelEvent::Message(e) => {
                    if let Some(name) = tool_name(&e) {
                        eprintln!("[tool] {name}");
                    }
                }
                _ => {}
            }
        }
    });

    let response = channel.query(&prompt).await?;
    printer.abort();

    println!("{}", response.text);
    if let Some(sid) = response.session_id {
        eprintln!("session: {sid}");
    }
    channel.close().await?;
    Ok(())
}

/// One-line summary of a record for display.
fn describe(record: &LogRecord) -> String {
    let when = chrono::DateTime::parse_from_rfc3339(record.timestamp())
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|_| record.timestamp().to_string());
    match record {
        LogRecord::User(turn) => {
            let text = turn
                .message
                .get("content")
                .map(content_text)
                .unwrap_or_default();
            format!("[{when}] user: {}", preview(&text))
        }
        LogRecord::Assistant(turn) => {
            let mut text = String::new();
            for block in &turn.message.content {
                if block.get("type").and_then(|v| v.as_str()) == Some("text") {
                    if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                        text.push_str(t);
                    }
                }
            }
            format!("[{when}] assistant: {}", preview(&text))
        }
        LogRecord::Snapshot(marker) => format!(
            "[{when}] snapshot {} ({} tracked files)",
            marker.message_id,
            marker.snapshot.tracked_file_backups.len()
        ),
    }
}

/// User message content is either a plain string or an array of blocks.
fn content_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn tool_name(event: &clawlink::channel::StreamEvent) -> Option<String> {
    if event.kind != "assistant" {
        return None;
    }
    let content = event.message.as_ref()?.get("content")?.as_array()?;
    for block in content {
        if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
            return block
                .get("name")
                .and_then(|v| v.as_str())
                .map(str::to_string);
        }
    }
    None
}

/// Truncate display text to 80 characters.
fn preview(s: &str) -> String {
    let flat = s.replace('\n', " ");
    let truncated: String = flat.chars().take(80).collect();
    if truncated.chars().count() < flat.chars().count() {
        format!("{}...", truncated)
    } else {
        flat
    }
}
