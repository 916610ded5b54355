// ABOUTME: Incremental reader for append-only JSONL session logs.
// ABOUTME: Tracks a byte cursor, tails live appends via notify, supports truncate/delete rewrites.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::framing::decode_lines;
use crate::session::records::LogRecord;

/// A line that was not valid JSON, kept with the decode error.
#[derive(Debug, Clone)]
pub struct LineError {
    pub line: String,
    pub error: String,
}

/// Notifications emitted while a live subscription is active (and collected
/// for syntax errors during any parse pass).
#[derive(Debug, Clone)]
pub enum ReaderEvent {
    /// A newly appended record discovered by a refresh, in parse order.
    Record(LogRecord),
    /// A line that failed JSON decoding. Non-fatal; parsing continued.
    ParseError(LineError),
    /// A watch-triggered refresh failed. The subscription stays alive.
    RefreshError(String),
}

/// In-memory state of one log file.
///
/// `cursor` is the byte offset already consumed; everything before it is
/// fully processed history. `session_id`/`is_sidechain` latch from the first
/// record that carries a session identifier and are never overwritten — later
/// conflicting observations are ignored on purpose, since sidechain matching
/// downstream depends on the first observation winning.
#[derive(Debug, Clone, Default)]
pub struct LogFile {
    pub records: Vec<LogRecord>,
    pub cursor: u64,
    pub session_id: Option<String>,
    pub is_sidechain: bool,
    pub parse_errors: Vec<LineError>,
}

struct WatchHandle {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

/// Incremental JSONL log reader.
///
/// Opening performs a full parse; `refresh` parses only bytes past the
/// cursor. The backing file is assumed append-only between refreshes except
/// for `truncate`/`delete_record`, which are the only operations allowed to
/// shrink it. An external shrink below the cursor is out of contract:
/// refresh silently no-ops until the file grows past the stale offset again.
pub struct LogReader {
    path: PathBuf,
    file: Arc<Mutex<LogFile>>,
    events: broadcast::Sender<ReaderEvent>,
    watch: Option<WatchHandle>,
}

impl LogReader {
    /// Open a log file and parse it fully. Fails if the file cannot be read.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let (events, _) = broadcast::channel(256);
        let reader = Self {
            path,
            file: Arc::new(Mutex::new(LogFile::default())),
            events,
            watch: None,
        };
        scan_off_thread(reader.path.clone(), Arc::clone(&reader.file), None).await?;
        Ok(reader)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The records parsed so far, in append order.
    pub async fn records(&self) -> Vec<LogRecord> {
        self.file.lock().await.records.clone()
    }

    /// Session identifier latched from the first record that carried one.
    pub async fn session_id(&self) -> Option<String> {
        self.file.lock().await.session_id.clone()
    }

    pub async fn is_sidechain(&self) -> bool {
        self.file.lock().await.is_sidechain
    }

    /// Byte offset already consumed.
    pub async fn cursor(&self) -> u64 {
        self.file.lock().await.cursor
    }

    /// Syntax errors accumulated across all parse passes.
    pub async fn parse_errors(&self) -> Vec<LineError> {
        self.file.lock().await.parse_errors.clone()
    }

    /// Parse any bytes appended since the last pass and append the newly
    /// validated records. No-op unless the file grew past the cursor, which
    /// also guards against shrink/no-change notifications.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        scan_off_thread(
            self.path.clone(),
            Arc::clone(&self.file),
            Some(self.events.clone()),
        )
        .await
    }

    /// Start watching the file for changes, refreshing on each notification.
    /// Idempotent: a second call just hands out another receiver. Errors
    /// during a triggered refresh are reported as `RefreshError` events, so a
    /// single bad notification never terminates the subscription.
    pub fn subscribe(&mut self) -> anyhow::Result<broadcast::Receiver<ReaderEvent>> {
        if self.watch.is_some() {
            return Ok(self.events.subscribe());
        }

        let (tx, mut rx) = mpsc::channel::<()>(16);
        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                // Coalescing is fine: refresh reads everything past the cursor.
                if res.is_ok() {
                    let _ = tx.try_send(());
                }
            })
            .context("failed to create file watcher")?;
        watcher
            .watch(&self.path, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", self.path.display()))?;

        let file = Arc::clone(&self.file);
        let path = self.path.clone();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                let scan =
                    scan_off_thread(path.clone(), Arc::clone(&file), Some(events.clone()));
                if let Err(e) = scan.await {
                    let _ = events.send(ReaderEvent::RefreshError(e.to_string()));
                }
            }
        });

        self.watch = Some(WatchHandle {
            _watcher: watcher,
            task,
        });
        Ok(self.events.subscribe())
    }

    /// Release the watch handle. Safe to call when not subscribed.
    pub fn unsubscribe(&mut self) {
        if let Some(handle) = self.watch.take() {
            handle.task.abort();
        }
    }

    /// Destructively reset: clear in-memory state, empty the backing file,
    /// and rewind the cursor to zero.
    pub async fn truncate(&self) -> anyhow::Result<()> {
        let mut file = self.file.lock().await;
        fs::write(&self.path, b"")
            .with_context(|| format!("failed to truncate {}", self.path.display()))?;
        file.records.clear();
        file.parse_errors.clear();
        file.session_id = None;
        file.is_sidechain = false;
        file.cursor = 0;
        Ok(())
    }

    /// Remove the record whose identifier matches and rewrite the backing
    /// file as the newline-joined serialization of the remainder. The cursor
    /// is pinned to the rewritten byte length so a later refresh neither
    /// re-reads known records nor misses fresh appends. Returns whether a
    /// record was removed; the file is untouched when the id is absent.
    pub async fn delete_record(&self, id: &str) -> anyhow::Result<bool> {
        let mut file = self.file.lock().await;
        let Some(pos) = file.records.iter().position(|r| r.id() == id) else {
            return Ok(false);
        };
        file.records.remove(pos);

        let mut lines = Vec::with_capacity(file.records.len());
        for record in &file.records {
            lines.push(serde_json::to_string(record)?);
        }
        let content = lines.join("\n");
        fs::write(&self.path, &content)
            .with_context(|| format!("failed to rewrite {}", self.path.display()))?;
        file.cursor = content.len() as u64;
        Ok(true)
    }
}

impl Drop for LogReader {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Run one scan pass on the blocking pool. The scan does synchronous file
/// I/O and must not occupy a runtime worker for a large append.
async fn scan_off_thread(
    path: PathBuf,
    file: Arc<Mutex<LogFile>>,
    events: Option<broadcast::Sender<ReaderEvent>>,
) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || {
        let mut file = file.blocking_lock();
        scan_into(&path, &mut file, events.as_ref())
    })
    .await
    .context("log scan task panicked")?
}

/// Parse bytes between the cursor and the current file size, appending newly
/// validated records. Syntax errors are recorded (and broadcast when a
/// sender is given); shape failures are dropped without a trace — that
/// asymmetry is deliberate, tolerating forward/backward schema drift.
fn scan_into(
    path: &Path,
    file: &mut LogFile,
    events: Option<&broadcast::Sender<ReaderEvent>>,
) -> anyhow::Result<()> {
    let size = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    if size <= file.cursor {
        return Ok(());
    }

    let mut handle =
        fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    handle.seek(SeekFrom::Start(file.cursor))?;
    let fresh = handle.take(size - file.cursor);

    decode_lines(fresh, |line| {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        let value: serde_json::Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                let err = LineError {
                    line: trimmed.to_string(),
                    error: e.to_string(),
                };
                if let Some(events) = events {
                    let _ = events.send(ReaderEvent::ParseError(err.clone()));
                }
                file.parse_errors.push(err);
                return;
            }
        };
        let Ok(record) = serde_json::from_value::<LogRecord>(value) else {
            return;
        };
        if file.session_id.is_none() {
            if let Some(sid) = record.session_id() {
                file.session_id = Some(sid.to_string());
                file.is_sidechain = record.is_sidechain();
            }
        }
        if let Some(events) = events {
            let _ = events.send(ReaderEvent::Record(record.clone()));
        }
        file.records.push(record);
    })?;

    file.cursor = size;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn user_line(uuid: &str, session: &str) -> String {
        format!(
            r#"{{"type":"user","uuid":"{uuid}","parentUuid":null,"timestamp":"2026-01-15T10:00:00Z","sessionId":"{session}","isSidechain":false,"message":{{"role":"user","content":"hi"}}}}"#
        )
    }

    fn assistant_line(uuid: &str, session: &str) -> String {
        format!(
            r#"{{"type":"assistant","uuid":"{uuid}","parentUuid":null,"timestamp":"2026-01-15T10:00:01Z","sessionId":"{session}","message":{{"model":"claude-sonnet-4","stop_reason":"end_turn","content":[],"usage":{{"input_tokens":1,"output_tokens":1}}}}}}"#
        )
    }

    fn write_log(path: &Path, lines: &[String]) {
        let mut content = lines.join("\n");
        content.push('\n');
        fs::write(path, content).unwrap();
    }

    fn append_log(path: &Path, lines: &[String]) {
        let mut f = fs::OpenOptions::new().append(true).open(path).unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
    }

    #[tokio::test]
    async fn open_then_refresh_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("session.jsonl");
        write_log(&path, &[user_line("u-1", "S1"), assistant_line("a-1", "S1")]);

        let reader = LogReader::open(&path).await.unwrap();
        let cursor = reader.cursor().await;
        assert_eq!(reader.records().await.len(), 2);

        reader.refresh().await.unwrap();
        assert_eq!(reader.records().await.len(), 2);
        assert_eq!(reader.cursor().await, cursor);
    }

    #[tokio::test]
    async fn empty_file_is_valid() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("session.jsonl");
        fs::write(&path, "").unwrap();

        let reader = LogReader::open(&path).await.unwrap();
        assert!(reader.records().await.is_empty());
        assert_eq!(reader.cursor().await, 0);
        assert_eq!(reader.session_id().await, None);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nope.jsonl");
        assert!(LogReader::open(&path).await.is_err());
    }

    #[tokio::test]
    async fn appends_and_refreshes_converge_to_full_parse() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("session.jsonl");
        write_log(&path, &[user_line("u-1", "S1")]);

        let reader = LogReader::open(&path).await.unwrap();
        append_log(&path, &[assistant_line("a-1", "S1")]);
        reader.refresh().await.unwrap();
        append_log(&path, &[user_line("u-2", "S1"), assistant_line("a-2", "S1")]);
        reader.refresh().await.unwrap();

        let incremental: Vec<String> = reader
            .records()
            .await
            .iter()
            .map(|r| r.id().to_string())
            .collect();

        let full = LogReader::open(&path).await.unwrap();
        let one_shot: Vec<String> = full
            .records()
            .await
            .iter()
            .map(|r| r.id().to_string())
            .collect();

        assert_eq!(incremental, one_shot);
        assert_eq!(incremental, vec!["u-1", "a-1", "u-2", "a-2"]);
    }

    #[tokio::test]
    async fn malformed_line_never_drops_neighbors() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("session.jsonl");
        write_log(
            &path,
            &[
                user_line("u-1", "S1"),
                "not json".to_string(),
                assistant_line("a-1", "S1"),
            ],
        );

        let reader = LogReader::open(&path).await.unwrap();
        let ids: Vec<String> = reader
            .records()
            .await
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        assert_eq!(ids, vec!["u-1", "a-1"]);

        let errors = reader.parse_errors().await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line, "not json");
    }

    #[tokio::test]
    async fn shape_invalid_lines_are_dropped_silently() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("session.jsonl");
        write_log(
            &path,
            &[
                r#"{"type":"summary","summary":"noise"}"#.to_string(),
                user_line("u-1", "S1"),
            ],
        );

        let reader = LogReader::open(&path).await.unwrap();
        assert_eq!(reader.records().await.len(), 1);
        assert!(reader.parse_errors().await.is_empty());
    }

    #[tokio::test]
    async fn session_latches_from_first_record_carrying_one() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("session.jsonl");
        let snapshot = r#"{"type":"file-history-snapshot","messageId":"m-1","snapshot":{"timestamp":"t","trackedFileBackups":{}}}"#.to_string();
        write_log(&path, &[snapshot, user_line("u-1", "S1"), user_line("u-2", "S2")]);

        let reader = LogReader::open(&path).await.unwrap();
        // The marker carries no session id; the first user turn wins and the
        // conflicting later one is ignored.
        assert_eq!(reader.session_id().await.as_deref(), Some("S1"));
        assert!(!reader.is_sidechain().await);
    }

    #[tokio::test]
    async fn refresh_noop_when_file_shrinks() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("session.jsonl");
        write_log(&path, &[user_line("u-1", "S1"), user_line("u-2", "S1")]);

        let reader = LogReader::open(&path).await.unwrap();
        // External shrink not mediated by truncate(): out of contract, the
        // size guard keeps refresh from reading garbage offsets.
        fs::write(&path, "").unwrap();
        reader.refresh().await.unwrap();
        assert_eq!(reader.records().await.len(), 2);
    }

    #[tokio::test]
    async fn delete_absent_id_leaves_file_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("session.jsonl");
        write_log(&path, &[user_line("u-1", "S1")]);
        let before = fs::read(&path).unwrap();

        let reader = LogReader::open(&path).await.unwrap();
        assert!(!reader.delete_record("missing").await.unwrap());
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn delete_present_id_removes_exactly_one() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("session.jsonl");
        write_log(
            &path,
            &[
                user_line("u-1", "S1"),
                assistant_line("a-1", "S1"),
                user_line("u-2", "S1"),
            ],
        );

        let reader = LogReader::open(&path).await.unwrap();
        assert!(reader.delete_record("a-1").await.unwrap());
        assert_eq!(
            reader.cursor().await,
            fs::metadata(&path).unwrap().len(),
            "cursor must match the rewritten file"
        );

        let reparsed = LogReader::open(&path).await.unwrap();
        let ids: Vec<String> = reparsed
            .records()
            .await
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        assert_eq!(ids, vec!["u-1", "u-2"]);
    }

    #[tokio::test]
    async fn refresh_after_delete_sees_only_new_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("session.jsonl");
        write_log(&path, &[user_line("u-1", "S1"), user_line("u-2", "S1")]);

        let reader = LogReader::open(&path).await.unwrap();
        assert!(reader.delete_record("u-1").await.unwrap());

        // The rewritten file has no trailing newline; an appended record must
        // start on its own line to parse.
        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "\n{}", user_line("u-3", "S1")).unwrap();
        drop(f);

        reader.refresh().await.unwrap();
        let ids: Vec<String> = reader
            .records()
            .await
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        assert_eq!(ids, vec!["u-2", "u-3"]);
    }

    #[tokio::test]
    async fn delete_snapshot_by_message_id() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("session.jsonl");
        let snapshot = r#"{"type":"file-history-snapshot","messageId":"m-1","snapshot":{"timestamp":"t","trackedFileBackups":{}}}"#.to_string();
        write_log(&path, &[user_line("u-1", "S1"), snapshot]);

        let reader = LogReader::open(&path).await.unwrap();
        assert!(reader.delete_record("m-1").await.unwrap());
        assert_eq!(reader.records().await.len(), 1);
    }

    #[tokio::test]
    async fn truncate_resets_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("session.jsonl");
        write_log(&path, &[user_line("u-1", "S1")]);

        let reader = LogReader::open(&path).await.unwrap();
        reader.truncate().await.unwrap();

        assert!(reader.records().await.is_empty());
        assert_eq!(reader.cursor().await, 0);
        assert_eq!(reader.session_id().await, None);
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_without_subscription_is_safe() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("session.jsonl");
        fs::write(&path, "").unwrap();

        let mut reader = LogReader::open(&path).await.unwrap();
        reader.unsubscribe();
        reader.unsubscribe();
    }
}
