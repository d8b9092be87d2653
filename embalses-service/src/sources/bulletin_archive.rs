use std::{
    fs::File,
    io::{BufRead, BufReader, Cursor, Read, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use async_stream::try_stream;
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use embalses_client::domain::RawRecord;
use time::{macros::date, Date, Duration};
use tokio::sync::mpsc;

use super::bulletin_row::ColumnMap;
use crate::{
    config::FetchConfig,
    pipeline::{Envelope, EnvelopeStream, PipelineError, Source},
};

/// How many skipped rows are logged individually before going quiet.
const SKIP_LOG_LIMIT: usize = 20;

/// Access tables whose name contains one of these hold the bulletin.
const ACCESS_TABLE_HINTS: [&str; 3] = ["embalse", "presa", "pantano"];

/// Kinds of archive entry we can read, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EntryKind {
    Spreadsheet,
    Access,
    Delimited,
}

fn entry_kind(entry_name: &str) -> Option<EntryKind> {
    let ext = Path::new(entry_name).extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "xlsx" | "xlsm" | "xls" => Some(EntryKind::Spreadsheet),
        "mdb" | "accdb" => Some(EntryKind::Access),
        "csv" | "txt" | "tsv" => Some(EntryKind::Delimited),
        _ => None,
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveStats {
    pub files: usize,
    /// Entries whose headers resolved to bulletin columns.
    pub tables: usize,
    /// Entries read but not recognised as bulletin tables.
    pub unrecognized: usize,
    pub rows: usize,
    pub records: usize,
    pub skipped: usize,
}

enum TableOutcome {
    Read,
    Unrecognized(String),
    Stopped,
}

/// External mdbtools commands used to export Access databases. Each is a
/// program followed by leading arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessTools {
    pub tables_cmd: Vec<String>,
    pub export_cmd: Vec<String>,
}

impl Default for AccessTools {
    fn default() -> Self {
        Self {
            tables_cmd: vec!["mdb-tables".to_string()],
            export_cmd: vec!["mdb-export".to_string()],
        }
    }
}

impl From<&FetchConfig> for AccessTools {
    fn from(cfg: &FetchConfig) -> Self {
        Self {
            tables_cmd: cfg.mdb_tables_cmd.clone(),
            export_cmd: cfg.mdb_export_cmd.clone(),
        }
    }
}

fn command(argv: &[String]) -> Result<Command, PipelineError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| PipelineError::Parse("empty mdbtools command configured".to_string()))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// Reads the bulletin records out of a ZIP archive already on disk.
///
/// Parsing is blocking (zip, spreadsheet, csv, child processes), so it runs
/// on the blocking pool and hands records over a bounded channel.
pub struct ArchiveFileSource {
    path: PathBuf,
    channel_capacity: usize,
    access: AccessTools,
}

impl ArchiveFileSource {
    pub fn new<P: Into<PathBuf>>(path: P, channel_capacity: usize) -> Self {
        Self {
            path: path.into(),
            channel_capacity: channel_capacity.max(1),
            access: AccessTools::default(),
        }
    }

    pub fn with_access_tools(mut self, access: AccessTools) -> Self {
        self.access = access;
        self
    }
}

#[async_trait::async_trait]
impl Source<RawRecord> for ArchiveFileSource {
    async fn stream(&self) -> EnvelopeStream<RawRecord> {
        let path = self.path.clone();
        let access = self.access.clone();
        let (tx, mut rx) = mpsc::channel(self.channel_capacity);

        let reader = tokio::task::spawn_blocking(move || {
            read_archive(&path, &access, |record| tx.blocking_send(Envelope::new(record)).is_ok())
        });

        let s = try_stream! {
            while let Some(env) = rx.recv().await {
                yield env;
            }

            // The channel also closes when the reader fails or panics, so the
            // run only counts as complete once the reader reports success.
            let stats = reader
                .await
                .map_err(|e| PipelineError::Parse(format!("archive reader task failed: {e}")))??;
            tracing::info!(
                files = stats.files,
                tables = stats.tables,
                unrecognized = stats.unrecognized,
                rows = stats.rows,
                records = stats.records,
                skipped = stats.skipped,
                "bulletin archive parsed"
            );
        };

        Box::pin(s)
    }
}

/// Parse the bulletin tables in the archive, handing each record to `emit`.
///
/// Only the most preferred kind present is read: the first spreadsheet, else
/// the first Access database, else every delimited text entry. Entries whose
/// headers are not bulletin columns are skipped; the archive fails when none
/// of them is.
///
/// `emit` returns `false` once nobody is listening anymore, which stops the
/// read early.
pub fn read_archive<F>(path: &Path, access: &AccessTools, mut emit: F) -> Result<ArchiveStats, PipelineError>
where
    F: FnMut(RawRecord) -> bool,
{
    let file = File::open(path)
        .map_err(|e| PipelineError::Parse(format!("failed to open archive {}: {e}", path.display())))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| PipelineError::Parse(format!("{} is not a readable zip archive: {e}", path.display())))?;

    let names: Vec<String> = archive.file_names().map(str::to_owned).collect();
    let Some(kind) = names.iter().filter_map(|n| entry_kind(n)).min() else {
        return Err(PipelineError::Parse(format!(
            "no spreadsheet, Access database or delimited table in archive; entries: {names:?}"
        )));
    };

    let mut entries: Vec<&String> = names.iter().filter(|n| entry_kind(n) == Some(kind)).collect();
    entries.sort();
    if kind != EntryKind::Delimited && entries.len() > 1 {
        tracing::info!(entries = ?entries, "several candidate tables in archive, reading the first");
        entries.truncate(1);
    }

    let mut stats = ArchiveStats::default();
    for name in entries {
        let mut entry = archive
            .by_name(name)
            .map_err(|e| PipelineError::Parse(format!("failed to open archive entry '{name}': {e}")))?;
        tracing::info!(entry = %name, kind = ?kind, size = entry.size(), "reading bulletin table");
        stats.files += 1;

        let read_err = |e: std::io::Error| PipelineError::Parse(format!("{name}: failed to read: {e}"));
        let outcome = match kind {
            EntryKind::Delimited => read_table(entry, name, &mut stats, &mut emit)?,
            EntryKind::Spreadsheet => {
                let mut bytes = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut bytes).map_err(read_err)?;
                read_spreadsheet(bytes, name, &mut stats, &mut emit)?
            }
            EntryKind::Access => {
                // mdbtools needs a real file to open.
                let mut db = tempfile::Builder::new()
                    .prefix("bulletin-")
                    .suffix(".mdb")
                    .tempfile()
                    .map_err(read_err)?;
                std::io::copy(&mut entry, &mut db).map_err(read_err)?;
                db.flush().map_err(read_err)?;
                read_access(db.path(), name, access, &mut stats, &mut emit)?
            }
        };

        match outcome {
            TableOutcome::Read => stats.tables += 1,
            TableOutcome::Unrecognized(reason) => {
                stats.unrecognized += 1;
                metrics::counter!("bulletin_entries_unrecognized_total").increment(1);
                tracing::warn!(entry = %name, reason = %reason, "archive entry is not a bulletin table, skipping");
            }
            TableOutcome::Stopped => {
                tracing::warn!("record consumer went away, stopping archive read");
                return Ok(stats);
            }
        }
    }

    if stats.tables == 0 {
        return Err(PipelineError::Parse(format!(
            "no archive entry has the bulletin columns; entries: {names:?}"
        )));
    }

    if stats.records == 0 {
        return Err(PipelineError::Parse(format!(
            "archive produced no records ({} rows read, {} skipped)",
            stats.rows, stats.skipped
        )));
    }

    Ok(stats)
}

/// Map rows through `columns`, counting and logging the ones that do not
/// yield a record.
fn emit_rows<I, F>(
    columns: &ColumnMap,
    rows: I,
    label: &str,
    stats: &mut ArchiveStats,
    emit: &mut F,
) -> Result<TableOutcome, PipelineError>
where
    I: Iterator<Item = Result<Vec<String>, PipelineError>>,
    F: FnMut(RawRecord) -> bool,
{
    for fields in rows {
        let fields = fields?;
        stats.rows += 1;
        match columns.to_record(&fields) {
            Ok(raw) => {
                stats.records += 1;
                metrics::counter!("bulletin_rows_parsed_total").increment(1);
                if !emit(raw) {
                    return Ok(TableOutcome::Stopped);
                }
            }
            Err(reason) => {
                stats.skipped += 1;
                metrics::counter!("bulletin_rows_skipped_total").increment(1);
                if stats.skipped <= SKIP_LOG_LIMIT {
                    tracing::warn!(entry = label, row = stats.rows, reason = %reason, "skipping bulletin row");
                }
            }
        }
    }
    Ok(TableOutcome::Read)
}

fn read_table<R, F>(
    reader: R,
    label: &str,
    stats: &mut ArchiveStats,
    emit: &mut F,
) -> Result<TableOutcome, PipelineError>
where
    R: Read,
    F: FnMut(RawRecord) -> bool,
{
    let mut reader = BufReader::new(reader);
    let delimiter = sniff_delimiter(
        reader
            .fill_buf()
            .map_err(|e| PipelineError::Parse(format!("{label}: failed to read: {e}")))?,
    );

    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(reader);

    let headers: Vec<String> = rdr
        .byte_headers()
        .map_err(|e| PipelineError::Parse(format!("{label}: failed to read headers: {e}")))?
        .iter()
        .map(decode_field)
        .collect();
    let columns = match ColumnMap::from_headers(headers.iter().map(String::as_str)) {
        Ok(columns) => columns,
        Err(reason) => return Ok(TableOutcome::Unrecognized(reason)),
    };

    let rows = rdr.byte_records().enumerate().map(|(idx, record)| {
        record
            .map(|r| r.iter().map(decode_field).collect::<Vec<String>>())
            .map_err(|e| PipelineError::Parse(format!("{label}: failed to read row {}: {e}", idx + 1)))
    });
    emit_rows(&columns, rows, label, stats, emit)
}

/// First worksheet of an `.xlsx`/`.xls` workbook; the first row holds the headers.
fn read_spreadsheet<F>(
    bytes: Vec<u8>,
    label: &str,
    stats: &mut ArchiveStats,
    emit: &mut F,
) -> Result<TableOutcome, PipelineError>
where
    F: FnMut(RawRecord) -> bool,
{
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
        .map_err(|e| PipelineError::Parse(format!("{label}: not a readable workbook: {e}")))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| PipelineError::Parse(format!("{label}: workbook has no sheets")))?
        .map_err(|e| PipelineError::Parse(format!("{label}: failed to read first sheet: {e}")))?;

    let mut rows = range.rows().map(|row| row.iter().map(cell_text).collect::<Vec<String>>());
    let Some(headers) = rows.next() else {
        return Ok(TableOutcome::Unrecognized("empty worksheet".to_string()));
    };
    let columns = match ColumnMap::from_headers(headers.iter().map(String::as_str)) {
        Ok(columns) => columns,
        Err(reason) => return Ok(TableOutcome::Unrecognized(reason)),
    };

    emit_rows(&columns, rows.map(Ok), label, stats, emit)
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => u8::from(*b).to_string(),
        Data::DateTime(dt) => excel_serial_date(dt.as_f64())
            .map(|d| d.to_string())
            .unwrap_or_default(),
        _ => String::new(),
    }
}

/// Calendar date of an Excel serial day number (1900 date system).
fn excel_serial_date(serial: f64) -> Option<Date> {
    if !serial.is_finite() || serial < 1.0 {
        return None;
    }
    date!(1899 - 12 - 30).checked_add(Duration::days(serial.floor() as i64))
}

/// Pick the bulletin table of an Access database.
fn choose_access_table(tables: &[String]) -> Option<&str> {
    tables
        .iter()
        .find(|t| {
            let lower = t.to_lowercase();
            ACCESS_TABLE_HINTS.iter().any(|hint| lower.contains(hint))
        })
        .or_else(|| tables.first())
        .map(String::as_str)
}

/// Export the bulletin table of an Access database with mdbtools and read the
/// CSV it prints.
fn read_access<F>(
    db: &Path,
    label: &str,
    access: &AccessTools,
    stats: &mut ArchiveStats,
    emit: &mut F,
) -> Result<TableOutcome, PipelineError>
where
    F: FnMut(RawRecord) -> bool,
{
    let tool_err = |cmd: &[String], e: std::io::Error| {
        PipelineError::Parse(format!("{label}: failed to run {cmd:?} (is mdbtools installed?): {e}"))
    };

    let listing = command(&access.tables_cmd)?
        .arg("-1")
        .arg(db)
        .output()
        .map_err(|e| tool_err(&access.tables_cmd, e))?;
    if !listing.status.success() {
        return Err(PipelineError::Parse(format!(
            "{label}: listing tables failed ({}): {}",
            listing.status,
            String::from_utf8_lossy(&listing.stderr).trim()
        )));
    }

    let tables: Vec<String> = String::from_utf8_lossy(&listing.stdout)
        .lines()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    let Some(table) = choose_access_table(&tables) else {
        return Ok(TableOutcome::Unrecognized("Access database has no tables".to_string()));
    };
    tracing::info!(entry = label, table, tables = ?tables, "exporting Access table");

    let mut child = command(&access.export_cmd)?
        .arg(db)
        .arg(table)
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| tool_err(&access.export_cmd, e))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| PipelineError::Parse(format!("{label}: export produced no output stream")))?;

    let table_label = format!("{label}:{table}");
    let outcome = read_table(stdout, &table_label, stats, emit);
    if matches!(outcome, Ok(TableOutcome::Stopped) | Err(_)) {
        let _ = child.kill();
        let _ = child.wait();
        return outcome;
    }

    let status = child
        .wait()
        .map_err(|e| tool_err(&access.export_cmd, e))?;
    if !status.success() {
        return Err(PipelineError::Parse(format!(
            "{table_label}: export exited with {status}"
        )));
    }
    outcome
}

/// Pick the delimiter that occurs most often in the header line.
fn sniff_delimiter(buf: &[u8]) -> u8 {
    let header = buf.split(|b| *b == b'\n').next().unwrap_or(buf);
    let count = |d: u8| header.iter().filter(|b| **b == d).count();

    [b';', b'\t', b',']
        .into_iter()
        .map(|d| (count(d), d))
        .filter(|(n, _)| *n > 0)
        .fold(None, |best: Option<(usize, u8)>, cand| match best {
            Some(b) if b.0 >= cand.0 => Some(b),
            _ => Some(cand),
        })
        .map(|(_, d)| d)
        .unwrap_or(b',')
}

/// UTF-8 when valid, otherwise Latin-1 (each byte is its own code point).
fn decode_field(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_owned(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}
