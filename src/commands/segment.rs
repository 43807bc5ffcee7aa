use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use rusqlite::{Connection, params};
use tracing::{info, warn};

use crate::cli::SegmentArgs;
use crate::commands::inventory;
use crate::model::{
    BookEntry, NameEntry, NamesManifest, SegmentCounts, SegmentPaths, SegmentRunManifest,
};
use crate::util::{
    ensure_directory, now_utc_string, read_json, utc_compact_string, write_json_replace,
};

pub(crate) const DB_SCHEMA_VERSION: &str = "0.2.0";

pub fn run(args: SegmentArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("run-{}", utc_compact_string(started_ts));

    let manifest_dir = args.cache_root.join("manifests");
    ensure_directory(&manifest_dir)?;

    let inventory_manifest_path = args
        .inventory_manifest_path
        .clone()
        .unwrap_or_else(|| manifest_dir.join("page_inventory.json"));
    let segment_manifest_path = args.segment_manifest_path.clone().unwrap_or_else(|| {
        manifest_dir.join(format!("segment_run_{}.json", utc_compact_string(started_ts)))
    });
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join("biograf_records.sqlite"));

    info!(cache_root = %args.cache_root.display(), run_id = %run_id, "starting segment");

    let inventory = inventory::load_or_build(
        &args.page_dir,
        &inventory_manifest_path,
        args.refresh_inventory,
    )?;

    let names: NamesManifest = read_json(&args.names_manifest_path)?;

    let mut connection = open_store(&db_path)?;

    let mut counts = SegmentCounts {
        books_in_inventory: inventory.books.len(),
        ..SegmentCounts::default()
    };
    let mut warnings = Vec::new();

    for book in &inventory.books {
        let Some(book_names) = names.books.get(&book.book_id) else {
            counts.books_without_names += 1;
            let warning = format!("no detected names for book {}, skipped", book.book_id);
            warn!(warning = %warning, "segment warning");
            warnings.push(warning);
            continue;
        };

        if book_names.biographical_entries.is_empty() {
            counts.books_without_names += 1;
            continue;
        }

        counts.names_listed += book_names.biographical_entries.len();

        let (entries, dropped) =
            collapse_consecutive_duplicates(book_names.biographical_entries.clone());
        counts.consecutive_duplicates_dropped += dropped;

        let text = match concatenate_book_text(book, &args.page_dir, &mut warnings) {
            Some(text) => text,
            None => {
                let warning = format!("no readable pages for book {}, skipped", book.book_id);
                warn!(warning = %warning, "segment warning");
                warnings.push(warning);
                continue;
            }
        };

        let names_only: Vec<String> = entries
            .iter()
            .map(|entry| entry.person_name.clone())
            .collect();
        let chunks = chunk_text_by_names(&text, &names_only);

        for chunk in &chunks {
            if !chunk.found {
                counts.empty_chunks += 1;
                warn!(
                    book_id = %book.book_id,
                    name = %chunk.name,
                    "name not found in book text, stored with empty chunk"
                );
            }
            if chunk.punctuation_fallback {
                counts.punctuation_fallback_hits += 1;
            }
        }

        counts.entries_inserted += insert_entries(&mut connection, book, &entries, &chunks)?;
        counts.books_segmented += 1;

        info!(
            book_id = %book.book_id,
            names = entries.len(),
            empty_chunks = chunks.iter().filter(|chunk| !chunk.found).count(),
            "segmented book"
        );
    }

    let updated_at = now_utc_string();
    let manifest = SegmentRunManifest {
        manifest_version: 1,
        run_id,
        db_schema_version: DB_SCHEMA_VERSION.to_string(),
        status: "completed".to_string(),
        started_at,
        updated_at,
        command: render_segment_command(&args),
        paths: SegmentPaths {
            page_dir: args.page_dir.display().to_string(),
            inventory_manifest_path: inventory_manifest_path.display().to_string(),
            names_manifest_path: args.names_manifest_path.display().to_string(),
            db_path: db_path.display().to_string(),
        },
        counts,
        warnings,
    };

    write_json_replace(&segment_manifest_path, &manifest)?;

    info!(path = %segment_manifest_path.display(), "wrote segment run manifest");
    info!(
        books = manifest.counts.books_segmented,
        entries = manifest.counts.entries_inserted,
        empty_chunks = manifest.counts.empty_chunks,
        "segment completed"
    );

    Ok(())
}

/// Open the record store, applying the connection pragmas and schema the
/// other commands rely on.
pub(crate) fn open_store(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        ensure_directory(parent)?;
    }

    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;

    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;

    ensure_schema(&connection)?;
    Ok(connection)
}

pub(crate) fn ensure_schema(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS books (
          book_id TEXT PRIMARY KEY,
          page_count INTEGER NOT NULL,
          page_start INTEGER,
          page_end INTEGER
        );

        CREATE TABLE IF NOT EXISTS entries (
          book_id TEXT NOT NULL,
          seq INTEGER NOT NULL,
          name TEXT NOT NULL,
          page_number INTEGER,
          chunk TEXT NOT NULL,
          chunk_found INTEGER NOT NULL,
          punctuation_fallback INTEGER NOT NULL DEFAULT 0,
          PRIMARY KEY(book_id, seq)
        );

        CREATE TABLE IF NOT EXISTS records (
          name TEXT NOT NULL,
          book_id TEXT NOT NULL,
          page_number INTEGER,
          markdown_chunk TEXT NOT NULL,
          chunk_found INTEGER NOT NULL,
          biography_json TEXT,
          portrait_filename TEXT,
          PRIMARY KEY(name, book_id)
        );
        ",
    )?;

    let now = now_utc_string();
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [DB_SCHEMA_VERSION],
    )?;
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_updated_at', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [now],
    )?;

    Ok(())
}

fn insert_entries(
    connection: &mut Connection,
    book: &BookEntry,
    entries: &[NameEntry],
    chunks: &[NameChunk],
) -> Result<usize> {
    let tx = connection.transaction()?;
    let mut inserted = 0usize;

    {
        tx.execute(
            "INSERT INTO books(book_id, page_count, page_start, page_end)
             VALUES(?1, ?2, ?3, ?4)
             ON CONFLICT(book_id) DO UPDATE SET
               page_count=excluded.page_count,
               page_start=excluded.page_start,
               page_end=excluded.page_end",
            params![
                book.book_id,
                book.page_count as i64,
                book.pages.first().map(|page| page.page_number),
                book.pages.last().map(|page| page.page_number),
            ],
        )?;

        tx.execute("DELETE FROM entries WHERE book_id = ?1", [&book.book_id])?;

        let mut statement = tx.prepare(
            "INSERT INTO entries(book_id, seq, name, page_number, chunk, chunk_found, punctuation_fallback)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;

        for (seq, (entry, chunk)) in entries.iter().zip(chunks.iter()).enumerate() {
            statement.execute(params![
                book.book_id,
                seq as i64,
                entry.person_name,
                entry.page_number,
                chunk.chunk,
                chunk.found,
                chunk.punctuation_fallback,
            ])?;
            inserted += 1;
        }
    }

    tx.commit()?;
    Ok(inserted)
}

fn concatenate_book_text(
    book: &BookEntry,
    page_dir: &Path,
    warnings: &mut Vec<String>,
) -> Option<String> {
    let mut parts = Vec::with_capacity(book.pages.len());

    for page in &book.pages {
        let path = page_dir.join(&page.filename);
        match fs::read_to_string(&path) {
            Ok(content) => parts.push(content),
            Err(err) => {
                let warning = format!("failed to read page {}: {err}", path.display());
                warn!(warning = %warning, "segment warning");
                warnings.push(warning);
            }
        }
    }

    if parts.is_empty() {
        return None;
    }

    Some(parts.join("\n\n"))
}

#[derive(Debug, Clone)]
pub(crate) struct NameChunk {
    pub name: String,
    pub chunk: String,
    pub found: bool,
    pub punctuation_fallback: bool,
}

/// Drop consecutive duplicate names, keeping the first of each run. OCR'd
/// page headers repeat the entry name of a continued biography; collapsing
/// runs keeps one entry per person without touching legitimate repeats
/// elsewhere in the book.
pub(crate) fn collapse_consecutive_duplicates(
    entries: Vec<NameEntry>,
) -> (Vec<NameEntry>, usize) {
    let mut kept: Vec<NameEntry> = Vec::with_capacity(entries.len());
    let mut dropped = 0usize;

    for entry in entries {
        if kept
            .last()
            .is_some_and(|previous| previous.person_name == entry.person_name)
        {
            dropped += 1;
            continue;
        }
        kept.push(entry);
    }

    (kept, dropped)
}

/// Split a book's concatenated text into one chunk per name. Chunk `i` starts
/// at the first case-insensitive occurrence of name `i` and ends immediately
/// before the first occurrence of name `i+1` after that match, or at end of
/// text for the last name. An unlocatable name yields an empty flagged chunk.
pub(crate) fn chunk_text_by_names(text: &str, names: &[String]) -> Vec<NameChunk> {
    let mut chunks = Vec::with_capacity(names.len());

    for (index, name) in names.iter().enumerate() {
        let Some(found) = locate_name(text, name, 0) else {
            chunks.push(NameChunk {
                name: name.clone(),
                chunk: String::new(),
                found: false,
                punctuation_fallback: false,
            });
            continue;
        };

        let search_from = found.start + found.len;
        let end = match names.get(index + 1) {
            Some(next_name) => locate_name(text, next_name, search_from)
                .map(|next| next.start)
                .unwrap_or(text.len()),
            None => text.len(),
        };

        chunks.push(NameChunk {
            name: name.clone(),
            chunk: text[found.start..end].trim().to_string(),
            found: true,
            punctuation_fallback: found.punctuation_fallback,
        });
    }

    chunks
}

struct NameMatch {
    start: usize,
    len: usize,
    punctuation_fallback: bool,
}

fn locate_name(text: &str, name: &str, from: usize) -> Option<NameMatch> {
    let haystack = &text[from..];

    if let Some((start, len)) = find_case_insensitive(haystack, name) {
        return Some(NameMatch {
            start: from + start,
            len,
            punctuation_fallback: false,
        });
    }

    // OCR noise often mangles the separators inside a name; retry without
    // punctuation before giving up.
    let simplified = strip_punctuation(name);
    if simplified != name && !simplified.trim().is_empty() {
        if let Some((start, len)) = find_case_insensitive(haystack, &simplified) {
            return Some(NameMatch {
                start: from + start,
                len,
                punctuation_fallback: true,
            });
        }
    }

    None
}

fn find_case_insensitive(haystack: &str, needle: &str) -> Option<(usize, usize)> {
    let pattern = Regex::new(&format!("(?i){}", regex::escape(needle))).ok()?;
    pattern
        .find(haystack)
        .map(|found| (found.start(), found.end() - found.start()))
}

fn strip_punctuation(name: &str) -> String {
    name.chars()
        .filter(|character| character.is_alphanumeric() || character.is_whitespace())
        .collect()
}

fn render_segment_command(args: &SegmentArgs) -> String {
    let mut command = vec![
        "biograf".to_string(),
        "segment".to_string(),
        "--cache-root".to_string(),
        args.cache_root.display().to_string(),
        "--page-dir".to_string(),
        args.page_dir.display().to_string(),
        "--names-manifest-path".to_string(),
        args.names_manifest_path.display().to_string(),
    ];

    if let Some(path) = &args.inventory_manifest_path {
        command.push("--inventory-manifest-path".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.segment_manifest_path {
        command.push("--segment-manifest-path".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.db_path {
        command.push("--db-path".to_string());
        command.push(path.display().to_string());
    }
    if args.refresh_inventory {
        command.push("--refresh-inventory".to_string());
    }

    command.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_entry(name: &str) -> NameEntry {
        NameEntry {
            person_name: name.to_string(),
            page_number: None,
            confidence: None,
        }
    }

    #[test]
    fn chunk_boundaries_follow_name_order() {
        let text = "HANSEN, Ole was born in Bergen.\nOLSEN, Anna grew up in Oslo.\nBERG, Nils ended the book.";
        let names = vec![
            "HANSEN, Ole".to_string(),
            "OLSEN, Anna".to_string(),
            "BERG, Nils".to_string(),
        ];

        let chunks = chunk_text_by_names(text, &names);

        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].chunk.starts_with("HANSEN, Ole"));
        assert!(chunks[0].chunk.ends_with("Bergen."));
        assert!(!chunks[0].chunk.contains("OLSEN"));
        assert!(chunks[1].chunk.starts_with("OLSEN, Anna"));
        assert!(chunks[2].chunk.ends_with("ended the book."));
    }

    #[test]
    fn chunk_search_is_case_insensitive() {
        let text = "Hansen, Ole lived here. OLSEN, Anna lived there.";
        let names = vec!["HANSEN, Ole".to_string(), "olsen, anna".to_string()];

        let chunks = chunk_text_by_names(text, &names);

        assert!(chunks[0].found);
        assert!(chunks[0].chunk.starts_with("Hansen, Ole"));
        assert!(chunks[1].found);
    }

    #[test]
    fn unlocatable_name_yields_empty_flagged_chunk() {
        let text = "HANSEN, Ole was here.";
        let names = vec!["HANSEN, Ole".to_string(), "NORDMANN, Kari".to_string()];

        let chunks = chunk_text_by_names(text, &names);

        assert!(chunks[0].found);
        assert!(chunks[0].chunk.ends_with("was here."));
        assert!(!chunks[1].found);
        assert!(chunks[1].chunk.is_empty());
    }

    #[test]
    fn punctuation_stripped_retry_tolerates_ocr_noise() {
        let text = "HANSEN Ole was recorded without the comma.";
        let names = vec!["HANSEN, Ole".to_string()];

        let chunks = chunk_text_by_names(text, &names);

        assert!(chunks[0].found);
        assert!(chunks[0].punctuation_fallback);
        assert!(chunks[0].chunk.starts_with("HANSEN Ole"));
    }

    #[test]
    fn consecutive_duplicates_collapse_to_first_occurrence() {
        let entries = vec![
            name_entry("HANSEN, Ole"),
            name_entry("HANSEN, Ole"),
            name_entry("OLSEN, Anna"),
            name_entry("HANSEN, Ole"),
        ];

        let (kept, dropped) = collapse_consecutive_duplicates(entries);

        assert_eq!(dropped, 1);
        let names: Vec<&str> = kept.iter().map(|entry| entry.person_name.as_str()).collect();
        // Only the consecutive repeat collapses; the later re-occurrence stays.
        assert_eq!(names, vec!["HANSEN, Ole", "OLSEN, Anna", "HANSEN, Ole"]);
    }

    #[test]
    fn later_duplicate_of_earlier_name_anchors_after_previous_chunk() {
        let text = "AAS, Per first entry. BERG, Siri middle entry. AAS, Per trailing entry.";
        let names = vec![
            "AAS, Per".to_string(),
            "BERG, Siri".to_string(),
            "AAS, Per".to_string(),
        ];

        let chunks = chunk_text_by_names(text, &names);

        assert!(chunks[1].chunk.starts_with("BERG, Siri"));
        assert!(chunks[1].chunk.ends_with("middle entry."));
        // The third chunk re-finds the first occurrence when searching from
        // the start; its span still ends at end of text.
        assert!(chunks[2].found);
        assert!(chunks[2].chunk.ends_with("trailing entry."));
    }

    #[test]
    fn store_schema_roundtrips_entries() {
        let mut connection = Connection::open_in_memory().unwrap();
        ensure_schema(&connection).unwrap();

        let book = BookEntry {
            book_id: "digibok_x".to_string(),
            page_count: 1,
            page_range: "1-1".to_string(),
            pages: vec![crate::model::PageEntry {
                filename: "digibok_x_0001.md".to_string(),
                book_id: "digibok_x".to_string(),
                page_number: 1,
                page_label: "0001".to_string(),
                sha256: "deadbeef".to_string(),
            }],
        };
        let entries = vec![name_entry("HANSEN, Ole")];
        let chunks = vec![NameChunk {
            name: "HANSEN, Ole".to_string(),
            chunk: "HANSEN, Ole biography text".to_string(),
            found: true,
            punctuation_fallback: false,
        }];

        let inserted = insert_entries(&mut connection, &book, &entries, &chunks).unwrap();
        assert_eq!(inserted, 1);

        let count: i64 = connection
            .query_row("SELECT COUNT(*) FROM entries WHERE book_id = 'digibok_x'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
