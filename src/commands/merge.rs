//! Reconciliation of segmented entries, enrichment rows, and portrait
//! associations into final per-person records.
//!
//! The segment store provides the base row set; merging never adds or drops
//! a person, it only fills fields in. Later non-empty values win, and an
//! empty value never erases one already present.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use rusqlite::{Connection, params};
use serde::Deserialize;
use tracing::{info, warn};

use crate::cli::MergeArgs;
use crate::commands::segment::{DB_SCHEMA_VERSION, open_store};
use crate::model::{
    BookAssociationReport, MergeCounts, MergePaths, MergeRunManifest, ProcessingRecord,
};
use crate::util::{ensure_directory, now_utc_string, read_json, utc_compact_string, write_json_replace};

/// Key of one person record: (name, book_id).
type RecordKey = (String, String);

/// One row from a later-pass enrichment file (retried failures, extraction
/// rounds). Only the keys are required; absent fields leave the record
/// untouched.
#[derive(Debug, Clone, Deserialize)]
struct EnrichmentRow {
    name: String,
    book_id: String,
    #[serde(default)]
    page_number: Option<i64>,
    #[serde(default)]
    markdown_chunk: Option<String>,
    #[serde(default)]
    biography: Option<serde_json::Value>,
    #[serde(default)]
    portrait_filename: Option<String>,
}

pub fn run(args: MergeArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("run-{}", utc_compact_string(started_ts));

    let manifest_dir = args.cache_root.join("manifests");
    ensure_directory(&manifest_dir)?;

    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join("biograf_records.sqlite"));
    let output_path = args
        .output_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join("biographical_records.json"));
    let merge_manifest_path = args.merge_manifest_path.clone().unwrap_or_else(|| {
        manifest_dir.join(format!("merge_run_{}.json", utc_compact_string(started_ts)))
    });

    info!(cache_root = %args.cache_root.display(), run_id = %run_id, "starting merge");

    let mut connection = open_store(&db_path)?;

    let mut counts = MergeCounts::default();
    let mut warnings = Vec::new();

    let (mut records, index) = base_records_from_store(&connection, &mut warnings)?;
    if records.is_empty() {
        bail!(
            "record store at {} holds no segmented entries; run segment first",
            db_path.display()
        );
    }
    counts.base_records = records.len();
    info!(records = records.len(), "loaded base records from store");

    for path in &args.enrichment_paths {
        let rows: Vec<EnrichmentRow> = read_json(path)
            .with_context(|| format!("failed to read enrichment file {}", path.display()))?;
        info!(path = %path.display(), rows = rows.len(), "applying enrichment file");
        apply_enrichment_rows(&mut records, &index, rows, &mut counts, &mut warnings);
    }

    let single_page = load_portraits(args.single_page_associations_dir.as_deref(), &mut warnings)?;
    let cross_page = load_portraits(args.associations_dir.as_deref(), &mut warnings)?;
    counts.single_page_portraits = single_page.len();
    counts.cross_page_portraits = cross_page.len();

    let portraits = merge_portrait_sources(single_page, cross_page);
    attach_portraits(&mut records, &index, &portraits, &mut counts, &mut warnings);

    counts.records_written = rebuild_records(&mut connection, &records)?;
    write_json_replace(&output_path, &records)?;
    info!(
        path = %output_path.display(),
        records = counts.records_written,
        "wrote reconciled records"
    );

    let manifest = MergeRunManifest {
        manifest_version: 1,
        run_id,
        db_schema_version: DB_SCHEMA_VERSION.to_string(),
        status: "completed".to_string(),
        started_at,
        updated_at: now_utc_string(),
        command: render_merge_command(&args),
        paths: MergePaths {
            db_path: db_path.display().to_string(),
            associations_dir: args
                .associations_dir
                .as_ref()
                .map(|path| path.display().to_string()),
            single_page_associations_dir: args
                .single_page_associations_dir
                .as_ref()
                .map(|path| path.display().to_string()),
            enrichment_paths: args
                .enrichment_paths
                .iter()
                .map(|path| path.display().to_string())
                .collect(),
            output_path: output_path.display().to_string(),
        },
        counts,
        warnings,
    };
    write_json_replace(&merge_manifest_path, &manifest)?;

    info!(path = %merge_manifest_path.display(), "wrote merge run manifest");
    info!(
        records = manifest.counts.records_written,
        fields_updated = manifest.counts.fields_updated,
        portraits_attached = manifest.counts.portraits_attached,
        enrichment_rows_dropped = manifest.counts.enrichment_rows_dropped,
        "merge completed"
    );

    Ok(())
}

/// Reads the segmented entries in insertion order. The returned index maps
/// (name, book_id) to position; when the same person appears twice in one
/// book, the first row keeps the key and later rows are only reachable
/// positionally.
fn base_records_from_store(
    connection: &Connection,
    warnings: &mut Vec<String>,
) -> Result<(Vec<ProcessingRecord>, BTreeMap<RecordKey, usize>)> {
    let mut statement = connection.prepare(
        "SELECT name, book_id, page_number, chunk, chunk_found
         FROM entries ORDER BY book_id, seq",
    )?;
    let rows = statement.query_map([], |row| {
        Ok(ProcessingRecord {
            name: row.get(0)?,
            book_id: row.get(1)?,
            page_number: row.get(2)?,
            markdown_chunk: row.get(3)?,
            chunk_found: row.get(4)?,
            biography: None,
            portrait_filename: None,
        })
    })?;

    let mut records = Vec::new();
    let mut index: BTreeMap<RecordKey, usize> = BTreeMap::new();
    for row in rows {
        let record = row?;
        let key = (record.name.clone(), record.book_id.clone());
        if index.contains_key(&key) {
            let warning = format!(
                "duplicate entry for {} in book {}; enrichment applies to the first",
                record.name, record.book_id
            );
            warn!(warning = %warning, "merge warning");
            warnings.push(warning);
        } else {
            index.insert(key, records.len());
        }
        records.push(record);
    }
    Ok((records, index))
}

fn apply_enrichment_rows(
    records: &mut [ProcessingRecord],
    index: &BTreeMap<RecordKey, usize>,
    rows: Vec<EnrichmentRow>,
    counts: &mut MergeCounts,
    warnings: &mut Vec<String>,
) {
    for row in rows {
        counts.enrichment_rows_seen += 1;
        let key = (row.name.clone(), row.book_id.clone());
        let Some(&position) = index.get(&key) else {
            counts.enrichment_rows_dropped += 1;
            let warning = format!(
                "enrichment row for {} in book {} matches no record, dropped",
                row.name, row.book_id
            );
            warn!(warning = %warning, "merge warning");
            warnings.push(warning);
            continue;
        };

        let record = &mut records[position];
        let mut updated = 0usize;

        if let Some(chunk) = row.markdown_chunk
            && !chunk.trim().is_empty()
        {
            record.markdown_chunk = chunk;
            record.chunk_found = true;
            updated += 1;
        }
        if let Some(page_number) = row.page_number {
            if record.page_number != Some(page_number) {
                updated += 1;
            }
            record.page_number = Some(page_number);
        }
        if let Some(biography) = row.biography
            && !biography.is_null()
        {
            record.biography = Some(biography);
            updated += 1;
        }
        if let Some(portrait) = row.portrait_filename
            && !portrait.trim().is_empty()
        {
            record.portrait_filename = Some(portrait);
            updated += 1;
        }

        counts.fields_updated += updated;
        counts.enrichment_rows_applied += 1;
    }
}

/// Collects person-to-portrait links from the per-book association reports
/// in a directory. The combined report is skipped; an unreadable report is
/// warned about, not fatal.
fn load_portraits(
    dir: Option<&Path>,
    warnings: &mut Vec<String>,
) -> Result<BTreeMap<RecordKey, String>> {
    let Some(dir) = dir else {
        return Ok(BTreeMap::new());
    };

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("failed to read association directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| {
                    name.ends_with("_portrait_associations.json") && !name.starts_with("all_books")
                })
        })
        .collect();
    paths.sort();

    let mut portraits: BTreeMap<RecordKey, String> = BTreeMap::new();
    for path in &paths {
        let report: BookAssociationReport = match read_json(path) {
            Ok(report) => report,
            Err(err) => {
                let warning = format!("unreadable association report {}: {err}", path.display());
                warn!(warning = %warning, "merge warning");
                warnings.push(warning);
                continue;
            }
        };
        for assoc in &report.associations {
            let Some(person) = assoc.associated_person.as_deref() else {
                continue;
            };
            if person.trim().is_empty() || assoc.image_filename.trim().is_empty() {
                continue;
            }
            // One portrait per person; the first association in page order wins.
            portraits
                .entry((person.to_string(), report.book_id.clone()))
                .or_insert_with(|| assoc.image_filename.clone());
        }
    }
    info!(dir = %dir.display(), portraits = portraits.len(), "collected portrait links");
    Ok(portraits)
}

/// Cross-page results supersede single-page ones for the same person; the
/// cross-page pass saw everything the single-page pass did plus the page
/// boundaries.
fn merge_portrait_sources(
    single_page: BTreeMap<RecordKey, String>,
    cross_page: BTreeMap<RecordKey, String>,
) -> BTreeMap<RecordKey, String> {
    let mut merged = single_page;
    for (key, filename) in cross_page {
        merged.insert(key, filename);
    }
    merged
}

fn attach_portraits(
    records: &mut [ProcessingRecord],
    index: &BTreeMap<RecordKey, usize>,
    portraits: &BTreeMap<RecordKey, String>,
    counts: &mut MergeCounts,
    warnings: &mut Vec<String>,
) {
    for (key, filename) in portraits {
        let Some(&position) = index.get(key) else {
            let warning = format!(
                "portrait {} links {} in book {} but no such record exists",
                filename, key.0, key.1
            );
            warn!(warning = %warning, "merge warning");
            warnings.push(warning);
            continue;
        };
        let record = &mut records[position];
        if record.portrait_filename.as_deref() != Some(filename.as_str()) {
            record.portrait_filename = Some(filename.clone());
            counts.portraits_attached += 1;
        }
    }
}

/// Replaces the records table with the reconciled set, transactionally.
fn rebuild_records(connection: &mut Connection, records: &[ProcessingRecord]) -> Result<usize> {
    let tx = connection.transaction()?;
    let mut written = 0usize;
    {
        tx.execute("DELETE FROM records", [])?;
        let mut statement = tx.prepare(
            "INSERT INTO records(name, book_id, page_number, markdown_chunk, chunk_found,
                                 biography_json, portrait_filename)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(name, book_id) DO UPDATE SET
               page_number=excluded.page_number,
               markdown_chunk=excluded.markdown_chunk,
               chunk_found=excluded.chunk_found,
               biography_json=excluded.biography_json,
               portrait_filename=excluded.portrait_filename",
        )?;
        for record in records {
            let biography_json = match &record.biography {
                Some(value) => Some(serde_json::to_string(value)?),
                None => None,
            };
            statement.execute(params![
                record.name,
                record.book_id,
                record.page_number,
                record.markdown_chunk,
                record.chunk_found,
                biography_json,
                record.portrait_filename,
            ])?;
            written += 1;
        }
    }
    tx.commit()?;
    Ok(written)
}

fn render_merge_command(args: &MergeArgs) -> String {
    let mut command = vec![
        "biograf".to_string(),
        "merge".to_string(),
        "--cache-root".to_string(),
        args.cache_root.display().to_string(),
    ];
    if let Some(path) = &args.db_path {
        command.push("--db-path".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.associations_dir {
        command.push("--associations-dir".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.single_page_associations_dir {
        command.push("--single-page-associations-dir".to_string());
        command.push(path.display().to_string());
    }
    for path in &args.enrichment_paths {
        command.push("--enrichment-path".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.output_path {
        command.push("--output-path".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.merge_manifest_path {
        command.push("--merge-manifest-path".to_string());
        command.push(path.display().to_string());
    }
    command.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, book_id: &str, chunk: &str) -> ProcessingRecord {
        ProcessingRecord {
            name: name.to_string(),
            book_id: book_id.to_string(),
            page_number: None,
            markdown_chunk: chunk.to_string(),
            chunk_found: !chunk.is_empty(),
            biography: None,
            portrait_filename: None,
        }
    }

    fn indexed(records: &[ProcessingRecord]) -> BTreeMap<RecordKey, usize> {
        records
            .iter()
            .enumerate()
            .map(|(position, record)| {
                ((record.name.clone(), record.book_id.clone()), position)
            })
            .collect()
    }

    fn row(name: &str, book_id: &str) -> EnrichmentRow {
        EnrichmentRow {
            name: name.to_string(),
            book_id: book_id.to_string(),
            page_number: None,
            markdown_chunk: None,
            biography: None,
            portrait_filename: None,
        }
    }

    #[test]
    fn non_empty_enrichment_wins_over_base_value() {
        let mut records = vec![record("HANSEN, Ole", "bok1", "old chunk")];
        let index = indexed(&records);
        let mut counts = MergeCounts::default();
        let mut warnings = Vec::new();

        let mut enriched = row("HANSEN, Ole", "bok1");
        enriched.markdown_chunk = Some("new chunk".to_string());
        enriched.biography = Some(serde_json::json!({"born": 1880}));
        apply_enrichment_rows(&mut records, &index, vec![enriched], &mut counts, &mut warnings);

        assert_eq!(records[0].markdown_chunk, "new chunk");
        assert_eq!(
            records[0].biography,
            Some(serde_json::json!({"born": 1880}))
        );
        assert_eq!(counts.enrichment_rows_applied, 1);
        assert_eq!(counts.fields_updated, 2);
        assert!(warnings.is_empty());
    }

    #[test]
    fn empty_enrichment_never_erases_base_value() {
        let mut records = vec![record("HANSEN, Ole", "bok1", "kept chunk")];
        records[0].biography = Some(serde_json::json!({"born": 1880}));
        records[0].portrait_filename = Some("p.png".to_string());
        let index = indexed(&records);
        let mut counts = MergeCounts::default();
        let mut warnings = Vec::new();

        let mut enriched = row("HANSEN, Ole", "bok1");
        enriched.markdown_chunk = Some("   ".to_string());
        enriched.biography = Some(serde_json::Value::Null);
        enriched.portrait_filename = Some(String::new());
        apply_enrichment_rows(&mut records, &index, vec![enriched], &mut counts, &mut warnings);

        assert_eq!(records[0].markdown_chunk, "kept chunk");
        assert_eq!(
            records[0].biography,
            Some(serde_json::json!({"born": 1880}))
        );
        assert_eq!(records[0].portrait_filename.as_deref(), Some("p.png"));
        assert_eq!(counts.fields_updated, 0);
    }

    #[test]
    fn enrichment_fills_empty_base_chunk() {
        let mut records = vec![record("OLSEN, Anna", "bok1", "")];
        let index = indexed(&records);
        let mut counts = MergeCounts::default();
        let mut warnings = Vec::new();

        let mut enriched = row("OLSEN, Anna", "bok1");
        enriched.markdown_chunk = Some("recovered chunk".to_string());
        apply_enrichment_rows(&mut records, &index, vec![enriched], &mut counts, &mut warnings);

        assert_eq!(records[0].markdown_chunk, "recovered chunk");
        assert!(records[0].chunk_found);
    }

    #[test]
    fn unmatched_enrichment_rows_are_dropped() {
        let mut records = vec![record("HANSEN, Ole", "bok1", "chunk")];
        let index = indexed(&records);
        let mut counts = MergeCounts::default();
        let mut warnings = Vec::new();

        apply_enrichment_rows(
            &mut records,
            &index,
            vec![row("NORDMANN, Kari", "bok1")],
            &mut counts,
            &mut warnings,
        );

        assert_eq!(counts.enrichment_rows_dropped, 1);
        assert_eq!(counts.enrichment_rows_applied, 0);
        assert_eq!(warnings.len(), 1);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn applying_the_same_enrichment_twice_is_idempotent() {
        let mut records = vec![record("HANSEN, Ole", "bok1", "old")];
        let index = indexed(&records);
        let mut counts = MergeCounts::default();
        let mut warnings = Vec::new();

        let mut enriched = row("HANSEN, Ole", "bok1");
        enriched.markdown_chunk = Some("new".to_string());
        enriched.page_number = Some(12);
        apply_enrichment_rows(
            &mut records,
            &index,
            vec![enriched.clone()],
            &mut counts,
            &mut warnings,
        );
        let snapshot = records.clone();
        apply_enrichment_rows(&mut records, &index, vec![enriched], &mut counts, &mut warnings);

        assert_eq!(records[0].markdown_chunk, snapshot[0].markdown_chunk);
        assert_eq!(records[0].page_number, snapshot[0].page_number);
    }

    #[test]
    fn cross_page_portraits_supersede_single_page() {
        let key = ("HANSEN, Ole".to_string(), "bok1".to_string());
        let mut single_page = BTreeMap::new();
        single_page.insert(key.clone(), "single.png".to_string());
        single_page.insert(
            ("OLSEN, Anna".to_string(), "bok1".to_string()),
            "anna.png".to_string(),
        );
        let mut cross_page = BTreeMap::new();
        cross_page.insert(key.clone(), "cross.png".to_string());

        let merged = merge_portrait_sources(single_page, cross_page);

        assert_eq!(merged.get(&key).map(String::as_str), Some("cross.png"));
        // Single-page links without a cross-page counterpart survive.
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn portrait_attachment_preserves_row_count() {
        let mut records = vec![
            record("HANSEN, Ole", "bok1", "chunk a"),
            record("OLSEN, Anna", "bok1", "chunk b"),
        ];
        let index = indexed(&records);
        let mut counts = MergeCounts::default();
        let mut warnings = Vec::new();

        let mut portraits = BTreeMap::new();
        portraits.insert(
            ("HANSEN, Ole".to_string(), "bok1".to_string()),
            "h.png".to_string(),
        );
        portraits.insert(
            ("UKJENT, Navn".to_string(), "bok1".to_string()),
            "u.png".to_string(),
        );
        attach_portraits(&mut records, &index, &portraits, &mut counts, &mut warnings);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].portrait_filename.as_deref(), Some("h.png"));
        assert!(records[1].portrait_filename.is_none());
        assert_eq!(counts.portraits_attached, 1);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn records_table_rebuild_roundtrips() {
        let mut connection = Connection::open_in_memory().unwrap();
        crate::commands::segment::ensure_schema(&connection).unwrap();

        let mut records = vec![record("HANSEN, Ole", "bok1", "chunk")];
        records[0].biography = Some(serde_json::json!({"born": 1880}));
        records[0].portrait_filename = Some("h.png".to_string());

        let written = rebuild_records(&mut connection, &records).unwrap();
        assert_eq!(written, 1);

        let (biography_json, portrait): (String, String) = connection
            .query_row(
                "SELECT biography_json, portrait_filename FROM records
                 WHERE name = 'HANSEN, Ole' AND book_id = 'bok1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(biography_json, "{\"born\":1880}");
        assert_eq!(portrait, "h.png");
    }
}
