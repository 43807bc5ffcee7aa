//! Read-only snapshot of the cache: manifests, record store counts, and
//! association reports. Never creates or migrates anything.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::cli::StatusArgs;

pub fn run(args: StatusArgs) -> Result<()> {
    info!(cache_root = %args.cache_root.display(), "status");

    report_manifests(&args.cache_root.join("manifests"))?;

    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join("biograf_records.sqlite"));
    report_store(&db_path)?;

    let associations_dir = args
        .associations_dir
        .clone()
        .unwrap_or_else(|| args.cache_root.join("associations"));
    report_associations(&associations_dir)?;

    Ok(())
}

fn report_manifests(manifest_dir: &Path) -> Result<()> {
    if !manifest_dir.exists() {
        info!(path = %manifest_dir.display(), "no manifests directory yet");
        return Ok(());
    }

    let inventory_present = manifest_dir.join("page_inventory.json").exists();
    let mut segment_runs = 0usize;
    let mut merge_runs = 0usize;
    for entry in fs::read_dir(manifest_dir)
        .with_context(|| format!("failed to read {}", manifest_dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with("segment_run_") && name.ends_with(".json") {
            segment_runs += 1;
        }
        if name.starts_with("merge_run_") && name.ends_with(".json") {
            merge_runs += 1;
        }
    }

    info!(
        path = %manifest_dir.display(),
        inventory_present,
        segment_runs,
        merge_runs,
        "manifests"
    );
    Ok(())
}

fn report_store(db_path: &Path) -> Result<()> {
    if !db_path.exists() {
        info!(path = %db_path.display(), "no record store yet; run segment first");
        return Ok(());
    }

    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;

    let schema_version: String = connection
        .query_row(
            "SELECT value FROM metadata WHERE key = 'db_schema_version'",
            [],
            |row| row.get(0),
        )
        .unwrap_or_else(|_| "unknown".to_string());
    let books = table_count(&connection, "books")?;
    let entries = table_count(&connection, "entries")?;
    let empty_chunks: i64 = connection
        .query_row(
            "SELECT COUNT(*) FROM entries WHERE chunk_found = 0",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);
    let records = table_count(&connection, "records")?;
    let with_portrait: i64 = connection
        .query_row(
            "SELECT COUNT(*) FROM records WHERE portrait_filename IS NOT NULL",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    info!(
        path = %db_path.display(),
        schema_version = %schema_version,
        books,
        entries,
        empty_chunks,
        records,
        with_portrait,
        "record store"
    );
    if entries > 0 && records == 0 {
        info!("entries are segmented but not reconciled; run merge");
    }
    Ok(())
}

fn table_count(connection: &Connection, table: &str) -> Result<i64> {
    // Table names come from the fixed schema, never from input.
    connection
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })
        .with_context(|| format!("failed to count rows in {table}"))
}

fn report_associations(associations_dir: &Path) -> Result<()> {
    if !associations_dir.exists() {
        info!(path = %associations_dir.display(), "no association reports yet; run associate");
        return Ok(());
    }

    let mut book_reports = 0usize;
    let mut combined_present = false;
    for entry in fs::read_dir(associations_dir)
        .with_context(|| format!("failed to read {}", associations_dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name == "all_books_portrait_associations.json" {
            combined_present = true;
        } else if name.ends_with("_portrait_associations.json") {
            book_reports += 1;
        }
    }

    if book_reports == 0 && !combined_present {
        warn!(path = %associations_dir.display(), "association directory exists but holds no reports");
        return Ok(());
    }
    info!(
        path = %associations_dir.display(),
        book_reports,
        combined_present,
        "association reports"
    );
    Ok(())
}
