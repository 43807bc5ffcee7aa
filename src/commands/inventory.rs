use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::cli::InventoryArgs;
use crate::model::{BookEntry, PageEntry, PageInventoryManifest};
use crate::util::{now_utc_string, read_json, sha256_file, write_json_replace};

pub fn run(args: InventoryArgs) -> Result<()> {
    let manifest = build_manifest(&args.page_dir)?;

    if args.dry_run {
        info!(
            book_count = manifest.book_count,
            page_count = manifest.page_count,
            source = %manifest.source_directory,
            "inventory dry-run complete"
        );
        return Ok(());
    }

    let manifest_path = args
        .manifest_path
        .unwrap_or_else(|| args.cache_root.join("manifests").join("page_inventory.json"));

    write_json_replace(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), "wrote page inventory manifest");
    info!(
        book_count = manifest.book_count,
        page_count = manifest.page_count,
        "inventory completed"
    );

    Ok(())
}

/// Scan a directory of per-page markdown files and group them into ordered
/// books. Filenames that do not match the `prefix_digits` pattern are skipped
/// with a warning; the run only fails when no page matches at all.
pub fn build_manifest(page_dir: &Path) -> Result<PageInventoryManifest> {
    let mut page_paths = discover_page_files(page_dir)?;
    page_paths.sort();

    if page_paths.is_empty() {
        bail!("no markdown page files found in {}", page_dir.display());
    }

    let mut warnings = Vec::new();
    let mut grouped: BTreeMap<String, Vec<PageEntry>> = BTreeMap::new();
    let mut page_count = 0usize;

    for path in page_paths {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(ToOwned::to_owned)
            .with_context(|| format!("invalid UTF-8 filename: {}", path.display()))?;

        let Some((book_id, page_number, page_label)) = parse_page_filename(&filename) else {
            let warning = format!("filename does not match book/page pattern, skipped: {filename}");
            warn!(warning = %warning, "inventory warning");
            warnings.push(warning);
            continue;
        };

        let pages = grouped.entry(book_id.clone()).or_default();

        // Duplicate page number: first path in lexical sort order wins.
        if let Some(existing) = pages.iter().find(|page| page.page_number == page_number) {
            let warning = format!(
                "duplicate page number {page_number} in book {book_id}: kept {}, skipped {filename}",
                existing.filename
            );
            warn!(warning = %warning, "inventory warning");
            warnings.push(warning);
            continue;
        }

        let sha256 = sha256_file(&path)?;
        pages.push(PageEntry {
            filename,
            book_id,
            page_number,
            page_label,
            sha256,
        });
        page_count += 1;
    }

    if grouped.is_empty() {
        bail!(
            "no page filenames in {} matched the book/page pattern",
            page_dir.display()
        );
    }

    let books = grouped
        .into_iter()
        .map(|(book_id, mut pages)| {
            pages.sort_by_key(|page| page.page_number);
            let page_range = match (pages.first(), pages.last()) {
                (Some(first), Some(last)) => format!("{}-{}", first.page_number, last.page_number),
                _ => "0-0".to_string(),
            };

            BookEntry {
                book_id,
                page_count: pages.len(),
                page_range,
                pages,
            }
        })
        .collect::<Vec<BookEntry>>();

    Ok(PageInventoryManifest {
        manifest_version: 1,
        generated_at: now_utc_string(),
        source_directory: page_dir.display().to_string(),
        book_count: books.len(),
        page_count,
        books,
        warnings,
    })
}

pub fn load_or_build(
    page_dir: &Path,
    manifest_path: &Path,
    refresh: bool,
) -> Result<PageInventoryManifest> {
    if refresh || !manifest_path.exists() {
        let manifest = build_manifest(page_dir)?;
        write_json_replace(manifest_path, &manifest)?;
        info!(
            path = %manifest_path.display(),
            book_count = manifest.book_count,
            "refreshed page inventory manifest"
        );
        return Ok(manifest);
    }

    let manifest: PageInventoryManifest = read_json(manifest_path)?;
    info!(
        path = %manifest_path.display(),
        book_count = manifest.book_count,
        "loaded existing page inventory manifest"
    );

    Ok(manifest)
}

fn discover_page_files(page_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut pages = Vec::new();

    let entries = fs::read_dir(page_dir)
        .with_context(|| format!("failed to read {}", page_dir.display()))?;

    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to read entry in {}", page_dir.display()))?;
        let path = entry.path();

        if !entry
            .file_type()
            .with_context(|| format!("failed to inspect file type: {}", path.display()))?
            .is_file()
        {
            continue;
        }

        let is_markdown = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("md"))
            .unwrap_or(false);

        if is_markdown {
            pages.push(path);
        }
    }

    Ok(pages)
}

/// Split a page filename into (book id, page number, page label). The last
/// underscore-delimited token of the stem must be all digits; it is the page
/// number, and everything before it is the book id. The raw token is kept as
/// the label because book scans zero-pad it to a fixed width.
pub(crate) fn parse_page_filename(filename: &str) -> Option<(String, i64, String)> {
    let stem = filename.strip_suffix(".md")?;
    let (book_id, label) = stem.rsplit_once('_')?;

    if book_id.is_empty() || label.is_empty() || !label.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let page_number = label.parse::<i64>().ok()?;
    Some((book_id.to_string(), page_number, label.to_string()))
}
