//! Book-by-book association driver.

use super::*;

pub fn run(args: AssociateArgs) -> Result<()> {
    let manifest_dir = args.cache_root.join("manifests");
    ensure_directory(&manifest_dir)?;
    let inventory_manifest_path = args
        .inventory_manifest_path
        .clone()
        .unwrap_or_else(|| manifest_dir.join("page_inventory.json"));
    let output_dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| args.cache_root.join("associations"));
    ensure_directory(&output_dir)?;

    let inventory =
        inventory::load_or_build(&args.page_dir, &inventory_manifest_path, args.refresh_inventory)?;
    let names_context = load_names_context(args.names_manifest_path.as_deref())?;
    let oracle = build_oracle_client(&args)?;
    let image_pattern = image_ref_regex()?;

    let mut books: BTreeMap<String, BookRunOutcome> = BTreeMap::new();
    let mut processed_books = Vec::new();
    let mut skipped_books = Vec::new();
    let mut failed_books = Vec::new();

    for (index, book) in inventory.books.iter().enumerate() {
        let report_path = output_dir.join(format!("{}_portrait_associations.json", book.book_id));
        if !args.force_reprocess && report_path.exists() {
            match read_json::<BookAssociationReport>(&report_path) {
                Ok(mut existing) => {
                    info!(
                        book_id = %book.book_id,
                        path = %report_path.display(),
                        "association report already exists; skipping book"
                    );
                    existing.status = "skipped_existing".to_string();
                    books.insert(
                        book.book_id.clone(),
                        BookRunOutcome::Report(Box::new(existing)),
                    );
                }
                Err(err) => {
                    warn!(
                        book_id = %book.book_id,
                        path = %report_path.display(),
                        error = %err,
                        "existing association report is unreadable; use --force-reprocess to rebuild it"
                    );
                    books.insert(
                        book.book_id.clone(),
                        BookRunOutcome::Failure {
                            status: "skipped_unreadable".to_string(),
                            error: format!("{err:#}"),
                            processing_timestamp: now_utc_string(),
                        },
                    );
                }
            }
            skipped_books.push(book.book_id.clone());
            continue;
        }

        let book_names = names_context
            .as_ref()
            .and_then(|context| context.get(&book.book_id));
        match process_book(
            book,
            &args.page_dir,
            book_names,
            oracle.as_ref(),
            &image_pattern,
        ) {
            Ok(report) => {
                // The report file lands whole or not at all; its presence is
                // the resumption signal for later runs.
                write_json_replace(&report_path, &report)?;
                info!(
                    book_id = %book.book_id,
                    images = report.total_images,
                    resolved = report.summary.resolved_associations,
                    cross_page = report.summary.cross_page_associations,
                    path = %report_path.display(),
                    "wrote book association report"
                );
                books.insert(
                    book.book_id.clone(),
                    BookRunOutcome::Report(Box::new(report)),
                );
                processed_books.push(book.book_id.clone());
                if args.pause_secs > 0 && index + 1 < inventory.books.len() {
                    thread::sleep(Duration::from_secs(args.pause_secs));
                }
            }
            Err(err) => {
                // Book-level containment: the failed book gets no output
                // file, so a later run retries it.
                error!(book_id = %book.book_id, error = %err, "book association failed");
                books.insert(
                    book.book_id.clone(),
                    BookRunOutcome::Failure {
                        status: "error".to_string(),
                        error: format!("{err:#}"),
                        processing_timestamp: now_utc_string(),
                    },
                );
                failed_books.push(book.book_id.clone());
            }
        }
    }

    let combined = CombinedAssociationReport {
        input_path: args.page_dir.display().to_string(),
        output_path: output_dir.display().to_string(),
        books_found: inventory.books.len(),
        processing_timestamp: now_utc_string(),
        processing_summary: ProcessingSummary {
            total_books: inventory.books.len(),
            newly_processed: processed_books.len(),
            skipped_existing: skipped_books.len(),
            errors: failed_books.len(),
            skip_existing_enabled: !args.force_reprocess,
            processed_books,
            skipped_books,
            failed_books,
        },
        books,
    };
    let combined_path = output_dir.join("all_books_portrait_associations.json");
    write_json_replace(&combined_path, &combined)?;
    info!(path = %combined_path.display(), "wrote combined association report");

    log_run_summary(&combined);
    Ok(())
}

fn build_oracle_client(args: &AssociateArgs) -> Result<Option<OracleClient>> {
    if args.no_oracle {
        info!("oracle pass disabled; unresolved references will be flagged for review");
        return Ok(None);
    }
    let endpoint = args
        .oracle_endpoint
        .clone()
        .or_else(|| std::env::var("ENDPOINT_URL").ok())
        .context("missing oracle endpoint: pass --oracle-endpoint, set ENDPOINT_URL, or use --no-oracle")?;
    let api_key = args
        .oracle_api_key
        .clone()
        .or_else(|| std::env::var("ORACLE_API_KEY").ok())
        .context("missing oracle API key: pass --oracle-api-key, set ORACLE_API_KEY, or use --no-oracle")?;
    let client = OracleClient::new(OracleConfig {
        endpoint,
        deployment: args.oracle_deployment.clone(),
        api_key,
        api_version: args.oracle_api_version.clone(),
        timeout_secs: args.oracle_timeout_secs,
        max_completion_tokens: args.oracle_max_completion_tokens,
    })?;
    info!(
        endpoint = %client.endpoint(),
        deployment = %client.deployment(),
        "oracle client configured"
    );
    Ok(Some(client))
}

/// Per-book page-number-to-names index from the names manifest, when one was
/// supplied.
fn load_names_context(
    path: Option<&Path>,
) -> Result<Option<BTreeMap<String, BTreeMap<i64, Vec<String>>>>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let manifest: NamesManifest = read_json(path)?;
    let mut context: BTreeMap<String, BTreeMap<i64, Vec<String>>> = BTreeMap::new();
    for (book_id, names) in &manifest.books {
        let by_page = context.entry(book_id.clone()).or_default();
        for entry in &names.biographical_entries {
            if let Some(page_number) = entry.page_number {
                by_page
                    .entry(page_number)
                    .or_default()
                    .push(entry.person_name.clone());
            }
        }
    }
    info!(path = %path.display(), books = context.len(), "loaded names context");
    Ok(Some(context))
}

fn process_book(
    book: &BookEntry,
    page_dir: &Path,
    book_names: Option<&BTreeMap<i64, Vec<String>>>,
    oracle: Option<&OracleClient>,
    image_pattern: &Regex,
) -> Result<BookAssociationReport> {
    let pages = load_book_pages(book, page_dir, image_pattern)?;
    if pages.is_empty() {
        bail!("no readable pages for book {}", book.book_id);
    }

    let total_images: usize = pages.iter().map(|page| page.image_refs.len()).sum();
    let context = BookContext {
        book_id: &book.book_id,
        pages: &pages,
        listed_names: book_names,
    };

    let mut resolved: BTreeMap<(usize, usize), PortraitAssociation> = BTreeMap::new();
    let mut unresolved: Vec<(usize, usize)> = Vec::new();
    for (page_index, page) in pages.iter().enumerate() {
        for ref_index in 0..page.image_refs.len() {
            match apply_rule_cascade(&context, page_index, ref_index) {
                RuleOutcome::Resolved(assoc) | RuleOutcome::Conflict(assoc) => {
                    resolved.insert((page_index, ref_index), assoc);
                }
                RuleOutcome::Unresolved => unresolved.push((page_index, ref_index)),
            }
        }
    }

    let mut oracle_hits = 0usize;
    if !unresolved.is_empty() {
        match oracle {
            Some(client) => {
                info!(
                    book_id = %book.book_id,
                    unresolved = unresolved.len(),
                    "delegating unresolved references to the oracle"
                );
                let prompt = build_book_prompt(&book.book_id, &pages);
                match client.complete(&prompt) {
                    Ok(raw) => {
                        let records = extract_associations(&raw);
                        if records.is_empty() {
                            warn!(book_id = %book.book_id, "oracle returned no parsable associations");
                        }
                        let mut by_filename: BTreeMap<&str, &OracleRecord> = BTreeMap::new();
                        for record in &records {
                            by_filename
                                .entry(record.image_filename.as_str())
                                .or_insert(record);
                        }
                        for &(page_index, ref_index) in &unresolved {
                            let page = &pages[page_index];
                            let image = &page.image_refs[ref_index];
                            let assoc = match by_filename.get(image.filename.as_str()) {
                                Some(record) => {
                                    oracle_hits += 1;
                                    association_from_oracle(record, &book.book_id, page, image)
                                }
                                None => unresolved_association(
                                    &book.book_id,
                                    page,
                                    image,
                                    "oracle output did not cover this image reference",
                                ),
                            };
                            resolved.insert((page_index, ref_index), assoc);
                        }
                    }
                    Err(err) => {
                        // A failed oracle call degrades the book, it does
                        // not abort it.
                        error!(
                            book_id = %book.book_id,
                            error = %err,
                            "oracle pass failed; unresolved references flagged for review"
                        );
                        for &(page_index, ref_index) in &unresolved {
                            let page = &pages[page_index];
                            let image = &page.image_refs[ref_index];
                            resolved.insert(
                                (page_index, ref_index),
                                unresolved_association(
                                    &book.book_id,
                                    page,
                                    image,
                                    "oracle pass failed",
                                ),
                            );
                        }
                    }
                }
            }
            None => {
                for &(page_index, ref_index) in &unresolved {
                    let page = &pages[page_index];
                    let image = &page.image_refs[ref_index];
                    resolved.insert(
                        (page_index, ref_index),
                        unresolved_association(&book.book_id, page, image, "no oracle configured"),
                    );
                }
            }
        }
    }

    let associations: Vec<PortraitAssociation> = resolved.into_values().collect();
    let summary = summarize(&associations, total_images, oracle_hits);
    Ok(BookAssociationReport {
        book_id: book.book_id.clone(),
        status: "newly_processed".to_string(),
        pages_processed: pages.len(),
        page_range: book.page_range.clone(),
        markdown_files: pages.iter().map(|page| page.filename.clone()).collect(),
        total_images,
        associations,
        summary,
        processing_info: ProcessingInfo {
            oracle_endpoint: oracle.map(|client| client.endpoint().to_string()),
            oracle_deployment: oracle.map(|client| client.deployment().to_string()),
            cross_page_analysis: true,
            processing_timestamp: now_utc_string(),
        },
    })
}

fn load_book_pages(book: &BookEntry, page_dir: &Path, image_pattern: &Regex) -> Result<Vec<PageText>> {
    let mut pages = Vec::with_capacity(book.pages.len());
    for page in &book.pages {
        let path = page_dir.join(&page.filename);
        match fs::read_to_string(&path) {
            Ok(content) => {
                pages.push(build_page_text(
                    &page.filename,
                    page.page_number,
                    content,
                    image_pattern,
                ));
            }
            Err(err) => {
                warn!(
                    book_id = %book.book_id,
                    path = %path.display(),
                    error = %err,
                    "page file unreadable; skipping page"
                );
            }
        }
    }
    Ok(pages)
}

pub(super) fn association_from_oracle(
    record: &OracleRecord,
    book_id: &str,
    page: &PageText,
    image: &ImageRef,
) -> PortraitAssociation {
    let cross_page_type = record
        .cross_page_type
        .as_deref()
        .map(CrossPageType::from_label)
        .unwrap_or(CrossPageType::None);
    let associated_person = record
        .associated_person
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(ToOwned::to_owned);
    let needs_review = associated_person.is_none();
    PortraitAssociation {
        image_filename: image.filename.clone(),
        image_page: record.image_page.unwrap_or(page.page_number),
        referenced_in_markdown: record.referenced_in_markdown.unwrap_or(true),
        person_page: record.person_page,
        confidence: record.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
        is_cross_page: record.is_cross_page.unwrap_or(matches!(
            cross_page_type,
            CrossPageType::ImageFirstOnNextPage
                | CrossPageType::NamePreviousPage
                | CrossPageType::Continuation
        )),
        cross_page_type,
        reasoning: record.reasoning.clone().unwrap_or_default(),
        context_evidence: record.context_evidence.clone().unwrap_or_default(),
        needs_review,
        associated_person,
        book_id: book_id.to_string(),
    }
}

fn unresolved_association(
    book_id: &str,
    page: &PageText,
    image: &ImageRef,
    reason: &str,
) -> PortraitAssociation {
    PortraitAssociation {
        image_filename: image.filename.clone(),
        image_page: page.page_number,
        referenced_in_markdown: true,
        associated_person: None,
        person_page: None,
        confidence: 0.0,
        is_cross_page: false,
        cross_page_type: CrossPageType::None,
        reasoning: reason.to_string(),
        context_evidence: String::new(),
        needs_review: true,
        book_id: book_id.to_string(),
    }
}

pub(super) fn summarize(
    associations: &[PortraitAssociation],
    total_images: usize,
    oracle_hits: usize,
) -> AssociationSummary {
    let resolved = associations
        .iter()
        .filter(|assoc| assoc.associated_person.is_some())
        .count();
    let mut breakdown = CrossPageBreakdown::default();
    for assoc in associations {
        if assoc.associated_person.is_none() {
            continue;
        }
        match assoc.cross_page_type {
            CrossPageType::SamePage => breakdown.same_page += 1,
            CrossPageType::ImageFirstOnNextPage => breakdown.image_first_on_next_page += 1,
            CrossPageType::NamePreviousPage => breakdown.name_previous_page += 1,
            CrossPageType::Continuation => breakdown.continuation += 1,
            CrossPageType::None => {}
        }
    }
    let success_rate = if associations.is_empty() {
        "0%".to_string()
    } else {
        format!("{:.1}%", resolved as f64 / associations.len() as f64 * 100.0)
    };
    AssociationSummary {
        total_associations: associations.len(),
        resolved_associations: resolved,
        unresolved_images: associations.len() - resolved,
        rule_associations: associations.len() - oracle_hits,
        oracle_associations: oracle_hits,
        cross_page_associations: associations
            .iter()
            .filter(|assoc| assoc.is_cross_page)
            .count(),
        cross_page_breakdown: breakdown,
        success_rate,
    }
}

fn log_run_summary(combined: &CombinedAssociationReport) {
    let mut total_images = 0usize;
    let mut total_associations = 0usize;
    let mut total_resolved = 0usize;
    let mut total_cross_page = 0usize;
    for outcome in combined.books.values() {
        if let BookRunOutcome::Report(report) = outcome {
            total_images += report.total_images;
            total_associations += report.summary.total_associations;
            total_resolved += report.summary.resolved_associations;
            total_cross_page += report.summary.cross_page_associations;
        }
    }
    let summary = &combined.processing_summary;
    info!(
        books = summary.total_books,
        newly_processed = summary.newly_processed,
        skipped_existing = summary.skipped_existing,
        errors = summary.errors,
        "association run finished"
    );
    info!(
        images = total_images,
        associations = total_associations,
        resolved = total_resolved,
        cross_page = total_cross_page,
        "association totals across books"
    );
    if summary.errors > 0 {
        warn!(
            failed_books = %summary.failed_books.join(", "),
            "some books failed; rerun to retry them"
        );
    }
}
