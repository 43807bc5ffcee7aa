use super::run::{association_from_oracle, summarize};
use super::*;

fn page(filename: &str, number: i64, content: &str) -> PageText {
    let pattern = image_ref_regex().unwrap();
    build_page_text(filename, number, content.to_string(), &pattern)
}

fn context<'a>(pages: &'a [PageText]) -> BookContext<'a> {
    BookContext {
        book_id: "bok1",
        pages,
        listed_names: None,
    }
}

#[test]
fn uppercase_name_parsing_rejects_mixed_case() {
    assert_eq!(
        parse_uppercase_name("SMITH, John, engineer, b. 1901."),
        Some("SMITH, John".to_string())
    );
    assert_eq!(
        parse_uppercase_name("## NYGAARD-HANSEN, Kari Anne, teacher."),
        Some("NYGAARD-HANSEN, Kari Anne".to_string())
    );
    assert_eq!(parse_uppercase_name("Smith, John, engineer."), None);
    assert_eq!(parse_uppercase_name("In the winter of 1901, he moved."), None);
    assert_eq!(parse_uppercase_name("no comma here at all"), None);
}

#[test]
fn immediate_name_resolves_with_full_confidence() {
    let pages = vec![page(
        "bok1_012.md",
        12,
        "earlier entry text.\n\n![Figure](figures/bok1_012_img1.png)\n\nSMITH, John, engineer, b. 1901 in Bergen, son of Peter.\n",
    )];
    let outcome = apply_rule_cascade(&context(&pages), 0, 0);
    let assoc = match outcome {
        RuleOutcome::Resolved(assoc) => assoc,
        _ => panic!("expected resolved outcome"),
    };
    assert_eq!(assoc.associated_person.as_deref(), Some("SMITH, John"));
    assert_eq!(assoc.confidence, 1.0);
    assert!(!assoc.is_cross_page);
    assert_eq!(assoc.cross_page_type, CrossPageType::SamePage);
    assert_eq!(assoc.person_page, Some(12));
    assert!(!assoc.needs_review);
}

#[test]
fn mixed_case_name_never_anchors() {
    let pages = vec![page(
        "bok1_012.md",
        12,
        "intro paragraph.\n\n![Figure](figures/img.png)\n\nSmith, John, engineer, b. 1901.\n",
    )];
    assert!(matches!(
        apply_rule_cascade(&context(&pages), 0, 0),
        RuleOutcome::Unresolved
    ));
}

#[test]
fn page_start_image_links_to_previous_page_last_heading() {
    let pages = vec![
        page(
            "bok1_031.md",
            31,
            "BERG, Siri, painter, b. 1890 in Oslo.\n\nHANSEN, Ole, farmer, b. 1880 in Stange, son of Lars.\nOwned the farm from 1910.\n",
        ),
        page(
            "bok1_032.md",
            32,
            "![Figure](figures/bok1_032_img1.png)\n\nHe took over the family farm and served on the township board.\n",
        ),
    ];
    let outcome = apply_rule_cascade(&context(&pages), 1, 0);
    let assoc = match outcome {
        RuleOutcome::Resolved(assoc) => assoc,
        _ => panic!("expected resolved outcome"),
    };
    assert_eq!(assoc.associated_person.as_deref(), Some("HANSEN, Ole"));
    assert_eq!(assoc.person_page, Some(31));
    assert_eq!(assoc.image_page, 32);
    assert!(assoc.is_cross_page);
    assert_eq!(assoc.cross_page_type, CrossPageType::ImageFirstOnNextPage);
    assert_eq!(assoc.confidence, 0.9);
}

#[test]
fn listed_names_take_precedence_over_heading_scan() {
    let pages = vec![
        page("bok1_007.md", 7, "NILSEN, Kari, nurse, b. 1895.\nMore text.\n"),
        page("bok1_008.md", 8, "![Figure](figures/p8.png)\n\nContinuation prose.\n"),
    ];
    let mut listed: BTreeMap<i64, Vec<String>> = BTreeMap::new();
    listed.insert(7, vec!["NILSEN, Kari".to_string(), "OLSEN, Anna".to_string()]);
    let ctx = BookContext {
        book_id: "bok1",
        pages: &pages,
        listed_names: Some(&listed),
    };
    let outcome = apply_rule_cascade(&ctx, 1, 0);
    let assoc = match outcome {
        RuleOutcome::Resolved(assoc) => assoc,
        _ => panic!("expected resolved outcome"),
    };
    assert_eq!(assoc.associated_person.as_deref(), Some("OLSEN, Anna"));
}

#[test]
fn immediate_name_wins_over_page_start_rule() {
    let pages = vec![
        page("bok1_001.md", 1, "HANSEN, Ole, farmer, b. 1880.\n"),
        page(
            "bok1_002.md",
            2,
            "![Figure](figures/p2.png)\n\nBERG, Nils, merchant, b. 1875 in Drammen.\n",
        ),
    ];
    let outcome = apply_rule_cascade(&context(&pages), 1, 0);
    let assoc = match outcome {
        RuleOutcome::Resolved(assoc) => assoc,
        _ => panic!("expected resolved outcome"),
    };
    assert_eq!(assoc.associated_person.as_deref(), Some("BERG, Nils"));
    assert!(!assoc.is_cross_page);
    assert_eq!(assoc.cross_page_type, CrossPageType::SamePage);
}

#[test]
fn adjacent_images_without_heading_conflict() {
    let pages = vec![page(
        "bok1_020.md",
        20,
        "DAHL, Erik, printer, b. 1900.\n\n![Figure](figures/a.png)\n![Figure](figures/b.png)\n\nThe society met annually in the parish hall.\n",
    )];
    let ctx = context(&pages);
    for ref_index in 0..2 {
        let outcome = apply_rule_cascade(&ctx, 0, ref_index);
        let assoc = match outcome {
            RuleOutcome::Conflict(assoc) => assoc,
            _ => panic!("expected conflict outcome"),
        };
        assert!(assoc.associated_person.is_none());
        assert!(assoc.needs_review);
        assert!(assoc.context_evidence.contains("DAHL, Erik"));
    }
}

#[test]
fn second_adjacent_image_may_still_take_its_following_name() {
    let pages = vec![page(
        "bok1_021.md",
        21,
        "intro.\n\n![Figure](figures/a.png)\n![Figure](figures/b.png)\n\nDAHL, Erik, printer, b. 1900.\n",
    )];
    let ctx = context(&pages);
    assert!(matches!(
        apply_rule_cascade(&ctx, 0, 0),
        RuleOutcome::Conflict(_)
    ));
    let assoc = match apply_rule_cascade(&ctx, 0, 1) {
        RuleOutcome::Resolved(assoc) => assoc,
        _ => panic!("expected resolved outcome"),
    };
    assert_eq!(assoc.associated_person.as_deref(), Some("DAHL, Erik"));
}

#[test]
fn response_parsing_handles_fenced_block_with_commentary() {
    let raw = "Here are the associations you asked for:\n```json\n[\n  {\"image_filename\": \"x.png\", \"associated_person\": \"SMITH, John\", \"confidence\": 0.95, \"cross_page_type\": \"same_page\"}\n]\n```\nLet me know if anything looks off.";
    let records = extract_associations(raw);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].image_filename, "x.png");
    assert_eq!(records[0].associated_person.as_deref(), Some("SMITH, John"));
}

#[test]
fn response_parsing_scans_for_balanced_array() {
    let raw = "The array follows. [{\"image_filename\": \"y.png\", \"context_evidence\": \"see [figure 2]\"}] That is all.";
    let records = extract_associations(raw);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].image_filename, "y.png");
    assert_eq!(
        records[0].context_evidence.as_deref(),
        Some("see [figure 2]")
    );
}

#[test]
fn response_parsing_repairs_raw_newlines_in_strings() {
    let raw = "[{\"image_filename\": \"z.png\", \"reasoning\": \"name on previous\npage\"}]";
    let records = extract_associations(raw);
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].reasoning.as_deref(),
        Some("name on previous\npage")
    );
}

#[test]
fn response_parsing_fails_closed() {
    assert!(extract_associations("I could not find any portraits.").is_empty());
    assert!(extract_associations("").is_empty());
    assert!(extract_associations("[{\"image_filename\": \"a.png\",]").is_empty());
}

#[test]
fn records_without_filename_are_dropped() {
    let raw = "[{\"image_filename\": \"a.png\"}, {\"associated_person\": \"SMITH, John\"}]";
    let records = extract_associations(raw);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].image_filename, "a.png");
}

#[test]
fn oracle_record_conversion_defaults_and_clamps() {
    let pages = vec![page("bok1_005.md", 5, "![Figure](figures/q.png)\n")];
    let image = &pages[0].image_refs[0];

    let record = OracleRecord {
        image_filename: "q.png".to_string(),
        associated_person: Some("  LIE, Trygve  ".to_string()),
        confidence: Some(1.7),
        cross_page_type: Some("image_first_on_next_page".to_string()),
        ..OracleRecord::default()
    };
    let assoc = association_from_oracle(&record, "bok1", &pages[0], image);
    assert_eq!(assoc.associated_person.as_deref(), Some("LIE, Trygve"));
    assert_eq!(assoc.confidence, 1.0);
    assert!(assoc.is_cross_page);
    assert_eq!(assoc.image_page, 5);
    assert!(!assoc.needs_review);

    let empty = OracleRecord {
        image_filename: "q.png".to_string(),
        associated_person: Some("   ".to_string()),
        ..OracleRecord::default()
    };
    let assoc = association_from_oracle(&empty, "bok1", &pages[0], image);
    assert!(assoc.associated_person.is_none());
    assert!(assoc.needs_review);
    assert_eq!(assoc.confidence, 0.0);
}

#[test]
fn summary_counts_and_success_rate() {
    let pages = vec![page(
        "bok1_001.md",
        1,
        "x\n![Figure](figures/a.png)\n\nSMITH, John, engineer.\n",
    )];
    let resolved = match apply_rule_cascade(&context(&pages), 0, 0) {
        RuleOutcome::Resolved(assoc) => assoc,
        _ => panic!("expected resolved outcome"),
    };
    let unresolved = PortraitAssociation {
        associated_person: None,
        needs_review: true,
        confidence: 0.0,
        ..resolved.clone()
    };
    let summary = summarize(&[resolved, unresolved], 2, 1);
    assert_eq!(summary.total_associations, 2);
    assert_eq!(summary.resolved_associations, 1);
    assert_eq!(summary.unresolved_images, 1);
    assert_eq!(summary.rule_associations, 1);
    assert_eq!(summary.oracle_associations, 1);
    assert_eq!(summary.cross_page_breakdown.same_page, 1);
    assert_eq!(summary.success_rate, "50.0%");
}

#[test]
fn book_prompt_carries_pages_and_previews() {
    let pages = vec![
        page("bok1_001.md", 1, "HANSEN, Ole, farmer, b. 1880.\n"),
        page("bok1_002.md", 2, "![Figure](figures/p2.png)\n\nmore text\n"),
    ];
    let prompt = build_book_prompt("bok1", &pages);
    assert!(prompt.contains("The book ID is: bok1"));
    assert!(prompt.contains("--- PAGE 1 (File: bok1_001.md) ---"));
    assert!(prompt.contains("Available images for this page: None"));
    assert!(prompt.contains("Available images for this page: p2.png"));
    assert!(prompt.contains("[PREVIEW OF NEXT PAGE 2"));
    // the last page has nothing following it to preview
    assert!(!prompt.contains("[PREVIEW OF NEXT PAGE 3"));
    assert!(prompt.contains("Respond with ONLY a valid JSON array"));
}
