use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One OCR page file, tagged with the book id and page number derived from
/// its filename. Immutable after inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageEntry {
    pub filename: String,
    pub book_id: String,
    pub page_number: i64,
    /// Page-number token as it appears in the filename, zero-padding kept.
    pub page_label: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookEntry {
    pub book_id: String,
    pub page_count: usize,
    pub page_range: String,
    pub pages: Vec<PageEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageInventoryManifest {
    pub manifest_version: u32,
    pub generated_at: String,
    pub source_directory: String,
    pub book_count: usize,
    pub page_count: usize,
    pub books: Vec<BookEntry>,
    pub warnings: Vec<String>,
}

/// External input: detected person names per book, in appearance order.
/// Name detection itself happens upstream; this tool only consumes it.
#[derive(Debug, Clone, Deserialize)]
pub struct NamesManifest {
    pub books: BTreeMap<String, BookNames>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookNames {
    #[serde(default)]
    pub biographical_entries: Vec<NameEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NameEntry {
    pub person_name: String,
    #[serde(default)]
    pub page_number: Option<i64>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossPageType {
    SamePage,
    ImageFirstOnNextPage,
    NamePreviousPage,
    Continuation,
    None,
}

impl CrossPageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SamePage => "same_page",
            Self::ImageFirstOnNextPage => "image_first_on_next_page",
            Self::NamePreviousPage => "name_previous_page",
            Self::Continuation => "continuation",
            Self::None => "none",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label {
            "same_page" => Self::SamePage,
            "image_first_on_next_page" => Self::ImageFirstOnNextPage,
            "name_previous_page" => Self::NamePreviousPage,
            "continuation" => Self::Continuation,
            _ => Self::None,
        }
    }
}

/// One portrait reference paired (or not) with a person. Created once per
/// processing pass and never mutated; later passes create new associations
/// that the merge layer may prefer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortraitAssociation {
    pub image_filename: String,
    pub image_page: i64,
    pub referenced_in_markdown: bool,
    pub associated_person: Option<String>,
    pub person_page: Option<i64>,
    pub confidence: f64,
    pub is_cross_page: bool,
    pub cross_page_type: CrossPageType,
    pub reasoning: String,
    pub context_evidence: String,
    pub needs_review: bool,
    pub book_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrossPageBreakdown {
    pub same_page: usize,
    pub image_first_on_next_page: usize,
    pub name_previous_page: usize,
    pub continuation: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationSummary {
    pub total_associations: usize,
    pub resolved_associations: usize,
    pub unresolved_images: usize,
    pub rule_associations: usize,
    pub oracle_associations: usize,
    pub cross_page_associations: usize,
    pub cross_page_breakdown: CrossPageBreakdown,
    pub success_rate: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingInfo {
    pub oracle_endpoint: Option<String>,
    pub oracle_deployment: Option<String>,
    pub cross_page_analysis: bool,
    pub processing_timestamp: String,
}

/// Per-book association results, written whole to
/// `<book_id>_portrait_associations.json`. Presence of this file is the
/// resumption signal for skipping the book on later runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookAssociationReport {
    pub book_id: String,
    pub status: String,
    pub pages_processed: usize,
    pub page_range: String,
    pub markdown_files: Vec<String>,
    pub total_images: usize,
    pub associations: Vec<PortraitAssociation>,
    pub summary: AssociationSummary,
    pub processing_info: ProcessingInfo,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum BookRunOutcome {
    Report(Box<BookAssociationReport>),
    Failure {
        status: String,
        error: String,
        processing_timestamp: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingSummary {
    pub total_books: usize,
    pub newly_processed: usize,
    pub skipped_existing: usize,
    pub errors: usize,
    pub skip_existing_enabled: bool,
    pub processed_books: Vec<String>,
    pub skipped_books: Vec<String>,
    pub failed_books: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CombinedAssociationReport {
    pub input_path: String,
    pub output_path: String,
    pub books_found: usize,
    pub processing_timestamp: String,
    pub books: BTreeMap<String, BookRunOutcome>,
    pub processing_summary: ProcessingSummary,
}

/// Shape of one record in the oracle's JSON array. Every field is defaulted
/// so a sparsely filled record survives strict array parsing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OracleRecord {
    #[serde(default)]
    pub image_filename: String,
    #[serde(default)]
    pub image_page: Option<i64>,
    #[serde(default)]
    pub referenced_in_markdown: Option<bool>,
    #[serde(default)]
    pub associated_person: Option<String>,
    #[serde(default)]
    pub person_page: Option<i64>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub is_cross_page: Option<bool>,
    #[serde(default)]
    pub cross_page_type: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub context_evidence: Option<String>,
}

/// Final reconciled unit: one person, their text chunk, opaque biography
/// payload, and portrait filename where one was linked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub name: String,
    pub book_id: String,
    pub page_number: Option<i64>,
    pub markdown_chunk: String,
    pub chunk_found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub biography: Option<serde_json::Value>,
    pub portrait_filename: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentPaths {
    pub page_dir: String,
    pub inventory_manifest_path: String,
    pub names_manifest_path: String,
    pub db_path: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SegmentCounts {
    pub books_in_inventory: usize,
    pub books_segmented: usize,
    pub books_without_names: usize,
    pub names_listed: usize,
    pub consecutive_duplicates_dropped: usize,
    pub entries_inserted: usize,
    pub empty_chunks: usize,
    pub punctuation_fallback_hits: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub db_schema_version: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub command: String,
    pub paths: SegmentPaths,
    pub counts: SegmentCounts,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergePaths {
    pub db_path: String,
    pub associations_dir: Option<String>,
    pub single_page_associations_dir: Option<String>,
    pub enrichment_paths: Vec<String>,
    pub output_path: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeCounts {
    pub base_records: usize,
    pub enrichment_rows_seen: usize,
    pub enrichment_rows_applied: usize,
    pub enrichment_rows_dropped: usize,
    pub fields_updated: usize,
    pub single_page_portraits: usize,
    pub cross_page_portraits: usize,
    pub portraits_attached: usize,
    pub records_written: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub db_schema_version: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub command: String,
    pub paths: MergePaths,
    pub counts: MergeCounts,
    pub warnings: Vec<String>,
}
