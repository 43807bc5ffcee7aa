use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "biograf",
    version,
    about = "Biographical page segmentation and portrait-name linkage tooling"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Inventory(InventoryArgs),
    Segment(SegmentArgs),
    Associate(AssociateArgs),
    Merge(MergeArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct InventoryArgs {
    #[arg(long, default_value = ".cache/biograf")]
    pub cache_root: PathBuf,

    /// Directory holding one OCR markdown file per scanned page.
    #[arg(long)]
    pub page_dir: PathBuf,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SegmentArgs {
    #[arg(long, default_value = ".cache/biograf")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub page_dir: PathBuf,

    /// Ordered per-book person names, produced by an upstream detection step.
    #[arg(long)]
    pub names_manifest_path: PathBuf,

    #[arg(long)]
    pub inventory_manifest_path: Option<PathBuf>,

    #[arg(long)]
    pub segment_manifest_path: Option<PathBuf>,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub refresh_inventory: bool,
}

#[derive(Args, Debug, Clone)]
pub struct AssociateArgs {
    #[arg(long, default_value = ".cache/biograf")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub page_dir: PathBuf,

    #[arg(long)]
    pub inventory_manifest_path: Option<PathBuf>,

    /// Optional name context for the cross-page rule; without it the engine
    /// falls back to scanning the previous page for its last name heading.
    #[arg(long)]
    pub names_manifest_path: Option<PathBuf>,

    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub refresh_inventory: bool,

    /// Reprocess books even when their association report already exists.
    #[arg(long, default_value_t = false)]
    pub force_reprocess: bool,

    /// Pause between books to respect oracle rate limits.
    #[arg(long, default_value_t = 2)]
    pub pause_secs: u64,

    /// Run the local rule cascade only; unresolved references are flagged
    /// for manual review instead of being sent to the oracle.
    #[arg(long, default_value_t = false)]
    pub no_oracle: bool,

    /// Oracle endpoint URL; falls back to the ENDPOINT_URL environment variable.
    #[arg(long)]
    pub oracle_endpoint: Option<String>,

    #[arg(long, default_value = "o4-mini")]
    pub oracle_deployment: String,

    /// Oracle API key; falls back to the ORACLE_API_KEY environment variable.
    #[arg(long)]
    pub oracle_api_key: Option<String>,

    #[arg(long, default_value = "2025-01-01-preview")]
    pub oracle_api_version: String,

    #[arg(long, default_value_t = 120)]
    pub oracle_timeout_secs: u64,

    #[arg(long, default_value_t = 50_000)]
    pub oracle_max_completion_tokens: usize,
}

#[derive(Args, Debug, Clone)]
pub struct MergeArgs {
    #[arg(long, default_value = ".cache/biograf")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Per-book association reports from the cross-page (oracle) pass.
    #[arg(long)]
    pub associations_dir: Option<PathBuf>,

    /// Per-book association reports from the single-page pass; cross-page
    /// values take precedence where both passes produced one.
    #[arg(long)]
    pub single_page_associations_dir: Option<PathBuf>,

    /// JSON row files from later passes (retried failures, enrichment rounds),
    /// applied in the order given.
    #[arg(long = "enrichment-path")]
    pub enrichment_paths: Vec<PathBuf>,

    #[arg(long)]
    pub output_path: Option<PathBuf>,

    #[arg(long)]
    pub merge_manifest_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/biograf")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub associations_dir: Option<PathBuf>,
}
