//! Portrait-to-name association.
//!
//! Each portrait reference runs through a strict priority cascade: immediate
//! upper-case name, page-start cross-page lookup, conflict detection. What
//! the cascade cannot resolve from local textual structure is packaged into
//! one prompt per book and delegated to the text oracle, whose raw output is
//! recovered by the layered response parser.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use std::{fs, thread};

use anyhow::{Context, Result, bail};
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::cli::AssociateArgs;
use crate::commands::inventory;
use crate::model::{
    AssociationSummary, BookAssociationReport, BookEntry, BookRunOutcome,
    CombinedAssociationReport, CrossPageBreakdown, CrossPageType, NamesManifest, OracleRecord,
    PortraitAssociation, ProcessingInfo, ProcessingSummary,
};
use crate::oracle::{OracleClient, OracleConfig};
use crate::util::{bounded_prefix, ensure_directory, now_utc_string, read_json, write_json_replace};

mod prompt;
mod response;
mod rules;
mod run;
#[cfg(test)]
mod tests;

pub use run::run;

use prompt::*;
use response::*;
use rules::*;
