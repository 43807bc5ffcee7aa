//! Local association rules.
//!
//! The cascade only fires on unambiguous textual structure. Anything fuzzier
//! (names buried in prose, layouts the rules do not recognize) is left
//! unresolved for the oracle pass.

use super::*;

/// A single `![..](figures/..)` reference with its byte span in the page.
pub(super) struct ImageRef {
    pub filename: String,
    pub start: usize,
    pub end: usize,
}

/// An upper-case surname heading and its byte offset in the page.
pub(super) struct NameHeading {
    pub offset: usize,
    pub name: String,
}

/// One markdown page with its extracted structure.
pub(super) struct PageText {
    pub filename: String,
    pub page_number: i64,
    pub content: String,
    pub image_refs: Vec<ImageRef>,
    pub headings: Vec<NameHeading>,
}

/// Per-book view handed to the cascade. `listed_names` maps page number to
/// the names known to appear on that page, in reading order, when a names
/// manifest is available; the heading scan is the fallback.
pub(super) struct BookContext<'a> {
    pub book_id: &'a str,
    pub pages: &'a [PageText],
    pub listed_names: Option<&'a BTreeMap<i64, Vec<String>>>,
}

pub(super) enum RuleOutcome {
    Resolved(PortraitAssociation),
    Conflict(PortraitAssociation),
    Unresolved,
}

pub(super) fn image_ref_regex() -> Result<Regex> {
    Regex::new(r"!\[[^\]]*\]\(figures/([^)\s]+)\)")
        .context("failed to compile image reference pattern")
}

pub(super) fn build_page_text(
    filename: &str,
    page_number: i64,
    content: String,
    image_pattern: &Regex,
) -> PageText {
    let mut image_refs = Vec::new();
    for captures in image_pattern.captures_iter(&content) {
        let whole = match captures.get(0) {
            Some(m) => m,
            None => continue,
        };
        let figure = match captures.get(1) {
            Some(m) => m.as_str().to_string(),
            None => continue,
        };
        image_refs.push(ImageRef {
            filename: figure,
            start: whole.start(),
            end: whole.end(),
        });
    }

    let mut headings = Vec::new();
    let mut offset = 0;
    for line in content.split('\n') {
        if let Some(name) = parse_uppercase_name(line) {
            headings.push(NameHeading { offset, name });
        }
        offset += line.len() + 1;
    }

    PageText {
        filename: filename.to_string(),
        page_number,
        content,
        image_refs,
        headings,
    }
}

/// Parses an entry heading of the form `SURNAME, Given names, ...` where the
/// surname is entirely upper-case. Mixed-case names are rejected so that
/// prose mentions never anchor an association.
pub(super) fn parse_uppercase_name(line: &str) -> Option<String> {
    let trimmed = line.trim().trim_start_matches(['#', '*']).trim_start();
    let (surname_part, rest) = trimmed.split_once(',')?;
    let surname = surname_part.trim().trim_matches('*').trim();
    if surname.len() < 2 || surname.split_whitespace().count() > 3 {
        return None;
    }
    if !surname
        .chars()
        .all(|c| c.is_alphabetic() || c == '-' || c == '\'' || c == ' ')
    {
        return None;
    }
    if surname.chars().any(|c| c.is_lowercase()) {
        return None;
    }
    let given = rest
        .split(',')
        .next()
        .unwrap_or("")
        .trim()
        .trim_matches('*')
        .trim_end_matches(['.', ';', ':'])
        .trim();
    if given.is_empty() || !given.chars().next().is_some_and(char::is_alphabetic) {
        return None;
    }
    Some(format!("{surname}, {given}"))
}

/// Runs the priority cascade for one image reference. Resolution order is
/// immediate name, then page-start cross-page, then conflict detection; the
/// paragraph-embedded case has no reliable local signature and is left to
/// the oracle.
pub(super) fn apply_rule_cascade(
    ctx: &BookContext<'_>,
    page_index: usize,
    ref_index: usize,
) -> RuleOutcome {
    let page = &ctx.pages[page_index];
    let image = &page.image_refs[ref_index];

    if let Some((name, line)) = immediate_name_after(page, image) {
        debug!(book_id = %ctx.book_id, image = %image.filename, person = %name, "immediate-name rule fired");
        return RuleOutcome::Resolved(PortraitAssociation {
            image_filename: image.filename.clone(),
            image_page: page.page_number,
            referenced_in_markdown: true,
            associated_person: Some(name),
            person_page: Some(page.page_number),
            confidence: 1.0,
            is_cross_page: false,
            cross_page_type: CrossPageType::SamePage,
            reasoning: "upper-case name heading immediately follows the image reference"
                .to_string(),
            context_evidence: line,
            needs_review: false,
            book_id: ctx.book_id.to_string(),
        });
    }

    if ref_index == 0 && page_starts_with_image(page) && page_index > 0 {
        let previous = &ctx.pages[page_index - 1];
        if let Some(name) = last_name_on_page(ctx, previous) {
            debug!(book_id = %ctx.book_id, image = %image.filename, person = %name, "page-start rule fired");
            return RuleOutcome::Resolved(PortraitAssociation {
                image_filename: image.filename.clone(),
                image_page: page.page_number,
                referenced_in_markdown: true,
                associated_person: Some(name.clone()),
                person_page: Some(previous.page_number),
                confidence: 0.9,
                is_cross_page: true,
                cross_page_type: CrossPageType::ImageFirstOnNextPage,
                reasoning: "page opens with the image; the entry began on the previous page"
                    .to_string(),
                context_evidence: format!(
                    "page {} ends with entry for {name}",
                    previous.page_number
                ),
                needs_review: false,
                book_id: ctx.book_id.to_string(),
            });
        }
    }

    if let Some(candidates) = conflicting_neighbors(page, ref_index) {
        return RuleOutcome::Conflict(PortraitAssociation {
            image_filename: image.filename.clone(),
            image_page: page.page_number,
            referenced_in_markdown: true,
            associated_person: None,
            person_page: None,
            confidence: 0.0,
            is_cross_page: false,
            cross_page_type: CrossPageType::None,
            reasoning: "adjacent image references with no intervening name heading".to_string(),
            context_evidence: format!("candidates: {}", candidates.join("; ")),
            needs_review: true,
            book_id: ctx.book_id.to_string(),
        });
    }

    RuleOutcome::Unresolved
}

/// Looks for an upper-case name heading on the remainder of the image's own
/// line, or failing that on the next non-blank line. Another image reference
/// in between breaks the adjacency.
fn immediate_name_after(page: &PageText, image: &ImageRef) -> Option<(String, String)> {
    let rest = &page.content[image.end..];
    let mut lines = rest.split('\n');

    let same_line = lines.next().unwrap_or("");
    let candidate = if same_line.trim().is_empty() {
        lines.find(|line| !line.trim().is_empty()).unwrap_or("")
    } else {
        same_line
    };

    if candidate.contains("![") {
        return None;
    }
    let name = parse_uppercase_name(candidate)?;
    Some((name, candidate.trim().to_string()))
}

fn page_starts_with_image(page: &PageText) -> bool {
    page.image_refs
        .first()
        .is_some_and(|first| page.content[..first.start].trim().is_empty())
}

/// Last name known on a page: the names manifest when one was supplied,
/// otherwise the page's own heading scan.
fn last_name_on_page(ctx: &BookContext<'_>, page: &PageText) -> Option<String> {
    if let Some(listed) = ctx.listed_names
        && let Some(names) = listed.get(&page.page_number)
        && let Some(last) = names.last()
    {
        return Some(last.clone());
    }
    page.headings.last().map(|heading| heading.name.clone())
}

/// An image reference conflicts when its neighbor on either side has no name
/// heading between them; neither can be attributed locally.
fn conflicting_neighbors(page: &PageText, ref_index: usize) -> Option<Vec<String>> {
    let image = &page.image_refs[ref_index];
    let next_conflict = page
        .image_refs
        .get(ref_index + 1)
        .is_some_and(|next| !heading_between(page, image.end, next.start));
    let prev_conflict = ref_index
        .checked_sub(1)
        .and_then(|index| page.image_refs.get(index))
        .is_some_and(|prev| !heading_between(page, prev.end, image.start));
    if !next_conflict && !prev_conflict {
        return None;
    }

    let mut candidates: Vec<String> = page
        .headings
        .iter()
        .map(|heading| heading.name.clone())
        .collect();
    if candidates.is_empty() {
        candidates.push("no name headings on page".to_string());
    }
    Some(candidates)
}

fn heading_between(page: &PageText, start: usize, end: usize) -> bool {
    page.headings
        .iter()
        .any(|heading| heading.offset > start && heading.offset < end)
}
