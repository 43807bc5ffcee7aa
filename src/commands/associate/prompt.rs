//! Book-level prompt assembly for the oracle pass.

use super::*;

/// How much of the following page is quoted under each page, so the oracle
/// can spot entries that run across the page break.
pub(super) const NEXT_PAGE_PREVIEW_CHARS: usize = 500;

pub(super) fn build_book_prompt(book_id: &str, pages: &[PageText]) -> String {
    let mut prompt = format!(
        "You are analyzing a biographical reference work that spans multiple pages.\n\
         The book ID is: {book_id}\n\n\
         IMPORTANT: Biographical entries sometimes span across consecutive pages. Common patterns:\n\
         1. A person's name (SURNAME, Given names) appears at the END of page N\n\
         2. Their portrait and detailed biographical information appears at the BEGINNING of page N+1\n\
         3. Some entries are split where basic info is on one page and detail continues on the next\n\n\
         Each page contains biographical entries with the format:\n\
         SURNAME, Given names, profession, biographical details...\n\n\
         Portraits are referenced as ![Figure](figures/filename.png) in the markdown.\n\n\
         PAGES TO ANALYZE (in sequential order):\n"
    );

    for (index, page) in pages.iter().enumerate() {
        let images = if page.image_refs.is_empty() {
            "None".to_string()
        } else {
            page.image_refs
                .iter()
                .map(|image| image.filename.clone())
                .collect::<Vec<_>>()
                .join(", ")
        };
        prompt.push_str(&format!(
            "\n--- PAGE {} (File: {}) ---\nAvailable images for this page: {}\n\nMarkdown content:\n{}\n",
            page.page_number, page.filename, images, page.content
        ));
        if let Some(next) = pages.get(index + 1) {
            prompt.push_str(&format!(
                "\n[PREVIEW OF NEXT PAGE {} - first {} characters:]\n{}\n",
                next.page_number,
                NEXT_PAGE_PREVIEW_CHARS,
                bounded_prefix(&next.content, NEXT_PAGE_PREVIEW_CHARS)
            ));
        }
    }

    prompt.push_str(TASK_INSTRUCTIONS);
    prompt
}

const TASK_INSTRUCTIONS: &str = r#"
TASK:
Analyze ALL pages together and associate each portrait with the person it most likely depicts.

IMPORTANT (strict pairing rules, in priority order):
1. **Exact syntax** - Every portrait appears as ![Figure](figures/filename.png). Search only for this pattern.
2. **Immediate-name rule (highest certainty)** - If the image tag is followed (same line or next non-empty line) by a name whose LASTNAME is in ALL-CAPS, always pair this image with that name. Treat this as a 100% match unless another image intervenes. If the name is not in ALL-CAPS, do NOT use it for pairing.
3. **Paragraph-embedded rule** - If the image tag sits inside a prose paragraph that is clearly describing a person, pair the image with that individual rather than the next standalone name heading.
4. **Page-start rule (cross-page)** - When a page begins with an image tag, assume the portrait belongs to the person whose name appeared last on the previous page. Mark is_cross_page = true and cross_page_type = "image_first_on_next_page". If the Immediate-name rule applies instead, use that name and mark is_cross_page = false and cross_page_type = "same_page".
5. **Conflict handling** - If two images appear back-to-back with no intervening name, or one name plausibly maps to multiple images, list all possibilities but set associated_person to null and flag for manual review.

CRITICAL: Ensure your response is valid JSON. Escape all quotes and newlines properly in string values.

Respond with ONLY a valid JSON array (no other text):
[
  {
    "image_filename": "actual_image_filename.png",
    "image_page": page_number,
    "referenced_in_markdown": true,
    "associated_person": "SURNAME, Given Names",
    "person_page": page_number,
    "confidence": 0.92,
    "is_cross_page": false,
    "cross_page_type": "same_page",
    "reasoning": "Brief explanation without quotes or newlines",
    "context_evidence": "Relevant text snippet without quotes or newlines"
  }
]

IMPORTANT (output hygiene):
- Use only double quotes for JSON strings
- Do not include newlines or unescaped quotes in string values
- Keep reasoning and context_evidence brief and on single lines
- If no association can be made, set associated_person to null
"#;
