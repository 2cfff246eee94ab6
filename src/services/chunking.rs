//! Overlapping text chunks and keyword-scored retrieval context.

/// Keywords that mark the parts of an invoice carrying header and total data.
const CONTEXT_KEYWORDS: &[(&str, u32)] = &[
    ("total", 5),
    ("ttc", 4),
    ("ht", 2),
    ("tva", 4),
    ("vat", 4),
    ("tax", 3),
    ("montant", 3),
    ("amount", 3),
    ("net à payer", 5),
    ("facture", 3),
    ("invoice", 3),
    ("avoir", 2),
    ("date", 2),
    ("échéance", 2),
    ("due", 1),
    ("n°", 1),
];

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Position in document order.
    pub index: usize,
    pub text: String,
}

/// Split `text` into windows of `size` chars, each overlapping the previous
/// one by `overlap` chars. Boundaries fall on char boundaries, not bytes.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<Chunk> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() || size == 0 {
        return Vec::new();
    }

    let step = size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + size).min(chars.len());
        chunks.push(Chunk {
            index: chunks.len(),
            text: chars[start..end].iter().collect(),
        });
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

fn keyword_score(text: &str) -> u32 {
    let lower = text.to_lowercase();
    CONTEXT_KEYWORDS
        .iter()
        .map(|(keyword, weight)| lower.matches(keyword).count() as u32 * weight)
        .sum()
}

/// The `top_n` highest-scoring chunks, returned in document order.
///
/// Chunks without any keyword hit are never selected.
pub fn retrieval_context(chunks: &[Chunk], top_n: usize) -> Vec<Chunk> {
    let mut scored: Vec<(u32, &Chunk)> = chunks
        .iter()
        .map(|c| (keyword_score(&c.text), c))
        .filter(|(score, _)| *score > 0)
        .collect();
    // Stable sort keeps earlier chunks first among equal scores.
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.truncate(top_n);

    let mut selected: Vec<Chunk> = scored.into_iter().map(|(_, c)| c.clone()).collect();
    selected.sort_by_key(|c| c.index);
    selected
}

/// Retrieval context of `text` joined into one block, or `None` when no chunk
/// carries a keyword.
pub fn context_block(text: &str, size: usize, overlap: usize, top_n: usize) -> Option<String> {
    let selected = retrieval_context(&chunk_text(text, size, overlap), top_n);
    if selected.is_empty() {
        return None;
    }
    Some(
        selected
            .into_iter()
            .map(|c| c.text)
            .collect::<Vec<_>>()
            .join("\n[...]\n"),
    )
}
