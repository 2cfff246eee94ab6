//! Deterministic text heuristics for invoice headers.
//!
//! Every function here is pure: text in, optional value out. The
//! post-processor decides what to do with the answers.

use chrono::NaiveDate;
use regex::Regex;
use std::sync::LazyLock;
use strsim::jaro_winkler;

/// Chars inspected before the document-type keyword.
const WINDOW_BEFORE: usize = 400;
/// Chars inspected after the document-type keyword.
const WINDOW_AFTER: usize = 800;
/// Lines scanned for the supplier name.
const SUPPLIER_HEADER_LINES: usize = 40;
/// Jaro-Winkler similarity above which two names are the same party.
const COLLISION_SIMILARITY: f64 = 0.97;

/// Legal-form tokens ignored when comparing company names.
const LEGAL_FORMS: &[&str] = &["sa", "sas", "sarl", "eurl", "sasu", "gmbh", "ltd", "inc", "llc", "bv"];

static DOCUMENT_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(facture|invoice)\b").expect("valid keyword regex"));

static INVOICE_NUMBER_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // "Facture n° F-2024-001", "Invoice No: 12345", "FACTURE : 2024/118"
        r"(?i)\b(?:facture|invoice)\s*(?:n[°ºo]\.?|no\.?|num[ée]ro|number|#)?\s*[:\-]?\s*([A-Z0-9][A-Z0-9\-/._]*[A-Z0-9])",
        // "N° de facture : 4521", "Numéro : FA123"
        r"(?i)(?:n[°º]|num[ée]ro|number|#)\s*(?:de\s+(?:la\s+)?facture|d'invoice)?\s*[:\-]?\s*([A-Z0-9][A-Z0-9\-/._]*[A-Z0-9])",
        // "Réf. facture FA-88"
        r"(?i)\br[ée]f(?:[ée]rence)?\.?\s*(?:facture)?\s*[:\-]?\s*([A-Z0-9][A-Z0-9\-/._]*[A-Z0-9])",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid invoice number regex"))
    .collect()
});

static NUMERIC_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2})[/.\-](\d{1,2})[/.\-](\d{4}|\d{2})\b").expect("valid numeric date regex")
});

static ISO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").expect("valid ISO date regex"));

static FRENCH_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(\d{1,2})(?:er)?\s+(janvier|f[ée]vrier|mars|avril|mai|juin|juillet|ao[uû]t|septembre|octobre|novembre|d[ée]cembre)\s+(\d{4})\b",
    )
    .expect("valid French date regex")
});

/// Lines carrying one of these terms hold a due, print, delivery or order
/// reference rather than the invoice's own.
static EXCLUDED_CONTEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:[ée]ch[ée]ance|due|imprim[ée]|printed|livraison|delivery|commande|order)\b")
        .expect("valid exclusion regex")
});

/// Lines carrying a customer, account or company identifier. Their numbers
/// are not the invoice's unless the document keyword labels them.
static IDENTIFIER_CONTEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:client|customer|compte|account|siret|siren|tva|vat)\b")
        .expect("valid identifier context regex")
});

/// Lines that describe addresses, identifiers or the customer, never the
/// issuer's name.
static BANNED_SUPPLIER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(factur|invoice|bill|adresse|address|\brue\b|avenue|boulevard|cedex|\btva\b|\bvat\b|siret|siren|\brcs\b|iban|\bbic\b|client|customer|destinataire|livr[ée]|ship|contact|t[ée]l[ée]?phone|\bt[ée]l\b|phone|fax|e-?mail|@|www\.|https?:|date|page|total|n°|capital)",
    )
    .expect("valid supplier banned regex")
});

/// Byte range around the first document-type keyword, `[-400, +800]` chars.
pub fn header_window(text: &str) -> Option<&str> {
    let found = DOCUMENT_KEYWORD.find(text)?;
    let start = back_chars(text, found.start(), WINDOW_BEFORE);
    let end = forward_chars(text, found.start(), WINDOW_AFTER);
    Some(&text[start..end])
}

fn back_chars(text: &str, from: usize, n: usize) -> usize {
    text[..from].char_indices().rev().nth(n.saturating_sub(1)).map_or(0, |(i, _)| i)
}

fn forward_chars(text: &str, from: usize, n: usize) -> usize {
    text[from..].char_indices().nth(n).map_or(text.len(), |(i, _)| from + i)
}

/// The full line of `text` containing byte offset `at`.
fn line_at(text: &str, at: usize) -> &str {
    let start = text[..at].rfind('\n').map_or(0, |i| i + 1);
    let end = text[at..].find('\n').map_or(text.len(), |i| at + i);
    &text[start..end]
}

/// First candidate on a clean line, else the first candidate.
fn prefer_clean_line(window: &str, mut candidates: Vec<(usize, String)>) -> Option<String> {
    candidates.sort_by_key(|(at, _)| *at);
    let clean = candidates
        .iter()
        .position(|(at, _)| !EXCLUDED_CONTEXT.is_match(line_at(window, *at)));
    match clean {
        Some(i) => Some(candidates.swap_remove(i).1),
        None => candidates.into_iter().next().map(|(_, value)| value),
    }
}

/// Invoice number printed near the document-type keyword.
///
/// Patterns are tried in order and the first one with a candidate wins, so
/// `Facture n° …` beats a bare `n° …` anywhere in the window.
pub fn invoice_number_from_header(text: &str) -> Option<String> {
    let window = header_window(text)?;

    INVOICE_NUMBER_PATTERNS
        .iter()
        .enumerate()
        .find_map(|(rank, pattern)| {
            let candidates = pattern
                .captures_iter(window)
                .filter_map(|caps| {
                    let m = caps.get(1)?;
                    let value = m.as_str().trim_end_matches(['.', '/', '-', '_']);
                    if !value.chars().any(|c| c.is_ascii_digit()) || looks_like_date(value) {
                        return None;
                    }
                    // Only the keyword-anchored pattern may read identifier lines.
                    if rank > 0 && IDENTIFIER_CONTEXT.is_match(line_at(window, m.start())) {
                        return None;
                    }
                    Some((m.start(), value.to_string()))
                })
                .collect();
            prefer_clean_line(window, candidates)
        })
}

fn looks_like_date(value: &str) -> bool {
    NUMERIC_DATE.is_match(value) || ISO_DATE.is_match(value)
}

/// Invoice date near the document-type keyword, as ISO `yyyy-mm-dd`.
pub fn invoice_date_from_header(text: &str) -> Option<String> {
    let window = header_window(text)?;

    let mut candidates = Vec::new();
    for caps in NUMERIC_DATE.captures_iter(window) {
        let (Some(all), Some(d), Some(m), Some(y)) = (caps.get(0), caps.get(1), caps.get(2), caps.get(3)) else {
            continue;
        };
        if let Some(date) = build_date(y.as_str(), m.as_str().parse().ok(), d.as_str()) {
            candidates.push((all.start(), date));
        }
    }
    for caps in ISO_DATE.captures_iter(window) {
        let (Some(all), Some(y), Some(m), Some(d)) = (caps.get(0), caps.get(1), caps.get(2), caps.get(3)) else {
            continue;
        };
        if let Some(date) = build_date(y.as_str(), m.as_str().parse().ok(), d.as_str()) {
            candidates.push((all.start(), date));
        }
    }
    for caps in FRENCH_DATE.captures_iter(window) {
        let (Some(all), Some(d), Some(month), Some(y)) = (caps.get(0), caps.get(1), caps.get(2), caps.get(3)) else {
            continue;
        };
        if let Some(date) = build_date(y.as_str(), french_month(month.as_str()), d.as_str()) {
            candidates.push((all.start(), date));
        }
    }

    prefer_clean_line(window, candidates)
}

fn build_date(year: &str, month: Option<u32>, day: &str) -> Option<String> {
    let mut year: i32 = year.parse().ok()?;
    if year < 100 {
        year += 2000;
    }
    let date = NaiveDate::from_ymd_opt(year, month?, day.parse().ok()?)?;
    Some(date.format("%Y-%m-%d").to_string())
}

fn french_month(name: &str) -> Option<u32> {
    let folded = fold_accents(&name.to_lowercase());
    let month = match folded.as_str() {
        "janvier" => 1,
        "fevrier" => 2,
        "mars" => 3,
        "avril" => 4,
        "mai" => 5,
        "juin" => 6,
        "juillet" => 7,
        "aout" => 8,
        "septembre" => 9,
        "octobre" => 10,
        "novembre" => 11,
        "decembre" => 12,
        _ => return None,
    };
    Some(month)
}

/// Issuer name guessed from the top of the document.
///
/// Skips lines with address, identifier or customer markers and lines with
/// fewer than 3 letters. An all-caps line wins, else the first one left.
pub fn supplier_from_header(text: &str) -> Option<String> {
    let lines: Vec<&str> = text
        .lines()
        .take(SUPPLIER_HEADER_LINES)
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| !BANNED_SUPPLIER_LINE.is_match(l))
        .filter(|l| l.chars().filter(|c| c.is_alphabetic()).count() >= 3)
        .collect();

    lines
        .iter()
        .find(|l| is_all_caps(l))
        .or_else(|| lines.first())
        .map(|l| l.to_string())
}

fn is_all_caps(line: &str) -> bool {
    let mut letters = line.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(char::is_uppercase)
}

/// Comparison key of a company name: lowercase, accents folded, legal forms
/// dropped, alphanumerics only. `"Moulins Dupont SARL"` -> `"moulinsdupont"`.
pub fn normalize_key(name: &str) -> String {
    // "S.A." and "S.A.R.L." collapse to their legal-form token.
    let folded = fold_accents(&name.to_lowercase()).replace('.', "");
    folded
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !LEGAL_FORMS.contains(t))
        .collect()
}

fn fold_accents(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => 'a',
            'ç' => 'c',
            'è' | 'é' | 'ê' | 'ë' => 'e',
            'ì' | 'í' | 'î' | 'ï' => 'i',
            'ñ' => 'n',
            'ò' | 'ó' | 'ô' | 'õ' | 'ö' => 'o',
            'ù' | 'ú' | 'û' | 'ü' => 'u',
            'ý' | 'ÿ' => 'y',
            other => other,
        })
        .collect()
}

/// Whether two names designate the same party.
pub fn names_collide(a: &str, b: &str) -> bool {
    let (ka, kb) = (normalize_key(a), normalize_key(b));
    if ka.is_empty() || kb.is_empty() {
        return false;
    }
    ka == kb || jaro_winkler(&ka, &kb) >= COLLISION_SIMILARITY
}

/// Leading token of an upload's file name: `METRO_facture_12.pdf` -> `METRO`.
/// Needs at least 3 letters.
pub fn file_name_prefix(file_name: &str) -> Option<String> {
    let token = file_name
        .split(['_', '-', ' ', '.'])
        .next()?
        .trim();
    if token.chars().filter(|c| c.is_alphabetic()).count() >= 3 {
        Some(token.to_string())
    } else {
        None
    }
}
