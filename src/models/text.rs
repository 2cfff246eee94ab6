use serde::{Deserialize, Serialize};
use strum::Display;

/// OCR output for one page at one tested rotation, with its quality score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationCandidate {
    pub angle: u16,
    pub text: String,
    pub score: i64,
}

/// Where the text of a document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TextSource {
    /// Embedded PDF text layer.
    TextLayer,
    /// Plain-text upload.
    Plain,
    /// OCR with rotation search.
    Ocr,
}

/// Best text of one page plus the runner-up rotations kept for retries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageText {
    pub text: String,
    /// Winning angle when the page went through OCR.
    pub angle: Option<u16>,
    pub score: Option<i64>,
    /// Runner-up rotations, best first.
    pub alternates: Vec<RotationCandidate>,
}

impl PageText {
    pub fn native(text: String) -> Self {
        Self {
            text,
            ..Self::default()
        }
    }
}

/// Text of a whole document, one entry per page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquiredText {
    pub pages: Vec<PageText>,
    pub source: TextSource,
}

impl AcquiredText {
    /// Pages joined by a blank line.
    pub fn full_text(&self) -> String {
        self.pages
            .iter()
            .map(|p| p.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Like [`full_text`](Self::full_text), with page 1 read at the given
    /// alternate rotation instead of the winning one.
    pub fn full_text_with_alternate(&self, angle: u16) -> String {
        let Some((first, rest)) = self.pages.split_first() else {
            return String::new();
        };
        let page_one = first
            .alternates
            .iter()
            .find(|c| c.angle == angle)
            .map_or(first.text.as_str(), |c| c.text.as_str());

        std::iter::once(page_one)
            .chain(rest.iter().map(|p| p.text.as_str()))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn is_blank(&self) -> bool {
        self.pages.iter().all(|p| p.text.trim().is_empty())
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}
