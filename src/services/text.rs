//! Text acquisition: native text first, OCR with rotation search as fallback.
//!
//! Scanned pages arrive in any orientation. Each page is OCR'd at every
//! right angle and the reading with the best quality score wins; the
//! runner-ups are kept so extraction can retry on them when the winner
//! turns out to be unusable.

use image::DynamicImage;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::models::text::{AcquiredText, PageText, RotationCandidate, TextSource};
use crate::services::ocr::{OcrEngine, OcrError};
use crate::services::pdf::{self, PageRenderer};
use crate::services::preprocess::{self, ROTATION_ANGLES};

/// Punctuation that ordinary invoice text is full of; not counted as noise.
const INVOICE_PUNCTUATION: &[char] = &[
    '.', ',', ':', ';', '-', '/', '(', ')', '%', '\'', '€', '$', '£', '+',
];

/// Quality measurement of one OCR reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextScore {
    /// Non-whitespace characters.
    pub char_count: usize,
    /// Purely alphanumeric tokens longer than two characters.
    pub valid_words: usize,
    /// Characters that are neither alphanumeric, whitespace nor punctuation.
    pub symbols: usize,
    pub score: i64,
}

impl TextScore {
    /// Whether the reading is clean enough to skip the remaining angles.
    pub fn is_good_enough(&self, config: &PipelineConfig) -> bool {
        self.valid_words > config.ocr_early_exit_words
            && self.symbols < config.ocr_early_exit_symbols
            && self.score > config.ocr_early_exit_score
    }
}

/// `score = chars + 20 * valid_words - 5 * symbols`
pub fn score_text(text: &str) -> TextScore {
    let char_count = text.chars().filter(|c| !c.is_whitespace()).count();
    let valid_words = text
        .split_whitespace()
        .filter(|w| w.chars().count() > 2 && w.chars().all(char::is_alphanumeric))
        .count();
    let symbols = text
        .chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace() && !INVOICE_PUNCTUATION.contains(c))
        .count();

    let score = char_count as i64 + 20 * valid_words as i64 - 5 * symbols as i64;
    TextScore {
        char_count,
        valid_words,
        symbols,
        score,
    }
}

/// Acquires document text with the injected OCR engine and page renderer.
pub struct TextAcquirer<'a> {
    ocr: &'a dyn OcrEngine,
    renderer: &'a dyn PageRenderer,
    config: &'a PipelineConfig,
}

impl<'a> TextAcquirer<'a> {
    pub fn new(
        ocr: &'a dyn OcrEngine,
        renderer: &'a dyn PageRenderer,
        config: &'a PipelineConfig,
    ) -> Self {
        Self {
            ocr,
            renderer,
            config,
        }
    }

    /// Extract per-page text from raw document bytes.
    ///
    /// A blank result is not an error here; the caller decides what an
    /// unreadable document means.
    pub async fn acquire(&self, bytes: &[u8], mime_type: &str) -> Result<AcquiredText, TextError> {
        let mime = mime_type.to_ascii_lowercase();

        if mime == "application/pdf" || bytes.starts_with(b"%PDF") {
            return self.acquire_pdf(bytes).await;
        }
        if mime.starts_with("image/") {
            let image = image::load_from_memory(bytes)?;
            let page = self.rotation_search(&image, 1).await?;
            return Ok(AcquiredText {
                pages: vec![page],
                source: TextSource::Ocr,
            });
        }
        if mime.starts_with("text/") {
            let text = String::from_utf8_lossy(bytes).into_owned();
            return Ok(AcquiredText {
                pages: vec![PageText::native(text)],
                source: TextSource::Plain,
            });
        }

        Err(TextError::UnsupportedFormat(mime_type.to_string()))
    }

    async fn acquire_pdf(&self, bytes: &[u8]) -> Result<AcquiredText, TextError> {
        match pdf::extract_text_layer(bytes) {
            Ok(pages) => {
                let usable_chars: usize = pages
                    .iter()
                    .map(|p| p.chars().filter(|c| !c.is_whitespace()).count())
                    .sum();
                if usable_chars >= self.config.ocr_min_text_chars {
                    debug!(pages = pages.len(), chars = usable_chars, "Using PDF text layer");
                    return Ok(AcquiredText {
                        pages: pages.into_iter().map(PageText::native).collect(),
                        source: TextSource::TextLayer,
                    });
                }
                info!(chars = usable_chars, "PDF text layer too thin, falling back to OCR");
            }
            Err(e) => {
                warn!(error = %e, "PDF text layer unreadable, falling back to OCR");
            }
        }

        let images = self
            .renderer
            .render_pages(bytes, self.config.ocr_render_dpi)
            .await?;

        let mut pages = Vec::with_capacity(images.len());
        for (index, png) in images.iter().enumerate() {
            let page_no = index + 1;
            let page = match image::load_from_memory(png) {
                Ok(image) => self.rotation_search(&image, page_no).await?,
                Err(e) => {
                    warn!(page = page_no, error = %e, "Rendered page could not be decoded");
                    PageText::default()
                }
            };
            pages.push(page);
        }

        Ok(AcquiredText {
            pages,
            source: TextSource::Ocr,
        })
    }

    /// OCR one page at each right angle and keep the best reading.
    ///
    /// Stops early once a reading is good enough. A rate-limit answer from
    /// the engine aborts the search; other per-angle failures are skipped.
    pub async fn rotation_search(
        &self,
        page: &DynamicImage,
        page_no: usize,
    ) -> Result<PageText, TextError> {
        let mut candidates: Vec<RotationCandidate> = Vec::with_capacity(ROTATION_ANGLES.len());
        let mut best: Option<usize> = None;

        for angle in ROTATION_ANGLES {
            let prepared = preprocess::preprocess(&preprocess::rotate(page, angle));
            let png = preprocess::encode_png(&prepared)?;

            metrics::counter!("ocr_rotation_attempts_total").increment(1);
            let text = match self.ocr.recognize(&png).await {
                Ok(text) => text,
                Err(OcrError::RateLimited(msg)) => return Err(TextError::QuotaExceeded(msg)),
                Err(e) => {
                    warn!(page = page_no, angle, error = %e, "OCR failed at this rotation");
                    continue;
                }
            };

            let measured = score_text(&text);
            debug!(
                page = page_no,
                angle,
                score = measured.score,
                words = measured.valid_words,
                symbols = measured.symbols,
                "OCR rotation scored"
            );

            candidates.push(RotationCandidate {
                angle,
                text,
                score: measured.score,
            });
            let index = candidates.len() - 1;
            if best.map_or(true, |b| measured.score > candidates[b].score) {
                best = Some(index);
            }

            if measured.is_good_enough(self.config) {
                debug!(page = page_no, angle, "OCR reading good enough, skipping remaining angles");
                break;
            }
        }

        let Some(best) = best else {
            warn!(page = page_no, "OCR produced no reading at any rotation");
            return Ok(PageText::default());
        };

        let winner = candidates.swap_remove(best);
        candidates.sort_by(|a, b| b.score.cmp(&a.score));
        candidates.truncate(self.config.alternate_retries);

        info!(
            page = page_no,
            angle = winner.angle,
            score = winner.score,
            alternates = candidates.len(),
            "Page orientation selected"
        );

        Ok(PageText {
            text: winner.text,
            angle: Some(winner.angle),
            score: Some(winner.score),
            alternates: candidates,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TextError {
    #[error("PDF processing failed: {0}")]
    Pdf(String),

    #[error("Page rendering failed: {0}")]
    Render(String),

    #[error("Image could not be decoded: {0}")]
    Image(#[from] image::ImageError),

    #[error("Unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("OCR quota exceeded: {0}")]
    QuotaExceeded(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use image::RgbImage;
    use crate::services::pdf::tests::pdf_with_pages;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Answers OCR calls from a script, in call order.
    struct ScriptedOcr {
        answers: Mutex<VecDeque<Result<String, OcrError>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedOcr {
        fn new(answers: Vec<Result<String, OcrError>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl OcrEngine for ScriptedOcr {
        async fn recognize(&self, _image_png: &[u8]) -> Result<String, OcrError> {
            *self.calls.lock().unwrap() += 1;
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()))
        }
    }

    struct NoRenderer;

    #[async_trait]
    impl PageRenderer for NoRenderer {
        async fn render_pages(&self, _pdf: &[u8], _dpi: u32) -> Result<Vec<Vec<u8>>, TextError> {
            Err(TextError::Render("no renderer in tests".to_string()))
        }
    }

    /// Renders every PDF as `pages` blank PNGs and counts the calls.
    struct CountingRenderer {
        pages: usize,
        calls: Mutex<usize>,
    }

    impl CountingRenderer {
        fn new(pages: usize) -> Self {
            Self {
                pages,
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl PageRenderer for CountingRenderer {
        async fn render_pages(&self, _pdf: &[u8], _dpi: u32) -> Result<Vec<Vec<u8>>, TextError> {
            *self.calls.lock().unwrap() += 1;
            let png = preprocess::encode_png(&page().to_luma8()).unwrap();
            Ok(vec![png; self.pages])
        }
    }

    fn page() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(24, 12, image::Rgb([250, 250, 250])))
    }

    fn clean_text(words: usize) -> String {
        (0..words).map(|i| format!("article{:03}", i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_score_formula() {
        let s = score_text("FACTURE numero 42 ~~ ok");
        // chars: 7 + 6 + 2 + 2 + 2 = 19; words: FACTURE, numero; symbols: ~~
        assert_eq!(s.char_count, 19);
        assert_eq!(s.valid_words, 2);
        assert_eq!(s.symbols, 2);
        assert_eq!(s.score, 19 + 40 - 10);
    }

    #[test]
    fn test_invoice_punctuation_is_not_noise() {
        let s = score_text("Total: 1.234,56 € (TVA 20%)");
        assert_eq!(s.symbols, 0);
    }

    #[test]
    fn test_good_enough_requires_all_three_thresholds() {
        let config = PipelineConfig::default();
        assert!(score_text(&clean_text(80)).is_good_enough(&config));
        assert!(!score_text(&clean_text(30)).is_good_enough(&config));
        let noisy = format!("{} {}", clean_text(80), "#".repeat(12));
        assert!(!score_text(&noisy).is_good_enough(&config));
    }

    #[tokio::test]
    async fn test_early_exit_skips_remaining_angles() {
        let ocr = ScriptedOcr::new(vec![
            Ok("~~ |# garbage".to_string()),
            Ok(clean_text(80)),
            Ok(clean_text(90)),
            Ok(clean_text(95)),
        ]);
        let config = PipelineConfig::default();
        let acquirer = TextAcquirer::new(&ocr, &NoRenderer, &config);

        let result = acquirer.rotation_search(&page(), 1).await.unwrap();

        assert_eq!(ocr.calls(), 2);
        assert_eq!(result.angle, Some(90));
        assert_eq!(result.alternates.len(), 1);
        assert_eq!(result.alternates[0].angle, 0);
    }

    #[tokio::test]
    async fn test_best_of_four_keeps_two_runner_ups() {
        let ocr = ScriptedOcr::new(vec![
            Ok("Facture numero".to_string()),
            Ok("x".to_string()),
            Ok("Facture numero 2024 fournisseur".to_string()),
            Ok("Facture".to_string()),
        ]);
        let config = PipelineConfig::default();
        let acquirer = TextAcquirer::new(&ocr, &NoRenderer, &config);

        let result = acquirer.rotation_search(&page(), 1).await.unwrap();

        assert_eq!(ocr.calls(), 4);
        assert_eq!(result.angle, Some(180));
        let alternate_angles: Vec<u16> = result.alternates.iter().map(|c| c.angle).collect();
        assert_eq!(alternate_angles, vec![0, 270]);
    }

    #[tokio::test]
    async fn test_failed_angles_are_skipped() {
        let ocr = ScriptedOcr::new(vec![
            Err(OcrError::Provider("timeout".to_string())),
            Ok("Facture numero".to_string()),
            Err(OcrError::Provider("timeout".to_string())),
            Err(OcrError::Provider("timeout".to_string())),
        ]);
        let config = PipelineConfig::default();
        let acquirer = TextAcquirer::new(&ocr, &NoRenderer, &config);

        let result = acquirer.rotation_search(&page(), 1).await.unwrap();
        assert_eq!(result.angle, Some(90));
        assert!(result.alternates.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_aborts_search() {
        let ocr = ScriptedOcr::new(vec![Err(OcrError::RateLimited("429".to_string()))]);
        let config = PipelineConfig::default();
        let acquirer = TextAcquirer::new(&ocr, &NoRenderer, &config);

        let result = acquirer.rotation_search(&page(), 1).await;
        assert!(matches!(result, Err(TextError::QuotaExceeded(_))));
        assert_eq!(ocr.calls(), 1);
    }

    #[tokio::test]
    async fn test_plain_text_upload() {
        let ocr = ScriptedOcr::new(vec![]);
        let config = PipelineConfig::default();
        let acquirer = TextAcquirer::new(&ocr, &NoRenderer, &config);

        let acquired = acquirer.acquire(b"FACTURE 12", "text/plain").await.unwrap();
        assert_eq!(acquired.source, TextSource::Plain);
        assert_eq!(acquired.full_text(), "FACTURE 12");
        assert_eq!(ocr.calls(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_format() {
        let ocr = ScriptedOcr::new(vec![]);
        let config = PipelineConfig::default();
        let acquirer = TextAcquirer::new(&ocr, &NoRenderer, &config);

        let result = acquirer.acquire(b"PK\x03\x04", "application/zip").await;
        assert!(matches!(result, Err(TextError::UnsupportedFormat(_))));
    }

    #[tokio::test]
    async fn test_thick_text_layer_skips_ocr() {
        let bytes = pdf_with_pages(&[
            "FACTURE F-2024-0117 Moulins Dupont Farine T55 2 sacs 12,50 Total TTC 25,00 EUR",
        ]);
        let ocr = ScriptedOcr::new(vec![]);
        let renderer = CountingRenderer::new(1);
        let config = PipelineConfig::default();
        let acquirer = TextAcquirer::new(&ocr, &renderer, &config);

        let acquired = acquirer.acquire(&bytes, "application/pdf").await.unwrap();

        assert_eq!(acquired.source, TextSource::TextLayer);
        assert!(acquired.full_text().contains("F-2024-0117"));
        assert_eq!(ocr.calls(), 0);
        assert_eq!(renderer.calls(), 0);
    }

    #[tokio::test]
    async fn test_thin_text_layer_falls_back_to_ocr() {
        let bytes = pdf_with_pages(&["p. 1"]);
        let ocr = ScriptedOcr::new(vec![
            Ok("Facture numero".to_string()),
            Ok("x".to_string()),
            Ok("Facture numero 2024 fournisseur".to_string()),
            Ok("Facture".to_string()),
        ]);
        let renderer = CountingRenderer::new(1);
        let config = PipelineConfig::default();
        let acquirer = TextAcquirer::new(&ocr, &renderer, &config);

        let acquired = acquirer.acquire(&bytes, "application/pdf").await.unwrap();

        assert_eq!(acquired.source, TextSource::Ocr);
        assert_eq!(renderer.calls(), 1);
        assert_eq!(ocr.calls(), 4);
        assert_eq!(acquired.pages.len(), 1);
        assert_eq!(acquired.pages[0].angle, Some(180));
        assert_eq!(acquired.full_text(), "Facture numero 2024 fournisseur");
    }
}
