//! PDF text-layer extraction and page rendering.

use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

use crate::services::text::TextError;

/// Pattern for Identity-H Unimplemented errors (common with CID fonts).
const IDENTITY_H_PATTERN: &str = "?Identity-H Unimplemented?";

/// Per-page text of the embedded text layer, in page order.
pub fn extract_text_layer(pdf_bytes: &[u8]) -> Result<Vec<String>, TextError> {
    let doc = lopdf::Document::load_mem(pdf_bytes)
        .map_err(|e| TextError::Pdf(format!("failed to load PDF: {}", e)))?;

    let pages = doc
        .get_pages()
        .into_keys()
        .map(|page_num| {
            doc.extract_text(&[page_num])
                .map(|t| t.replace(IDENTITY_H_PATTERN, ""))
                .unwrap_or_default()
        })
        .collect();

    Ok(pages)
}

/// Renders every page of a PDF to a PNG image.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render_pages(&self, pdf_bytes: &[u8], dpi: u32) -> Result<Vec<Vec<u8>>, TextError>;
}

/// Renders pages with `pdftoppm` from poppler-utils.
#[derive(Debug, Default, Clone)]
pub struct PdftoppmRenderer;

#[async_trait]
impl PageRenderer for PdftoppmRenderer {
    async fn render_pages(&self, pdf_bytes: &[u8], dpi: u32) -> Result<Vec<Vec<u8>>, TextError> {
        let work_dir = std::env::temp_dir().join(format!("invoice_ingest_{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| TextError::Render(format!("failed to create work dir: {}", e)))?;

        let result = render_into(&work_dir, pdf_bytes, dpi).await;
        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            tracing::warn!(dir = %work_dir.display(), error = %e, "Failed to remove render work dir");
        }
        result
    }
}

async fn render_into(work_dir: &Path, pdf_bytes: &[u8], dpi: u32) -> Result<Vec<Vec<u8>>, TextError> {
    let pdf_path = work_dir.join("input.pdf");
    let prefix = work_dir.join("page");

    tokio::fs::write(&pdf_path, pdf_bytes)
        .await
        .map_err(|e| TextError::Render(format!("failed to write temp PDF: {}", e)))?;

    let output = Command::new("pdftoppm")
        .arg("-png")
        .arg("-r")
        .arg(dpi.to_string())
        .arg(&pdf_path)
        .arg(&prefix)
        .output()
        .await
        .map_err(|e| {
            TextError::Render(format!(
                "failed to run pdftoppm: {}. Make sure poppler-utils is installed.",
                e
            ))
        })?;

    if !output.status.success() {
        return Err(TextError::Render(format!(
            "pdftoppm failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let mut rendered = Vec::new();
    let mut entries = tokio::fs::read_dir(work_dir)
        .await
        .map_err(|e| TextError::Render(format!("failed to list rendered pages: {}", e)))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| TextError::Render(e.to_string()))?
    {
        let path = entry.path();
        if let Some(page) = rendered_page_number(&path) {
            rendered.push((page, path));
        }
    }
    rendered.sort_by_key(|(page, _)| *page);

    let mut images = Vec::with_capacity(rendered.len());
    for (_, path) in rendered {
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| TextError::Render(format!("failed to read rendered page: {}", e)))?;
        images.push(bytes);
    }
    Ok(images)
}

/// `page-07.png` -> 7. pdftoppm zero-pads to the width of the page count.
fn rendered_page_number(path: &Path) -> Option<u32> {
    if path.extension().and_then(|e| e.to_str()) != Some("png") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    stem.strip_prefix("page-")?.parse().ok()
}
