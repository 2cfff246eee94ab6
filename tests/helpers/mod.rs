//! Provider stubs and state builders for pipeline tests.

#![allow(dead_code)]

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, RgbImage};
use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use invoice_ingest::{
    app_state::{AppState, Services},
    config::PipelineConfig,
    db::memory::MemoryStore,
    db::repository::{DocumentStore, TaskQueue},
    models::{document::Document, task::Task, usage::TokenUsage},
    services::{
        llm::{LlmClient, LlmError, LlmResponse},
        ocr::{OcrEngine, OcrError},
        pdf::PageRenderer,
        storage::{ObjectStore, StorageError},
        text::TextError,
    },
};

/// Answers OCR calls from a script, in call order. Runs out into empty text.
#[derive(Default)]
pub struct ScriptedOcr {
    answers: Mutex<VecDeque<Result<String, OcrError>>>,
    calls: Mutex<usize>,
}

impl ScriptedOcr {
    pub fn new(answers: Vec<Result<String, OcrError>>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            calls: Mutex::new(0),
        }
    }

    /// One page read at 0, 90, 180 and 270 degrees.
    pub fn page(readings: [&str; 4]) -> Vec<Result<String, OcrError>> {
        readings.iter().map(|r| Ok(r.to_string())).collect()
    }

    pub fn calls(&self) -> usize {
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

/// Renders any PDF as `pages` small blank PNGs.
pub struct StubRenderer {
    pub pages: usize,
}

#[async_trait]
impl PageRenderer for StubRenderer {
    async fn render_pages(&self, _pdf_bytes: &[u8], _dpi: u32) -> Result<Vec<Vec<u8>>, TextError> {
        Ok((0..self.pages).map(|_| blank_png()).collect())
    }
}

pub fn blank_png() -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 16, image::Rgb([255, 255, 255])));
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

/// What a scripted model answers.
#[derive(Clone)]
pub enum Reply {
    Text(String),
    Quota,
}

/// Answers prompts by the first rule whose needle occurs in the prompt.
/// Unmatched prompts get `{}`.
#[derive(Default)]
pub struct ScriptedLlm {
    rules: Vec<(String, Reply)>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, needle: &str, answer: &str) -> Self {
        self.rules.push((needle.to_string(), Reply::Text(answer.to_string())));
        self
    }

    pub fn quota_on(mut self, needle: &str) -> Self {
        self.rules.push((needle.to_string(), Reply::Quota));
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn model(&self) -> &str {
        "scripted-llm"
    }

    async fn invoke(&self, prompt: &str) -> Result<LlmResponse, LlmError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let reply = self
            .rules
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| Reply::Text("{}".to_string()));

        match reply {
            Reply::Text(text) => Ok(LlmResponse {
                text,
                usage: TokenUsage {
                    input_tokens: prompt.len() as i64 / 4,
                    output_tokens: 50,
                },
            }),
            Reply::Quota => Err(LlmError::QuotaExceeded("3036: daily neuron limit reached".to_string())),
        }
    }
}

/// Bucket held in memory, keyed by object path.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn put(&self, path: &str, bytes: &[u8]) {
        self.objects.lock().unwrap().insert(path.to_string(), bytes.to_vec());
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }
}

/// A pipeline wired to in-memory stores and scripted providers.
pub struct TestPipeline {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub ocr: Arc<ScriptedOcr>,
    pub llm: Arc<ScriptedLlm>,
    pub organization_id: Uuid,
}

impl TestPipeline {
    pub fn new(ocr: ScriptedOcr, llm: ScriptedLlm, rendered_pages: usize) -> Self {
        let store = Arc::new(MemoryStore::new());
        let objects = Arc::new(MemoryObjectStore::default());
        let ocr = Arc::new(ocr);
        let llm = Arc::new(llm);

        let services = Services {
            storage: objects.clone(),
            ocr: ocr.clone(),
            renderer: Arc::new(StubRenderer { pages: rendered_pages }),
            llm: llm.clone(),
            encryption: None,
        };
        let state = AppState::new(store.clone(), services, PipelineConfig::default());

        Self {
            state,
            store,
            objects,
            ocr,
            llm,
            organization_id: Uuid::new_v4(),
        }
    }

    /// Upload a document and queue a task for it.
    pub async fn upload(&self, file_path: &str, mime_type: &str, bytes: &[u8]) -> (Document, Task) {
        self.objects.put(file_path, bytes);
        let document = Document::new(self.organization_id, file_path, mime_type);
        self.store.insert_document(&document).await.unwrap();
        let task = self.store.enqueue(document.id, 0, 3).await.unwrap();
        (document, task)
    }
}

/// Page 1 of the test invoice as printed.
pub const INVOICE_PAGE_ONE: &str = "MOULINS DUPONT\n\
    FACTURE N° F-2024-0117\n\
    Date : 12/03/2024\n\
    Farine T55 10,00\n\
    Total TTC 30,00";

/// Page 2: one more line.
pub const INVOICE_PAGE_TWO: &str = "Beurre doux 20,00";

/// Model answer for page 1.
pub const INVOICE_JSON: &str = r#"Here is the data:
```json
{
  "document_type": "invoice",
  "invoice_number": "F-2024-0117",
  "invoice_date": "2024-03-12",
  "currency": "EUR",
  "supplier_name": "MOULINS DUPONT",
  "total_amount": 30.0,
  "items": [
    {"description": "Farine T55", "quantity": 1, "unit_price": 10.0, "total_price": 10.0}
  ]
}
```"#;

pub const PAGE_TWO_ITEMS_JSON: &str =
    r#"{"items": [{"description": "Beurre doux", "quantity": 1, "unit_price": 20.0, "total_price": 20.0}]}"#;

pub const CLASSIFICATION_JSON: &str =
    r#"{"category": "raw_materials", "confidence": 0.9, "item_categories": ["flour", "dairy"]}"#;
