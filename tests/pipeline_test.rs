//! End-to-end runs of `process_next_task` against in-memory stores and
//! scripted OCR/LLM providers.

mod helpers;

use helpers::*;
use invoice_ingest::{
    db::repository::TaskQueue,
    models::{document::DocumentStatus, task::{Task, TaskStatus}},
    services::worker::process_next_task,
};

const GARBLED: &str = "GARBLED GARBLED GARBLED GARBLED GARBLED GARBLED \
    GARBLED GARBLED GARBLED GARBLED GARBLED GARBLED";

#[tokio::test]
async fn test_idle_when_queue_is_empty() {
    let pipeline = TestPipeline::new(ScriptedOcr::default(), ScriptedLlm::new(), 1);

    let outcome = process_next_task(&pipeline.state).await.unwrap();

    assert!(!outcome.processed);
    assert!(outcome.document_id.is_none());
    assert_eq!(pipeline.llm.calls(), 0);
}

#[tokio::test]
async fn test_two_page_scan_merges_items_across_pages() {
    // Page 1 reads best rotated 90°, page 2 upright.
    let mut readings = ScriptedOcr::page(["~~ ## |||", INVOICE_PAGE_ONE, "x", ""]);
    readings.extend(ScriptedOcr::page([INVOICE_PAGE_TWO, "", "~", ""]));
    let llm = ScriptedLlm::new()
        .on("Classify", CLASSIFICATION_JSON)
        .on("This is page 2", PAGE_TWO_ITEMS_JSON)
        .on("MOULINS DUPONT", INVOICE_JSON);
    let pipeline = TestPipeline::new(ScriptedOcr::new(readings), llm, 2);

    // Not a parseable PDF, so the text layer is skipped and pages are rendered.
    let (document, task) = pipeline
        .upload("org/scans/MOULINS_0117.pdf", "application/pdf", b"%PDF-1.4 scanned")
        .await;

    let outcome = process_next_task(&pipeline.state).await.unwrap();

    assert!(outcome.processed);
    assert_eq!(outcome.document_id, Some(document.id));
    assert!(outcome.error.is_none(), "unexpected error {:?}", outcome.error);
    assert_eq!(pipeline.ocr.calls(), 8);

    let stored = pipeline.store.document(document.id).await.unwrap();
    assert_eq!(stored.status, DocumentStatus::Completed);
    assert_eq!(stored.invoice_number.as_deref(), Some("F-2024-0117"));
    assert!(stored.supplier_id.is_some());

    let items = pipeline.store.items(document.id).await;
    let descriptions: Vec<&str> = items.iter().map(|i| i.description.as_str()).collect();
    assert_eq!(descriptions, vec!["Farine T55", "Beurre doux"]);
    assert_eq!(items[0].category.as_deref(), Some("flour"));
    assert_eq!(items[1].category.as_deref(), Some("dairy"));

    let data = stored.extracted_data.unwrap();
    let subtotal = data["subtotal"].as_f64().unwrap();
    assert!((subtotal - 30.0).abs() < 0.01);
    let notes = data["notes"].as_array().unwrap();
    assert!(notes.iter().all(|n| !n.as_str().unwrap_or("").starts_with("sum mismatch")));

    let classification = stored.classification.unwrap();
    assert_eq!(classification["category"], "raw_materials");

    let task = pipeline.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempts, 1);

    // Extraction, page 2 items, classification.
    assert_eq!(pipeline.llm.calls(), 3);
    assert_eq!(pipeline.store.usage_records().await.len(), 3);

    let suppliers = pipeline.store.suppliers().await;
    assert_eq!(suppliers.len(), 1);
    assert_eq!(suppliers[0].normalized_key, "moulinsdupont");
}

#[tokio::test]
async fn test_second_invoice_with_same_number_is_duplicate() {
    let text = format!("{}\n{}", INVOICE_PAGE_ONE, INVOICE_PAGE_TWO);
    let llm = ScriptedLlm::new()
        .on("Classify", CLASSIFICATION_JSON)
        .on("DOCUMENT:", INVOICE_JSON);
    let pipeline = TestPipeline::new(ScriptedOcr::default(), llm, 1);

    let (first, first_task) = pipeline.upload("org/a.txt", "text/plain", text.as_bytes()).await;
    let (second, second_task) = pipeline.upload("org/b.txt", "text/plain", text.as_bytes()).await;

    let a = process_next_task(&pipeline.state).await.unwrap();
    let b = process_next_task(&pipeline.state).await.unwrap();
    assert!(a.processed && b.processed);
    assert!(a.error.is_none() && !a.duplicate);
    // A duplicate is a finished task, not a failure.
    assert!(b.duplicate);
    assert!(b.error.is_none());

    let first = pipeline.store.document(first.id).await.unwrap();
    let second = pipeline.store.document(second.id).await.unwrap();
    let mut statuses = vec![first.status, second.status];
    statuses.sort_by_key(|s| s.to_string());
    assert_eq!(statuses, vec![DocumentStatus::Completed, DocumentStatus::Duplicate]);

    let duplicate = if first.status == DocumentStatus::Duplicate { first } else { second };
    assert!(duplicate.invoice_number.is_none());
    assert!(duplicate.extracted_data.is_some());

    // Both tasks finish; a duplicate is not retried.
    for id in [first_task.id, second_task.id] {
        let task = pipeline.store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }
    assert_eq!(pipeline.store.suppliers().await.len(), 1);
}

#[tokio::test]
async fn test_rate_limit_requeues_with_backoff() {
    let llm = ScriptedLlm::new().quota_on("DOCUMENT:");
    let pipeline = TestPipeline::new(ScriptedOcr::default(), llm, 1);
    let (document, task) = pipeline
        .upload("org/c.txt", "text/plain", INVOICE_PAGE_ONE.as_bytes())
        .await;

    // Second attempt of five.
    let retried = Task { attempts: 1, max_attempts: 5, ..task };
    pipeline.store.put_task(retried.clone()).await;

    let outcome = process_next_task(&pipeline.state).await.unwrap();
    assert!(outcome.error.unwrap().contains("quota"));

    let task = pipeline.store.get_task(retried.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts, 2);
    assert!(task.started_at.is_none());
    assert!(task.is_quota_backoff());
    assert!(task.error_message.unwrap().contains("retry after 120s"));

    let stored = pipeline.store.document(document.id).await.unwrap();
    assert_eq!(stored.status, DocumentStatus::Queued);

    // Cooling down: nothing is claimable yet.
    let again = process_next_task(&pipeline.state).await.unwrap();
    assert!(!again.processed);
}

#[tokio::test]
async fn test_empty_extraction_retries_on_alternate_rotation() {
    let alternate = "MOULINS DUPONT\nFACTURE N° F-2024-0117\nDate : 12/03/2024\nFarine T55 10,00";
    let ocr = ScriptedOcr::new(ScriptedOcr::page([GARBLED, alternate, "x", ""]));
    let llm = ScriptedLlm::new()
        .on("Classify", CLASSIFICATION_JSON)
        .on("MOULINS DUPONT", INVOICE_JSON);
    let pipeline = TestPipeline::new(ocr, llm, 1);
    let (document, _) = pipeline.upload("org/photo.png", "image/png", &blank_png()).await;

    let outcome = process_next_task(&pipeline.state).await.unwrap();
    assert!(outcome.error.is_none(), "unexpected error {:?}", outcome.error);

    let stored = pipeline.store.document(document.id).await.unwrap();
    assert_eq!(stored.status, DocumentStatus::Completed);
    assert_eq!(stored.invoice_number.as_deref(), Some("F-2024-0117"));

    let data = stored.extracted_data.unwrap();
    assert_eq!(data["supplier_name"], "MOULINS DUPONT");
    let notes: Vec<&str> = data["notes"].as_array().unwrap().iter().filter_map(|n| n.as_str()).collect();
    assert!(notes.iter().any(|n| n.contains("rotated 90")));

    // Garbled primary, alternate at 90°, classification.
    let prompts = pipeline.llm.prompts();
    assert_eq!(prompts.len(), 3);
    assert!(prompts[0].contains("GARBLED"));
    assert!(prompts[1].contains("MOULINS DUPONT"));
}

#[tokio::test]
async fn test_blank_document_fails_without_model_call() {
    let pipeline = TestPipeline::new(ScriptedOcr::default(), ScriptedLlm::new(), 1);
    let (document, task) = pipeline.upload("org/blank.txt", "text/plain", b"  \n ").await;

    let outcome = process_next_task(&pipeline.state).await.unwrap();
    assert!(outcome.error.unwrap().starts_with("unreadable:"));

    let task = pipeline.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 1);

    let stored = pipeline.store.document(document.id).await.unwrap();
    assert_eq!(stored.status, DocumentStatus::Error);
    assert!(stored.error_message.unwrap().starts_with("unreadable:"));
    assert_eq!(pipeline.llm.calls(), 0);
}

#[tokio::test]
async fn test_corrupt_image_is_unreadable() {
    let pipeline = TestPipeline::new(ScriptedOcr::default(), ScriptedLlm::new(), 1);
    let (document, _) = pipeline.upload("org/broken.jpg", "image/jpeg", b"not a jpeg").await;

    process_next_task(&pipeline.state).await.unwrap();

    let stored = pipeline.store.document(document.id).await.unwrap();
    assert_eq!(stored.status, DocumentStatus::Error);
    assert_eq!(pipeline.ocr.calls(), 0);
    assert_eq!(pipeline.llm.calls(), 0);
}

#[tokio::test]
async fn test_parse_failure_retries_then_fails() {
    let llm = ScriptedLlm::new().on("DOCUMENT:", "I could not read this invoice, sorry.");
    let pipeline = TestPipeline::new(ScriptedOcr::default(), llm, 1);
    let (document, task) = pipeline
        .upload("org/d.txt", "text/plain", INVOICE_PAGE_ONE.as_bytes())
        .await;

    for _ in 0..3 {
        let outcome = process_next_task(&pipeline.state).await.unwrap();
        assert!(outcome.processed);
    }

    let task = pipeline.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 3);
    assert!(task.error_message.unwrap().starts_with("failed after 3 attempts"));

    let stored = pipeline.store.document(document.id).await.unwrap();
    assert_eq!(stored.status, DocumentStatus::Error);

    // Exhausted tasks are never claimed again.
    assert!(!process_next_task(&pipeline.state).await.unwrap().processed);
}

#[tokio::test]
async fn test_customer_number_does_not_merge_invoices() {
    let page = |number: &str| {
        format!(
            "MOULINS DUPONT\nClient n° 4521\nFACTURE N° {}\nDate : 12/03/2024\nFarine T55 10,00\nTotal TTC 30,00",
            number
        )
    };
    let second_json = INVOICE_JSON.replace("F-2024-0117", "F-2024-0342");
    let llm = ScriptedLlm::new()
        .on("Classify", CLASSIFICATION_JSON)
        .on("F-2024-0342", &second_json)
        .on("F-2024-0117", INVOICE_JSON);
    let pipeline = TestPipeline::new(ScriptedOcr::default(), llm, 1);

    let (first, _) = pipeline
        .upload("org/e.txt", "text/plain", page("F-2024-0117").as_bytes())
        .await;
    let (second, _) = pipeline
        .upload("org/f.txt", "text/plain", page("F-2024-0342").as_bytes())
        .await;

    for _ in 0..2 {
        let outcome = process_next_task(&pipeline.state).await.unwrap();
        assert!(outcome.processed);
        assert!(!outcome.duplicate);
        assert!(outcome.error.is_none(), "unexpected error {:?}", outcome.error);
    }

    let first = pipeline.store.document(first.id).await.unwrap();
    let second = pipeline.store.document(second.id).await.unwrap();
    assert_eq!(first.status, DocumentStatus::Completed);
    assert_eq!(second.status, DocumentStatus::Completed);
    assert_eq!(first.invoice_number.as_deref(), Some("F-2024-0117"));
    assert_eq!(second.invoice_number.as_deref(), Some("F-2024-0342"));
    assert_eq!(pipeline.store.suppliers().await.len(), 1);
}
