pub mod chunking;
pub mod encryption;
pub mod extraction;
pub mod heuristics;
pub mod llm;
pub mod ocr;
pub mod pdf;
pub mod persistence;
pub mod post_process;
pub mod preprocess;
pub mod prompts;
pub mod sanitize;
pub mod storage;
pub mod text;
pub mod validation;
pub mod worker;
