pub mod document;
pub mod supplier;
pub mod task;
pub mod text;
pub mod usage;
