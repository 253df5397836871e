pub mod checker;
pub mod extractor;
