pub mod reader;
pub mod simulate;
