//! 引用提取：从逐 Token 到达的最终回复中增量提取引用标记

pub mod parser;

pub use parser::{Citation, CitationParser};
