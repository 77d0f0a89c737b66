//! 流式引用解析器
//!
//! 支持两种标记：
//! - 编号引用 `[1]`：从正文中移除，记录一条只有 label 的 Citation；
//! - Markdown 链接 `[Mayo Clinic](https://www.mayoclinic.org/...)`：正文保留链接文字，记录 url 与文字在正文中的位置。
//!
//! 分块边界不影响结果：同一段文本无论一次送入还是逐字符送入，拼接后的正文与引用列表完全一致。
//! 缓冲区末尾「仍可能变成标记」的片段会保留到下一次 process_chunk，最长不超过一个完整标记的长度。

use serde::{Deserialize, Serialize};

/// 链接文字最大字符数，超过则视为普通文本
const MAX_LABEL_CHARS: usize = 200;
/// URL 最大字符数
const MAX_URL_CHARS: usize = 2048;
/// 编号引用最多位数（`[1]` ~ `[9999]`）
const MAX_NUMERIC_DIGITS: usize = 4;

/// 一条引用；start_index / end_index 为正文（已去除标记）中的字符偏移，跨整个回复累计
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub start_index: usize,
    pub end_index: usize,
}

enum Scan {
    /// 完整标记：消耗的字节数、正文中保留的文字、引用内容
    Complete {
        len: usize,
        keep: Option<String>,
        label: String,
        url: Option<String>,
    },
    /// 到缓冲区末尾仍可能成为标记，需等待更多输入
    Partial,
    /// 不是标记，`[` 作为普通文本输出
    NoMatch,
}

/// 单次回复的解析状态；每次新回复应使用新的实例
#[derive(Debug, Default)]
pub struct CitationParser {
    buffer: String,
    citations: Vec<Citation>,
    /// 已输出正文的字符数
    emitted: usize,
}

impl CitationParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一段增量文本，返回可安全输出的正文与本次新解析出的引用
    pub fn process_chunk(&mut self, delta: &str) -> (String, Vec<Citation>) {
        self.buffer.push_str(delta);

        let mut clean = String::new();
        let mut found = Vec::new();
        let mut pos = 0;

        while pos < self.buffer.len() {
            let Some(rel) = self.buffer[pos..].find('[') else {
                self.emit(&mut clean, pos, self.buffer.len());
                pos = self.buffer.len();
                break;
            };
            let open = pos + rel;
            self.emit(&mut clean, pos, open);

            match scan_marker(&self.buffer[open..]) {
                Scan::Complete {
                    len,
                    keep,
                    label,
                    url,
                } => {
                    let start_index = self.emitted;
                    if let Some(text) = keep {
                        self.emitted += text.chars().count();
                        clean.push_str(&text);
                    }
                    let citation = Citation {
                        label,
                        url,
                        start_index,
                        end_index: self.emitted,
                    };
                    self.citations.push(citation.clone());
                    found.push(citation);
                    pos = open + len;
                }
                Scan::Partial => {
                    pos = open;
                    break;
                }
                Scan::NoMatch => {
                    clean.push('[');
                    self.emitted += 1;
                    pos = open + 1;
                }
            }
        }

        self.buffer.drain(..pos);
        (clean, found)
    }

    /// 流结束：剩余缓冲区按原样作为普通文本输出（从未闭合的片段不是引用）
    pub fn finalize(&mut self) -> String {
        let rest = std::mem::take(&mut self.buffer);
        self.emitted += rest.chars().count();
        rest
    }

    /// 本次回复累计的全部引用（按出现顺序）
    pub fn citations(&self) -> &[Citation] {
        &self.citations
    }

    pub fn into_citations(self) -> Vec<Citation> {
        self.citations
    }

    /// 当前暂存、尚未输出的字节数
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    fn emit(&mut self, clean: &mut String, from: usize, to: usize) {
        let text = &self.buffer[from..to];
        self.emitted += text.chars().count();
        clean.push_str(text);
    }
}

/// 判断以 `[` 开头的 s 是否为标记。只在读到 s 末尾时返回 Partial，因此结果与分块方式无关。
fn scan_marker(s: &str) -> Scan {
    debug_assert!(s.starts_with('['));
    let mut chars = s.char_indices().skip(1);

    let mut label_chars = 0;
    let close = loop {
        let Some((i, c)) = chars.next() else {
            return Scan::Partial;
        };
        match c {
            ']' => break i,
            '[' | '\n' | '\r' => return Scan::NoMatch,
            _ => {
                label_chars += 1;
                if label_chars > MAX_LABEL_CHARS {
                    return Scan::NoMatch;
                }
            }
        }
    };
    let label = &s[1..close];
    if label.trim().is_empty() {
        return Scan::NoMatch;
    }

    if label.len() <= MAX_NUMERIC_DIGITS && label.bytes().all(|b| b.is_ascii_digit()) {
        return Scan::Complete {
            len: close + 1,
            keep: None,
            label: label.to_string(),
            url: None,
        };
    }

    match chars.next() {
        None => return Scan::Partial,
        Some((_, '(')) => {}
        Some(_) => return Scan::NoMatch,
    }
    let url_start = close + 2;

    let mut url_chars = 0;
    loop {
        let Some((i, c)) = chars.next() else {
            return Scan::Partial;
        };
        match c {
            ')' => {
                let url = &s[url_start..i];
                if url.is_empty() {
                    return Scan::NoMatch;
                }
                return Scan::Complete {
                    len: i + 1,
                    keep: Some(label.to_string()),
                    label: label.to_string(),
                    url: Some(url.to_string()),
                };
            }
            '(' | '[' | ']' => return Scan::NoMatch,
            c if c.is_whitespace() => return Scan::NoMatch,
            _ => {
                url_chars += 1;
                if url_chars > MAX_URL_CHARS {
                    return Scan::NoMatch;
                }
            }
        }
    }
}
