//! Structured element extraction for XML documents.
//!
//! [`partition_xml`] decomposes a document into an ordered sequence of
//! [`Element`]s, one per block-level element, in document order. Inline
//! markup (`<italic>`, `<xref>`, MathML, …) is folded into the enclosing
//! block so that `<p>The <italic>BRCA1</italic> gene</p>` becomes the
//! single text `The BRCA1 gene`. Whitespace inside each element is
//! collapsed to single spaces.
//!
//! Errors are returned, never panicked, so one bad document can be
//! recorded and skipped by the caller.

use quick_xml::events::Event;
use quick_xml::Reader;
use std::borrow::Cow;

/// Elements whose text belongs to the surrounding block.
const INLINE_TAGS: &[&str] = &[
    // JATS inline formatting and linking
    "italic",
    "bold",
    "sup",
    "sub",
    "sc",
    "underline",
    "overline",
    "monospace",
    "roman",
    "sans-serif",
    "strike",
    "xref",
    "ext-link",
    "uri",
    "email",
    "abbrev",
    "named-content",
    "styled-content",
    "inline-formula",
    "inline-graphic",
    "tex-math",
    // HTML-style inline elements
    "a",
    "b",
    "i",
    "u",
    "em",
    "strong",
    "span",
    "small",
    "code",
    // MathML
    "math",
    "mi",
    "mo",
    "mn",
    "ms",
    "mtext",
    "mrow",
    "msub",
    "msup",
    "msubsup",
    "mfrac",
    "msqrt",
    "mroot",
    "mstyle",
    "mspace",
    "mover",
    "munder",
    "munderover",
    "mfenced",
    "mtable",
    "mtr",
    "mtd",
    "semantics",
    "annotation",
];

/// One block-level piece of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    /// Local name of the element the text belongs to.
    pub tag: String,
    /// Normalized text, or `None` when the element held only whitespace.
    pub text: Option<String>,
}

#[derive(Debug)]
pub enum PartitionError {
    /// The XML could not be parsed.
    Malformed { position: u64, message: String },
    /// The input contained no root element.
    Empty,
}

impl std::fmt::Display for PartitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionError::Malformed { position, message } => {
                write!(f, "malformed XML at byte {}: {}", position, message)
            }
            PartitionError::Empty => write!(f, "document has no root element"),
        }
    }
}

impl std::error::Error for PartitionError {}

struct Open {
    tag: String,
    inline: bool,
}

/// Partition an XML document into block elements in document order.
pub fn partition_xml(xml: &str) -> Result<Vec<Element>, PartitionError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut elements = Vec::new();
    let mut stack: Vec<Open> = Vec::new();
    let mut pending = String::new();
    let mut saw_root = false;

    loop {
        let event = reader.read_event().map_err(|e| PartitionError::Malformed {
            position: reader.error_position() as u64,
            message: e.to_string(),
        })?;

        match event {
            Event::Start(e) => {
                saw_root = true;
                let tag = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                // The root is always a block, so its text is never dropped.
                let inline = !stack.is_empty() && is_inline(&tag);
                if !inline {
                    // Text before a nested block belongs to the enclosing one.
                    if let Some(parent) = innermost_block(&stack) {
                        flush_fragment(&mut elements, parent, &mut pending);
                    }
                }
                stack.push(Open { tag, inline });
            }
            Event::End(_) => {
                let open = stack.pop().ok_or_else(|| PartitionError::Malformed {
                    position: reader.buffer_position() as u64,
                    message: "unexpected closing tag".to_string(),
                })?;
                if !open.inline {
                    elements.push(Element {
                        tag: open.tag,
                        text: normalize(&pending),
                    });
                    pending.clear();
                }
            }
            Event::Empty(_) => {
                saw_root = true;
                // `<break/>` and friends separate words.
                pending.push(' ');
            }
            Event::Text(e) => {
                if stack.is_empty() {
                    continue;
                }
                let text = match e.unescape() {
                    Ok(text) => text,
                    // Undeclared entities (`&nbsp;` without a DTD) keep their raw form.
                    Err(_) => Cow::Owned(String::from_utf8_lossy(&e).into_owned()),
                };
                pending.push_str(&text);
            }
            Event::CData(e) => {
                if !stack.is_empty() {
                    pending.push_str(&String::from_utf8_lossy(&e));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(PartitionError::Malformed {
            position: reader.buffer_position() as u64,
            message: format!("unexpected end of document, <{}> is not closed", open.tag),
        });
    }
    if !saw_root {
        return Err(PartitionError::Empty);
    }

    Ok(elements)
}

fn is_inline(tag: &str) -> bool {
    INLINE_TAGS.contains(&tag)
}

fn innermost_block(stack: &[Open]) -> Option<&str> {
    stack
        .iter()
        .rev()
        .find(|open| !open.inline)
        .map(|open| open.tag.as_str())
}

fn flush_fragment(elements: &mut Vec<Element>, tag: &str, pending: &mut String) {
    if let Some(text) = normalize(pending) {
        elements.push(Element {
            tag: tag.to_string(),
            text: Some(text),
        });
    }
    pending.clear();
}

fn normalize(raw: &str) -> Option<String> {
    let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Join the non-empty element texts with newlines, in order.
pub fn elements_to_text(elements: &[Element]) -> String {
    elements
        .iter()
        .filter_map(|e| e.text.as_deref())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// The article title: first `article-title`, else first `title`.
pub fn find_title(elements: &[Element]) -> Option<String> {
    let first_text = |tag: &str| {
        elements
            .iter()
            .find(|e| e.tag == tag && e.text.is_some())
            .and_then(|e| e.text.clone())
    };
    first_text("article-title").or_else(|| first_text("title"))
}
