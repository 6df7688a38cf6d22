//! Inline runs to and from the remote rich-text segment list.
//!
//! The remote stores rich text as an array of segments, each with a single
//! annotation bundle. Encoding cuts at every annotation change, joins
//! neighbours that render identically, and splits long text at the
//! per-segment ceiling. Links and equations are always their own segments.

use crate::block::{Annotations, Color, InlineRun};
use miette::Diagnostic;
use serde_json::{Map, Value, json};
use thiserror::Error;

/// Characters per text segment.
pub const MAX_SEGMENT_CHARS: usize = 2000;
/// Segments per rich-text array.
pub const MAX_SEGMENTS: usize = 100;
pub const MAX_EQUATION_CHARS: usize = 1000;
pub const MAX_URL_CHARS: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum EncodingError {
    #[error("rich text segment {text:?} is empty after trimming")]
    #[diagnostic(
        code(encoding::blank_segment),
        help("links need visible text, and a block cannot consist of whitespace only")
    )]
    BlankSegment { text: String },

    #[error("inline equation has an empty expression")]
    #[diagnostic(code(encoding::blank_equation))]
    BlankEquation,

    #[error("equation is {len} characters, the remote allows {max}")]
    #[diagnostic(code(encoding::equation_too_long))]
    EquationTooLong { len: usize, max: usize },

    #[error("link target is {len} characters, the remote allows {max}")]
    #[diagnostic(code(encoding::url_too_long))]
    UrlTooLong { len: usize, max: usize },

    #[error("rich text needs {count} segments, the remote allows {max}")]
    #[diagnostic(
        code(encoding::too_many_segments),
        help("split the paragraph or reduce formatting changes")
    )]
    TooManySegments { count: usize, max: usize },

    #[error("{kind} blocks cannot have children")]
    #[diagnostic(code(encoding::children_not_allowed))]
    ChildrenNotAllowed { kind: &'static str },

    #[error("heading level {level} is not supported, expected 1 to 3")]
    #[diagnostic(code(encoding::heading_level))]
    InvalidHeadingLevel { level: u8 },

    #[error("table has no cells")]
    #[diagnostic(code(encoding::empty_table))]
    EmptyTable,

    #[error("media {path} has not been uploaded")]
    #[diagnostic(code(encoding::unresolved_media))]
    UnresolvedMedia { path: String },

    #[error("file hosted by the remote cannot be re-attached: {url}")]
    #[diagnostic(code(encoding::hosted_media))]
    HostedMedia { url: String },
}

/// One remote segment, borrowed from the canonical runs it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    Text {
        content: &'a str,
        annotations: Annotations,
        link: Option<&'a str>,
    },
    Equation {
        expression: &'a str,
    },
}

/// The form the remote will store for `runs`.
///
/// Empty text runs disappear, colors collapse to the single remote color,
/// whitespace-only spacer text is folded into a neighbouring text run whose
/// rendering it cannot change (kept as plain text otherwise), and
/// adjacent runs with the same annotations and link are joined. Equations
/// never join. The result is what fingerprints are computed over, so it is
/// also what decoding a published block yields.
pub fn canonical_runs(runs: &[InlineRun]) -> Vec<InlineRun> {
    let mut out: Vec<InlineRun> = Vec::with_capacity(runs.len());
    let mut pending = String::new();

    for run in runs {
        match run {
            InlineRun::Text {
                text, link: None, ..
            } if text.is_empty() => {}
            InlineRun::Text {
                text,
                link: None,
                ..
            } if text.trim().is_empty() => match out.last_mut() {
                Some(InlineRun::Text {
                    text: last,
                    annotations,
                    link,
                }) if absorbs_spacer(annotations, link) => last.push_str(text),
                _ => pending.push_str(text),
            },
            InlineRun::Text {
                text,
                annotations,
                link,
            } => {
                let annotations = annotations.canonical();
                if !pending.is_empty() && !absorbs_spacer(&annotations, link) {
                    push_spacer(&mut out, std::mem::take(&mut pending));
                }
                let text = if pending.is_empty() {
                    text.clone()
                } else {
                    let mut joined = std::mem::take(&mut pending);
                    joined.push_str(text);
                    joined
                };
                match out.last_mut() {
                    Some(InlineRun::Text {
                        text: last,
                        annotations: last_annotations,
                        link: last_link,
                    }) if *last_annotations == annotations && *last_link == *link => {
                        last.push_str(&text)
                    }
                    _ => out.push(InlineRun::Text {
                        text,
                        annotations,
                        link: link.clone(),
                    }),
                }
            }
            InlineRun::Equation { expression } => {
                if !pending.is_empty() {
                    push_spacer(&mut out, std::mem::take(&mut pending));
                }
                out.push(InlineRun::equation(expression.clone()));
            }
        }
    }

    if !pending.is_empty() {
        push_spacer(&mut out, pending);
    }
    out
}

/// Whether trailing or leading whitespace can join a run without changing
/// how it renders. Links, code, underline, strikethrough and backgrounds
/// all show on spaces.
fn absorbs_spacer(annotations: &Annotations, link: &Option<String>) -> bool {
    link.is_none()
        && !annotations.code
        && !annotations.underline
        && !annotations.strikethrough
        && annotations.background == Color::Default
}

fn push_spacer(out: &mut Vec<InlineRun>, spacer: String) {
    match out.last_mut() {
        Some(InlineRun::Text {
            text,
            annotations,
            link: None,
        }) if annotations.is_plain() => text.push_str(&spacer),
        _ => out.push(InlineRun::plain(spacer)),
    }
}

/// Cut canonical runs into remote segments, validating limits.
pub fn segments(canonical: &[InlineRun]) -> Result<Vec<Segment<'_>>, EncodingError> {
    let all_blank = canonical.iter().all(
        |run| matches!(run, InlineRun::Text { text, .. } if text.trim().is_empty()),
    );
    let mut out = Vec::new();

    for run in canonical {
        match run {
            InlineRun::Text {
                text,
                annotations,
                link,
            } => {
                if text.trim().is_empty() && (link.is_some() || all_blank) {
                    return Err(EncodingError::BlankSegment { text: text.clone() });
                }
                if let Some(url) = link {
                    let len = url.chars().count();
                    if len > MAX_URL_CHARS {
                        return Err(EncodingError::UrlTooLong {
                            len,
                            max: MAX_URL_CHARS,
                        });
                    }
                }
                for chunk in split_chars(text, MAX_SEGMENT_CHARS) {
                    out.push(Segment::Text {
                        content: chunk,
                        annotations: *annotations,
                        link: link.as_deref(),
                    });
                }
            }
            InlineRun::Equation { expression } => {
                if expression.trim().is_empty() {
                    return Err(EncodingError::BlankEquation);
                }
                let len = expression.chars().count();
                if len > MAX_EQUATION_CHARS {
                    return Err(EncodingError::EquationTooLong {
                        len,
                        max: MAX_EQUATION_CHARS,
                    });
                }
                out.push(Segment::Equation { expression });
            }
        }
    }

    if out.len() > MAX_SEGMENTS {
        return Err(EncodingError::TooManySegments {
            count: out.len(),
            max: MAX_SEGMENTS,
        });
    }
    Ok(out)
}

/// Encode inline runs as a remote rich-text array.
pub fn encode_rich_text(runs: &[InlineRun]) -> Result<Value, EncodingError> {
    let canonical = canonical_runs(runs);
    let segments = segments(&canonical)?;
    Ok(Value::Array(segments.iter().map(segment_json).collect()))
}

fn segment_json(segment: &Segment<'_>) -> Value {
    match segment {
        Segment::Text {
            content,
            annotations,
            link,
        } => {
            let mut text = Map::new();
            text.insert("content".into(), json!(content));
            if let Some(url) = link {
                text.insert("link".into(), json!({ "url": url }));
            }
            json!({
                "type": "text",
                "text": text,
                "annotations": annotations_json(annotations),
            })
        }
        Segment::Equation { expression } => json!({
            "type": "equation",
            "equation": { "expression": expression },
            "annotations": annotations_json(&Annotations::default()),
        }),
    }
}

fn annotations_json(annotations: &Annotations) -> Value {
    json!({
        "bold": annotations.bold,
        "italic": annotations.italic,
        "strikethrough": annotations.strikethrough,
        "underline": annotations.underline,
        "code": annotations.code,
        "color": annotations.remote_color(),
    })
}

/// Read a remote rich-text array back into inline runs.
///
/// Mentions and other segment types come back as plain text carrying their
/// rendered form.
pub fn decode_rich_text(value: &Value) -> Vec<InlineRun> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items.iter().map(decode_segment).collect()
}

fn decode_segment(segment: &Value) -> InlineRun {
    let annotations = decode_annotations(&segment["annotations"]);
    match segment["type"].as_str() {
        Some("equation") => InlineRun::equation(
            segment["equation"]["expression"]
                .as_str()
                .unwrap_or_default(),
        ),
        Some("text") => InlineRun::Text {
            text: segment["text"]["content"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            annotations,
            link: segment["text"]["link"]["url"].as_str().map(str::to_string),
        },
        _ => InlineRun::Text {
            text: segment["plain_text"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            annotations,
            link: segment["href"].as_str().map(str::to_string),
        },
    }
}

fn decode_annotations(value: &Value) -> Annotations {
    let flag = |name: &str| value[name].as_bool().unwrap_or(false);
    Annotations {
        bold: flag("bold"),
        italic: flag("italic"),
        strikethrough: flag("strikethrough"),
        underline: flag("underline"),
        code: flag("code"),
        ..Annotations::default()
    }
    .with_remote_color(value["color"].as_str().unwrap_or("default"))
}

/// Split on char boundaries into pieces of at most `max` chars.
fn split_chars(text: &str, max: usize) -> impl Iterator<Item = &str> {
    let mut rest = text;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let cut = rest
            .char_indices()
            .nth(max)
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len());
        let (head, tail) = rest.split_at(cut);
        rest = tail;
        Some(head)
    })
}
