//! Block model to and from remote block JSON.
//!
//! One encode arm per [`BlockKind`] variant, selected by an exhaustive match,
//! and the matching decoder for blocks read back from the remote.

use crate::block::{
    Block, BlockKind, Color, InlineRun, MediaKind, MediaReference, TableRow, path_key,
};
use crate::fingerprint::canonical_table;
use crate::richtext::{EncodingError, decode_rich_text, encode_rich_text};
use miette::Diagnostic;
use pagesync_common::UploadId;
use serde_json::{Map, Value, json};
use thiserror::Error;

/// A block that can never be sent, located by its structural path.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
#[error("block {path} cannot be encoded: {source}")]
#[diagnostic(code(encoding::invalid_block))]
pub struct InvalidBlock {
    pub path: String,
    #[source]
    #[diagnostic_source]
    pub source: EncodingError,
}

/// Remote type name for a kind.
pub fn block_type(kind: &BlockKind) -> &'static str {
    match kind {
        BlockKind::Paragraph => "paragraph",
        BlockKind::Heading { level: 1 } => "heading_1",
        BlockKind::Heading { level: 2 } => "heading_2",
        BlockKind::Heading { .. } => "heading_3",
        BlockKind::BulletedItem => "bulleted_list_item",
        BlockKind::NumberedItem => "numbered_list_item",
        BlockKind::ToDo { .. } => "to_do",
        BlockKind::Quote => "quote",
        BlockKind::Callout { .. } => "callout",
        BlockKind::Toggle => "toggle",
        BlockKind::Code { .. } => "code",
        BlockKind::Table { .. } => "table",
        BlockKind::Media { media, .. } => media.as_str(),
        BlockKind::Equation { .. } => "equation",
        BlockKind::Divider => "divider",
        BlockKind::Embed { .. } => "embed",
        BlockKind::TableOfContents => "table_of_contents",
    }
}

/// Check every block in the forest without needing media to be uploaded.
pub fn validate(blocks: &[Block]) -> Result<(), InvalidBlock> {
    fn visit(block: &Block, path: &mut Vec<usize>) -> Result<(), InvalidBlock> {
        payload(block, false).map_err(|source| InvalidBlock {
            path: path_key(path),
            source,
        })?;
        for (idx, child) in block.children.iter().enumerate() {
            path.push(idx);
            visit(child, path)?;
            path.pop();
        }
        Ok(())
    }

    let mut path = Vec::new();
    for (idx, block) in blocks.iter().enumerate() {
        path.push(idx);
        visit(block, &mut path)?;
        path.pop();
    }
    Ok(())
}

/// Full block object for an append request.
///
/// `children` are already-encoded nested blocks to embed, if any. Tables
/// always embed their rows.
pub fn encode_block(block: &Block, children: Option<Vec<Value>>) -> Result<Value, EncodingError> {
    let ty = block_type(&block.kind);
    let mut body = payload(block, true)?;
    if let Some(children) = children.filter(|c| !c.is_empty()) {
        body.insert("children".into(), Value::Array(children));
    }
    Ok(json!({
        "object": "block",
        "type": ty,
        ty: body,
    }))
}

/// Body for an in-place update of `block`'s own content.
pub fn update_body(block: &Block) -> Result<Value, EncodingError> {
    let ty = block_type(&block.kind);
    let mut body = payload(block, true)?;
    // table rows are never part of an update
    body.remove("children");
    Ok(json!({ ty: body }))
}

fn payload(block: &Block, strict_media: bool) -> Result<Map<String, Value>, EncodingError> {
    let nested = !block.children.is_empty();
    if nested && !block.kind.accepts_children() {
        return Err(EncodingError::ChildrenNotAllowed {
            kind: block_type(&block.kind),
        });
    }

    let mut body = Map::new();
    match &block.kind {
        BlockKind::Paragraph
        | BlockKind::BulletedItem
        | BlockKind::NumberedItem
        | BlockKind::Quote
        | BlockKind::Toggle => {
            body.insert("rich_text".into(), encode_rich_text(&block.runs)?);
        }
        BlockKind::Heading { level } => {
            if !(1..=3).contains(level) {
                return Err(EncodingError::InvalidHeadingLevel { level: *level });
            }
            body.insert("rich_text".into(), encode_rich_text(&block.runs)?);
            body.insert("is_toggleable".into(), json!(nested));
        }
        BlockKind::ToDo { checked } => {
            body.insert("rich_text".into(), encode_rich_text(&block.runs)?);
            body.insert("checked".into(), json!(checked));
        }
        BlockKind::Callout { icon, color } => {
            body.insert("rich_text".into(), encode_rich_text(&block.runs)?);
            if let Some(emoji) = icon {
                body.insert("icon".into(), json!({ "type": "emoji", "emoji": emoji }));
            }
            body.insert("color".into(), json!(color.as_str()));
        }
        BlockKind::Code { language, caption } => {
            body.insert("rich_text".into(), encode_rich_text(&block.runs)?);
            body.insert(
                "language".into(),
                json!(crate::block::canonical_language(language)),
            );
            body.insert("caption".into(), encode_rich_text(caption)?);
        }
        BlockKind::Table {
            rows,
            header_rows,
            stub_columns,
        } => {
            let (width, rows) = canonical_table(rows);
            if width == 0 || rows.is_empty() {
                return Err(EncodingError::EmptyTable);
            }
            let rows = rows
                .iter()
                .map(|cells| {
                    let cells = cells
                        .iter()
                        .map(|cell| encode_rich_text(cell))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(json!({
                        "object": "block",
                        "type": "table_row",
                        "table_row": { "cells": cells },
                    }))
                })
                .collect::<Result<Vec<_>, EncodingError>>()?;
            body.insert("table_width".into(), json!(width));
            body.insert("has_column_header".into(), json!(*header_rows > 0));
            body.insert("has_row_header".into(), json!(*stub_columns > 0));
            body.insert("children".into(), Value::Array(rows));
        }
        BlockKind::Media { source, .. } => {
            match source {
                MediaReference::External { url } => {
                    body.insert("type".into(), json!("external"));
                    body.insert("external".into(), json!({ "url": url }));
                }
                MediaReference::Uploaded { upload_id, .. } => {
                    body.insert("type".into(), json!("file_upload"));
                    body.insert("file_upload".into(), json!({ "id": upload_id }));
                }
                MediaReference::Local { path, .. } => {
                    if strict_media {
                        return Err(EncodingError::UnresolvedMedia {
                            path: path.display().to_string(),
                        });
                    }
                }
                MediaReference::Hosted { url } => {
                    return Err(EncodingError::HostedMedia { url: url.clone() });
                }
            }
            body.insert("caption".into(), encode_rich_text(&block.runs)?);
        }
        BlockKind::Equation { latex } => {
            if latex.trim().is_empty() {
                return Err(EncodingError::BlankEquation);
            }
            body.insert("expression".into(), json!(latex));
        }
        BlockKind::Divider => {}
        BlockKind::Embed { url } => {
            body.insert("url".into(), json!(url));
        }
        BlockKind::TableOfContents => {
            body.insert("color".into(), json!(Color::Default.as_str()));
        }
    }
    Ok(body)
}

/// A remote block's content in model terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBlock {
    pub kind: BlockKind,
    pub runs: Vec<InlineRun>,
    /// Whether the payload says the block holds nested blocks.
    pub nested: bool,
}

/// Decode the type-specific payload of a remote block.
///
/// Returns `None` for types the model does not represent. Table rows arrive
/// as separate child blocks; decode them with [`decode_table_row`] and store
/// them in the returned table kind.
pub fn decode_payload(block_type: &str, payload: &Value) -> Option<DecodedBlock> {
    let rich_text = || decode_rich_text(&payload["rich_text"]);
    let plain = |kind| DecodedBlock {
        kind,
        runs: rich_text(),
        nested: false,
    };

    let decoded = match block_type {
        "paragraph" => plain(BlockKind::Paragraph),
        "bulleted_list_item" => plain(BlockKind::BulletedItem),
        "numbered_list_item" => plain(BlockKind::NumberedItem),
        "quote" => plain(BlockKind::Quote),
        "toggle" => plain(BlockKind::Toggle),
        "heading_1" | "heading_2" | "heading_3" => DecodedBlock {
            kind: BlockKind::Heading {
                level: block_type[8..].parse().ok()?,
            },
            runs: rich_text(),
            nested: payload["is_toggleable"].as_bool().unwrap_or(false),
        },
        "to_do" => plain(BlockKind::ToDo {
            checked: payload["checked"].as_bool().unwrap_or(false),
        }),
        "callout" => plain(BlockKind::Callout {
            icon: payload["icon"]["emoji"].as_str().map(str::to_string),
            color: Color::parse(payload["color"].as_str().unwrap_or("default"))
                .unwrap_or_default(),
        }),
        "code" => plain(BlockKind::Code {
            language: payload["language"]
                .as_str()
                .unwrap_or("plain text")
                .to_string(),
            caption: decode_rich_text(&payload["caption"]),
        }),
        "table" => DecodedBlock {
            kind: BlockKind::Table {
                rows: Vec::new(),
                header_rows: payload["has_column_header"].as_bool().unwrap_or(false) as u32,
                stub_columns: payload["has_row_header"].as_bool().unwrap_or(false) as u32,
            },
            runs: Vec::new(),
            nested: false,
        },
        "equation" => DecodedBlock {
            kind: BlockKind::Equation {
                latex: payload["expression"].as_str().unwrap_or_default().to_string(),
            },
            runs: Vec::new(),
            nested: false,
        },
        "divider" => DecodedBlock {
            kind: BlockKind::Divider,
            runs: Vec::new(),
            nested: false,
        },
        "embed" => DecodedBlock {
            kind: BlockKind::Embed {
                url: payload["url"].as_str().unwrap_or_default().to_string(),
            },
            runs: Vec::new(),
            nested: false,
        },
        "table_of_contents" => DecodedBlock {
            kind: BlockKind::TableOfContents,
            runs: Vec::new(),
            nested: false,
        },
        other => {
            let media = MediaKind::from_block_type(other)?;
            DecodedBlock {
                kind: BlockKind::Media {
                    media,
                    source: decode_media_source(payload)?,
                },
                runs: decode_rich_text(&payload["caption"]),
                nested: false,
            }
        }
    };
    Some(decoded)
}

fn decode_media_source(payload: &Value) -> Option<MediaReference> {
    match payload["type"].as_str()? {
        "external" => Some(MediaReference::External {
            url: payload["external"]["url"].as_str()?.to_string(),
        }),
        "file" => Some(MediaReference::Hosted {
            url: payload["file"]["url"].as_str()?.to_string(),
        }),
        "file_upload" => Some(MediaReference::Uploaded {
            upload_id: UploadId::new(payload["file_upload"]["id"].as_str()?),
            digest: None,
        }),
        _ => None,
    }
}

/// Decode a `table_row` payload.
pub fn decode_table_row(payload: &Value) -> TableRow {
    let cells = payload["cells"]
        .as_array()
        .map(|cells| cells.iter().map(decode_rich_text).collect())
        .unwrap_or_default();
    TableRow { cells }
}
