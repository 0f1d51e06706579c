//! Block extraction: decomposes a representation into ordered blocks.
//!
//! Extraction is a pure function of the representation: the same id and
//! content always produce byte-identical blocks, block ids, content hashes,
//! and fingerprint.
//!
//! Markdown is decomposed by top-level block structure. Every top-level
//! element is one block, except lists, whose items each become a
//! `list_item` block. Headings maintain the section path carried by the
//! blocks that follow them. Pre-segmented content maps one segment to one
//! block.

use std::collections::BTreeMap;
use std::ops::Range;

use chrono::Utc;
use pulldown_cmark::{Event, Options, Parser as MarkdownParser, Tag, TagEnd};
use tracing::debug;
use uuid::Uuid;

use docket_core::hashing::{block_content_hash, block_set_fingerprint, representation_hash};
use docket_core::{
    block_id, new_v7, Block, BlockLocator, ConversionRepresentation, Error, ParsedRepresentation,
    RepresentationContent, Result, Segment,
};
use docket_core::logging::SUBSYSTEM_PIPELINE;

/// A representation ready to be persisted, with its blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub representation: ConversionRepresentation,
    pub blocks: Vec<Block>,
    pub fingerprint: String,
}

/// Derives ordered blocks from conversion representations.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockExtractor;

impl BlockExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Ordered blocks of `representation`.
    ///
    /// Fails with `MalformedRepresentation` when the content yields no
    /// blocks, a segment has no type, or a span falls outside the text.
    pub fn extract(&self, representation: &ConversionRepresentation) -> Result<Vec<Block>> {
        let drafts = match &representation.content {
            RepresentationContent::Markdown { text } => decompose_markdown(text)?,
            RepresentationContent::Segments { segments } => decompose_segments(segments)?,
        };
        if drafts.is_empty() {
            return Err(Error::MalformedRepresentation(
                "representation contains no blocks".to_string(),
            ));
        }

        Ok(drafts
            .into_iter()
            .enumerate()
            .map(|(idx, draft)| draft.into_block(representation.id, idx as i32))
            .collect())
    }

    /// Wrap parser output in a new representation of `document_id` and
    /// extract its blocks, filling in the representation statistics.
    pub fn build(&self, document_id: Uuid, parsed: ParsedRepresentation) -> Result<Extraction> {
        if parsed.parsing_tool.trim().is_empty() {
            return Err(Error::MalformedRepresentation(
                "parser did not name its tool".to_string(),
            ));
        }

        let mut representation = ConversionRepresentation {
            id: new_v7(),
            document_id,
            schema_version: parsed.schema_version,
            content_hash: representation_hash(&parsed.parsing_tool, &parsed.content),
            parsing_tool: parsed.parsing_tool,
            content: parsed.content,
            block_count: 0,
            block_type_freq: BTreeMap::new(),
            total_characters: 0,
            superseded_at: None,
            parsed_at: Utc::now(),
        };

        let blocks = self.extract(&representation)?;

        let mut freq: BTreeMap<String, i32> = BTreeMap::new();
        for block in &blocks {
            *freq.entry(block.block_type.clone()).or_default() += 1;
        }
        representation.block_count = blocks.len() as i32;
        representation.block_type_freq = freq;
        representation.total_characters = blocks.iter().map(|b| b.content.chars().count() as i64).sum();

        let fingerprint = block_set_fingerprint(&blocks);
        debug!(
            subsystem = SUBSYSTEM_PIPELINE,
            component = "extractor",
            document_id = %document_id,
            representation_id = %representation.id,
            block_count = blocks.len(),
            "Blocks extracted"
        );

        Ok(Extraction {
            representation,
            blocks,
            fingerprint,
        })
    }
}

struct BlockDraft {
    block_type: String,
    section_path: Vec<String>,
    locator: Option<BlockLocator>,
    content: String,
}

impl BlockDraft {
    fn into_block(self, representation_id: Uuid, order_index: i32) -> Block {
        Block {
            id: block_id(representation_id, order_index),
            representation_id,
            order_index,
            content_hash: block_content_hash(&self.block_type, &self.content),
            block_type: self.block_type,
            section_path: self.section_path,
            locator: self.locator,
            content: self.content,
        }
    }
}

fn markdown_options() -> Options {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);
    options.insert(Options::ENABLE_FOOTNOTES);
    options
}

fn block_type(tag: &Tag<'_>) -> &'static str {
    match tag {
        Tag::Paragraph => "paragraph",
        Tag::Heading { .. } => "heading",
        Tag::BlockQuote(_) => "blockquote",
        Tag::CodeBlock(_) => "code",
        Tag::HtmlBlock => "html",
        Tag::Table(_) => "table",
        Tag::FootnoteDefinition(_) => "footnote",
        Tag::Item => "list_item",
        _ => "other",
    }
}

fn section_path(trail: &[(usize, String)]) -> Vec<String> {
    trail.iter().map(|(_, title)| title.clone()).collect()
}

/// Slice `range` out of `text`, trimming trailing whitespace from the span.
fn slice_draft(
    text: &str,
    range: Range<usize>,
    block_type: &str,
    trail: &[(usize, String)],
) -> Result<BlockDraft> {
    let raw = text.get(range.clone()).ok_or_else(|| {
        Error::MalformedRepresentation(format!(
            "block span {}..{} outside text of length {}",
            range.start,
            range.end,
            text.len()
        ))
    })?;
    let content = raw.trim_end();
    Ok(BlockDraft {
        block_type: block_type.to_string(),
        section_path: section_path(trail),
        locator: Some(BlockLocator {
            start_offset: range.start as i64,
            end_offset: (range.start + content.len()) as i64,
        }),
        content: content.to_string(),
    })
}

fn decompose_markdown(text: &str) -> Result<Vec<BlockDraft>> {
    let mut drafts = Vec::new();
    let mut depth = 0usize;
    let mut in_list = false;
    let mut trail: Vec<(usize, String)> = Vec::new();
    // (level, draft index, accumulated title)
    let mut heading: Option<(usize, usize, String)> = None;

    for (event, range) in MarkdownParser::new_ext(text, markdown_options()).into_offset_iter() {
        match event {
            Event::Start(tag) => {
                if depth == 0 {
                    match &tag {
                        Tag::List(_) => in_list = true,
                        Tag::Heading { level, .. } => {
                            heading = Some((*level as usize, drafts.len(), String::new()));
                            drafts.push(slice_draft(text, range, "heading", &trail)?);
                        }
                        other => drafts.push(slice_draft(text, range, block_type(other), &trail)?),
                    }
                } else if depth == 1 && in_list && matches!(tag, Tag::Item) {
                    drafts.push(slice_draft(text, range, "list_item", &trail)?);
                }
                depth += 1;
            }
            Event::End(end) => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    match end {
                        TagEnd::List(_) => in_list = false,
                        TagEnd::Heading(_) => {
                            if let Some((level, idx, title)) = heading.take() {
                                trail.retain(|(l, _)| *l < level);
                                trail.push((level, title.trim().to_string()));
                                drafts[idx].section_path = section_path(&trail);
                            }
                        }
                        _ => {}
                    }
                }
            }
            Event::Text(t) | Event::Code(t) => {
                if let Some((_, _, title)) = heading.as_mut() {
                    title.push_str(&t);
                }
            }
            Event::Rule if depth == 0 => {
                drafts.push(slice_draft(text, range, "thematic_break", &trail)?);
            }
            _ => {}
        }
    }

    Ok(drafts)
}

fn decompose_segments(segments: &[Segment]) -> Result<Vec<BlockDraft>> {
    segments
        .iter()
        .enumerate()
        .map(|(idx, segment)| {
            let block_type = segment.block_type.trim();
            if block_type.is_empty() {
                return Err(Error::MalformedRepresentation(format!(
                    "segment {} has no block type",
                    idx
                )));
            }
            Ok(BlockDraft {
                block_type: block_type.to_string(),
                section_path: segment.section_path.clone(),
                locator: None,
                content: segment.text.clone(),
            })
        })
        .collect()
}
