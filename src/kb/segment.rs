//! Two-stage document segmenter
//! Slices parsed markdown along structural elements (headings, lists, tables),
//! then applies a sentence-window pass so every node keeps local context.
//! Nodes come out in reading order with page numbers, section paths, and
//! character offsets into the page text.

use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};
use serde::{Deserialize, Serialize};

/// Segmenter version recorded on documents for replay
pub const SEGMENT_VERSION: &str = "seg.v1";

/// Segmentation parameters. `window` is the sentence-window size; prose blocks
/// are emitted as windows of `window` consecutive sentences.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    pub window: usize,
    pub min_chars: usize,
    pub max_block_chars: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            window: 2,
            min_chars: 24,
            max_block_chars: 2000,
        }
    }
}

/// One evidence node produced by segmentation, before persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentedNode {
    pub text: String,
    /// 1-based page number
    pub page: i64,
    pub section_path: Option<String>,
    pub article_id: Option<String>,
    /// Byte offsets into the page's markdown text
    pub start_offset: i64,
    pub end_offset: i64,
}

/// Segmenter output: document title (first H1 seen) plus ordered nodes
#[derive(Debug, Clone)]
pub struct SegmentOutput {
    pub title: Option<String>,
    pub nodes: Vec<SegmentedNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Heading(u8),
    Prose,
    /// Tables and code blocks stay whole
    Verbatim,
}

#[derive(Debug)]
struct Block {
    kind: BlockKind,
    start: usize,
    end: usize,
}

/// Segment parsed pages into ordered nodes.
///
/// Stage 1 walks the markdown structure of each page; stage 2 windows prose
/// blocks into sentence groups. Nodes shorter than `min_chars` are merged
/// into a neighbor, or dropped when nothing on the page can absorb them.
pub fn segment_pages(pages: &[String], config: &SegmentConfig) -> SegmentOutput {
    let mut title: Option<String> = None;
    let mut nodes: Vec<SegmentedNode> = Vec::new();
    // Heading stack survives page boundaries: a section can span pages
    let mut heading_path: Vec<String> = Vec::new();
    let mut article_id: Option<String> = None;

    for (page_idx, page_text) in pages.iter().enumerate() {
        let page = page_idx as i64 + 1;
        let mut page_nodes: Vec<SegmentedNode> = Vec::new();

        for block in structural_blocks(page_text) {
            let source = page_text[block.start..block.end].trim_end();
            if source.trim().is_empty() {
                continue;
            }

            match block.kind {
                BlockKind::Heading(level) => {
                    let heading = heading_text(source);
                    if title.is_none() && level == 1 {
                        title = Some(heading.clone());
                    }
                    let level = level as usize;
                    if level > 0 && level <= heading_path.len() {
                        heading_path.truncate(level - 1);
                    }
                    if let Some(id) = parse_article_id(&heading) {
                        article_id = Some(id);
                    } else if level <= 2 {
                        // A new top section ends the current article scope
                        article_id = None;
                    }
                    heading_path.push(heading);
                }
                BlockKind::Verbatim => {
                    page_nodes.push(SegmentedNode {
                        text: source.to_string(),
                        page,
                        section_path: join_path(&heading_path),
                        article_id: article_id.clone(),
                        start_offset: block.start as i64,
                        end_offset: (block.start + source.len()) as i64,
                    });
                }
                BlockKind::Prose => {
                    for (win_start, win_end) in
                        sentence_windows(source, config.window, config.max_block_chars)
                    {
                        let abs_start = block.start + win_start;
                        let abs_end = block.start + win_end;
                        let text = page_text[abs_start..abs_end].trim().to_string();
                        if text.is_empty() {
                            continue;
                        }
                        page_nodes.push(SegmentedNode {
                            text,
                            page,
                            section_path: join_path(&heading_path),
                            article_id: article_id.clone(),
                            start_offset: abs_start as i64,
                            end_offset: abs_end as i64,
                        });
                    }
                }
            }
        }

        merge_short_nodes(&mut page_nodes, config.min_chars);
        nodes.extend(page_nodes);
    }

    SegmentOutput { title, nodes }
}

/// Stage 1: top-level markdown blocks with byte ranges into the source
fn structural_blocks(source: &str) -> Vec<Block> {
    let parser = Parser::new_ext(source, Options::ENABLE_TABLES);
    let mut blocks = Vec::new();
    let mut depth = 0usize;

    for (event, range) in parser.into_offset_iter() {
        match event {
            Event::Start(tag) => {
                if depth == 0 {
                    let kind = match tag {
                        Tag::Heading { level, .. } => Some(BlockKind::Heading(level as u8)),
                        Tag::Paragraph | Tag::List(_) | Tag::BlockQuote(_) => {
                            Some(BlockKind::Prose)
                        }
                        Tag::Table(_) | Tag::CodeBlock(_) => Some(BlockKind::Verbatim),
                        _ => None,
                    };
                    if let Some(kind) = kind {
                        blocks.push(Block {
                            kind,
                            start: range.start,
                            end: range.end,
                        });
                    }
                }
                depth += 1;
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
            }
            _ => {}
        }
    }

    blocks
}

/// Extract plain heading text from its markdown source
fn heading_text(source: &str) -> String {
    source
        .trim()
        .trim_start_matches('#')
        .trim()
        .trim_end_matches('#')
        .trim()
        .to_string()
}

/// Parse an article identifier out of a heading like "Article 12",
/// "Article (12)", or "Article 12 bis".
pub fn parse_article_id(heading: &str) -> Option<String> {
    let lower = heading.trim().to_lowercase();
    let rest = lower.strip_prefix("article")?;
    let rest = rest.trim_start_matches(|c: char| c == ' ' || c == '(' || c == ':');
    let id: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
        .collect();
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

fn join_path(path: &[String]) -> Option<String> {
    if path.is_empty() {
        None
    } else {
        Some(path.join(" > "))
    }
}

/// Stage 2: split a prose block into windows of `window` sentences.
/// Returns byte ranges relative to the block. Blocks within one window's worth
/// of sentences come out whole; a window never exceeds `max_chars` (overlong
/// windows are cut at sentence boundaries).
fn sentence_windows(block: &str, window: usize, max_chars: usize) -> Vec<(usize, usize)> {
    let window = window.max(1);
    let sentences = split_sentences(block);
    if sentences.is_empty() {
        return vec![];
    }
    if sentences.len() <= window && block.len() <= max_chars {
        let start = sentences[0].0;
        let end = sentences[sentences.len() - 1].1;
        return vec![(start, end)];
    }

    let mut windows = Vec::new();
    let mut i = 0;
    while i < sentences.len() {
        let start = sentences[i].0;
        let mut end = sentences[i].1;
        let mut taken = 1;
        while taken < window && i + taken < sentences.len() {
            let next_end = sentences[i + taken].1;
            if next_end - start > max_chars {
                break;
            }
            end = next_end;
            taken += 1;
        }
        windows.push((start, end));
        i += taken;
    }
    windows
}

/// Sentence boundaries as byte ranges. Terminators are `.`, `!`, `?`, `؟`
/// followed by whitespace or end of text; newlines inside list blocks also
/// terminate so list items stay separable.
fn split_sentences(text: &str) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let bytes = text.as_bytes();
    let mut start = 0usize;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        let is_terminator = matches!(c, '.' | '!' | '?' | '؟');
        let is_break = c == '\n';
        if !is_terminator && !is_break {
            continue;
        }
        if is_terminator {
            // Only break if followed by whitespace or end of text
            match chars.peek() {
                Some((_, next)) if !next.is_whitespace() => continue,
                _ => {}
            }
        }
        let end = idx + c.len_utf8();
        if text[start..end].trim().is_empty() {
            start = end;
            continue;
        }
        out.push(trim_range(text, start, end));
        start = end;
    }

    if start < bytes.len() && !text[start..].trim().is_empty() {
        out.push(trim_range(text, start, bytes.len()));
    }

    out
}

/// Shrink a range to exclude leading/trailing whitespace
fn trim_range(text: &str, start: usize, end: usize) -> (usize, usize) {
    let slice = &text[start..end];
    let trimmed_start = start + (slice.len() - slice.trim_start().len());
    let trimmed_end = end - (slice.len() - slice.trim_end().len());
    (trimmed_start, trimmed_end)
}

/// Merge nodes shorter than `min_chars` into a neighbor; drop stragglers that
/// have no neighbor to absorb them.
fn merge_short_nodes(nodes: &mut Vec<SegmentedNode>, min_chars: usize) {
    if min_chars == 0 {
        return;
    }
    let mut merged: Vec<SegmentedNode> = Vec::with_capacity(nodes.len());
    for node in nodes.drain(..) {
        if node.text.len() >= min_chars {
            merged.push(node);
            continue;
        }
        match merged.last_mut() {
            Some(prev) if prev.page == node.page => {
                prev.text.push(' ');
                prev.text.push_str(&node.text);
                prev.end_offset = node.end_offset;
            }
            _ => {
                // Keep it for now: the next long node may absorb it below
                merged.push(node);
            }
        }
    }

    // Forward pass: leading short node absorbs into the following node
    let mut i = 0;
    while i < merged.len() {
        if merged[i].text.len() < min_chars && i + 1 < merged.len() {
            let short = merged.remove(i);
            let next = &mut merged[i];
            next.text = format!("{} {}", short.text, next.text);
            next.start_offset = short.start_offset;
        } else {
            i += 1;
        }
    }

    merged.retain(|n| n.text.len() >= min_chars);
    *nodes = merged;
}
