//! Remote cursor geometry.
//!
//! Maps `{blockId, offset}` positions onto screen rectangles for blocks that
//! span several lines. Offsets count Unicode scalar values.
//!
//! ```text
//!   block "p1"  (max_width = 10 chars)
//!   ┌──────────┐
//!   │the quick │  line 0  [0, 10)   soft wrap after the space
//!   │brown fox │  line 1  [10, 19)
//!   │          │  line 2  [20, 20)  hard break ("\n") at 19
//!   └──────────┘
//! ```
//!
//! An offset sitting exactly on a soft wrap is drawn at the start of the
//! following line; on a hard break it stays at the end of its own line.

use serde::{Deserialize, Serialize};

use crate::presence::Collaborator;
use crate::protocol::{CursorPosition, SelectionRange, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    fn translated(self, dy: f32) -> Self {
        Self { y: self.y + dy, ..self }
    }
}

/// Fixed-advance text metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextMetrics {
    pub char_width: f32,
    pub line_height: f32,
    pub caret_width: f32,
}

impl Default for TextMetrics {
    fn default() -> Self {
        Self {
            char_width: 8.0,
            line_height: 20.0,
            caret_width: 2.0,
        }
    }
}

/// One visual line: chars `[start, end)` of the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineBox {
    pub start: usize,
    pub end: usize,
}

pub trait BlockLayout {
    fn caret_rect(&self, offset: u32) -> Rect;
    /// One rect per line the range touches. Empty for a collapsed range.
    fn selection_rects(&self, start: u32, end: u32) -> Vec<Rect>;
    fn height(&self) -> f32;
}

// ─── Wrapped text ─────────────────────────────────────────────────────────

/// Greedy word-wrapped layout of a text block.
#[derive(Debug, Clone)]
pub struct WrappedTextLayout {
    lines: Vec<LineBox>,
    len: usize,
    metrics: TextMetrics,
}

impl WrappedTextLayout {
    pub fn new(text: &str, max_width: f32, metrics: TextMetrics) -> Self {
        let chars: Vec<char> = text.chars().collect();
        let columns = if max_width.is_finite() && metrics.char_width > 0.0 {
            ((max_width / metrics.char_width).floor() as usize).max(1)
        } else {
            usize::MAX
        };

        let mut lines = Vec::new();
        let mut paragraph_start = 0;
        for (i, c) in chars.iter().enumerate() {
            if *c == '\n' {
                wrap_paragraph(&chars, paragraph_start, i, columns, &mut lines);
                paragraph_start = i + 1;
            }
        }
        wrap_paragraph(&chars, paragraph_start, chars.len(), columns, &mut lines);

        Self {
            lines,
            len: chars.len(),
            metrics,
        }
    }

    pub fn lines(&self) -> &[LineBox] {
        &self.lines
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Visual line holding `offset` (already clamped).
    fn line_of(&self, offset: usize) -> usize {
        for (index, line) in self.lines.iter().enumerate() {
            if offset < line.start {
                continue;
            }
            if offset < line.end {
                return index;
            }
            if offset == line.end {
                match self.lines.get(index + 1) {
                    // Soft wrap: the next line starts where this one ends
                    Some(next) if next.start == line.end => continue,
                    _ => return index,
                }
            }
        }
        self.lines.len().saturating_sub(1)
    }

    fn clamp(&self, offset: u32) -> usize {
        (offset as usize).min(self.len)
    }
}

fn wrap_paragraph(chars: &[char], start: usize, end: usize, columns: usize, lines: &mut Vec<LineBox>) {
    let mut line_start = start;
    while end - line_start > columns {
        let limit = line_start + columns;
        let brk = (line_start + 1..=limit)
            .rev()
            .find(|&i| chars[i - 1].is_whitespace())
            .unwrap_or(limit);
        lines.push(LineBox {
            start: line_start,
            end: brk,
        });
        line_start = brk;
    }
    lines.push(LineBox {
        start: line_start,
        end,
    });
}

impl BlockLayout for WrappedTextLayout {
    fn caret_rect(&self, offset: u32) -> Rect {
        let offset = self.clamp(offset);
        let index = self.line_of(offset);
        let column = self.lines.get(index).map_or(0, |l| offset - l.start);
        Rect::new(
            column as f32 * self.metrics.char_width,
            index as f32 * self.metrics.line_height,
            self.metrics.caret_width,
            self.metrics.line_height,
        )
    }

    fn selection_rects(&self, start: u32, end: u32) -> Vec<Rect> {
        let (start, end) = (self.clamp(start.min(end)), self.clamp(start.max(end)));
        if start == end {
            return Vec::new();
        }
        self.lines
            .iter()
            .enumerate()
            .filter_map(|(index, line)| {
                let from = start.max(line.start);
                let to = end.min(line.end);
                (to > from).then(|| {
                    Rect::new(
                        (from - line.start) as f32 * self.metrics.char_width,
                        index as f32 * self.metrics.line_height,
                        (to - from) as f32 * self.metrics.char_width,
                        self.metrics.line_height,
                    )
                })
            })
            .collect()
    }

    fn height(&self) -> f32 {
        self.lines.len() as f32 * self.metrics.line_height
    }
}

// ─── Document ─────────────────────────────────────────────────────────────

/// Remote cursor ready to paint.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorOverlay {
    pub user_id: UserId,
    pub user_name: String,
    pub color: &'static str,
    pub caret: Option<Rect>,
    pub selection: Vec<Rect>,
}

/// Vertically stacked blocks.
#[derive(Debug, Clone)]
pub struct DocumentLayout {
    blocks: Vec<(String, f32, WrappedTextLayout)>,
    width: f32,
    block_gap: f32,
    metrics: TextMetrics,
}

impl DocumentLayout {
    pub fn new(width: f32, metrics: TextMetrics) -> Self {
        Self {
            blocks: Vec::new(),
            width,
            block_gap: 0.0,
            metrics,
        }
    }

    pub fn with_block_gap(mut self, gap: f32) -> Self {
        self.block_gap = gap;
        self
    }

    pub fn push_block(&mut self, block_id: impl Into<String>, text: &str) {
        let top = self.height() + if self.blocks.is_empty() { 0.0 } else { self.block_gap };
        let layout = WrappedTextLayout::new(text, self.width, self.metrics);
        self.blocks.push((block_id.into(), top, layout));
    }

    pub fn height(&self) -> f32 {
        self.blocks
            .last()
            .map_or(0.0, |(_, top, layout)| top + layout.height())
    }

    fn block(&self, block_id: &str) -> Option<(f32, &WrappedTextLayout)> {
        self.blocks
            .iter()
            .find(|(id, _, _)| id == block_id)
            .map(|(_, top, layout)| (*top, layout))
    }

    /// `None` when the block is not laid out (deleted or not yet loaded).
    pub fn caret_for(&self, cursor: &CursorPosition) -> Option<Rect> {
        let (top, layout) = self.block(&cursor.block_id)?;
        Some(layout.caret_rect(cursor.offset).translated(top))
    }

    /// Highlight rects for `selection`. A collapsed range draws nothing.
    pub fn selection_for(&self, selection: &SelectionRange) -> Vec<Rect> {
        if selection.is_collapsed() {
            return Vec::new();
        }
        self.block(&selection.block_id)
            .map(|(top, layout)| {
                layout
                    .selection_rects(selection.start_offset, selection.end_offset)
                    .into_iter()
                    .map(|r| r.translated(top))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn overlays(&self, collaborators: &[Collaborator]) -> Vec<CursorOverlay> {
        collaborators
            .iter()
            .map(|c| CursorOverlay {
                user_id: c.user_id.clone(),
                user_name: c.user_name.clone(),
                color: c.user_color,
                caret: c.cursor.as_ref().and_then(|cursor| self.caret_for(cursor)),
                selection: c
                    .selection
                    .as_ref()
                    .map(|s| self.selection_for(s))
                    .unwrap_or_default(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(text: &str, columns: f32) -> WrappedTextLayout {
        WrappedTextLayout::new(text, columns * 8.0, TextMetrics::default())
    }

    #[test]
    fn test_single_line() {
        let l = layout("hello", 80.0);
        assert_eq!(l.line_count(), 1);
        assert_eq!(l.caret_rect(3), Rect::new(24.0, 0.0, 2.0, 20.0));
        // Past the end clamps
        assert_eq!(l.caret_rect(99).x, 40.0);
    }

    #[test]
    fn test_soft_wrap_at_word_boundary() {
        let l = layout("the quick brown fox", 10.0);
        assert_eq!(
            l.lines(),
            &[LineBox { start: 0, end: 10 }, LineBox { start: 10, end: 19 }]
        );
        // Offset on the wrap belongs to the next line
        assert_eq!(l.caret_rect(10), Rect::new(0.0, 20.0, 2.0, 20.0));
        assert_eq!(l.caret_rect(12).x, 16.0);
    }

    #[test]
    fn test_long_word_breaks_mid_word() {
        let l = layout("abcdefghijkl", 5.0);
        assert_eq!(l.line_count(), 3);
        assert_eq!(l.caret_rect(11), Rect::new(8.0, 40.0, 2.0, 20.0));
    }

    #[test]
    fn test_hard_break() {
        let l = layout("ab\ncd\n", 80.0);
        assert_eq!(l.line_count(), 3);
        // End of the first line stays there
        assert_eq!(l.caret_rect(2), Rect::new(16.0, 0.0, 2.0, 20.0));
        assert_eq!(l.caret_rect(3), Rect::new(0.0, 20.0, 2.0, 20.0));
        assert_eq!(l.caret_rect(6).y, 40.0);
    }

    #[test]
    fn test_counts_chars_not_bytes() {
        let l = layout("héllo wörld", 80.0);
        assert_eq!(l.caret_rect(7).x, 56.0);
    }

    #[test]
    fn test_selection_spans_lines() {
        let l = layout("the quick brown fox", 10.0);
        let rects = l.selection_rects(16, 4);
        assert_eq!(
            rects,
            vec![
                Rect::new(32.0, 0.0, 48.0, 20.0),
                Rect::new(0.0, 20.0, 48.0, 20.0),
            ]
        );
        assert!(l.selection_rects(5, 5).is_empty());
    }

    #[test]
    fn test_empty_block() {
        let l = layout("", 10.0);
        assert_eq!(l.line_count(), 1);
        assert_eq!(l.caret_rect(0), Rect::new(0.0, 0.0, 2.0, 20.0));
        assert_eq!(l.height(), 20.0);
    }

    #[test]
    fn test_document_stacks_blocks() {
        let mut doc = DocumentLayout::new(80.0, TextMetrics::default()).with_block_gap(10.0);
        doc.push_block("h1", "Title");
        doc.push_block("p1", "the quick brown fox");

        assert_eq!(doc.height(), 70.0);
        let caret = doc.caret_for(&CursorPosition::new("p1", 12)).unwrap();
        assert_eq!(caret, Rect::new(16.0, 50.0, 2.0, 20.0));
        assert!(doc.caret_for(&CursorPosition::new("gone", 0)).is_none());

        let sel = doc.selection_for(&SelectionRange::new("h1", 0, 5));
        assert_eq!(sel, vec![Rect::new(0.0, 0.0, 40.0, 20.0)]);
        assert!(doc.selection_for(&SelectionRange::new("p1", 7, 7)).is_empty());
    }
}
