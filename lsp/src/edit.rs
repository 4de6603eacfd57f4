//! UTF-16 position conversion and text edit application.
//!
//! LSP positions count UTF-16 code units; Rust strings are UTF-8. Every edit a
//! server returns (rename, formatting, code actions) has to be translated
//! before it can be spliced into a `String`.

use crate::error::{LspError, LspResult};
use crate::types::{Position, TextEdit};

/// Byte offset of `position` in `text`.
///
/// A character past the end of its line clamps to the line end (the protocol
/// allows it); a line past the end of the text clamps to the text end. An
/// offset landing inside a surrogate pair is rejected.
pub fn position_to_offset(text: &str, position: Position) -> LspResult<usize> {
    let mut line_start = 0usize;
    for _ in 0..position.line {
        match text[line_start..].find('\n') {
            Some(idx) => line_start += idx + 1,
            None => return Ok(text.len()),
        }
    }

    let line_end = text[line_start..]
        .find('\n')
        .map_or(text.len(), |idx| line_start + idx);
    let line = text[line_start..line_end]
        .strip_suffix('\r')
        .unwrap_or(&text[line_start..line_end]);

    let target = position.character as usize;
    let mut units = 0usize;
    for (byte_idx, ch) in line.char_indices() {
        if units == target {
            return Ok(line_start + byte_idx);
        }
        units += ch.len_utf16();
        if units > target {
            return Err(LspError::InvalidArgument(format!(
                "position {}:{} splits a UTF-16 surrogate pair",
                position.line, position.character
            )));
        }
    }
    Ok(line_start + line.len())
}

/// LSP position of byte offset `offset` in `text`.
pub fn offset_to_position(text: &str, offset: usize) -> LspResult<Position> {
    if offset > text.len() || !text.is_char_boundary(offset) {
        return Err(LspError::InvalidArgument(format!(
            "byte offset {offset} is not a character boundary"
        )));
    }
    let before = &text[..offset];
    let line_start = before.rfind('\n').map_or(0, |idx| idx + 1);
    let line = u32::try_from(before.matches('\n').count())
        .map_err(|_| LspError::InvalidArgument("line number overflows u32".to_string()))?;
    let character = u32::try_from(before[line_start..].encode_utf16().count())
        .map_err(|_| LspError::InvalidArgument("column overflows u32".to_string()))?;
    Ok(Position::new(line, character))
}

/// Apply a set of edits, all expressed against the original `text`.
///
/// Edits may arrive in any order; overlapping edits are rejected. Edits that
/// share a start position are applied in the order given.
pub fn apply_text_edits(text: &str, edits: &[TextEdit]) -> LspResult<String> {
    let mut spans = Vec::with_capacity(edits.len());
    for (idx, edit) in edits.iter().enumerate() {
        let start = position_to_offset(text, edit.range.start)?;
        let end = position_to_offset(text, edit.range.end)?;
        if end < start {
            return Err(LspError::InvalidArgument(format!(
                "edit range ends before it starts at {}:{}",
                edit.range.start.line, edit.range.start.character
            )));
        }
        spans.push((start, end, idx));
    }
    spans.sort_by_key(|&(start, end, idx)| (start, end, idx));

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;
    for (start, end, idx) in spans {
        if start < cursor {
            return Err(LspError::InvalidArgument(
                "overlapping text edits".to_string(),
            ));
        }
        out.push_str(&text[cursor..start]);
        out.push_str(&edits[idx].new_text);
        cursor = end;
    }
    out.push_str(&text[cursor..]);
    Ok(out)
}
