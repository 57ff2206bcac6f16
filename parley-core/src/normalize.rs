// ABOUTME: Default message pre-processing applied before prefix matching
// ABOUTME: Trims whitespace and folds full-width and typographic lookalikes to ASCII

/// Trim and canonicalise lookalike characters.
///
/// Full-width forms (U+FF01..U+FF5E) map to their ASCII counterparts, the
/// ideographic space becomes a plain space and curly quotes become straight
/// quotes so the argument tokenizer sees them.
pub fn normalize_message(text: &str) -> String {
    text.chars()
        .map(fold_char)
        .collect::<String>()
        .trim()
        .to_string()
}

fn fold_char(c: char) -> char {
    match c {
        '\u{FF01}'..='\u{FF5E}' => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
        '\u{3000}' => ' ',
        '\u{2018}' | '\u{2019}' => '\'',
        '\u{201C}' | '\u{201D}' => '"',
        _ => c,
    }
}
