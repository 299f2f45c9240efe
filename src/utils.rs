use crossterm::style::Color;
use std::hash::{Hash, Hasher};

/// Split a `KEY=VALUE` pair at the first `=`.
pub fn parse_key_value(pair: &str) -> Result<(String, String), String> {
    let pair = pair.trim();
    match pair.find('=') {
        Some(0) => Err(format!("empty key in '{}'", pair)),
        Some(eq_pos) => Ok((pair[..eq_pos].to_string(), pair[eq_pos + 1..].to_string())),
        None => Err(format!("expected KEY=VALUE, got '{}'", pair)),
    }
}

/// Generate a color for a string based on hash.
pub fn get_color(s: &str) -> Color {
    let colors = [
        Color::Red,
        Color::Green,
        Color::Blue,
        Color::Yellow,
        Color::Magenta,
        Color::Cyan,
        Color::AnsiValue(91), // Bright Red
        Color::AnsiValue(92), // Bright Green
        Color::AnsiValue(94), // Bright Blue
        Color::AnsiValue(93), // Bright Yellow
        Color::AnsiValue(95), // Bright Magenta
        Color::AnsiValue(96), // Bright Cyan
    ];
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    let hash = hasher.finish() as u32;
    colors[(hash % colors.len() as u32) as usize]
}
