//! ANSI SGR decoding of task output into HTML-safe styled segments.
//!
//! Two states: `Plain` copies text (escaping `&`, `<`, `>`), `Escape` collects
//! CSI parameter bytes after `ESC [`. Only the `m` final byte applies codes;
//! any other final byte drops the sequence. A sequence still open at end of
//! input produces nothing. Task output is untrusted, so nothing here fails.

use std::fmt::Write as _;

// ── Styles ──────────────────────────────────────────────────────────

const PALETTE: [&str; 16] = [
    // 30–37
    "#000000", "#dc2626", "#16a34a", "#ca8a04", "#2563eb", "#7c3aed", "#0891b2", "#e5e7eb",
    // 90–97
    "#6b7280", "#ef4444", "#22c55e", "#eab308", "#3b82f6", "#a855f7", "#06b6d4", "#ffffff",
];

/// Foreground color, an index into the 16-entry palette (8 standard, 8 bright).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color(u8);

impl Color {
    pub fn from_sgr(code: u16) -> Option<Self> {
        match code {
            30..=37 => Some(Self((code - 30) as u8)),
            90..=97 => Some(Self((code - 90 + 8) as u8)),
            _ => None,
        }
    }

    pub fn hex(self) -> &'static str {
        PALETTE[self.0 as usize]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Style {
    pub color: Option<Color>,
    pub bold: bool,
}

impl Style {
    pub fn is_plain(&self) -> bool {
        *self == Self::default()
    }

    /// Apply one `;`-separated SGR parameter string, left to right.
    fn apply_sgr(mut self, params: &str) -> Self {
        let mut saw_param = false;
        for part in params.split(';').filter(|p| !p.is_empty()) {
            saw_param = true;
            let Ok(code) = part.parse::<u16>() else {
                continue;
            };
            match code {
                0 => self = Self::default(),
                1 => self.bold = true,
                22 => self.bold = false,
                39 => self.color = None,
                _ => {
                    if let Some(color) = Color::from_sgr(code) {
                        self.color = Some(color);
                    }
                }
            }
        }
        // `ESC [ m` is a reset.
        if !saw_param {
            self = Self::default();
        }
        self
    }
}

/// A run of text under one style. `html` is already escaped. `ends_line` marks
/// a `\n` in the input directly after this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub style: Style,
    pub html: String,
    pub ends_line: bool,
}

// ── Decoder ─────────────────────────────────────────────────────────

enum State {
    Plain,
    Escape,
}

pub fn decode(input: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut style = Style::default();
    let mut text = String::new();
    let mut params = String::new();
    let mut state = State::Plain;
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        match state {
            State::Plain => match ch {
                '\x1b' if chars.peek() == Some(&'[') => {
                    chars.next();
                    params.clear();
                    state = State::Escape;
                }
                '\r' => {}
                '\n' => segments.push(Segment {
                    style,
                    html: std::mem::take(&mut text),
                    ends_line: true,
                }),
                '&' => text.push_str("&amp;"),
                '<' => text.push_str("&lt;"),
                '>' => text.push_str("&gt;"),
                other => text.push(other),
            },
            State::Escape => match ch {
                '0'..='9' | ';' => params.push(ch),
                'm' => {
                    let next = style.apply_sgr(&params);
                    if next != style {
                        flush(&mut segments, style, &mut text);
                        style = next;
                    }
                    state = State::Plain;
                }
                _ => state = State::Plain,
            },
        }
    }

    // A dangling escape sequence is simply dropped.
    flush(&mut segments, style, &mut text);
    segments
}

fn flush(segments: &mut Vec<Segment>, style: Style, text: &mut String) {
    if text.is_empty() {
        return;
    }
    segments.push(Segment {
        style,
        html: std::mem::take(text),
        ends_line: false,
    });
}

// ── HTML ────────────────────────────────────────────────────────────

pub fn to_html(segments: &[Segment]) -> String {
    let mut html = String::new();
    for segment in segments {
        if segment.style.is_plain() || segment.html.is_empty() {
            html.push_str(&segment.html);
        } else {
            let mut css = Vec::with_capacity(2);
            if segment.style.bold {
                css.push("font-weight:bold".to_string());
            }
            if let Some(color) = segment.style.color {
                css.push(format!("color:{}", color.hex()));
            }
            let _ = write!(html, "<span style=\"{}\">{}</span>", css.join(";"), segment.html);
        }
        if segment.ends_line {
            html.push('\n');
        }
    }
    html
}

/// Decode and render in one step.
pub fn ansi_to_html(input: &str) -> String {
    to_html(&decode(input))
}

// ── Unit tests ──────────────────────────────────────────────────────
