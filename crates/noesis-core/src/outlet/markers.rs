//! Action-marker scanner
//!
//! The LLM embeds structured directives in its responses as line-anchored
//! blocks:
//!
//! ```text
//! [SAVE_NOTE: Title]
//! body
//! [/SAVE_NOTE]
//! ```
//!
//! The head accepts optional `| field` splits (`[SEND_EMAIL: Subject |
//! recipient@example.com]`). Parsing is a small hand-rolled scanner, not
//! regex: openers must start a line, bodies run to the matching closer, and
//! unterminated blocks are left in place as plain text.

/// Marker verbs the scanner recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    /// `[SAVE_NOTE: title]`
    SaveNote,
    /// `[SEND_EMAIL: subject [| recipient]]`
    SendEmail,
    /// `[SCHEDULE_EMAIL: subject | datetime]`
    ScheduleEmail,
    /// `[ADD_EXPENSE: amount | category]`
    AddExpense,
    /// `[ADD_SCHEDULE: title | datetime]`
    AddSchedule,
    /// `[SEARCH_EMAIL: query]`
    SearchEmail,
}

impl MarkerKind {
    const ALL: &'static [MarkerKind] = &[
        MarkerKind::SaveNote,
        MarkerKind::SendEmail,
        MarkerKind::ScheduleEmail,
        MarkerKind::AddExpense,
        MarkerKind::AddSchedule,
        MarkerKind::SearchEmail,
    ];

    /// Marker verb as written in the response text.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::SaveNote => "SAVE_NOTE",
            Self::SendEmail => "SEND_EMAIL",
            Self::ScheduleEmail => "SCHEDULE_EMAIL",
            Self::AddExpense => "ADD_EXPENSE",
            Self::AddSchedule => "ADD_SCHEDULE",
            Self::SearchEmail => "SEARCH_EMAIL",
        }
    }
}

/// One parsed action marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionMarker {
    /// Which verb
    pub kind: MarkerKind,
    /// Text before the first `|` in the head
    pub head: String,
    /// Optional `| field` from the head
    pub extra: Option<String>,
    /// Block body (between head line and closer)
    pub body: String,
    /// Byte range of the whole block in the source text
    pub span: (usize, usize),
}

/// Result of a scan: parsed markers plus the text with their blocks removed.
#[derive(Debug, Clone)]
pub struct ScanResult {
    /// Markers in source order
    pub markers: Vec<ActionMarker>,
    /// Response text with marker blocks stripped and ≥3 newline runs
    /// collapsed
    pub cleaned: String,
}

/// Scan a response for action markers.
pub fn scan(text: &str) -> ScanResult {
    let mut markers = Vec::new();
    let mut cursor = 0usize;

    while cursor < text.len() {
        let Some(open_rel) = text[cursor..].find('[') else {
            break;
        };
        let open = cursor + open_rel;

        // Openers are case-sensitive and anchored to line starts
        if open > 0 && text.as_bytes()[open - 1] != b'\n' {
            cursor = open + 1;
            continue;
        }
        let Some(marker) = try_parse_block(text, open) else {
            cursor = open + 1;
            continue;
        };
        cursor = marker.span.1;
        markers.push(marker);
    }

    // Strip the blocks back-to-front so spans stay valid
    let mut cleaned = text.to_string();
    for marker in markers.iter().rev() {
        cleaned.replace_range(marker.span.0..marker.span.1, "");
    }
    ScanResult {
        markers,
        cleaned: collapse_newlines(cleaned.trim()),
    }
}

/// Strip every marker without parsing semantics (the security gate).
/// Returns the cleaned text and how many blocks were removed.
pub fn strip_all(text: &str) -> (String, usize) {
    let result = scan(text);
    (result.cleaned, result.markers.len())
}

/// Replace one marker's block with substitute text (used by SEARCH_EMAIL,
/// whose results render in place).
pub fn replace_block(text: &str, marker: &ActionMarker, substitute: &str) -> String {
    let mut out = text.to_string();
    out.replace_range(marker.span.0..marker.span.1, substitute);
    out
}

fn try_parse_block(text: &str, open: usize) -> Option<ActionMarker> {
    let rest = &text[open..];
    let kind = MarkerKind::ALL.iter().copied().find(|k| {
        rest.len() > k.verb().len() + 1
            && rest[1..].starts_with(k.verb())
            && rest[1 + k.verb().len()..].starts_with(':')
    })?;

    // Head runs to the closing bracket on the same line
    let head_end_rel = rest.find(']')?;
    let line_end_rel = rest.find('\n').unwrap_or(rest.len());
    if head_end_rel > line_end_rel {
        return None;
    }
    let head_raw = rest[1 + kind.verb().len() + 1..head_end_rel].trim();

    let (head, extra) = match head_raw.split_once('|') {
        Some((left, right)) => (left.trim().to_string(), Some(right.trim().to_string())),
        None => (head_raw.to_string(), None),
    };
    if head.is_empty() {
        return None;
    }

    let closer = format!("[/{}]", kind.verb());
    let body_start = open + head_end_rel + 1;
    let close_rel = text[body_start..].find(&closer)?;
    let body = text[body_start..body_start + close_rel]
        .trim_matches('\n')
        .trim_end()
        .to_string();

    let mut end = body_start + close_rel + closer.len();
    // Swallow one trailing newline so stripping doesn't leave blank lines
    if text[end..].starts_with('\n') {
        end += 1;
    }

    Some(ActionMarker {
        kind,
        head,
        extra,
        body,
        span: (open, end),
    })
}

fn collapse_newlines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run = 0usize;
    for c in text.chars() {
        if c == '\n' {
            run += 1;
            if run <= 2 {
                out.push(c);
            }
        } else {
            run = 0;
            out.push(c);
        }
    }
    out
}

/// Re-render a marker back into its block form (used by tests and the
/// outbound formatting of deferred actions).
pub fn render(marker: &ActionMarker) -> String {
    let head = match &marker.extra {
        Some(extra) => format!("{} | {}", marker.head, extra),
        None => marker.head.clone(),
    };
    format!(
        "[{verb}: {head}]\n{body}\n[/{verb}]",
        verb = marker.kind.verb(),
        head = head,
        body = marker.body,
    )
}

// ============================================================================
// TESTS
// ============================================================================
