//! Code extraction from model responses.
//!
//! Picks the longest Python-or-unlabelled fenced block; failing that, trims
//! leading and trailing prose around recognisable program text. The chosen
//! span is always returned byte-for-byte as it appears in the response.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

const PYTHON_LANGS: &[&str] = &["python", "py", "python3"];

const PROGRAM_STARTS: &[&str] = &["import ", "from ", "class ", "def ", "async def ", "#!"];

const PY_KEYWORDS: &[&str] = &[
    "import", "from", "def", "class", "if", "elif", "else", "for", "while", "try", "except",
    "finally", "with", "return", "raise", "print", "assert", "pass", "break", "continue",
    "global", "lambda", "yield", "async", "await", "del",
];

/// Which heuristic produced the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    FencedBlock,
    ProseTrimmed,
    Empty,
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExtractionMethod::FencedBlock => "fenced_block",
            ExtractionMethod::ProseTrimmed => "prose_trimmed",
            ExtractionMethod::Empty => "empty",
        })
    }
}

/// Result of extraction. `source == response[span]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub source: String,
    pub method: ExtractionMethod,
    pub span: Range<usize>,
}

impl Extraction {
    fn empty() -> Self {
        Self {
            source: String::new(),
            method: ExtractionMethod::Empty,
            span: 0..0,
        }
    }

    fn slice(response: &str, span: Range<usize>, method: ExtractionMethod) -> Self {
        Self {
            source: response[span.clone()].to_string(),
            method,
            span,
        }
    }
}

/// A fenced block found in a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FencedBlock {
    /// First word of the info string, as written.
    pub language: Option<String>,
    /// Byte range of the block body, excluding both fence lines.
    pub body: Range<usize>,
    pub terminated: bool,
}

impl FencedBlock {
    pub fn is_python(&self) -> bool {
        match &self.language {
            None => true,
            Some(lang) => PYTHON_LANGS.iter().any(|p| lang.eq_ignore_ascii_case(p)),
        }
    }
}

struct Line<'a> {
    start: usize,
    end: usize,
    text: &'a str,
}

fn lines(text: &str) -> Vec<Line<'_>> {
    let mut out = Vec::new();
    let mut start = 0;
    for raw in text.split_inclusive('\n') {
        let end = start + raw.len();
        out.push(Line {
            start,
            end,
            text: raw.trim_end_matches(['\n', '\r']),
        });
        start = end;
    }
    out
}

/// The line without its indent, if it is indented by at most three
/// spaces. Deeper lines are content, never fences.
fn fence_indent(line: &str) -> Option<&str> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    (indent <= 3).then(|| &line[indent..])
}

/// `(fence char, run length, info string)` for a fence line.
fn fence(line: &str) -> Option<(char, usize, &str)> {
    let trimmed = fence_indent(line)?;
    let ch = trimmed.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let run = trimmed.chars().take_while(|c| *c == ch).count();
    (run >= 3).then(|| (ch, run, trimmed[run..].trim()))
}

fn closes(line: &str, ch: char, run: usize) -> bool {
    let Some(trimmed) = fence_indent(line).map(str::trim_end) else {
        return false;
    };
    trimmed.len() >= run && trimmed.chars().all(|c| c == ch)
}

/// All fenced blocks in order of appearance.
pub fn fenced_blocks(response: &str) -> Vec<FencedBlock> {
    let lines = lines(response);
    let mut blocks = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let Some((ch, run, info)) = fence(lines[i].text) else {
            i += 1;
            continue;
        };
        let language = info.split_whitespace().next().map(str::to_string);
        let body_start = lines[i].end;

        let close = (i + 1..lines.len()).find(|&j| closes(lines[j].text, ch, run));
        match close {
            Some(j) => {
                blocks.push(FencedBlock {
                    language,
                    body: body_start..lines[j].start,
                    terminated: true,
                });
                i = j + 1;
            }
            None => {
                blocks.push(FencedBlock {
                    language,
                    body: body_start..response.len(),
                    terminated: false,
                });
                break;
            }
        }
    }
    blocks
}

/// Extract one candidate program from a model response.
pub fn extract(response: &str) -> Extraction {
    let mut best: Option<&FencedBlock> = None;
    let blocks = fenced_blocks(response);
    for block in blocks.iter().filter(|b| b.is_python()) {
        if response[block.body.clone()].trim().is_empty() {
            continue;
        }
        // Strictly longer wins, so the first of equal-length blocks stays.
        if best.map_or(true, |b| block.body.len() > b.body.len()) {
            best = Some(block);
        }
    }
    if let Some(block) = best {
        return Extraction::slice(response, block.body.clone(), ExtractionMethod::FencedBlock);
    }

    match trim_prose(response) {
        Some(span) => Extraction::slice(response, span, ExtractionMethod::ProseTrimmed),
        None => Extraction::empty(),
    }
}

fn starts_program(line: &str) -> bool {
    PROGRAM_STARTS.iter().any(|p| line.starts_with(p))
}

fn is_code_like(line: &str) -> bool {
    if line.starts_with(char::is_whitespace) || line.starts_with('#') || line.starts_with('@') {
        return true;
    }
    let first = line
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .next()
        .unwrap_or("");
    if PY_KEYWORDS.contains(&first) {
        return true;
    }
    line.contains('=') || line.contains('(') || line.contains('[') || line.ends_with(':')
}

/// Span from the first program-looking line to the end of the last
/// non-prose paragraph, or `None` if nothing looks like a program.
fn trim_prose(response: &str) -> Option<Range<usize>> {
    let lines = lines(response);
    let first = lines.iter().position(|l| starts_program(l.text))?;

    let mut last = lines.len();
    // Walk trailing paragraphs backwards, dropping blank lines, stray
    // fences and paragraphs with no code-like line.
    loop {
        while last > first + 1 {
            let line = lines[last - 1].text;
            if line.trim().is_empty() || fence(line).is_some() {
                last -= 1;
            } else {
                break;
            }
        }
        let para_start = (first + 1..last)
            .rev()
            .find(|&j| lines[j - 1].text.trim().is_empty())
            .unwrap_or(first);
        if para_start == first {
            break;
        }
        let prose = lines[para_start..last]
            .iter()
            .all(|l| !is_code_like(l.text) || fence(l.text).is_some());
        if !prose {
            break;
        }
        last = para_start;
    }

    let span = lines[first].start..lines[last - 1].end;
    (!response[span.clone()].trim().is_empty()).then_some(span)
}
