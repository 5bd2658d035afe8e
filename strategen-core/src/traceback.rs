//! Recognising Python exception traces in captured output.
//!
//! Shared by the sandbox runner (exit-0-with-trace detection) and the
//! outcome classifier (terminal frame, excerpt boundaries).

/// First line of every Python traceback block.
pub const TRACEBACK_HEADER: &str = "Traceback (most recent call last):";

/// Prefix of a stack-frame line inside a traceback.
pub const FRAME_PREFIX: &str = "  File \"";

const BARE_EXCEPTIONS: &[&str] = &[
    "KeyboardInterrupt",
    "SystemExit",
    "StopIteration",
    "GeneratorExit",
];

/// A parsed `Name: message` exception line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionLine<'a> {
    /// Last dotted component, e.g. `EmptyDataError`.
    pub name: &'a str,
    /// Name as printed, e.g. `pandas.errors.EmptyDataError`.
    pub qualified: &'a str,
    pub message: &'a str,
}

/// Parse one line as an exception line. Indented lines never are.
pub fn parse_exception_line(line: &str) -> Option<ExceptionLine<'_>> {
    let line = line.trim_end();
    if line.is_empty() || line.starts_with(char::is_whitespace) {
        return None;
    }

    let (qualified, message) = match line.find(':') {
        Some(idx) => (&line[..idx], line[idx + 1..].trim_start()),
        None => (line, ""),
    };
    if !is_dotted_identifier(qualified) {
        return None;
    }

    let name = qualified.rsplit('.').next().unwrap_or(qualified);
    let looks_like_exception = name.ends_with("Error")
        || name.ends_with("Exception")
        || BARE_EXCEPTIONS.contains(&name);
    looks_like_exception.then_some(ExceptionLine {
        name,
        qualified,
        message,
    })
}

fn is_dotted_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

/// Every exception line in `text`, in order of appearance.
pub fn exception_lines(text: &str) -> impl Iterator<Item = ExceptionLine<'_>> {
    text.lines().filter_map(parse_exception_line)
}

/// The terminal exception: the last exception line in `text`.
pub fn last_exception(text: &str) -> Option<ExceptionLine<'_>> {
    text.lines().rev().find_map(parse_exception_line)
}

/// True when the last non-empty line is an exception line belonging to a
/// trace (a traceback header or frame line appears before it).
pub fn has_trailing_exception(stderr: &str) -> bool {
    let Some(last) = stderr.lines().rev().find(|l| !l.trim().is_empty()) else {
        return false;
    };
    parse_exception_line(last).is_some()
        && stderr
            .lines()
            .any(|l| l.starts_with(TRACEBACK_HEADER) || l.starts_with(FRAME_PREFIX))
}

/// Byte offset of the last traceback header line, if any.
pub fn last_traceback_start(text: &str) -> Option<usize> {
    line_offsets(text)
        .filter(|&(_, line)| line.starts_with(TRACEBACK_HEADER))
        .map(|(offset, _)| offset)
        .last()
}

/// Byte offset of the last frame line, if any. Syntax errors raised while
/// compiling the entry script print a frame without a traceback header.
pub fn last_frame_start(text: &str) -> Option<usize> {
    line_offsets(text)
        .filter(|&(_, line)| line.starts_with(FRAME_PREFIX))
        .map(|(offset, _)| offset)
        .last()
}

fn line_offsets(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.split_inclusive('\n').scan(0usize, |offset, line| {
        let start = *offset;
        *offset += line.len();
        Some((start, line))
    })
}
