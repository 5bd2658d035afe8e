//! Outcome classifier.
//!
//! Rules are tried top-down and the first match wins:
//! timeout, dependency_missing/import, data_missing, syntax,
//! name_or_attribute, index_or_key, value_or_type, empty_output,
//! runtime_other. The result is a pure function of the outcome and the
//! program source, so identical inputs classify identically.

use serde::{Deserialize, Serialize};

use crate::domain::{ClassifiedError, ErrorKind, RunOutcome, RunStatus};
use crate::traceback::{self, FRAME_PREFIX};

/// Byte budget of an excerpt.
pub const EXCERPT_BUDGET: usize = 2048;

const ELISION: &str = "  ...";

/// Modules every Python install provides; an import failure naming one of
/// these is a misuse, not a missing dependency.
const STDLIB_MODULES: &[&str] = &[
    "abc", "argparse", "array", "asyncio", "base64", "bisect", "calendar", "collections",
    "concurrent", "contextlib", "copy", "csv", "dataclasses", "datetime", "decimal", "enum",
    "fractions", "functools", "glob", "hashlib", "heapq", "io", "itertools", "json", "logging",
    "math", "operator", "os", "pathlib", "pickle", "random", "re", "shutil", "statistics",
    "string", "subprocess", "sys", "tempfile", "threading", "time", "traceback", "typing",
    "unittest", "uuid", "warnings", "zoneinfo",
];

const SYNTAX_ERRORS: &[&str] = &["SyntaxError", "IndentationError", "TabError"];
const IMPORT_ERRORS: &[&str] = &["ModuleNotFoundError", "ImportError"];
const NAME_ERRORS: &[&str] = &["NameError", "AttributeError", "UnboundLocalError"];
const LOOKUP_ERRORS: &[&str] = &["IndexError", "KeyError"];
const VALUE_ERRORS: &[&str] = &[
    "ValueError",
    "TypeError",
    "ZeroDivisionError",
    "OverflowError",
    "FloatingPointError",
    "ArithmeticError",
    "LinAlgError",
];
const FILE_MISSING_MARKERS: &[&str] = &["FileNotFoundError", "No such file or directory", "[Errno 2]"];

// ── Rules ────────────────────────────────────────────────────────────

/// What a successful run must look like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierRules {
    /// Third-party modules the interpreter environment provides.
    pub provided_modules: Vec<String>,
    /// Substrings that must all appear in stdout.
    pub completion_markers: Vec<String>,
    /// Minimum count of non-blank stdout lines.
    pub min_output_lines: usize,
}

impl Default for ClassifierRules {
    fn default() -> Self {
        Self {
            provided_modules: Vec::new(),
            completion_markers: Vec::new(),
            min_output_lines: 1,
        }
    }
}

/// Classifier decision for one outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Failed(ClassifiedError),
}

impl Verdict {
    pub fn is_passed(&self) -> bool {
        matches!(self, Verdict::Passed)
    }

    pub fn error(&self) -> Option<&ClassifiedError> {
        match self {
            Verdict::Passed => None,
            Verdict::Failed(e) => Some(e),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Classifier {
    rules: ClassifierRules,
}

impl Classifier {
    pub fn new(rules: ClassifierRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &ClassifierRules {
        &self.rules
    }

    pub fn classify(&self, outcome: &RunOutcome, program_source: &str) -> Verdict {
        match outcome.status {
            RunStatus::Timeout => {
                let tail = tail_lines(output_of(outcome), EXCERPT_BUDGET / 2);
                let mut excerpt = format!("timed out after {:.0}s", outcome.wall_time);
                if !tail.is_empty() {
                    excerpt.push_str("\nlast output:\n");
                    excerpt.push_str(&tail);
                }
                return fail(ClassifiedError::new(ErrorKind::Timeout, excerpt).with_hint(
                    "the program did not finish within the wall-clock budget",
                ));
            }
            RunStatus::Ok => return self.check_output(outcome),
            RunStatus::LauncherError => {
                return fail(
                    ClassifiedError::new(ErrorKind::RuntimeOther, tail_lines(&outcome.stderr, EXCERPT_BUDGET))
                        .with_hint("the interpreter could not be launched"),
                );
            }
            RunStatus::NonzeroExit => {}
        }

        let stderr = outcome.stderr.as_str();
        let excerpt = excerpt(stderr, &outcome.stdout);

        if let Some(err) = self.import_failure(stderr, &excerpt) {
            return fail(err);
        }
        if let Some(path) = missing_path(stderr, program_source) {
            return fail(
                ClassifiedError::new(ErrorKind::DataMissing, excerpt)
                    .with_hint(format!("data file `{path}` could not be opened")),
            );
        }
        if traceback::exception_lines(stderr).any(|e| SYNTAX_ERRORS.contains(&e.name)) {
            return fail(ClassifiedError::new(ErrorKind::Syntax, excerpt));
        }

        let kind = match traceback::last_exception(stderr).map(|e| e.name) {
            Some(name) if NAME_ERRORS.contains(&name) => ErrorKind::NameOrAttribute,
            Some(name) if LOOKUP_ERRORS.contains(&name) => ErrorKind::IndexOrKey,
            Some(name) if VALUE_ERRORS.contains(&name) => ErrorKind::ValueOrType,
            _ => ErrorKind::RuntimeOther,
        };
        fail(ClassifiedError::new(kind, excerpt))
    }

    fn import_failure(&self, stderr: &str, excerpt: &str) -> Option<ClassifiedError> {
        let failure = traceback::exception_lines(stderr)
            .filter(|e| IMPORT_ERRORS.contains(&e.name))
            .last()?;

        let Some(module) = missing_module(failure.message) else {
            return Some(ClassifiedError::new(ErrorKind::DependencyMissing, excerpt));
        };
        let top = module.split('.').next().unwrap_or(module);

        if self.is_provided(top) {
            Some(
                ClassifiedError::new(ErrorKind::Import, excerpt)
                    .with_hint(format!("`{top}` is installed; check the imported names")),
            )
        } else {
            Some(
                ClassifiedError::new(ErrorKind::DependencyMissing, excerpt).with_hint(format!(
                    "`{top}` is not installed; use an available library instead"
                )),
            )
        }
    }

    fn is_provided(&self, module: &str) -> bool {
        STDLIB_MODULES.contains(&module) || self.rules.provided_modules.iter().any(|m| m == module)
    }

    fn check_output(&self, outcome: &RunOutcome) -> Verdict {
        let lines = outcome.stdout.lines().filter(|l| !l.trim().is_empty()).count();
        let mut problems = Vec::new();
        if lines < self.rules.min_output_lines {
            problems.push(format!(
                "stdout had {lines} non-blank line(s); at least {} expected",
                self.rules.min_output_lines
            ));
        }
        for marker in &self.rules.completion_markers {
            if !outcome.stdout.contains(marker.as_str()) {
                problems.push(format!("stdout lacks completion marker `{marker}`"));
            }
        }
        if problems.is_empty() {
            return Verdict::Passed;
        }

        let mut excerpt = problems.join("\n");
        let tail = tail_lines(output_of(outcome), EXCERPT_BUDGET / 2);
        if !tail.is_empty() {
            excerpt.push_str("\nlast output:\n");
            excerpt.push_str(&tail);
        }
        fail(
            ClassifiedError::new(ErrorKind::EmptyOutput, excerpt)
                .with_hint("the program exited cleanly but did not report results"),
        )
    }
}

fn fail(err: ClassifiedError) -> Verdict {
    Verdict::Failed(err)
}

fn output_of(outcome: &RunOutcome) -> &str {
    if outcome.stderr.trim().is_empty() {
        &outcome.stdout
    } else {
        &outcome.stderr
    }
}

/// Module named by an import failure message, e.g. `No module named 'ta.trend'`
/// or `cannot import name 'lib' from 'backtesting' (...)`.
fn missing_module(message: &str) -> Option<&str> {
    if let Some(rest) = message.split("No module named ").nth(1) {
        return quoted(rest).or_else(|| rest.split_whitespace().next());
    }
    if let Some(rest) = message.split(" from ").nth(1) {
        return quoted(rest);
    }
    None
}

fn quoted(s: &str) -> Option<&str> {
    let s = s.trim_start();
    let q = s.chars().next().filter(|c| *c == '\'' || *c == '"')?;
    let body = &s[1..];
    body.find(q).map(|end| &body[..end])
}

// ── Data paths ───────────────────────────────────────────────────────

/// A quoted path from a file-open failure that the program names in one of
/// its string literals.
fn missing_path(stderr: &str, program_source: &str) -> Option<String> {
    let literals = string_literals(program_source);
    stderr
        .lines()
        .filter(|line| FILE_MISSING_MARKERS.iter().any(|m| line.contains(m)))
        .flat_map(quoted_all)
        .find(|path| {
            literals
                .iter()
                .any(|lit| lit == path || (lit.len() >= 4 && path.ends_with(lit.as_str())))
        })
        .map(str::to_string)
}

fn quoted_all(line: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = line;
    while let Some(start) = rest.find(['\'', '"']) {
        let q = &rest[start..start + 1];
        let body = &rest[start + 1..];
        match body.find(q) {
            Some(end) => {
                out.push(&body[..end]);
                rest = &body[end + 1..];
            }
            None => break,
        }
    }
    out
}

/// Contents of the string literals in `source`, unescaped only as far as
/// being left verbatim. Handles prefixes (`r`, `b`, `f`, `u` and pairs),
/// triple quotes and `#` comments.
pub fn string_literals(source: &str) -> Vec<String> {
    let bytes = source.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            q @ (b'\'' | b'"') => {
                let raw = is_raw_prefix(bytes, i);
                let triple = bytes.get(i..i + 3) == Some(&[q, q, q][..]);
                let open = if triple { 3 } else { 1 };
                let start = i + open;
                let mut j = start;
                let mut end = None;
                while j < bytes.len() {
                    if bytes[j] == b'\\' && !raw {
                        j += 2;
                        continue;
                    }
                    if !triple && bytes[j] == b'\n' {
                        break;
                    }
                    if bytes[j] == q && (!triple || bytes.get(j..j + 3) == Some(&[q, q, q][..])) {
                        end = Some(j);
                        break;
                    }
                    j += 1;
                }
                match end {
                    Some(end) => {
                        out.push(String::from_utf8_lossy(&bytes[start..end]).into_owned());
                        i = end + open;
                    }
                    None => i = j.max(i + 1),
                }
            }
            _ => i += 1,
        }
    }
    out
}

fn is_raw_prefix(bytes: &[u8], quote: usize) -> bool {
    let mut k = quote;
    let mut raw = false;
    while k > 0 && quote - k < 2 && bytes[k - 1].is_ascii_alphabetic() {
        k -= 1;
        match bytes[k].to_ascii_lowercase() {
            b'r' => raw = true,
            b'b' | b'f' | b'u' => {}
            _ => return false,
        }
    }
    let standalone = k == 0 || !(bytes[k - 1].is_ascii_alphanumeric() || bytes[k - 1] == b'_');
    raw && standalone
}

// ── Excerpts ─────────────────────────────────────────────────────────

/// The most relevant part of a failed run's output, at most
/// `EXCERPT_BUDGET` bytes, cut on line boundaries.
///
/// Preference: the last traceback block (earliest frames elided when over
/// budget), then the last bare frame (syntax errors in the entry script),
/// then the tail of stderr, or of stdout when stderr is empty.
pub fn excerpt(stderr: &str, stdout: &str) -> String {
    if let Some(start) = traceback::last_traceback_start(stderr) {
        return fit_traceback(stderr[start..].trim_end());
    }
    if let Some(start) = traceback::last_frame_start(stderr) {
        return tail_lines(stderr[start..].trim_end(), EXCERPT_BUDGET);
    }
    let source = if stderr.trim().is_empty() { stdout } else { stderr };
    tail_lines(source.trim_end(), EXCERPT_BUDGET)
}

fn fit_traceback(block: &str) -> String {
    if block.len() <= EXCERPT_BUDGET {
        return block.to_string();
    }

    let lines: Vec<&str> = block.lines().collect();
    let frames: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| l.starts_with(FRAME_PREFIX))
        .map(|(i, _)| i)
        .collect();

    if frames.len() > 1 {
        let header = lines[0];
        for &keep_from in &frames[1..] {
            let mut parts = vec![header, ELISION];
            parts.extend_from_slice(&lines[keep_from..]);
            let candidate = parts.join("\n");
            if candidate.len() <= EXCERPT_BUDGET {
                return candidate;
            }
        }
    }
    tail_lines(block, EXCERPT_BUDGET)
}

/// Trailing whole lines of `text` totalling at most `budget` bytes. A single
/// line longer than the budget keeps only its end.
fn tail_lines(text: &str, budget: usize) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut used = 0;
    for line in text.lines().rev() {
        let cost = line.len() + usize::from(!kept.is_empty());
        if used + cost > budget {
            break;
        }
        used += cost;
        kept.push(line);
    }

    if kept.is_empty() {
        let Some(last) = text.lines().next_back() else {
            return String::new();
        };
        let mut cut = last.len().saturating_sub(budget);
        while !last.is_char_boundary(cut) {
            cut += 1;
        }
        return last[cut..].to_string();
    }
    kept.reverse();
    kept.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn failed(stderr: &str) -> RunOutcome {
        RunOutcome {
            status: RunStatus::NonzeroExit,
            exit_code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_string(),
            wall_time: 0.4,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            cancelled: false,
        }
    }

    fn trace(exception: &str) -> String {
        format!(
            "Traceback (most recent call last):\n  File \"/tmp/bt.py\", line 12, in <module>\n    run()\n{exception}\n"
        )
    }

    fn kind_of(stderr: &str, program: &str) -> ErrorKind {
        match Classifier::default().classify(&failed(stderr), program) {
            Verdict::Failed(e) => e.kind,
            Verdict::Passed => panic!("expected a failure"),
        }
    }

    #[test]
    fn terminal_frame_kinds() {
        assert_eq!(kind_of(&trace("NameError: name 'sma' is not defined"), ""), ErrorKind::NameOrAttribute);
        assert_eq!(kind_of(&trace("AttributeError: 'Series' object has no attribute 'rolling_mean'"), ""), ErrorKind::NameOrAttribute);
        assert_eq!(kind_of(&trace("KeyError: 'Close'"), ""), ErrorKind::IndexOrKey);
        assert_eq!(kind_of(&trace("IndexError: list index out of range"), ""), ErrorKind::IndexOrKey);
        assert_eq!(kind_of(&trace("ZeroDivisionError: division by zero"), ""), ErrorKind::ValueOrType);
        assert_eq!(kind_of(&trace("RuntimeError: boom"), ""), ErrorKind::RuntimeOther);
        assert_eq!(kind_of("Segmentation fault\n", ""), ErrorKind::RuntimeOther);
    }

    #[test]
    fn syntax_error_without_traceback_header() {
        let stderr = "  File \"/tmp/bt.py\", line 12\n    if fast > slow\n                  ^\nSyntaxError: expected ':'\n";
        let verdict = Classifier::default().classify(&failed(stderr), "");
        let err = verdict.error().unwrap();
        assert_eq!(err.kind, ErrorKind::Syntax);
        assert!(err.excerpt.contains("line 12"));
        assert!(err.excerpt.ends_with("SyntaxError: expected ':'"));
    }

    #[test]
    fn missing_third_party_module_is_a_dependency() {
        let stderr = trace("ModuleNotFoundError: No module named 'talib.abstract'");
        assert_eq!(kind_of(&stderr, ""), ErrorKind::DependencyMissing);
    }

    #[test]
    fn provided_module_misuse_is_import() {
        let classifier = Classifier::new(ClassifierRules {
            provided_modules: vec!["backtesting".into()],
            ..ClassifierRules::default()
        });
        let stderr = trace("ImportError: cannot import name 'lib' from 'backtesting' (/opt/x.py)");
        let err = classifier.classify(&failed(&stderr), "").error().cloned().unwrap();
        assert_eq!(err.kind, ErrorKind::Import);

        let stdlib = trace("ImportError: cannot import name 'mean2' from 'statistics'");
        assert_eq!(kind_of(&stdlib, ""), ErrorKind::Import);
    }

    #[test]
    fn data_missing_requires_path_in_program() {
        let stderr = trace("FileNotFoundError: [Errno 2] No such file or directory: '/data/BTC-6h.csv'");
        let program = "import pandas as pd\ndf = pd.read_csv(\"/data/BTC-6h.csv\")\n";
        assert_eq!(kind_of(&stderr, program), ErrorKind::DataMissing);

        let unrelated = "open('results.txt')\n";
        assert_eq!(kind_of(&stderr, unrelated), ErrorKind::RuntimeOther);
    }

    #[test]
    fn data_missing_accepts_relative_suffix() {
        let stderr = trace("FileNotFoundError: [Errno 2] No such file or directory: '/work/data/eth.csv'");
        assert_eq!(kind_of(&stderr, "path = r'data/eth.csv'\n"), ErrorKind::DataMissing);
    }

    #[test]
    fn timeout_excerpt_is_labelled() {
        let mut outcome = failed("");
        outcome.status = RunStatus::Timeout;
        outcome.wall_time = 5.02;
        outcome.stdout = "bar 1\nbar 2\n".into();
        let err = Classifier::default().classify(&outcome, "").error().cloned().unwrap();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.excerpt.starts_with("timed out after 5s"));
        assert!(err.excerpt.contains("bar 2"));
    }

    #[test]
    fn ok_status_passes_only_with_output() {
        let mut outcome = failed("");
        outcome.status = RunStatus::Ok;
        outcome.exit_code = Some(0);
        assert_eq!(
            Classifier::default().classify(&outcome, "").error().map(|e| e.kind),
            Some(ErrorKind::EmptyOutput)
        );

        outcome.stdout = "Return [%]  12.5\n".into();
        assert!(Classifier::default().classify(&outcome, "").is_passed());

        let strict = Classifier::new(ClassifierRules {
            completion_markers: vec!["Sharpe Ratio".into()],
            ..ClassifierRules::default()
        });
        assert_eq!(
            strict.classify(&outcome, "").error().map(|e| e.kind),
            Some(ErrorKind::EmptyOutput)
        );
    }

    #[test]
    fn launcher_errors_are_runtime_other_with_hint() {
        let mut outcome = failed("failed to launch `python9`: No such file or directory (os error 2)");
        outcome.status = RunStatus::LauncherError;
        let err = Classifier::default().classify(&outcome, "").error().cloned().unwrap();
        assert_eq!(err.kind, ErrorKind::RuntimeOther);
        assert!(err.hint.is_some());
    }

    #[test]
    fn long_traceback_drops_earliest_frames() {
        let mut stderr = String::from("Traceback (most recent call last):\n");
        for i in 0..60 {
            stderr.push_str(&format!(
                "  File \"/site-packages/pandas/core/frame_{i}.py\", line {i}, in f{i}\n    return g{i}(x)\n"
            ));
        }
        stderr.push_str("ValueError: cannot reindex on an axis with duplicate labels\n");

        let ex = excerpt(&stderr, "");
        assert!(ex.len() <= EXCERPT_BUDGET);
        assert!(ex.starts_with("Traceback (most recent call last):\n  ...\n"));
        assert!(ex.contains("frame_59.py\", line 59"));
        assert!(!ex.contains("frame_0.py"));
        assert!(ex.ends_with("duplicate labels"));
    }

    #[test]
    fn excerpt_keeps_only_the_last_traceback() {
        let stderr = format!("{}\nwarning: retrying\n{}", trace("KeyError: 'a'"), trace("KeyError: 'b'"));
        let ex = excerpt(&stderr, "");
        assert!(ex.contains("'b'"));
        assert!(!ex.contains("'a'"));
    }

    #[test]
    fn excerpt_falls_back_to_stdout() {
        assert_eq!(excerpt("", "step 1\nstep 2\n"), "step 1\nstep 2");
    }

    #[test]
    fn literal_scanner_handles_prefixes_and_comments() {
        let src = "# '/not/a/literal.csv'\nx = r\"C:\\data\\a.csv\"\ny = f'{x}'\nz = '''multi\nline'''\nw = 'esc\\'aped'\n";
        let lits = string_literals(src);
        assert_eq!(lits, vec!["C:\\data\\a.csv", "{x}", "multi\nline", "esc\\'aped"]);
    }
}
