//! Import policy applied between extraction and execution.

use crate::domain::{ClassifiedError, ErrorKind};

/// Modules a generated program may not import. Listing `backtesting.lib`
/// also forbids `from backtesting import lib` and any submodule of it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportPolicy {
    forbidden: Vec<String>,
}

/// First forbidden import found in a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportViolation {
    /// 1-based line number.
    pub line_number: usize,
    pub line: String,
    pub module: String,
    pub rule: String,
}

impl ImportViolation {
    /// The violation as fed back to the debug model.
    pub fn to_classified(&self) -> ClassifiedError {
        ClassifiedError::new(
            ErrorKind::Import,
            format!(
                "ImportPolicyError: line {}: {}\nimporting `{}` is not allowed",
                self.line_number,
                self.line.trim(),
                self.module
            ),
        )
        .with_hint(format!("`{}` is on the forbidden import list", self.rule))
    }
}

impl ImportPolicy {
    pub fn new<I, S>(forbidden: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            forbidden: forbidden
                .into_iter()
                .map(Into::<String>::into)
                .filter(|m| !m.trim().is_empty())
                .collect(),
        }
    }

    pub fn is_inert(&self) -> bool {
        self.forbidden.is_empty()
    }

    pub fn check(&self, source: &str) -> Option<ImportViolation> {
        if self.is_inert() {
            return None;
        }
        for (idx, line) in source.lines().enumerate() {
            for module in imported_modules(line) {
                if let Some(rule) = self.matching_rule(&module) {
                    return Some(ImportViolation {
                        line_number: idx + 1,
                        line: line.to_string(),
                        module,
                        rule: rule.to_string(),
                    });
                }
            }
        }
        None
    }

    fn matching_rule(&self, module: &str) -> Option<&str> {
        self.forbidden
            .iter()
            .map(String::as_str)
            .find(|rule| module == *rule || module.starts_with(&format!("{rule}.")))
    }
}

/// Module paths a single import statement brings in. For
/// `from pkg import a, b` both `pkg` and `pkg.a`, `pkg.b` are reported.
fn imported_modules(line: &str) -> Vec<String> {
    let stmt = line.split('#').next().unwrap_or("").trim();

    if let Some(rest) = stmt.strip_prefix("import ") {
        return rest
            .split(',')
            .filter_map(|part| part.split_whitespace().next())
            .map(str::to_string)
            .collect();
    }

    if let Some(rest) = stmt.strip_prefix("from ") {
        let Some((pkg, names)) = rest.split_once(" import ") else {
            return Vec::new();
        };
        let pkg = pkg.trim();
        let mut modules = vec![pkg.to_string()];
        modules.extend(
            names
                .trim_matches(|c: char| c == '(' || c == ')' || c.is_whitespace())
                .split(',')
                .filter_map(|part| part.split_whitespace().next())
                .filter(|name| *name != "*")
                .map(|name| format!("{pkg}.{name}")),
        );
        return modules;
    }

    Vec::new()
}
