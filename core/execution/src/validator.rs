//! Static compliance scan applied before any code is parsed or run.
//!
//! Rejections here are policy, not syntax: the identifiers below reach for
//! capabilities the sandbox does not grant (dynamic evaluation, timers,
//! network, module loading, process control). All violations are collected
//! so the caller sees the full list, not just the first hit.

use crate::types::{ComplianceViolation, ExecutionError};
use regex::Regex;

pub const MAX_CODE_BYTES: usize = 1024 * 1024;
pub const MAX_INPUT_BYTES: usize = 10 * 1024;

const PROHIBITED_IDENTIFIERS: &[&str] = &[
    "eval",
    "Function",
    "setTimeout",
    "setInterval",
    "XMLHttpRequest",
    "fetch",
    "WebSocket",
    "require",
    "import",
    "process",
];

pub struct ComplianceChecker {
    patterns: Vec<(String, Regex)>,
}

impl Default for ComplianceChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl ComplianceChecker {
    pub fn new() -> Self {
        let patterns = PROHIBITED_IDENTIFIERS
            .iter()
            .map(|ident| {
                let re = Regex::new(&format!(r"\b{ident}\b"))
                    .expect("prohibited identifiers are valid regex literals");
                (ident.to_string(), re)
            })
            .collect();
        Self { patterns }
    }

    /// Check size ceilings and scan for prohibited identifiers.
    pub fn check(&self, code: &str, input_bytes: usize) -> Result<(), ExecutionError> {
        if code.len() > MAX_CODE_BYTES {
            return Err(ExecutionError::Compliance(vec![ComplianceViolation {
                identifier: format!("code exceeds {MAX_CODE_BYTES} bytes"),
                line: 0,
            }]));
        }
        if input_bytes > MAX_INPUT_BYTES {
            return Err(ExecutionError::Compliance(vec![ComplianceViolation {
                identifier: format!("input exceeds {MAX_INPUT_BYTES} bytes"),
                line: 0,
            }]));
        }

        let mut violations = Vec::new();
        for (line_idx, line) in code.lines().enumerate() {
            for (ident, re) in &self.patterns {
                if re.is_match(line) {
                    violations.push(ComplianceViolation {
                        identifier: ident.clone(),
                        line: line_idx as u32 + 1,
                    });
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ExecutionError::Compliance(violations))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_code_passes() {
        let checker = ComplianceChecker::new();
        assert!(checker
            .check("function main(input) { return input.value * 2; }", 10)
            .is_ok());
    }

    #[test]
    fn test_prohibited_identifier_rejected_with_line() {
        let checker = ComplianceChecker::new();
        let err = checker
            .check("let x = 1;\nlet y = eval(\"2\");", 0)
            .unwrap_err();
        match err {
            ExecutionError::Compliance(v) => {
                assert_eq!(v.len(), 1);
                assert_eq!(v[0].identifier, "eval");
                assert_eq!(v[0].line, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_all_violations_collected() {
        let checker = ComplianceChecker::new();
        let err = checker
            .check("fetch(url);\nrequire(\"fs\");\nsetTimeout(f, 1);", 0)
            .unwrap_err();
        match err {
            ExecutionError::Compliance(v) => assert_eq!(v.len(), 3),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_word_boundary_avoids_substrings() {
        let checker = ComplianceChecker::new();
        // "evaluate" and "important" contain prohibited substrings but are
        // legitimate identifiers.
        assert!(checker
            .check("let evaluate = 1; let important = 2;", 0)
            .is_ok());
    }

    #[test]
    fn test_size_ceilings() {
        let checker = ComplianceChecker::new();
        let big_code = "x".repeat(MAX_CODE_BYTES + 1);
        assert!(matches!(
            checker.check(&big_code, 0),
            Err(ExecutionError::Compliance(_))
        ));
        assert!(matches!(
            checker.check("let x = 1;", MAX_INPUT_BYTES + 1),
            Err(ExecutionError::Compliance(_))
        ));
    }
}
