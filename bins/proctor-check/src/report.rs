/// Failure reports: what the operator sees when cases fail.
///
/// Every failure gets a one-line header; output-mismatch failures
/// additionally get the configured rendering of expected vs actual.

use std::io::{self, Write};

use clap::ValueEnum;
use difference::{Changeset, Difference};
use proctor_common::Outcome;

const BANNER: &str = "=================================================";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    /// Context-style line diff of expected vs actual.
    Diff,
    /// Full dump of both texts.
    Full,
    /// Escaped literal representation of both texts.
    Repr,
    /// Headers only.
    None,
}

/// Render failing outcomes. Only `diff`-classified failures carry a text
/// comparison worth rendering; other classifications are fully described by
/// their header line.
pub fn render_failures(
    failures: &[&Outcome],
    format: ReportFormat,
    out: &mut dyn Write,
) -> io::Result<()> {
    for outcome in failures {
        writeln!(out, "{}", outcome.label())?;
        if outcome.message != "diff" {
            continue;
        }
        let expected = outcome.expected_text.as_deref().unwrap_or_default();
        let actual = outcome.actual_text.as_deref().unwrap_or_default();
        match format {
            ReportFormat::Diff => render_diff(expected, actual, out)?,
            ReportFormat::Full => render_full(expected, actual, out)?,
            ReportFormat::Repr => {
                writeln!(out, "expected: {expected:?}")?;
                writeln!(out, "  actual: {actual:?}")?;
            }
            ReportFormat::None => {}
        }
    }
    Ok(())
}

fn render_diff(expected: &str, actual: &str, out: &mut dyn Write) -> io::Result<()> {
    let changeset = Changeset::new(expected, actual, "\n");
    for diff in &changeset.diffs {
        match diff {
            Difference::Same(lines) => {
                for line in lines.lines() {
                    writeln!(out, "  {line}")?;
                }
            }
            Difference::Rem(lines) => {
                for line in lines.lines() {
                    writeln!(out, "- {line}")?;
                }
            }
            Difference::Add(lines) => {
                for line in lines.lines() {
                    writeln!(out, "+ {line}")?;
                }
            }
        }
    }
    Ok(())
}

fn render_full(expected: &str, actual: &str, out: &mut dyn Write) -> io::Result<()> {
    writeln!(out, "{BANNER}")?;
    writeln!(out, "EXPECTED")?;
    writeln!(out, "{BANNER}")?;
    write!(out, "{expected}")?;
    writeln!(out, "{BANNER}")?;
    writeln!(out, "{BANNER}")?;
    writeln!(out, "ACTUAL")?;
    writeln!(out, "{BANNER}")?;
    write!(out, "{actual}")?;
    writeln!(out, "{BANNER}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctor_common::Fixture;
    use std::path::PathBuf;

    fn diff_outcome() -> Outcome {
        Outcome {
            passed: false,
            executable: PathBuf::from("/proj/q1/build/q1"),
            fixture: Fixture::new(
                Some(PathBuf::from("/proj/q1/1-input.txt")),
                Some(PathBuf::from("/proj/q1/1-expected.txt")),
                None,
                Vec::new(),
            ),
            expected_text: Some("Sum = 3\n".to_string()),
            actual_text: Some("Sum = 4\n".to_string()),
            message: "diff".to_string(),
        }
    }

    fn rendered(outcome: &Outcome, format: ReportFormat) -> String {
        let mut buffer = Vec::new();
        render_failures(&[outcome], format, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn header_names_executable_case_and_message() {
        let text = rendered(&diff_outcome(), ReportFormat::None);
        assert_eq!(text, "q1: 1-input.txt: diff\n");
    }

    #[test]
    fn diff_format_marks_both_sides() {
        let text = rendered(&diff_outcome(), ReportFormat::Diff);
        assert!(text.contains("- Sum = 3"));
        assert!(text.contains("+ Sum = 4"));
    }

    #[test]
    fn full_format_dumps_both_texts_between_banners() {
        let text = rendered(&diff_outcome(), ReportFormat::Full);
        assert!(text.contains("EXPECTED"));
        assert!(text.contains("ACTUAL"));
        assert!(text.contains("Sum = 3\n"));
        assert!(text.contains("Sum = 4\n"));
    }

    #[test]
    fn repr_format_escapes_texts() {
        let text = rendered(&diff_outcome(), ReportFormat::Repr);
        assert!(text.contains("expected: \"Sum = 3\\n\""));
        assert!(text.contains("  actual: \"Sum = 4\\n\""));
    }

    #[test]
    fn non_diff_failures_render_header_only() {
        let mut outcome = diff_outcome();
        outcome.message = "bad exit code: expected 0, got 1".to_string();
        let text = rendered(&outcome, ReportFormat::Diff);
        assert_eq!(text, "q1: 1-input.txt: bad exit code: expected 0, got 1\n");
    }
}
