//! Source-located reports for translation failures.
//!
//! A [`Diagnostic`] ties a decode or expression-building [`Error`] back to
//! the disassembly lines that caused it and renders it with ariadne.

use std::io;
use std::ops::Range;

use ariadne::{Color, Config, Label, Report, ReportKind, Source};

use crate::error::Error;
use crate::parsing::trace::ClosureTrace;
use crate::span::Span;

#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub message: String,
    /// Trace position of the instruction at fault, when there is one.
    pub position: Option<usize>,
    /// Listing bytes the label points at; empty when nothing is located.
    pub span: Span,
    pub label: String,
    pub note: Option<String>,
    pub help: Option<String>,
}

impl Diagnostic {
    pub fn from_translation_error(err: &Error, trace: &ClosureTrace) -> Self {
        match err {
            Error::UnsupportedInstruction { mnemonic, position } => Self {
                message: format!("unsupported instruction `{}`", mnemonic),
                position: Some(*position),
                span: instruction_span(trace, *position),
                label: format!("instruction {} has no kernel equivalent", position),
                note: Some(
                    "only local loads, integer pushes and + - * / are translated".to_string(),
                ),
                help: Some("rewrite the closure as a flat arithmetic expression".to_string()),
            },
            Error::MalformedExpression(detail) => Self {
                message: format!("malformed expression: {}", detail),
                position: None,
                span: trace_span(trace),
                label: format!(
                    "these {} instructions do not reduce to one value",
                    trace.instructions().len()
                ),
                note: None,
                help: None,
            },
            other => Self {
                message: other.to_string(),
                position: None,
                span: Span::dummy(),
                label: String::new(),
                note: None,
                help: None,
            },
        }
    }

    /// Write the report for `source` (the listing named `filename`) to `out`.
    pub fn write(
        &self,
        filename: &str,
        source: &str,
        color: bool,
        out: impl io::Write,
    ) -> io::Result<()> {
        self.report(filename, color)
            .write((filename, Source::from(source)), out)
    }

    fn report<'a>(&'a self, filename: &'a str, color: bool) -> Report<'a, (&'a str, Range<usize>)> {
        let mut report = Report::build(ReportKind::Error, filename, self.span.start as usize)
            .with_config(Config::default().with_color(color))
            .with_message(&self.message);
        if !self.span.is_empty() {
            report = report.with_label(
                Label::new((filename, self.span.start as usize..self.span.end as usize))
                    .with_message(&self.label)
                    .with_color(Color::Red),
            );
        }
        if let Some(note) = &self.note {
            report = report.with_note(note);
        }
        if let Some(help) = &self.help {
            report = report.with_help(help);
        }
        report.finish()
    }
}

fn instruction_span(trace: &ClosureTrace, position: usize) -> Span {
    trace
        .instructions()
        .get(position)
        .and_then(|inst| inst.span)
        .unwrap_or_else(Span::dummy)
}

fn trace_span(trace: &ClosureTrace) -> Span {
    trace
        .instructions()
        .iter()
        .filter_map(|inst| inst.span)
        .reduce(Span::merge)
        .unwrap_or_else(Span::dummy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::decode::decode;
    use crate::parsing::translate;

    const LISTING: &str = "\
== disasm: #<ISeq:block in <main>@-e:1 (1,7)-(1,21)>
0000 getlocal_WC_0                          x@0
0002 putobject                              7
0004 opt_mod                                <calldata!mid:%, argc:1>
0006 leave
";

    fn plain(d: &Diagnostic, source: &str) -> String {
        let mut out = Vec::new();
        d.write("block.disasm", source, false, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_unsupported_instruction_points_at_line() {
        let trace = ClosureTrace::from_disassembly(LISTING);
        let err = decode(&trace).unwrap_err();
        let d = Diagnostic::from_translation_error(&err, &trace);
        assert_eq!(d.position, Some(2));
        let pointed = &LISTING[d.span.start as usize..d.span.end as usize];
        assert!(pointed.starts_with("opt_mod"), "pointed at {pointed:?}");

        let text = plain(&d, LISTING);
        assert!(text.contains("unsupported instruction `opt_mod`"));
        assert!(text.contains("instruction 2 has no kernel equivalent"));
        assert!(text.contains("rewrite the closure as a flat arithmetic expression"));
    }

    #[test]
    fn test_malformed_expression_spans_whole_trace() {
        let listing = "0000 putobject 3\n0002 putobject 4\n0004 leave\n";
        let trace = ClosureTrace::from_disassembly(listing);
        let err = translate(&trace).unwrap_err();
        assert!(matches!(err, Error::MalformedExpression(_)));

        let d = Diagnostic::from_translation_error(&err, &trace);
        assert_eq!(d.position, None);
        let pointed = &listing[d.span.start as usize..d.span.end as usize];
        assert!(pointed.starts_with("putobject 3"), "pointed at {pointed:?}");
        assert!(pointed.ends_with('4'), "pointed at {pointed:?}");
        assert!(plain(&d, listing).contains("these 2 instructions do not reduce to one value"));
    }

    #[test]
    fn test_unlocated_error_has_no_label() {
        let trace = ClosureTrace::from_disassembly(LISTING);
        let d = Diagnostic::from_translation_error(&Error::NoDataLoaded, &trace);
        assert!(d.span.is_empty());
        assert!(d.note.is_none());
        assert!(plain(&d, LISTING).contains("no dataset loaded on device"));
    }
}
