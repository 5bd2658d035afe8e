//! Property tests for extraction and classification.
//!
//! 1. Extractor losslessness: a single fenced block comes back byte-for-byte
//! 2. Extraction is always a slice of the response
//! 3. Classifier determinism: identical inputs give identical (kind, excerpt)
//! 4. Excerpts never exceed the byte budget

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use strategen_core::classify::{excerpt, EXCERPT_BUDGET};
use strategen_core::domain::{RunOutcome, RunStatus};
use strategen_core::{extract, Classifier, ClassifierRules, ExtractionMethod, Verdict};

// ── Strategies (proptest) ────────────────────────────────────────────

/// A code line that cannot be mistaken for a fence.
fn arb_code_line() -> impl Strategy<Value = String> {
    "[ \t]{0,8}[a-zA-Z0-9_=()\\[\\]:'\",.+*/ -]{0,60}[ \t]{0,3}"
}

fn arb_body() -> impl Strategy<Value = String> {
    prop::collection::vec(arb_code_line(), 1..30)
        .prop_map(|lines| lines.into_iter().map(|l| l + "\n").collect::<String>())
        .prop_filter("non-blank body", |b| !b.trim().is_empty())
}

fn arb_prose() -> impl Strategy<Value = String> {
    "[A-Za-z ,.!']{0,80}"
}

fn arb_status() -> impl Strategy<Value = RunStatus> {
    prop_oneof![
        Just(RunStatus::Ok),
        Just(RunStatus::NonzeroExit),
        Just(RunStatus::Timeout),
        Just(RunStatus::LauncherError),
    ]
}

fn arb_stderr() -> impl Strategy<Value = String> {
    let line = prop_oneof![
        Just("Traceback (most recent call last):".to_string()),
        "  File \"/tmp/bt\\.py\", line [0-9]{1,3}, in [a-z]{1,8}",
        "    [a-z_()=. ]{0,40}",
        "(ValueError|KeyError|NameError|SyntaxError|ModuleNotFoundError|FileNotFoundError): [a-z '/._]{0,40}",
        "[\\PC]{0,120}",
    ];
    prop::collection::vec(line, 0..80).prop_map(|lines| lines.join("\n"))
}

fn outcome(status: RunStatus, code: Option<i32>, stdout: String, stderr: String) -> RunOutcome {
    let t = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
    RunOutcome {
        status,
        exit_code: code,
        stdout,
        stderr,
        wall_time: 1.5,
        started_at: t,
        ended_at: t,
        cancelled: false,
    }
}

// ── 1–2. Extraction ──────────────────────────────────────────────────

proptest! {
    #[test]
    fn single_fenced_block_is_returned_unchanged(
        before in arb_prose(),
        lang in prop_oneof![Just(""), Just("python"), Just("py"), Just("Python3")],
        body in arb_body(),
        after in arb_prose(),
    ) {
        let response = format!("{before}\n```{lang}\n{body}```\n{after}");
        let extraction = extract(&response);
        prop_assert_eq!(extraction.method, ExtractionMethod::FencedBlock);
        prop_assert_eq!(extraction.source, body);
    }

    #[test]
    fn extraction_is_a_slice_of_the_response(response in "[\\PC\n`~]{0,400}") {
        let extraction = extract(&response);
        prop_assert_eq!(&response[extraction.span.clone()], extraction.source.as_str());
    }
}

// ── 3–4. Classification ──────────────────────────────────────────────

proptest! {
    #[test]
    fn classification_is_deterministic(
        status in arb_status(),
        code in prop::option::of(-5i32..5),
        stdout in "[\\PC\n]{0,200}",
        stderr in arb_stderr(),
        program in "[\\PC\n]{0,200}",
    ) {
        let classifier = Classifier::new(ClassifierRules {
            provided_modules: vec!["pandas".into()],
            completion_markers: vec!["Return".into()],
            min_output_lines: 1,
        });
        let run = outcome(status, code, stdout, stderr);

        let first = classifier.classify(&run, &program);
        let second = classifier.classify(&run.clone(), &program);
        prop_assert_eq!(&first, &second);
        if status != RunStatus::Ok {
            prop_assert!(matches!(first, Verdict::Failed(_)));
        }
    }

    #[test]
    fn excerpt_fits_the_budget(stderr in arb_stderr(), stdout in "[\\PC\n]{0,3000}") {
        let ex = excerpt(&stderr, &stdout);
        prop_assert!(ex.len() <= EXCERPT_BUDGET, "excerpt is {} bytes", ex.len());
    }
}
