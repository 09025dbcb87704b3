//! Property tests for the wire-level validation and codec helpers.

use proptest::prelude::*;

use mitos::domain::models::envelope::{validate_identifier, TraceContext};
use mitos::domain::models::mission::parse_duration;
use mitos::domain::models::Envelope;

proptest! {
    /// The hand-rolled validator agrees with the published pattern.
    #[test]
    fn identifier_validator_matches_reference_pattern(input in "\\PC{0,80}") {
        let reference = regex::Regex::new("^[a-z]([-a-z0-9]{0,61}[a-z0-9])?$").unwrap();
        prop_assert_eq!(validate_identifier(&input), reference.is_match(&input));
    }

    /// Well-formed identifiers are always accepted.
    #[test]
    fn generated_identifiers_are_accepted(input in "[a-z]([-a-z0-9]{0,40}[a-z0-9])?") {
        prop_assert!(validate_identifier(&input));
    }

    /// Duration strings with supported units parse to the expected seconds.
    #[test]
    fn durations_parse_exactly(value in 0u64..100_000, unit in prop::sample::select(vec!["s", "m", "h", ""])) {
        let parsed = parse_duration(&format!("{value}{unit}")).unwrap();
        let multiplier = match unit {
            "m" => 60,
            "h" => 3600,
            _ => 1,
        };
        prop_assert_eq!(parsed.as_secs(), value * multiplier);
    }

    /// Envelopes survive a JSON round trip with id and payload intact.
    #[test]
    fn envelope_json_round_trip(from in "[a-z]{1,10}", to in "[a-z]{1,10}", content in "\\PC{0,200}") {
        let envelope = Envelope::message(from, to, content.clone());
        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(parsed.id, envelope.id);
        prop_assert_eq!(parsed.content(), content);
    }

    /// Trace context parsing accepts exactly the well-formed 00-version
    /// headers it produces.
    #[test]
    fn traceparent_round_trip(trace in "[0-9a-f]{32}", span in "[0-9a-f]{16}") {
        prop_assume!(!trace.chars().all(|c| c == '0'));
        prop_assume!(!span.chars().all(|c| c == '0'));

        let ctx = TraceContext::from_ids(&trace, &span);
        let (parsed_trace, parsed_span) = ctx.parse().unwrap();
        prop_assert_eq!(parsed_trace, trace);
        prop_assert_eq!(parsed_span, span);
    }
}
