//! Property tests for the query classifier
//!
//! The classifier is the only piece of the router that consumes raw user
//! text, so it gets fuzzed: arbitrary unicode must never panic, scores and
//! confidence must stay inside their documented ranges, and the routing
//! decision must stay consistent with the published thresholds.

use duoroute::brain::classifier::QueryClassifier;
use duoroute::brain::messages::NormalizedTurn;
use duoroute::brain::Role;
use duoroute::config::ClassifierConfig;
use proptest::prelude::*;

fn classifier() -> QueryClassifier {
    QueryClassifier::new(
        &ClassifierConfig::default(),
        "agent-30b".to_string(),
        "direct-8b".to_string(),
    )
}

fn history(contents: &[String]) -> Vec<NormalizedTurn> {
    contents
        .iter()
        .enumerate()
        .map(|(i, content)| NormalizedTurn {
            role: if i % 2 == 0 { Role::User } else { Role::Assistant },
            content: content.clone(),
        })
        .collect()
}

proptest! {
    /// Arbitrary unicode in the utterance, history, and system prompt must
    /// produce a score in [0, 1] and a capped confidence, never a panic.
    #[test]
    fn scores_stay_in_bounds(
        utterance in ".{0,300}",
        turns in prop::collection::vec(".{0,80}", 0..16),
        system_prompt in ".{0,400}",
    ) {
        let result = classifier().classify(Some(&utterance), &history(&turns), &system_prompt);

        prop_assert!((0.0..=1.0).contains(&result.complexity_score()),
            "complexity {} out of range", result.complexity_score());
        prop_assert!((0.0..=0.95).contains(&result.confidence()),
            "confidence {} out of range", result.confidence());
        prop_assert!(!result.reasoning().is_empty());
    }

    /// Same input, same answer: classification carries no hidden state.
    #[test]
    fn classification_is_deterministic(
        utterance in ".{1,200}",
        turns in prop::collection::vec(".{0,80}", 0..8),
    ) {
        let h = history(&turns);
        let first = classifier().classify(Some(&utterance), &h, "");
        let second = classifier().classify(Some(&utterance), &h, "");

        prop_assert_eq!(first.route_to_agent(), second.route_to_agent());
        prop_assert_eq!(first.complexity_score(), second.complexity_score());
        prop_assert_eq!(first.confidence(), second.confidence());
        prop_assert_eq!(first.detected_patterns(), second.detected_patterns());
    }

    /// Appending explicit tool phrasing can only push the score up. Length
    /// and category components are both monotone under extension, and the
    /// suffix contains no conversational markers that could subtract.
    #[test]
    fn tool_phrasing_never_lowers_the_score(base in ".{1,200}") {
        prop_assume!(!base.trim().is_empty());

        let extended = format!("{base} create a task and assign it to the operations team");
        let plain = classifier().classify(Some(&base), &[], "");
        let loaded = classifier().classify(Some(&extended), &[], "");

        prop_assert!(
            loaded.complexity_score() >= plain.complexity_score(),
            "score dropped from {} to {} after adding tool phrasing",
            plain.complexity_score(),
            loaded.complexity_score()
        );
        prop_assert!(loaded.detected_patterns().contains("tool-intent"));
    }

    /// The routing decision is a pure function of score and confidence
    /// against the configured thresholds.
    #[test]
    fn route_decision_matches_thresholds(utterance in ".{1,300}") {
        let result = classifier().classify(Some(&utterance), &[], "");

        let expected = result.complexity_score() >= 0.45 || result.confidence() < 0.60;
        prop_assert_eq!(
            result.route_to_agent(),
            expected,
            "route {} inconsistent with score {} / confidence {}",
            result.route_to_agent(),
            result.complexity_score(),
            result.confidence()
        );
    }

    /// Whitespace-only utterances are indistinguishable from missing ones
    /// and take the conservative default.
    #[test]
    fn blank_utterances_take_conservative_default(blank in "[ \t\r\n]{0,40}") {
        let result = classifier().classify(Some(&blank), &[], "");

        prop_assert!(result.route_to_agent(), "conservative default must route to agent");
        prop_assert_eq!(result.confidence(), 0.5);
        prop_assert!(result.detected_patterns().is_empty());
    }

    /// Deeper histories never lower the score for the same utterance.
    #[test]
    fn history_depth_is_monotone(
        utterance in ".{1,120}",
        depth_a in 0usize..16,
        depth_b in 0usize..16,
    ) {
        prop_assume!(!utterance.trim().is_empty());
        let (shallow, deep) = if depth_a <= depth_b {
            (depth_a, depth_b)
        } else {
            (depth_b, depth_a)
        };
        let filler: Vec<String> = (0..deep).map(|i| format!("turn {i}")).collect();

        let short = classifier().classify(Some(&utterance), &history(&filler[..shallow]), "");
        let long = classifier().classify(Some(&utterance), &history(&filler[..deep]), "");

        prop_assert!(
            long.complexity_score() >= short.complexity_score(),
            "score dropped from {} to {} as history grew",
            short.complexity_score(),
            long.complexity_score()
        );
    }
}
