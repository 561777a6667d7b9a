//! Property tests for the classifier and fragment reassembly

use super::intent::{detect_auth_intent, AuthIntent};
use crate::llm::{ToolCallBuilder, ToolCallFragment};
use proptest::prelude::*;

proptest! {
    #[test]
    fn any_standalone_six_digit_code_is_detected(code in 100_000u32..=999_999) {
        let text = format!("the code is {code}, thanks");
        prop_assert_eq!(
            detect_auth_intent(&text, false),
            Some(AuthIntent::VerifyCode { code })
        );
        // Authenticated conversations never classify
        prop_assert_eq!(detect_auth_intent(&text, true), None);
    }

    #[test]
    fn classification_is_pure(text in ".{0,80}") {
        let first = detect_auth_intent(&text, false);
        let second = detect_auth_intent(&text, false);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn introductions_capture_trimmed_names(name in "[A-Za-z]{2,12}( [A-Za-z]{2,12})?") {
        let text = format!("hello, my name is {name}");
        prop_assert_eq!(
            detect_auth_intent(&text, false),
            Some(AuthIntent::RequestAuth { name: name.clone() })
        );
    }

    #[test]
    fn fragments_reassemble_regardless_of_split(
        item in "[a-z0-9 ]{1,40}",
        cuts in proptest::collection::vec(1usize..100, 0..4),
    ) {
        let full = serde_json::json!({ "item": item }).to_string();

        let mut points: Vec<usize> = cuts.into_iter().map(|c| c % full.len()).collect();
        points.sort_unstable();
        points.dedup();

        let mut builder = ToolCallBuilder::default();
        let mut prev = 0;
        let bytes = full.as_bytes();
        for (i, point) in points.iter().chain(std::iter::once(&full.len())).enumerate() {
            if *point <= prev && *point != full.len() {
                continue;
            }
            let chunk = String::from_utf8(bytes.get(prev..*point).unwrap_or_default().to_vec())
                .expect("ascii chunk");
            builder.apply(&ToolCallFragment {
                index: 0,
                id: (i == 0).then(|| "call_1".to_string()),
                name: (i == 0).then(|| "create_shopping_request".to_string()),
                arguments: Some(chunk),
            });
            prev = *point;
        }

        prop_assert_eq!(&builder.arguments, &full);
        let parsed: serde_json::Value = serde_json::from_str(&builder.arguments).expect("valid json");
        prop_assert_eq!(parsed["item"].as_str(), Some(item.as_str()));
    }
}
