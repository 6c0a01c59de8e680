//! Properties of the entry transformation and the `Log` codec.

use proptest::prelude::*;
use scribe_input::scribe::{decode_log_args, encode_log_call, LogEntry};
use scribe_input::thrift;
use scribe_input::transform::Transformer;
use scribe_input::{Config, MessageFormat};
use serde_json::{json, Value};

fn transformer(f: impl FnOnce(&mut Config)) -> Transformer {
    let mut config = Config::new(0);
    f(&mut config);
    Transformer::new(&config)
}

fn json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[a-z0-9 ]{0,8}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

proptest! {
    #[test]
    fn tag_is_category_without_prefix(category in "\\PC*") {
        let t = transformer(|_| {});
        prop_assert_eq!(t.tag(category.as_bytes()).unwrap(), category);
    }

    #[test]
    fn tag_is_prefixed(prefix in "[a-z][a-z.]{0,10}", category in "\\PC*") {
        let t = transformer(|c| c.add_prefix = Some(prefix.clone()));
        prop_assert_eq!(
            t.tag(category.as_bytes()).unwrap(),
            format!("{prefix}.{category}")
        );
    }

    #[test]
    fn text_without_newline_is_unchanged(message in "\\PC*", remove in any::<bool>()) {
        prop_assume!(!message.ends_with('\n'));
        let t = transformer(|c| c.remove_newline = remove);
        let record = t.record(message.as_bytes()).unwrap();
        let expected = json!(message);
        prop_assert_eq!(record.get("message"), Some(&expected));
    }

    #[test]
    fn one_trailing_newline(body in "\\PC*") {
        let message = format!("{body}\n");
        let stripped = transformer(|c| c.remove_newline = true);
        let kept = transformer(|_| {});
        let record = stripped.record(message.as_bytes()).unwrap();
        let expected = json!(body);
        prop_assert_eq!(record.get("message"), Some(&expected));
        let record = kept.record(message.as_bytes()).unwrap();
        let expected = json!(message);
        prop_assert_eq!(record.get("message"), Some(&expected));
    }

    #[test]
    fn json_objects_pass_through(
        object in prop::collection::btree_map("[a-z]{1,6}", json_value(), 0..6)
    ) {
        let object: serde_json::Map<String, Value> = object.into_iter().collect();
        let message = serde_json::to_vec(&object).unwrap();
        let t = transformer(|c| c.message_format = MessageFormat::Json);
        prop_assert_eq!(t.record(&message).unwrap(), object);
    }

    #[test]
    fn json_non_objects_are_refused(value in json_value()) {
        prop_assume!(!value.is_object());
        let message = serde_json::to_vec(&value).unwrap();
        let t = transformer(|c| c.message_format = MessageFormat::Json);
        prop_assert!(t.record(&message).is_err());
    }

    #[test]
    fn entries_survive_the_wire(
        pairs in prop::collection::vec(
            (prop::collection::vec(any::<u8>(), 0..16), prop::collection::vec(any::<u8>(), 0..64)),
            0..8,
        ),
        strict in any::<bool>(),
    ) {
        let entries: Vec<_> = pairs
            .iter()
            .map(|(category, message)| LogEntry { category, message })
            .collect();
        let payload = encode_log_call(1, &entries, strict).unwrap();
        let (header, body) = thrift::decode_message(&payload).unwrap();
        prop_assert_eq!(header.seq_id, 1);
        prop_assert_eq!(decode_log_args(body).unwrap(), entries);
    }

    #[test]
    fn arbitrary_bytes_never_panic(payload in prop::collection::vec(any::<u8>(), 0..256)) {
        if let Ok((_, body)) = thrift::decode_message(&payload) {
            let _ = decode_log_args(body);
        }
    }
}
