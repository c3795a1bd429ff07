//! Topic naming for the broker
//!
//! Every topic this bridge publishes or subscribes to lives under one of two
//! roots: the machine prefix or the global broadcast prefix. Logical topic names
//! are appended verbatim, so stripping a root always recovers the original name.

/// Normalize a configured prefix into a topic root.
///
/// Surrounding whitespace and slashes are removed and consecutive slashes are
/// collapsed, so `"/iotlink//desktop/"` becomes `"iotlink/desktop"`.
pub fn sanitize_prefix(prefix: &str) -> String {
    let mut result = prefix.to_string();

    while result.contains("//") {
        result = result.replace("//", "/");
    }

    result
        .trim_matches(|c: char| c == '/' || c.is_whitespace())
        .to_string()
}

/// Fully-qualified topic under the machine prefix.
///
/// An empty name yields the root itself.
pub fn full_topic_name(prefix: &str, name: &str) -> String {
    let root = sanitize_prefix(prefix);
    if name.is_empty() {
        root
    } else if root.is_empty() {
        name.to_string()
    } else {
        format!("{root}/{name}")
    }
}

/// Fully-qualified topic under the global broadcast prefix
pub fn global_topic_name(global_prefix: &str, name: &str) -> String {
    full_topic_name(global_prefix, name)
}

/// Strip one configured root from an inbound topic, if present
pub fn strip_prefix(topic: &str, prefix: &str) -> Option<String> {
    let root = sanitize_prefix(prefix);
    if root.is_empty() {
        return Some(topic.to_string());
    }
    if topic == root {
        return Some(String::new());
    }

    topic
        .strip_prefix(root.as_str())
        .and_then(|rest| rest.strip_prefix('/'))
        .map(str::to_string)
}

/// Recover the logical topic name from an inbound broker topic.
///
/// When both roots match, the longer one wins, so a global prefix nested
/// under the machine prefix (`iotlink` and `iotlink/all`) still strips as
/// global. Topics under neither root are returned unchanged.
pub fn strip_topic_prefixes(topic: &str, prefix: &str, global_prefix: &str) -> String {
    let machine = sanitize_prefix(prefix);
    let global = sanitize_prefix(global_prefix);

    let roots = if global.len() > machine.len() {
        [global_prefix, prefix]
    } else {
        [prefix, global_prefix]
    };

    roots
        .iter()
        .find_map(|root| strip_prefix(topic, root))
        .unwrap_or_else(|| topic.to_string())
}

/// Wildcard subscriptions covering both roots
pub fn subscription_filters(prefix: &str, global_prefix: &str) -> [String; 2] {
    [
        full_topic_name(prefix, "#"),
        global_topic_name(global_prefix, "#"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn strip_inverts_qualify(
            topic in "[A-Za-z0-9 _/#+-]{0,40}",
            prefix in "[a-z]{1,8}(/[a-z0-9]{1,8}){0,3}",
        ) {
            let qualified = full_topic_name(&prefix, &topic);
            prop_assert_eq!(strip_topic_prefixes(&qualified, &prefix, "broadcast/all"), topic);
        }

        #[test]
        fn strip_inverts_global_qualify(
            topic in "[A-Za-z0-9 _/-]{0,40}",
            global in "[a-z]{1,8}/all",
        ) {
            let qualified = global_topic_name(&global, &topic);
            prop_assert_eq!(strip_topic_prefixes(&qualified, "machine/desktop", &global), topic);
        }

        #[test]
        fn sanitize_prefix_is_idempotent(prefix in ".*") {
            let once = sanitize_prefix(&prefix);
            prop_assert_eq!(sanitize_prefix(&once), once.clone());
        }
    }

    #[test]
    fn test_full_topic_name() {
        assert_eq!(
            full_topic_name("iotlink/workgroup/desktop", "stats/cpu"),
            "iotlink/workgroup/desktop/stats/cpu"
        );
        assert_eq!(full_topic_name("/iotlink//desktop/", "lwt"), "iotlink/desktop/lwt");
        assert_eq!(full_topic_name("iotlink", ""), "iotlink");
        assert_eq!(full_topic_name("", "lwt"), "lwt");
    }

    #[test]
    fn test_strip_requires_segment_boundary() {
        // "iotlink2" must not be treated as living under "iotlink"
        assert_eq!(strip_prefix("iotlink2/refresh", "iotlink"), None);
        assert_eq!(strip_prefix("iotlink/refresh", "iotlink"), Some("refresh".into()));
        assert_eq!(strip_prefix("iotlink", "iotlink"), Some(String::new()));
    }

    #[test]
    fn test_strip_topic_prefixes_prefers_machine_root() {
        assert_eq!(
            strip_topic_prefixes("iotlink/desktop/refresh", "iotlink/desktop", "iotlink/all"),
            "refresh"
        );
        assert_eq!(
            strip_topic_prefixes("iotlink/all/commands/notify", "iotlink/desktop", "iotlink/all"),
            "commands/notify"
        );
        assert_eq!(
            strip_topic_prefixes("other/topic", "iotlink/desktop", "iotlink/all"),
            "other/topic"
        );
    }

    #[test]
    fn test_nested_global_prefix_strips_as_global() {
        let defaults = crate::config::MqttSection::default();
        assert_eq!(
            strip_topic_prefixes("iotlink/all/refresh", &defaults.prefix, &defaults.global_prefix),
            "refresh"
        );
        assert_eq!(
            strip_topic_prefixes(
                "iotlink/all/commands/notify",
                &defaults.prefix,
                &defaults.global_prefix
            ),
            "commands/notify"
        );
        assert_eq!(
            strip_topic_prefixes("iotlink/stats/cpu", &defaults.prefix, &defaults.global_prefix),
            "stats/cpu"
        );
    }

    #[test]
    fn test_subscription_filters() {
        let [machine, global] = subscription_filters("iotlink/desktop", "iotlink/all/");
        assert_eq!(machine, "iotlink/desktop/#");
        assert_eq!(global, "iotlink/all/#");
    }
}
