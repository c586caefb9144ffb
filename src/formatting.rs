//! Name sanitization and helpers for rendering the Prometheus [exposition
//! format].
//!
//! [exposition format]: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#text-format-details

/// Coerces an arbitrary string into a valid Prometheus identifier.
///
/// Every character outside `[A-Za-z0-9_]` becomes `_`, and a leading ASCII
/// digit gets an underscore prepended. Applied to incoming metric names and
/// DogStatsD tag keys, which are untrusted. Idempotent.
pub fn escape_metric_name(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len() + 1);
    if name.as_bytes().first().is_some_and(u8::is_ascii_digit) {
        escaped.push('_');
    }
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            escaped.push(c);
        } else {
            escaped.push('_');
        }
    }
    escaped
}

/// Writes a `# HELP` line for a metric.
pub fn write_help_line(buffer: &mut String, name: &str, help: &str) {
    buffer.push_str("# HELP ");
    buffer.push_str(name);
    buffer.push(' ');
    buffer.push_str(&escape_help(help));
    buffer.push('\n');
}

/// Writes a `# TYPE` line for a metric.
pub fn write_type_line(buffer: &mut String, name: &str, metric_type: &str) {
    buffer.push_str("# TYPE ");
    buffer.push_str(name);
    buffer.push(' ');
    buffer.push_str(metric_type);
    buffer.push('\n');
}

/// Writes one sample line.
///
/// `suffix` is appended to the name (for `_sum`, `_count` and `_bucket`
/// series), and `extra_label` carries the data-type-specific label such as
/// `le` for histogram buckets or `quantile` for summaries.
pub fn write_metric_line<T: std::fmt::Display>(
    buffer: &mut String,
    name: &str,
    suffix: Option<&'static str>,
    label_names: &[String],
    label_values: &[String],
    extra_label: Option<(&'static str, &str)>,
    value: T,
) {
    buffer.push_str(name);
    if let Some(suffix) = suffix {
        buffer.push('_');
        buffer.push_str(suffix);
    }

    if !label_names.is_empty() || extra_label.is_some() {
        buffer.push('{');
        let mut first = true;
        for (name, value) in label_names.iter().zip(label_values) {
            if !first {
                buffer.push(',');
            }
            first = false;
            buffer.push_str(name);
            buffer.push_str("=\"");
            buffer.push_str(&escape_label_value(value));
            buffer.push('"');
        }
        if let Some((name, value)) = extra_label {
            if !first {
                buffer.push(',');
            }
            buffer.push_str(name);
            buffer.push_str("=\"");
            buffer.push_str(value);
            buffer.push('"');
        }
        buffer.push('}');
    }

    buffer.push(' ');
    buffer.push_str(&value.to_string());
    buffer.push('\n');
}

/// Escapes a label value: backslashes, double quotes and line feeds must be
/// escaped in the text format.
pub fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}

// Help text follows the same rules as label values, minus the quote escape.
fn escape_help(help: &str) -> String {
    let mut escaped = String::with_capacity(help.len());
    for c in help.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_escape_metric_name_known_cases() {
        let cases = &[
            ("foo_bar", "foo_bar"),
            ("foo.bar", "foo_bar"),
            ("foo-bar", "foo_bar"),
            ("9xyz", "_9xyz"),
            ("net.tx:rate", "net_tx_rate"),
            ("Ünïcode", "_n_code"),
            ("", ""),
        ];

        for (input, expected) in cases {
            assert_eq!(*expected, escape_metric_name(input));
        }
    }

    #[test]
    fn test_escape_label_value() {
        assert_eq!("a\\\\b", escape_label_value("a\\b"));
        assert_eq!("say \\\"hi\\\"", escape_label_value("say \"hi\""));
        assert_eq!("two\\nlines", escape_label_value("two\nlines"));
    }

    #[test]
    fn test_write_metric_line() {
        let mut out = String::new();
        write_metric_line(
            &mut out,
            "http_requests",
            None,
            &["code".to_string(), "method".to_string()],
            &["200".to_string(), "get".to_string()],
            None,
            3.0,
        );
        assert_eq!(out, "http_requests{code=\"200\",method=\"get\"} 3\n");

        let mut out = String::new();
        write_metric_line(&mut out, "rpc_duration", Some("bucket"), &[], &[], Some(("le", "0.5")), 7u64);
        assert_eq!(out, "rpc_duration_bucket{le=\"0.5\"} 7\n");
    }

    proptest! {
        #[test]
        fn test_escape_metric_name_output_is_valid(input in ".*") {
            let result = escape_metric_name(&input);

            if let Some(first) = result.chars().next() {
                prop_assert!(first.is_ascii_alphabetic() || first == '_');
            }
            prop_assert!(result.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        }

        #[test]
        fn test_escape_metric_name_idempotent(input in ".*") {
            let once = escape_metric_name(&input);
            prop_assert_eq!(escape_metric_name(&once), once);
        }

        #[test]
        fn test_escape_label_value_no_raw_newlines(input in ".*") {
            let result = escape_label_value(&input);
            prop_assert!(!result.contains('\n'));
        }
    }
}
