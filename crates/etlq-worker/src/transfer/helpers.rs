//! Small value helpers for writing transforms

use std::sync::LazyLock;

use regex::Regex;

use super::row::FieldValue;

#[allow(clippy::expect_used)]
static LINE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").expect("valid line break pattern"));

#[allow(clippy::expect_used)]
static PARAGRAPH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<p\s*/?>").expect("valid paragraph pattern"));

#[allow(clippy::expect_used)]
static ANY_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid tag pattern"));

#[allow(clippy::expect_used)]
static HTML_ELEMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<[a-z].*>").expect("valid element pattern"));

/// First value that is present and not null, otherwise NULL
pub fn coalesce<'a>(values: impl IntoIterator<Item = Option<&'a FieldValue>>) -> FieldValue {
    values
        .into_iter()
        .flatten()
        .find(|value| !value.is_null())
        .cloned()
        .unwrap_or(FieldValue::Null)
}

/// Whether `text` contains something that looks like an HTML element
pub fn is_html(text: &str) -> bool {
    HTML_ELEMENT.is_match(text)
}

/// Turn `<br>` into a newline, `<p>` into a blank line and drop every other tag
pub fn html_to_plain_text(html: &str) -> String {
    let text = LINE_BREAK.replace_all(html, "\n");
    let text = PARAGRAPH.replace_all(&text, "\n\n");
    ANY_TAG.replace_all(&text, "").into_owned()
}

/// Find the first parsable JSON object embedded in free text
///
/// Tries every `{` from the left against every `}` from the right, so the
/// widest valid object wins.
pub fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    let mut open = text.find('{')?;

    loop {
        let mut close = text.rfind('}')?;
        if close <= open {
            return None;
        }

        loop {
            if let Ok(value) = serde_json::from_str(&text[open..=close]) {
                return Some(value);
            }
            match text[..close].rfind('}') {
                Some(previous) if previous > open => close = previous,
                _ => break,
            }
        }

        open += 1 + text[open + 1..].find('{')?;
    }
}
