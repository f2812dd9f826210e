//! Plain-text extraction for message bodies.
//!
//! Provider bodies arrive either as HTML or as plain text. The pipeline keeps
//! the raw HTML and derives a tag-stripped, whitespace-collapsed text form
//! plus a bounded preview from it.

use scraper::{Html, Node};

/// Elements whose text never reaches the reader.
const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "head", "noscript", "template"];

/// Elements that start a new line of text when rendered.
const BLOCK_ELEMENTS: &[&str] = &[
    "html", "body", "p", "div", "br", "li", "ul", "ol", "tr", "td", "th", "table", "h1", "h2",
    "h3", "h4", "h5", "h6", "blockquote", "pre", "hr", "section", "article", "header", "footer",
];

/// Convert an HTML body to readable plain text.
///
/// Inline markup joins its text as written; block boundaries and `<br>`
/// become a single space.
pub fn html_to_text(html: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }

    let document = Html::parse_document(html);
    let mut out = String::with_capacity(html.len() / 2);
    let mut last_block = None;

    for node in document.tree.root().descendants() {
        let text = match node.value() {
            Node::Text(text) => text,
            Node::Element(el) if el.name() == "br" => {
                out.push(' ');
                continue;
            }
            _ => continue,
        };
        let hidden = node.ancestors().any(|a| match a.value() {
            Node::Element(el) => SKIPPED_ELEMENTS.contains(&el.name()),
            _ => false,
        });
        if hidden {
            continue;
        }

        let block = node
            .ancestors()
            .find(|a| matches!(a.value(), Node::Element(el) if BLOCK_ELEMENTS.contains(&el.name())))
            .map(|a| a.id());
        if block != last_block {
            out.push(' ');
            last_block = block;
        }
        out.push_str(text);
    }

    collapse_whitespace(&out)
}

/// Normalize a body of the given provider content type to plain text.
pub fn body_to_text(content: &str, content_type: &str) -> String {
    if content_type.eq_ignore_ascii_case("html") {
        html_to_text(content)
    } else {
        collapse_whitespace(content)
    }
}

/// Replace every run of whitespace with a single space and trim.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First `max_chars` characters of `s`, never splitting a code point.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Bounded preview with an ellipsis when the text was cut.
pub fn preview(s: &str, max_chars: usize) -> String {
    let cut = truncate_chars(s, max_chars);
    if cut.len() < s.len() {
        format!("{}...", cut.trim_end())
    } else {
        cut.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tags_scripts_and_styles() {
        let html = r#"<html><head><title>T</title><style>p { color: red; }</style></head>
            <body><p>Hello   <b>team</b>,</p><script>alert(1)</script>
            <div>Quarterly
            numbers attached.</div></body></html>"#;
        assert_eq!(html_to_text(html), "Hello team, Quarterly numbers attached.");
    }

    #[test]
    fn inline_markup_keeps_words_and_punctuation_together() {
        assert_eq!(
            html_to_text("<p>Hello <b>team</b>, see <a href=\"#\">the deck</a>.</p>"),
            "Hello team, see the deck."
        );
        assert_eq!(html_to_text("<p>un<i>believ</i>able</p>"), "unbelievable");
    }

    #[test]
    fn blocks_and_breaks_separate_words() {
        assert_eq!(html_to_text("<div>one</div><div>two</div>"), "one two");
        assert_eq!(html_to_text("<p>line<br>next</p>"), "line next");
        assert_eq!(html_to_text("<div><p>inner</p>tail</div>"), "inner tail");
        assert_eq!(
            html_to_text("<table><tr><td>Q1</td><td>Q2</td></tr></table>"),
            "Q1 Q2"
        );
    }

    #[test]
    fn decodes_entities() {
        assert_eq!(html_to_text("<p>Fish &amp; chips</p>"), "Fish & chips");
    }

    #[test]
    fn plain_text_bodies_are_collapsed() {
        assert_eq!(body_to_text("a\n\n  b\tc", "text"), "a b c");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(preview("abcdef", 3), "abc...");
        assert_eq!(preview("abc", 3), "abc");
    }

    #[test]
    fn empty_html_is_empty_text() {
        assert_eq!(html_to_text("   "), "");
    }
}
