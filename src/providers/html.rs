//! HTML sanitizing and entity decoding shared by the drivers.

/// Strips scripts, event handlers and other unsafe markup from an HTML body.
pub fn sanitize(html: &str) -> String {
    ammonia::Builder::default().clean(html.trim()).to_string()
}

/// Decodes HTML entities such as `&amp;` and `&#39;`.
pub fn decode_entities(text: &str) -> String {
    html_escape::decode_html_entities(text).into_owned()
}

/// Renders a plain-text body as HTML, preserving line breaks.
pub fn text_to_html(text: &str) -> String {
    let decoded = decode_entities(text);
    html_escape::encode_text(&decoded)
        .replace("\r\n", "\n")
        .replace('\n', "<br>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_removes_scripts() {
        let cleaned = sanitize("<p>Hello</p><script>alert('x')</script>");
        assert_eq!(cleaned, "<p>Hello</p>");
    }

    #[test]
    fn sanitize_removes_event_handlers() {
        let cleaned = sanitize(r#"<img src="a.png" onerror="steal()">"#);
        assert!(!cleaned.contains("onerror"));
        assert!(cleaned.contains("a.png"));
    }

    #[test]
    fn decode_entities_in_subjects() {
        assert_eq!(decode_entities("Tom &amp; Jerry&#39;s"), "Tom & Jerry's");
        assert_eq!(decode_entities("plain"), "plain");
    }

    #[test]
    fn text_to_html_escapes_and_breaks_lines() {
        assert_eq!(text_to_html("a < b\r\nnext"), "a &lt; b<br>next");
        assert_eq!(text_to_html("one\ntwo"), "one<br>two");
    }
}
