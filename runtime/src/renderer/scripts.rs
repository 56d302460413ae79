//! JavaScript snippets for page interaction.
//!
//! ## Security: JS encoding
//!
//! Selectors, text filters and fill values come from config files and
//! model output. They are escaped with [`sanitize_js_string`] and injected
//! only into single-quoted string literals, never into code positions.

/// Expression evaluating to the array of elements matching `css`,
/// optionally filtered by lowercase text containment.
fn matching_elements(css: &str, text: Option<&str>) -> String {
    format!(
        r#"(() => {{
            const needle = '{}';
            let all = [];
            try {{ all = [...document.querySelectorAll('{}')]; }} catch (e) {{ return []; }}
            if (!needle) return all;
            return all.filter(el => ((el.innerText || el.textContent || '') + '').toLowerCase().includes(needle));
        }})()"#,
        sanitize_js_string(text.unwrap_or("")),
        sanitize_js_string(css)
    )
}

/// Count matching elements. Evaluates to a number.
pub fn count(css: &str, text: Option<&str>) -> String {
    format!("({}).length", matching_elements(css, text))
}

/// Click the first visible match (or the first match). Evaluates to
/// `{ success: bool }`.
pub fn click(css: &str, text: Option<&str>) -> String {
    format!(
        r#"(() => {{
            const els = {};
            const visible = els.filter(el => el.offsetParent !== null || el.getClientRects().length > 0);
            const el = visible[0] || els[0];
            if (!el) return {{ success: false }};
            try {{ el.scrollIntoView({{ block: 'center' }}); }} catch (e) {{}}
            el.click();
            return {{ success: true }};
        }})()"#,
        matching_elements(css, text)
    )
}

/// Set an input's value through the native setter so framework-managed
/// inputs observe it, then dispatch `input` and `change`.
pub fn fill(css: &str, text: Option<&str>, value: &str) -> String {
    format!(
        r#"(() => {{
            const el = ({})[0];
            if (!el) return {{ success: false }};
            const value = '{}';
            try {{ el.focus(); }} catch (e) {{}}
            const proto = el instanceof HTMLTextAreaElement
                ? HTMLTextAreaElement.prototype
                : HTMLInputElement.prototype;
            const desc = Object.getOwnPropertyDescriptor(proto, 'value');
            if (desc && desc.set && el instanceof proto.constructor) {{
                desc.set.call(el, value);
            }} else {{
                el.value = value;
            }}
            el.dispatchEvent(new Event('input', {{ bubbles: true }}));
            el.dispatchEvent(new Event('change', {{ bubbles: true }}));
            return {{ success: true }};
        }})()"#,
        matching_elements(css, text),
        sanitize_js_string(value)
    )
}

/// Dispatch a key press on the first match, or on the focused element when
/// `css` is `None`. `Enter` on an input inside a form also submits the form.
pub fn press_key(css: Option<&str>, key: &str) -> String {
    let target = match css {
        Some(css) => format!("({})[0]", matching_elements(css, None)),
        None => "(document.activeElement || document.body)".to_string(),
    };
    format!(
        r#"(() => {{
            const el = {};
            if (!el) return {{ success: false }};
            const key = '{}';
            for (const type of ['keydown', 'keypress', 'keyup']) {{
                el.dispatchEvent(new KeyboardEvent(type, {{ key, code: key, bubbles: true, cancelable: true }}));
            }}
            if (key === 'Enter' && el.form) {{
                if (typeof el.form.requestSubmit === 'function') el.form.requestSubmit();
                else el.form.submit();
            }}
            return {{ success: true }};
        }})()"#,
        target,
        sanitize_js_string(key)
    )
}

/// Scroll the window, or the first match of `container`, to the bottom.
/// Evaluates to the new scroll height.
pub fn scroll_to_bottom(container: Option<&str>) -> String {
    match container {
        Some(css) => format!(
            r#"(() => {{
                const el = ({})[0];
                if (!el) return 0;
                el.scrollTop = el.scrollHeight;
                return el.scrollHeight;
            }})()"#,
            matching_elements(css, None)
        ),
        None => r#"(() => {
                window.scrollTo(0, document.body.scrollHeight);
                return document.body.scrollHeight;
            })()"#
            .to_string(),
    }
}

/// Whether a JS result object reports `success: true`.
pub fn reported_success(value: &serde_json::Value) -> bool {
    value
        .as_object()
        .and_then(|o| o.get("success"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// Sanitize a string for safe injection into a JavaScript string literal.
///
/// Escapes all characters that could break out of a JS string context:
/// - Backslashes, single/double quotes, backticks
/// - Newlines, carriage returns, tabs
/// - HTML script tags (to prevent `</script>` injection)
/// - Null bytes
pub fn sanitize_js_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 8);
    for ch in s.chars() {
        match ch {
            '\\' => result.push_str("\\\\"),
            '\'' => result.push_str("\\'"),
            '"' => result.push_str("\\\""),
            '`' => result.push_str("\\`"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\t' => result.push_str("\\t"),
            '\0' => {}
            '<' => result.push_str("\\x3c"),
            '>' => result.push_str("\\x3e"),
            _ => result.push(ch),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_basic() {
        assert_eq!(sanitize_js_string("hello"), "hello");
        assert_eq!(sanitize_js_string("it's"), "it\\'s");
        assert_eq!(sanitize_js_string("a\"b"), "a\\\"b");
    }

    #[test]
    fn test_sanitize_xss() {
        let sanitized = sanitize_js_string("</script><script>alert(1)</script>");
        assert!(!sanitized.contains("</script>"));
        assert!(sanitized.contains("\\x3c/script\\x3e"));
    }

    #[test]
    fn test_sanitize_null_bytes() {
        assert_eq!(sanitize_js_string("abc\0def"), "abcdef");
    }

    #[test]
    fn test_fill_script_escapes_selector_and_value() {
        let js = fill("input[name='zip']", None, "10001'); alert('x");
        assert!(js.contains("input[name=\\'zip\\']"));
        assert!(js.contains("10001\\'); alert(\\'x"));
        assert!(js.contains("dispatchEvent(new Event('input'"));
    }

    #[test]
    fn test_click_script_carries_text_filter() {
        let js = click("button", Some("find a dealer"));
        assert!(js.contains("const needle = 'find a dealer'"));
        assert!(js.contains("el.click()"));
    }

    #[test]
    fn test_press_key_targets() {
        assert!(press_key(None, "Escape").contains("document.activeElement"));
        assert!(press_key(Some("#zip"), "Enter").contains("requestSubmit"));
    }

    #[test]
    fn test_reported_success() {
        assert!(reported_success(&serde_json::json!({ "success": true })));
        assert!(!reported_success(&serde_json::json!({ "success": false })));
        assert!(!reported_success(&serde_json::json!(null)));
    }
}
