//! HTML rendering of received messages
//!
//! Telegram parses the message as HTML, so anything coming off the air gets
//! its markup-significant characters escaped before it is embedded.

use smsgate_core::AssembledSms;

/// Render one assembled SMS for delivery.
pub fn format_message(message: &AssembledSms) -> String {
    let mut out = String::new();
    out.push_str("<b>SMS Received</b>\n\n");
    out.push_str(&format!(
        "<b>From:</b> <code>{}</code>\n",
        escape_html(&message.sender)
    ));
    out.push_str(&format!(
        "<b>Time:</b> {}\n",
        message.timestamp.format("%Y-%m-%d %H:%M:%S")
    ));
    if let Some(smsc) = &message.smsc {
        out.push_str(&format!("<b>SMSC:</b> {}\n", escape_html(smsc)));
    }
    if message.is_multipart() {
        out.push_str(&format!("<b>Parts:</b> {}\n", message.total_parts));
    }
    out.push('\n');
    out.push_str(&escape_html(&message.text));
    out
}

/// Escape the characters Telegram's HTML parse mode treats as markup.
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn message() -> AssembledSms {
        AssembledSms {
            sender: "+1234567890".to_string(),
            smsc: Some("+1987654321".to_string()),
            timestamp: FixedOffset::east_opt(0)
                .unwrap()
                .with_ymd_and_hms(2025, 12, 11, 18, 21, 49)
                .unwrap(),
            text: "Test message".to_string(),
            total_parts: 1,
            indices: vec![1],
        }
    }

    #[test]
    fn test_format_contains_metadata() {
        let rendered = format_message(&message());
        assert!(rendered.contains("+1234567890"));
        assert!(rendered.contains("+1987654321"));
        assert!(rendered.contains("2025-12-11 18:21:49"));
        assert!(rendered.contains("Test message"));
        assert!(!rendered.contains("Parts:"));
    }

    #[test]
    fn test_format_multipart_shows_part_count() {
        let mut msg = message();
        msg.total_parts = 3;
        let rendered = format_message(&msg);
        assert!(rendered.contains("<b>Parts:</b> 3"));
    }

    #[test]
    fn test_format_without_smsc_omits_line() {
        let mut msg = message();
        msg.smsc = None;
        assert!(!format_message(&msg).contains("SMSC:"));
    }

    #[test]
    fn test_format_escapes_body() {
        let mut msg = message();
        msg.text = "<script>1 & 2</script>".to_string();
        let rendered = format_message(&msg);
        assert!(rendered.contains("&lt;script&gt;1 &amp; 2&lt;/script&gt;"));
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("hello"), "hello");
        assert_eq!(escape_html("<script>"), "&lt;script&gt;");
        assert_eq!(escape_html("a & b"), "a &amp; b");
        assert_eq!(escape_html("1 < 2 > 0"), "1 &lt; 2 &gt; 0");
        assert_eq!(escape_html(""), "");
    }
}
