//! Text helpers for raw device output.
//!
//! Pass-through commands return whatever the RAM code prints, which may be
//! cut in the middle of a UTF-8 sequence or carry terminal control bytes.

/// Drain buffered bytes into displayable UTF-8 text without stalling on invalid bytes.
///
/// - Valid UTF-8 is emitted as-is.
/// - Invalid byte sequences emit the replacement char `�` and continue.
/// - Incomplete UTF-8 suffix is kept in `buffer` for the next read.
pub fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                break;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if let Ok(valid) = std::str::from_utf8(&buffer[..valid_up_to]) {
                    output.push_str(valid);
                }

                if let Some(invalid_len) = err.error_len() {
                    output.push('\u{FFFD}');
                    let drain_to = valid_up_to.saturating_add(invalid_len).min(buffer.len());
                    buffer.drain(..drain_to);
                } else {
                    buffer.drain(..valid_up_to);
                    break;
                }
            },
        }
    }

    output
}

/// Filter non-printable control characters from device output.
///
/// Keeps `\n`, `\t` and printable characters. `\r\n` and lone `\r` both
/// become `\n`; other control characters are dropped.
pub fn clean_monitor_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\r' => {
                if chars.peek() != Some(&'\n') {
                    out.push('\n');
                }
            },
            '\n' | '\t' => out.push(ch),
            _ if ch.is_control() => {},
            _ => out.push(ch),
        }
    }
    out
}
