use std::borrow::Cow;

/// Terminate `frame` with exactly one `\n`.
///
/// A frame that already ends in a newline is returned untouched, so an
/// existing terminator is never doubled.
pub fn ensure_newline(frame: &str) -> Cow<'_, str> {
    if frame.ends_with('\n') {
        Cow::Borrowed(frame)
    } else {
        let mut owned = String::with_capacity(frame.len() + 1);
        owned.push_str(frame);
        owned.push('\n');
        Cow::Owned(owned)
    }
}
