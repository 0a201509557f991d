//! Character I/O and diagnostic host function implementation.
//!
//! The toolchain image has no file descriptors of its own: the compiled
//! program's `putchar`/`getchar` and the compiler's error callback are routed
//! to these functions, which operate on the session's [`SessionContext`].

use csandbox_common::StreamKind;
use csandbox_core::SessionContext;
use tracing::debug;

/// Value returned by [`StdioHost::get_char`] at end of input.
pub const EOF: i32 = -1;

/// Host implementation for the character I/O interface.
pub struct StdioHost;

impl StdioHost {
    /// Append one character to stdout (`stream == 1`) or stderr
    /// (`stream == 2`). Other stream numbers are ignored.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn put_char(ctx: &mut SessionContext, stream: i32, ch: i32) {
        match StreamKind::from_fd(stream) {
            // C semantics: the character is converted to unsigned char.
            Some(kind) => ctx.stream_mut(kind).push(ch as u8),
            None => debug!(
                session_id = %ctx.session_id,
                stream,
                "Output to unknown stream dropped"
            ),
        }
    }

    /// Read the next stdin byte, or [`EOF`].
    pub fn get_char(ctx: &mut SessionContext) -> i32 {
        ctx.next_input().map_or(EOF, i32::from)
    }

    /// Record a compiler diagnostic.
    pub fn report_error(ctx: &mut SessionContext, message: &str) {
        debug!(session_id = %ctx.session_id, guest_diagnostic = true, "{}", message);
        ctx.report_diagnostic(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csandbox_common::LineCollector;

    fn context() -> SessionContext {
        SessionContext::new("test".into(), 1 << 20)
    }

    #[test]
    fn test_put_char_routes_streams() {
        let mut ctx = context();
        let out = LineCollector::with_cap(64);
        let err = LineCollector::with_cap(64);
        ctx.attach(out.sink(), err.sink(), 64);

        for &b in b"Hi\n" {
            StdioHost::put_char(&mut ctx, 1, i32::from(b));
        }
        for &b in b"oops\n" {
            StdioHost::put_char(&mut ctx, 2, i32::from(b));
        }
        StdioHost::put_char(&mut ctx, 7, i32::from(b'x'));

        assert_eq!(out.lines(), vec!["Hi"]);
        assert_eq!(err.lines(), vec!["oops"]);
    }

    #[test]
    fn test_put_char_truncates_to_byte() {
        let mut ctx = context();
        let out = LineCollector::with_cap(64);
        ctx.attach(out.sink(), LineCollector::with_cap(64).sink(), 64);

        // 0x141 -> 'A'
        StdioHost::put_char(&mut ctx, 1, 0x141);
        StdioHost::put_char(&mut ctx, 1, i32::from(b'\n'));

        assert_eq!(out.lines(), vec!["A"]);
    }

    #[test]
    fn test_get_char_until_eof() {
        let mut ctx = context();
        ctx.set_input(b"7\n");

        assert_eq!(StdioHost::get_char(&mut ctx), i32::from(b'7'));
        assert_eq!(StdioHost::get_char(&mut ctx), i32::from(b'\n'));
        assert_eq!(StdioHost::get_char(&mut ctx), EOF);
        assert_eq!(StdioHost::get_char(&mut ctx), EOF);
    }

    #[test]
    fn test_report_error_collects() {
        let mut ctx = context();

        StdioHost::report_error(&mut ctx, "<string>:1: error: identifier expected");

        assert_eq!(
            ctx.take_diagnostic().as_deref(),
            Some("<string>:1: error: identifier expected")
        );
    }
}
