//! General purpose macros for text output.
//!
//! The framebuffer / terminal renderer lives outside of the core; it registers itself here as a
//! raw byte sink, and everything in the core logs through it. Logging before a sink is installed
//! is a no-op.

use conquer_once::spin::OnceCell;
use core::fmt;

/// A console sink receives raw bytes and displays them.
pub type ConsoleSink = fn(&[u8]);

static CONSOLE: OnceCell<ConsoleSink> = OnceCell::uninit();

/// Installs the byte sink used by [`info!`], [`error!`] and syscall writes to the standard
/// descriptors.
///
/// Only the first registration takes effect.
pub fn register_console(sink: ConsoleSink) {
    CONSOLE.init_once(|| sink);
}

/// Writes raw bytes to the registered console sink, if any.
pub fn console_write(bytes: &[u8]) {
    if let Some(sink) = CONSOLE.get() {
        sink(bytes);
    }
}

struct SinkWriter;

impl fmt::Write for SinkWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        console_write(s.as_bytes());
        Ok(())
    }
}

#[doc(hidden)]
pub fn _log(prefix: &str, ctx: Option<&str>, args: fmt::Arguments) {
    use fmt::Write;

    let mut writer = SinkWriter;
    let _ = writer.write_str(prefix);
    if let Some(ctx) = ctx {
        let _ = writer.write_str(ctx);
        let _ = writer.write_str(" : ");
    }
    let _ = writer.write_fmt(args);
    let _ = writer.write_str("\n");
}

/// Prints a standard information message to the output.
///
/// You can specify a 'context' as the first argument when calling the macro, which will be
/// inserted at the beginning of the message.
///
/// # Examples
///
/// ```
/// use opal::info;
///
/// info!("paging", "paging enabled");
/// ```
#[macro_export]
macro_rules! info {
    ($ctx: literal, $($arg: tt)*) => {
        $crate::console::_log("[info] ", Some($ctx), format_args!($($arg)*))
    };
    ($($arg: tt)*) => {
        $crate::console::_log("[info] ", None, format_args!($($arg)*))
    };
}

/// Prints a standard error message to the output.
///
/// # Examples
///
/// ```
/// use opal::error;
///
/// error!("paging", "failed to initialize paging");
/// ```
#[macro_export]
macro_rules! error {
    ($ctx: literal, $($arg: tt)*) => {
        $crate::console::_log("[error] ", Some($ctx), format_args!($($arg)*))
    };
    ($($arg: tt)*) => {
        $crate::console::_log("[error] ", None, format_args!($($arg)*))
    };
}
