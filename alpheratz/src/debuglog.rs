//! A ring-buffered `log::Log` implementor backing the F10 debug-log viewer.
//! Uses the `log` crate like any other console output, but captures it in
//! memory instead, since the console is long gone by
//! the time a failed boot wants to show its history.

use alloc::string::String;
use core::cell::RefCell;
use core::fmt::Write as _;
use log::{Level, Log, Metadata, Record};

/// Once the buffer would grow past this, it is cleared rather than grown
/// further — a boot-time debug log has no need to retain more than the most
/// recent screenful of history, and an unbounded buffer would fight the
/// loader's own memory budget.
const CAPACITY: usize = 16 * 1024;

struct DebugLog {
    buf: RefCell<String>,
}

// Single-threaded, no interrupts taken: nothing else can observe the
// `RefCell` while `log()` holds it.
unsafe impl Sync for DebugLog {}

static DEBUG_LOG: DebugLog = DebugLog { buf: RefCell::new(String::new()) };

impl Log for DebugLog {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut buf = self.buf.borrow_mut();
        if buf.len() > CAPACITY {
            buf.clear();
        }
        let _ = writeln!(buf, "[{}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

/// Install the debug-log buffer as the global `log` backend. Must run
/// before `uefi::helpers::init()`'s stdout is torn down by
/// `exit_boot_services` if earlier messages are to survive into the
/// viewer — in practice this runs once at the very top of `main`.
pub fn install() {
    let _ = log::set_logger(&DEBUG_LOG);
    log::set_max_level(Level::Info.to_level_filter());
}

/// A snapshot of everything logged so far, for [`crate::menu::show_debug_log`].
pub fn snapshot() -> String {
    DEBUG_LOG.buf.borrow().clone()
}
