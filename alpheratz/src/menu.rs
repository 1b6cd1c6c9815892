//! The key-polling boot menu, driven off `alpheratz_core::config::MenuEntry`:
//! `default`/`hidden`/`timeout` are read out of the root environment rather
//! than dedicated struct fields, since
//! the config engine stores them as ordinary `set` values, and a
//! selected entry's `deferred_error` (trapped while its commands ran) is
//! surfaced as a boot error instead of silently booting a half-configured
//! environment.

use alloc::rc::Rc;
use core::cell::RefCell;
use core::fmt::Write;
use core::time::Duration;

use alpheratz_core::config::{Environment, MenuEntry, Value};
use uefi::prelude::*;
use uefi::proto::console::text::{Color, Key, ScanCode};
use uefi::runtime::{ResetType, VariableAttributes, VariableVendor};

pub enum Selection {
    Entry(usize),
    Shell,
    DebugLog,
    Firmware,
    Shutdown,
}

fn default_index(root: &Rc<RefCell<Environment>>, entries: &[MenuEntry]) -> usize {
    match Environment::lookup(root, "default") {
        Some(Value::Integer(i)) => (i as usize).min(entries.len().saturating_sub(1)),
        Some(Value::String(name)) => entries.iter().position(|e| e.label == name).unwrap_or(0),
        _ => 0,
    }
}

fn is_hidden(root: &Rc<RefCell<Environment>>) -> bool {
    matches!(Environment::lookup(root, "hidden"), Some(Value::Boolean(true)))
}

fn timeout_secs(root: &Rc<RefCell<Environment>>) -> Option<usize> {
    match Environment::lookup(root, "timeout") {
        Some(Value::Integer(n)) if n > 0 => Some(n as usize),
        _ => None,
    }
}

/// Poll for ~500ms for any keypress, used to decide whether a `hidden` menu
/// should stay hidden.
fn key_pressed_within(duration: Duration) -> bool {
    let ticks = (duration.as_millis() / 50).max(1);
    for _ in 0..ticks {
        uefi::boot::stall(Duration::from_millis(50));
        if let Ok(Some(_)) = uefi::system::with_stdin(|stdin| stdin.read_key()) {
            return true;
        }
    }
    false
}

/// Display the boot menu and return the user's selection.
///
/// `Firmware`/`Shutdown` never return to the caller — they call
/// `uefi::runtime::reset` directly.
pub fn show(root: &Rc<RefCell<Environment>>, entries: &[MenuEntry]) -> Selection {
    if entries.is_empty() {
        uefi::system::with_stdout(|out| {
            let _ = write!(out, "No boot entries found in configuration.\r\n");
        });
        loop {
            uefi::boot::stall(Duration::from_secs(1));
        }
    }

    if is_hidden(root) && !key_pressed_within(Duration::from_millis(500)) {
        return Selection::Entry(default_index(root, entries));
    }

    let mut selected = default_index(root, entries);
    let mut timeout = timeout_secs(root);
    let mut tick_count: usize = 0;

    uefi::system::with_stdout(|out| {
        let _ = out.clear();
        let _ = out.enable_cursor(false);
    });

    draw(entries, selected, timeout);

    loop {
        uefi::boot::stall(Duration::from_millis(100));

        let key = uefi::system::with_stdin(|stdin| stdin.read_key());

        if let Ok(Some(key)) = key {
            timeout = None;

            match key {
                Key::Special(ScanCode::UP) if selected > 0 => selected -= 1,
                Key::Special(ScanCode::DOWN) if selected < entries.len() - 1 => selected += 1,
                Key::Special(ScanCode::FUNCTION_2) => return Selection::Shell,
                Key::Special(ScanCode::FUNCTION_10) => return Selection::DebugLog,
                Key::Printable(c) if u16::from(c) == 0x000D => return confirm(entries, selected),
                _ => {}
            }

            draw(entries, selected, timeout);
        }

        tick_count += 1;
        if tick_count >= 10 {
            tick_count = 0;
            if let Some(ref mut t) = timeout {
                if *t == 0 {
                    return confirm(entries, selected);
                }
                *t -= 1;
                draw(entries, selected, timeout);
            }
        }
    }
}

fn confirm(entries: &[MenuEntry], selected: usize) -> Selection {
    uefi::system::with_stdout(|out| {
        let _ = out.set_color(Color::White, Color::Black);
        let _ = out.clear();
        let _ = write!(out, "Booting {}...\n", entries[selected].label);
    });
    Selection::Entry(selected)
}

/// Set OsIndications bit 0 (EFI_OS_INDICATIONS_BOOT_TO_FW_UI) and cold-reset.
pub fn reboot_to_firmware() -> ! {
    const EFI_OS_INDICATIONS_BOOT_TO_FW_UI: u64 = 0x0000_0000_0000_0001;

    let name = cstr16!("OsIndications");
    let vendor = &VariableVendor::GLOBAL_VARIABLE;
    let attrs = VariableAttributes::NON_VOLATILE | VariableAttributes::BOOTSERVICE_ACCESS | VariableAttributes::RUNTIME_ACCESS;

    let _ = uefi::runtime::set_variable(name, vendor, attrs, &EFI_OS_INDICATIONS_BOOT_TO_FW_UI.to_le_bytes());

    uefi::runtime::reset(ResetType::COLD, uefi::Status::SUCCESS, None);
}

pub fn shutdown() -> ! {
    uefi::runtime::reset(ResetType::SHUTDOWN, uefi::Status::SUCCESS, None);
}

/// Render the debug-log viewer (F10) until a keypress dismisses it.
pub fn show_debug_log(log: &str) {
    uefi::system::with_stdout(|out| {
        let _ = out.set_color(Color::LightGray, Color::Black);
        let _ = out.clear();
        let _ = write!(out, "{log}\r\n\r\nPress any key to return...\r\n");
    });
    loop {
        uefi::boot::stall(Duration::from_millis(100));
        if let Ok(Some(_)) = uefi::system::with_stdin(|stdin| stdin.read_key()) {
            return;
        }
    }
}

fn draw(entries: &[MenuEntry], selected: usize, timeout: Option<usize>) {
    uefi::system::with_stdout(|out| {
        let _ = out.set_cursor_position(0, 0);
        let _ = out.set_color(Color::White, Color::Black);
        let _ = write!(out, "\n  Alpheratz Boot Loader\n\n");

        for (i, entry) in entries.iter().enumerate() {
            draw_item(out, i == selected, &entry.label);
        }

        let _ = out.set_color(Color::LightGray, Color::Black);
        let _ = write!(out, "\n");

        match timeout {
            Some(secs) => {
                let _ = write!(out, "  Auto boot in {secs}s...                              \n");
            }
            None => {
                let _ = write!(out, "                                                   \n");
            }
        }

        let _ = out.set_color(Color::DarkGray, Color::Black);
        let _ = write!(out, "\n  Up/Down to select, Enter to boot, F2 for shell, F10 for debug log\n");
        let _ = out.set_color(Color::White, Color::Black);
    });
}

fn draw_item(out: &mut uefi::proto::console::text::Output, is_selected: bool, label: &str) {
    if is_selected {
        let _ = out.set_color(Color::White, Color::Blue);
        let _ = write!(out, "  > {:<66}\n", label);
        let _ = out.set_color(Color::White, Color::Black);
    } else {
        let _ = out.set_color(Color::LightGray, Color::Black);
        let _ = write!(out, "    {:<66}\n", label);
    }
}

/// Render a recoverable boot error: a one-line summary
/// plus Reboot/Shell/DebugLog choices.
pub fn show_boot_error(detail: &str) -> Selection {
    uefi::system::with_stdout(|out| {
        let _ = out.set_color(Color::Yellow, Color::Black);
        let _ = out.clear();
        let _ = write!(out, "Boot error: {detail}\r\n\r\n");
        let _ = write!(out, "  [R] Reboot   [S] Shell   [D] Debug log\r\n");
        let _ = out.set_color(Color::White, Color::Black);
    });

    loop {
        uefi::boot::stall(Duration::from_millis(100));
        if let Ok(Some(key)) = uefi::system::with_stdin(|stdin| stdin.read_key()) {
            match key {
                Key::Printable(c) if matches!(u16::from(c), 0x0072 | 0x0052) => {
                    uefi::runtime::reset(ResetType::COLD, uefi::Status::SUCCESS, None);
                }
                Key::Printable(c) if matches!(u16::from(c), 0x0073 | 0x0053) => return Selection::Shell,
                Key::Printable(c) if matches!(u16::from(c), 0x0064 | 0x0044) => return Selection::DebugLog,
                _ => {}
            }
        }
    }
}
