//! The interactive shell: a REPL that reuses the configuration
//! parser in line-at-a-time mode. An empty line is `EOF` and returns to the
//! menu. Lines are read a keystroke at a time via `uefi::system::with_stdin`
//! instead of polling for a single confirm key.

use alloc::rc::Rc;
use alloc::string::String;
use core::cell::RefCell;
use core::fmt::Write;

use alpheratz_core::config::{self, CommandContext, Environment};
use alpheratz_core::device::DeviceTree;
use uefi::prelude::*;
use uefi::proto::console::text::Key;

const BACKSPACE: u16 = 0x0008;
const ENTER: u16 = 0x000D;

/// Read one line of input, echoing keystrokes, until Enter. Backspace
/// erases the last character.
fn read_line() -> String {
    let mut line = String::new();
    loop {
        uefi::boot::stall(core::time::Duration::from_millis(20));
        let Ok(Some(key)) = uefi::system::with_stdin(|stdin| stdin.read_key()) else {
            continue;
        };
        let Key::Printable(c) = key else { continue };
        let code = u16::from(c);
        if code == ENTER {
            uefi::system::with_stdout(|out| {
                let _ = write!(out, "\r\n");
            });
            return line;
        }
        if code == BACKSPACE {
            if line.pop().is_some() {
                uefi::system::with_stdout(|out| {
                    let _ = write!(out, "\u{8} \u{8}");
                });
            }
            continue;
        }
        if let Some(ch) = char::from_u32(code as u32) {
            line.push(ch);
            uefi::system::with_stdout(|out| {
                let _ = write!(out, "{ch}");
            });
        }
    }
}

/// Run the shell against `root`, accumulating `set`/`device` state across
/// lines by threading the previous line's resulting child environment into
/// the next.
/// Returns once the user enters an empty line.
pub fn run(root: &Rc<RefCell<Environment>>, devices: &mut DeviceTree) {
    uefi::system::with_stdout(|out| {
        let _ = write!(out, "\r\nalpheratz shell. Empty line to return to the menu.\r\n");
    });

    let mut current = Environment::child(root);

    loop {
        uefi::system::with_stdout(|out| {
            let _ = write!(out, "> ");
        });
        let line = read_line();
        if line.trim().is_empty() {
            return;
        }

        let list = match config::lexer::parse(&line) {
            Ok(list) => list,
            Err(e) => {
                uefi::system::with_stdout(|out| {
                    let _ = write!(out, "{e}\r\n");
                });
                continue;
            }
        };

        let mut ctx = CommandContext::new(devices);
        match config::command_list_exec(&list, &current, &mut ctx, false) {
            Ok(next) => current = next,
            Err(e) => {
                uefi::system::with_stdout(|out| {
                    let _ = write!(out, "{e}\r\n");
                });
            }
        }
    }
}
