//! Terminal operator input
//!
//! A reader thread owns the terminal in raw mode and turns key presses into
//! [`OperatorSignal`]s on a bounded channel; the control loop drains that
//! channel without blocking.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use armpilot_core::control::{ChannelInput, InputSource, OperatorSignal};
use crossbeam_channel::{Sender, TrySendError};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

/// Space toggles pause, `q`/Esc/Ctrl-C quit
pub struct TerminalInput {
    signals: ChannelInput,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    raw: bool,
}

impl TerminalInput {
    /// Enter raw mode and start the reader thread
    pub fn spawn() -> io::Result<Self> {
        enable_raw_mode()?;
        let (tx, signals) = ChannelInput::bounded(16);
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let reader = thread::Builder::new()
            .name("operator-input".into())
            .spawn(move || read_keys(tx, flag));
        let reader = match reader {
            Ok(handle) => handle,
            Err(e) => {
                let _ = disable_raw_mode();
                return Err(e);
            }
        };
        Ok(Self {
            signals,
            stop,
            reader: Some(reader),
            raw: true,
        })
    }
}

impl InputSource for TerminalInput {
    fn poll(&mut self) -> Option<OperatorSignal> {
        self.signals.poll()
    }

    fn restore(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                tracing::warn!("Operator input thread panicked");
            }
        }
        if self.raw {
            if let Err(e) = disable_raw_mode() {
                tracing::warn!("Failed to restore terminal: {}", e);
            }
            self.raw = false;
        }
    }
}

impl Drop for TerminalInput {
    fn drop(&mut self) {
        self.restore();
    }
}

fn read_keys(tx: Sender<OperatorSignal>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        match event::poll(Duration::from_millis(50)) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                tracing::warn!("Terminal input error: {}", e);
                break;
            }
        }
        let signal = match event::read() {
            Ok(Event::Key(key)) => map_key(&key),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("Terminal input error: {}", e);
                break;
            }
        };
        if let Some(signal) = signal {
            match tx.try_send(signal) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => tracing::debug!("Dropping {:?}, loop busy", signal),
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
    }
}

/// Log sink that ends lines with `\r\n`
///
/// Raw mode turns off output post-processing, so a bare `\n` would only
/// move the cursor down.
pub struct RawModeWriter<W> {
    inner: W,
}

impl<W: Write> RawModeWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for RawModeWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for (i, line) in buf.split(|&b| b == b'\n').enumerate() {
            if i > 0 {
                self.inner.write_all(b"\r\n")?;
            }
            self.inner.write_all(line)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn map_key(key: &KeyEvent) -> Option<OperatorSignal> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    match key.code {
        KeyCode::Char(' ') => Some(OperatorSignal::TogglePause),
        KeyCode::Char('q') | KeyCode::Esc => Some(OperatorSignal::Quit),
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(OperatorSignal::Quit)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_mapping() {
        let press = |code, modifiers| KeyEvent::new(code, modifiers);
        assert_eq!(
            map_key(&press(KeyCode::Char(' '), KeyModifiers::NONE)),
            Some(OperatorSignal::TogglePause)
        );
        assert_eq!(
            map_key(&press(KeyCode::Char('q'), KeyModifiers::NONE)),
            Some(OperatorSignal::Quit)
        );
        assert_eq!(
            map_key(&press(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(OperatorSignal::Quit)
        );
        assert_eq!(map_key(&press(KeyCode::Char('c'), KeyModifiers::NONE)), None);
        assert_eq!(map_key(&press(KeyCode::Enter, KeyModifiers::NONE)), None);
    }

    #[test]
    fn test_raw_mode_writer_returns_carriage() {
        let mut out = RawModeWriter::new(Vec::new());
        write!(out, "INFO tick 1\nINFO tick 2\n").unwrap();
        out.write_all(b"no newline").unwrap();
        assert_eq!(out.inner, b"INFO tick 1\r\nINFO tick 2\r\nno newline");
    }
}
