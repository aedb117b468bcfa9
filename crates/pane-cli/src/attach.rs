//! Interactive attach: raw-mode stdin in, rendered cells out.
//!
//! The wire side is the subscriber stream from the server; this module
//! drives the local console. Keyboard bytes are forwarded as input
//! messages, except for the ctrl-B prefix: `d` detaches, `c` creates a
//! session and switches to it, `n`/`p` cycle through sessions. A
//! doubled prefix sends a literal ctrl-B. SIGWINCH becomes a resize
//! message.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use pane_core::protocol::{
    InputMessage, Request, ResizeMessage, SessionInfo, WireMessage,
};
use pane_core::screen::{Attribute, Cell, Color, ScreenDelta, ScreenSnapshot, Style};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;

use crate::daemon::client::{ConnectOptions, PaneClient};
use crate::daemon::connection::FramedConnection;

/// ctrl-B.
const PREFIX_KEY: u8 = 0x02;

enum Outcome {
    Detach,
    SessionEnded,
    CreateNew,
    SwitchNext,
    SwitchPrev,
}

/// Attach to `target` (or the single running session) and run the
/// console loop, following `c`/`n`/`p` switches until detach or end.
pub async fn run(target: Option<String>, options: ConnectOptions) -> Result<()> {
    let mut target = target;
    let mut stdin_rx = spawn_stdin_reader();

    loop {
        let client = PaneClient::connect(options).await?;
        let (cols, rows) = terminal_size();
        let (session, snapshot) = client.attach(target.clone(), cols, rows).await?;
        let conn = client.connection();

        let outcome = run_attached(&conn, &snapshot, &mut stdin_rx).await;
        conn.close().await;
        match outcome? {
            Outcome::Detach => {
                println!("[detached]");
                return Ok(());
            }
            Outcome::SessionEnded => {
                println!("[session ended]");
                return Ok(());
            }
            Outcome::CreateNew => {
                let control = PaneClient::connect(options).await?;
                let response = control
                    .request_ok(Request::CreateSession {
                        name: None,
                        command_line: None,
                    })
                    .await?;
                target = response.session.map(|s| s.id);
            }
            Outcome::SwitchNext => {
                target = switch_target(options, &session.id, true).await?;
            }
            Outcome::SwitchPrev => {
                target = switch_target(options, &session.id, false).await?;
            }
        }
    }
}

/// Ask the server for the session list and pick the neighbor of the
/// session just left.
async fn switch_target(
    options: ConnectOptions,
    current: &str,
    forward: bool,
) -> Result<Option<String>> {
    let control = PaneClient::connect(options).await?;
    let response = control.request_ok(Request::ListSessions).await?;
    let sessions = response.sessions.unwrap_or_default();
    Ok(pick_neighbor(&sessions, current, forward))
}

async fn run_attached(
    conn: &Arc<FramedConnection>,
    snapshot: &ScreenSnapshot,
    stdin_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
) -> Result<Outcome> {
    let _raw = RawModeGuard::enable().context("failed to enter raw mode")?;
    let mut stdout = std::io::stdout();

    // Alternate screen for the duration of the attach.
    paint(&mut stdout, "\x1b[?1049h")?;
    paint(&mut stdout, &snapshot_frame(snapshot))?;

    let result = attached_loop(conn, stdin_rx, &mut stdout).await;

    let _ = paint(&mut stdout, "\x1b[0m\x1b[?1049l\x1b[?25h");
    result
}

async fn attached_loop(
    conn: &Arc<FramedConnection>,
    stdin_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    stdout: &mut std::io::Stdout,
) -> Result<Outcome> {
    let mut screen_rx = spawn_screen_reader(conn.clone());
    let mut winch =
        signal(SignalKind::window_change()).context("failed to register SIGWINCH")?;
    let mut filter = KeyFilter::default();

    loop {
        tokio::select! {
            message = screen_rx.recv() => match message {
                Some(WireMessage::Snapshot { snapshot }) => {
                    paint(stdout, &snapshot_frame(&snapshot))?;
                }
                Some(WireMessage::Delta { delta }) => {
                    paint(stdout, &delta_frame(&delta))?;
                }
                Some(_) => {}
                None => return Ok(Outcome::SessionEnded),
            },
            chunk = stdin_rx.recv() => match chunk {
                Some(bytes) => {
                    for action in filter.process(&bytes) {
                        match action {
                            KeyAction::Forward(data) => {
                                let data = String::from_utf8_lossy(&data).into_owned();
                                conn.send_binary(&WireMessage::Input {
                                    input: InputMessage { data },
                                })
                                .await?;
                            }
                            KeyAction::Detach => return Ok(Outcome::Detach),
                            KeyAction::CreateSession => return Ok(Outcome::CreateNew),
                            KeyAction::NextSession => return Ok(Outcome::SwitchNext),
                            KeyAction::PrevSession => return Ok(Outcome::SwitchPrev),
                        }
                    }
                }
                None => return Ok(Outcome::Detach),
            },
            _ = winch.recv() => {
                let (cols, rows) = terminal_size();
                conn.send_binary(&WireMessage::Resize {
                    resize: ResizeMessage { cols, rows },
                })
                .await?;
            }
        }
    }
}

/// Forward frames into a channel so the select loop stays
/// cancellation-safe; reading a frame directly inside `select!` could
/// drop half a frame when another branch fires.
fn spawn_screen_reader(
    conn: Arc<FramedConnection>,
) -> mpsc::UnboundedReceiver<WireMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            match conn.read_message().await {
                Ok(Some(message)) => {
                    if tx.send(message).is_err() {
                        break;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
    });
    rx
}

/// One blocking reader thread for the program's lifetime; stdin has no
/// useful async story and the thread parks in read().
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<Vec<u8>> {
    use std::io::Read;

    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

fn pick_neighbor(sessions: &[SessionInfo], current: &str, forward: bool) -> Option<String> {
    if sessions.is_empty() {
        return None;
    }
    let index = sessions.iter().position(|s| s.id == current).unwrap_or(0);
    let len = sessions.len();
    let neighbor = if forward {
        (index + 1) % len
    } else {
        (index + len - 1) % len
    };
    Some(sessions[neighbor].id.clone())
}

/// Splits raw keyboard bytes into forwardable input and prefix
/// commands.
#[derive(Default)]
struct KeyFilter {
    prefix_armed: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum KeyAction {
    Forward(Vec<u8>),
    Detach,
    CreateSession,
    NextSession,
    PrevSession,
}

impl KeyFilter {
    fn process(&mut self, chunk: &[u8]) -> Vec<KeyAction> {
        let mut actions = Vec::new();
        let mut pending: Vec<u8> = Vec::new();
        for &byte in chunk {
            if self.prefix_armed {
                self.prefix_armed = false;
                let command = match byte {
                    b'd' => Some(KeyAction::Detach),
                    b'c' => Some(KeyAction::CreateSession),
                    b'n' => Some(KeyAction::NextSession),
                    b'p' => Some(KeyAction::PrevSession),
                    PREFIX_KEY => {
                        pending.push(PREFIX_KEY);
                        None
                    }
                    other => {
                        pending.push(PREFIX_KEY);
                        pending.push(other);
                        None
                    }
                };
                if let Some(command) = command {
                    if !pending.is_empty() {
                        actions.push(KeyAction::Forward(std::mem::take(&mut pending)));
                    }
                    actions.push(command);
                }
            } else if byte == PREFIX_KEY {
                self.prefix_armed = true;
            } else {
                pending.push(byte);
            }
        }
        if !pending.is_empty() {
            actions.push(KeyAction::Forward(pending));
        }
        actions
    }
}

fn paint(stdout: &mut std::io::Stdout, frame: &str) -> Result<()> {
    stdout
        .write_all(frame.as_bytes())
        .context("failed to write to terminal")?;
    stdout.flush().context("failed to flush terminal")?;
    Ok(())
}

fn snapshot_frame(snapshot: &ScreenSnapshot) -> String {
    let mut out = String::with_capacity(snapshot.lines.len() * snapshot.cols as usize * 2);
    out.push_str("\x1b[?25l\x1b[2J");
    for (i, line) in snapshot.lines.iter().enumerate() {
        out.push_str(&format!("\x1b[{};1H", i + 1));
        render_line(&mut out, line);
    }
    finish_cursor(&mut out, snapshot.cursor_x, snapshot.cursor_y);
    out
}

fn delta_frame(delta: &ScreenDelta) -> String {
    let mut out = String::new();
    out.push_str("\x1b[?25l");
    for (offset, line) in delta.lines.iter().enumerate() {
        out.push_str(&format!("\x1b[{};1H", delta.start_y as usize + offset + 1));
        render_line(&mut out, line);
    }
    finish_cursor(&mut out, delta.cursor_x, delta.cursor_y);
    out
}

fn finish_cursor(out: &mut String, x: u16, y: u16) {
    out.push_str(&format!("\x1b[0m\x1b[{};{}H\x1b[?25h", y + 1, x + 1));
}

fn render_line(out: &mut String, cells: &[Cell]) {
    let mut current_sgr = String::new();
    for cell in cells {
        // Width-0 companions occupy no column; the wide glyph before
        // them already advanced the cursor.
        if cell.width == 0 {
            continue;
        }
        let sgr = sgr_sequence(&cell.attr);
        if sgr != current_sgr {
            out.push_str(&sgr);
            current_sgr = sgr;
        }
        if cell.ch.is_empty() {
            out.push(' ');
        } else {
            out.push_str(&cell.ch);
        }
    }
}

fn sgr_sequence(attr: &Attribute) -> String {
    let mut seq = String::from("\x1b[0");
    if attr.style.contains(Style::BOLD) {
        seq.push_str(";1");
    }
    if attr.style.contains(Style::DIM) {
        seq.push_str(";2");
    }
    if attr.style.contains(Style::ITALIC) {
        seq.push_str(";3");
    }
    if attr.style.contains(Style::UNDERLINE) {
        seq.push_str(";4");
    }
    if attr.style.contains(Style::BLINK) {
        seq.push_str(";5");
    }
    if attr.style.contains(Style::INVERT) {
        seq.push_str(";7");
    }
    if attr.style.contains(Style::INVISIBLE) {
        seq.push_str(";8");
    }
    if attr.style.contains(Style::CROSSED_OUT) {
        seq.push_str(";9");
    }
    push_color(&mut seq, attr.fg, false);
    push_color(&mut seq, attr.bg, true);
    seq.push('m');
    seq
}

fn push_color(seq: &mut String, color: Color, background: bool) {
    let plane = if background { 4 } else { 3 };
    match color {
        Color::Default => {}
        Color::DefaultInverted => {
            if !background {
                seq.push_str(";7");
            }
        }
        Color::Ansi { index } => {
            seq.push_str(&format!(";{plane}8;5;{index}"));
        }
        Color::TrueColor { r, g, b } => {
            seq.push_str(&format!(";{plane}8;2;{r};{g};{b}"));
        }
    }
}

fn terminal_size() -> (u16, u16) {
    // SAFETY: TIOCGWINSZ only fills the struct it is handed.
    unsafe {
        let mut ws: libc::winsize = std::mem::zeroed();
        if libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) == 0
            && ws.ws_col > 0
            && ws.ws_row > 0
        {
            (ws.ws_col, ws.ws_row)
        } else {
            (80, 24)
        }
    }
}

/// Puts stdin into raw mode, restoring the original settings on drop.
struct RawModeGuard {
    original: libc::termios,
}

impl RawModeGuard {
    fn enable() -> std::io::Result<Self> {
        // SAFETY: termios calls on our own stdin descriptor.
        unsafe {
            let mut term: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(libc::STDIN_FILENO, &mut term) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            let original = term;
            libc::cfmakeraw(&mut term);
            if libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &term) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(Self { original })
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        // SAFETY: restoring the attributes captured in enable().
        unsafe {
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &self.original);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_bytes_are_forwarded() {
        let mut filter = KeyFilter::default();
        let actions = filter.process(b"hello");
        assert_eq!(actions, vec![KeyAction::Forward(b"hello".to_vec())]);
    }

    #[test]
    fn prefix_d_detaches() {
        let mut filter = KeyFilter::default();
        let actions = filter.process(&[PREFIX_KEY, b'd']);
        assert_eq!(actions, vec![KeyAction::Detach]);
    }

    #[test]
    fn prefix_commands_map_to_actions() {
        let mut filter = KeyFilter::default();
        assert_eq!(
            filter.process(&[PREFIX_KEY, b'c']),
            vec![KeyAction::CreateSession]
        );
        assert_eq!(
            filter.process(&[PREFIX_KEY, b'n']),
            vec![KeyAction::NextSession]
        );
        assert_eq!(
            filter.process(&[PREFIX_KEY, b'p']),
            vec![KeyAction::PrevSession]
        );
    }

    #[test]
    fn doubled_prefix_sends_literal_prefix() {
        let mut filter = KeyFilter::default();
        let actions = filter.process(&[PREFIX_KEY, PREFIX_KEY]);
        assert_eq!(actions, vec![KeyAction::Forward(vec![PREFIX_KEY])]);
    }

    #[test]
    fn unknown_prefix_command_passes_both_bytes_through() {
        let mut filter = KeyFilter::default();
        let actions = filter.process(&[PREFIX_KEY, b'x']);
        assert_eq!(actions, vec![KeyAction::Forward(vec![PREFIX_KEY, b'x'])]);
    }

    #[test]
    fn bytes_before_a_command_are_flushed_first() {
        let mut filter = KeyFilter::default();
        let actions = filter.process(&[b'a', b'b', PREFIX_KEY, b'd']);
        assert_eq!(
            actions,
            vec![
                KeyAction::Forward(vec![b'a', b'b']),
                KeyAction::Detach,
            ]
        );
    }

    #[test]
    fn prefix_state_survives_chunk_boundaries() {
        let mut filter = KeyFilter::default();
        assert!(filter.process(&[PREFIX_KEY]).is_empty());
        assert_eq!(filter.process(&[b'd']), vec![KeyAction::Detach]);
    }

    #[test]
    fn neighbor_selection_wraps() {
        let sessions: Vec<SessionInfo> = ["a", "b", "c"]
            .iter()
            .map(|id| SessionInfo {
                id: id.to_string(),
                name: None,
                created_at: String::new(),
                process_id: None,
                is_running: true,
                last_exit_code: None,
            })
            .collect();
        assert_eq!(pick_neighbor(&sessions, "a", true), Some("b".into()));
        assert_eq!(pick_neighbor(&sessions, "c", true), Some("a".into()));
        assert_eq!(pick_neighbor(&sessions, "a", false), Some("c".into()));
        assert_eq!(pick_neighbor(&[], "a", true), None);
    }

    #[test]
    fn sgr_covers_styles_and_colors() {
        let attr = Attribute {
            fg: Color::Ansi { index: 2 },
            bg: Color::TrueColor { r: 1, g: 2, b: 3 },
            style: Style::BOLD | Style::UNDERLINE,
            underline_color: None,
        };
        assert_eq!(sgr_sequence(&attr), "\x1b[0;1;4;38;5;2;48;2;1;2;3m");
        assert_eq!(sgr_sequence(&Attribute::default()), "\x1b[0m");
    }

    #[test]
    fn snapshot_frame_positions_every_row() {
        let snapshot = ScreenSnapshot {
            cols: 2,
            rows: 2,
            cursor_x: 1,
            cursor_y: 0,
            is_alternate: false,
            lines: vec![
                vec![
                    Cell {
                        ch: "a".into(),
                        width: 1,
                        attr: Attribute::default(),
                    },
                    Cell {
                        ch: "b".into(),
                        width: 1,
                        attr: Attribute::default(),
                    },
                ],
                vec![Cell::blank(), Cell::blank()],
            ],
        };
        let frame = snapshot_frame(&snapshot);
        assert!(frame.contains("\x1b[2J"));
        assert!(frame.contains("\x1b[1;1H"));
        assert!(frame.contains("\x1b[2;1H"));
        assert!(frame.contains("ab"));
        // Cursor parked at (x=1, y=0) => row 1, column 2.
        assert!(frame.ends_with("\x1b[0m\x1b[1;2H\x1b[?25h"));
    }

    #[test]
    fn delta_frame_skips_width_zero_companions() {
        let delta = ScreenDelta {
            start_y: 4,
            end_y: 4,
            cursor_x: 0,
            cursor_y: 4,
            lines: vec![vec![
                Cell {
                    ch: "漢".into(),
                    width: 2,
                    attr: Attribute::default(),
                },
                Cell {
                    ch: String::new(),
                    width: 0,
                    attr: Attribute::default(),
                },
            ]],
        };
        let frame = delta_frame(&delta);
        assert!(frame.contains("\x1b[5;1H"));
        assert!(frame.contains("漢"));
        // The companion must not become a stray space after the glyph.
        assert!(!frame.contains("漢 "));
    }
}
