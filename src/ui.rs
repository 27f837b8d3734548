use crate::client::RelayClient;
use crate::conversation::{ChatSnapshot, Conversation, Role, Turn};
use crate::protocol::RelayMode;
use crossterm::cursor::MoveTo;
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use ratatui::backend::CrosstermBackend;
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Paragraph, Widget, Wrap};
use ratatui::{Frame, Terminal, TerminalOptions, Viewport};
use std::io;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

type TuiTerminal = Terminal<CrosstermBackend<io::Stdout>>;
type UiResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const INPUT_HEIGHT: u16 = 6;

// Restores terminal settings even if the loop exits early.
struct TerminalGuard;

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = io::stdout().flush();
    }
}

/// One block of transcript printed above the input box.
#[derive(Debug, Clone, PartialEq)]
enum ChatLine {
    User(String),
    Assistant(String),
    Info(String),
    Error(String),
}

impl From<&Turn> for ChatLine {
    fn from(turn: &Turn) -> Self {
        match turn.role() {
            Role::User => ChatLine::User(turn.content().to_string()),
            Role::Assistant => ChatLine::Assistant(turn.content().to_string()),
        }
    }
}

#[derive(Debug, Clone)]
struct LineSpec {
    text: String,
    style: Style,
}

impl ChatLine {
    fn line_specs(&self) -> Vec<LineSpec> {
        let (header, body, color) = match self {
            ChatLine::User(body) => ("You:", body, Color::Blue),
            ChatLine::Assistant(body) => ("Assistant:", body, Color::Yellow),
            ChatLine::Error(body) => ("Error:", body, Color::Red),
            ChatLine::Info(body) => {
                return vec![LineSpec {
                    text: format!("ℹ {}", body),
                    style: Style::default()
                        .fg(Color::Gray)
                        .add_modifier(Modifier::ITALIC),
                }];
            }
        };

        let body_style = Style::default().fg(color);
        let mut lines = vec![LineSpec {
            text: header.to_string(),
            style: body_style.add_modifier(Modifier::BOLD),
        }];
        for line in body.lines() {
            lines.push(LineSpec {
                text: format!("  {}", line),
                style: body_style,
            });
        }
        lines
    }

    fn to_text(&self) -> Text<'static> {
        let lines = self
            .line_specs()
            .into_iter()
            .map(|spec| Line::from(Span::styled(spec.text, spec.style)))
            .collect::<Vec<_>>();
        Text::from(lines)
    }

    fn rendered_height(&self, width: u16) -> u16 {
        let width = width.max(1) as usize;
        let total: usize = self
            .line_specs()
            .iter()
            .map(|spec| spec.text.chars().count().max(1).div_ceil(width))
            .sum();
        total.min(u16::MAX as usize) as u16
    }
}

/// Text being typed. `cursor` counts chars, not bytes.
#[derive(Debug, Default)]
struct Composer {
    text: String,
    cursor: usize,
}

impl Composer {
    fn byte_offset(&self) -> usize {
        self.text
            .char_indices()
            .nth(self.cursor)
            .map_or(self.text.len(), |(idx, _)| idx)
    }

    fn insert(&mut self, c: char) {
        let at = self.byte_offset();
        self.text.insert(at, c);
        self.cursor += 1;
    }

    fn backspace(&mut self) {
        if self.cursor == 0 {
            return;
        }
        self.cursor -= 1;
        let at = self.byte_offset();
        self.text.remove(at);
    }

    fn move_left(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    fn move_right(&mut self) {
        self.cursor = (self.cursor + 1).min(self.text.chars().count());
    }

    fn move_home(&mut self) {
        self.cursor = 0;
    }

    fn move_end(&mut self) {
        self.cursor = self.text.chars().count();
    }

    fn take(&mut self) -> String {
        self.cursor = 0;
        std::mem::take(&mut self.text)
    }

    fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// (column, row) of the cursor inside the text.
    fn cursor_position(&self) -> (usize, usize) {
        let before = &self.text[..self.byte_offset()];
        let row = before.matches('\n').count();
        let col = before.rsplit('\n').next().map_or(0, |line| line.chars().count());
        (col, row)
    }

    fn render(&self) -> Text<'static> {
        if self.text.is_empty() {
            return Text::from(Span::styled(
                "Type your message here...",
                Style::default().fg(Color::DarkGray),
            ));
        }
        Text::from(self.text.clone())
    }
}

/// The current error, if a failure happened since `shown_failures` and no
/// later submission has cleared it yet.
fn unshown_error(snapshot: &ChatSnapshot, shown_failures: u64) -> Option<&str> {
    if snapshot.failures > shown_failures {
        snapshot.error.as_deref()
    } else {
        None
    }
}

pub struct App {
    conversation: Arc<Conversation<RelayClient>>,
    mode: RelayMode,
    composer: Composer,
    shown_turns: usize,
    shown_epoch: u64,
    shown_failures: u64,
    busy: bool,
    should_quit: bool,
}

impl App {
    pub fn new(conversation: Arc<Conversation<RelayClient>>, mode: RelayMode) -> Self {
        Self {
            conversation,
            mode,
            composer: Composer::default(),
            shown_turns: 0,
            shown_epoch: 0,
            shown_failures: 0,
            busy: false,
            should_quit: false,
        }
    }

    fn draw(&mut self, f: &mut Frame) {
        let area = f.area();
        let title = if self.busy {
            " Message (Enter to send, /quit or Esc to exit) [Thinking...] "
        } else {
            " Message (Enter to send, /quit or Esc to exit) "
        };

        let input_paragraph = Paragraph::new(self.composer.render())
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(title)
                    .border_style(Style::default().fg(Color::DarkGray)),
            )
            .wrap(Wrap { trim: false });

        f.render_widget(input_paragraph, area);

        let (col, row) = self.composer.cursor_position();
        let x = (area.x + 1 + col as u16).min(area.x + area.width - 2);
        let y = (area.y + 1 + row as u16).min(area.y + area.height - 2);
        f.set_cursor_position((x, y));
    }

    fn print(&self, terminal: &mut TuiTerminal, line: ChatLine) -> UiResult<()> {
        let width = terminal.size()?.width;
        let height = line.rendered_height(width).saturating_add(1);
        let mut text = line.to_text();
        text.extend(Text::raw("\n"));
        // Insert above the inline viewport so the log stays in scrollback.
        terminal.insert_before(height, |buf| {
            let paragraph = Paragraph::new(text).wrap(Wrap { trim: false });
            paragraph.render(buf.area, buf);
        })?;
        Ok(())
    }

    /// Prints whatever the store gained since the last tick.
    fn sync_transcript(&mut self, terminal: &mut TuiTerminal) -> UiResult<()> {
        let snapshot = self.conversation.snapshot();

        if snapshot.epoch != self.shown_epoch {
            self.shown_epoch = snapshot.epoch;
            self.shown_turns = 0;
            self.shown_failures = 0;
            let banner = match &snapshot.session_id {
                Some(id) => format!("Session {}", id),
                None => "New conversation".to_string(),
            };
            self.print(terminal, ChatLine::Info(banner))?;
        }

        for turn in snapshot.turns.iter().skip(self.shown_turns) {
            self.print(terminal, ChatLine::from(turn))?;
        }
        self.shown_turns = snapshot.turns.len();

        if let Some(error) = unshown_error(&snapshot, self.shown_failures) {
            self.print(terminal, ChatLine::Error(error.to_string()))?;
        }
        self.shown_failures = snapshot.failures;

        self.busy = snapshot.busy;
        Ok(())
    }

    fn submit_input(&mut self, terminal: &mut TuiTerminal) -> UiResult<()> {
        if self.composer.is_blank() {
            return Ok(());
        }
        if let Some(command) = self.composer.text.trim().strip_prefix('/') {
            let command = command.to_string();
            self.composer.take();
            return self.run_command(terminal, &command);
        }
        if self.conversation.is_busy() {
            return Ok(());
        }

        let text = self.composer.take();
        let conversation = Arc::clone(&self.conversation);
        tokio::spawn(async move {
            conversation.submit(&text).await;
        });
        Ok(())
    }

    fn run_command(&mut self, terminal: &mut TuiTerminal, command: &str) -> UiResult<()> {
        let (name, arg) = match command.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (command, ""),
        };

        match (name, self.mode) {
            ("quit", _) => self.should_quit = true,
            ("new", RelayMode::Session) => self
                .conversation
                .reset(Some(Uuid::new_v4().to_string())),
            ("new", RelayMode::Prompt) => self.conversation.reset(None),
            ("session", RelayMode::Session) if !arg.is_empty() => {
                self.conversation.reset(Some(arg.to_string()))
            }
            ("session", RelayMode::Session) => {
                self.print(terminal, ChatLine::Info("Usage: /session <id>".to_string()))?
            }
            ("session", RelayMode::Prompt) => self.print(
                terminal,
                ChatLine::Info("Sessions need --mode session".to_string()),
            )?,
            _ => self.print(
                terminal,
                ChatLine::Info(format!("Unknown command: /{}", name)),
            )?,
        }
        Ok(())
    }

    fn handle_events(&mut self, terminal: &mut TuiTerminal) -> UiResult<bool> {
        self.sync_transcript(terminal)?;

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c')
                {
                    self.should_quit = true;
                    return Ok(false);
                }

                match key.code {
                    KeyCode::Esc => {
                        self.should_quit = true;
                        return Ok(false);
                    }
                    KeyCode::Enter if key.modifiers.contains(KeyModifiers::SHIFT) => {
                        self.composer.insert('\n');
                    }
                    KeyCode::Enter => self.submit_input(terminal)?,
                    KeyCode::Char(c) => self.composer.insert(c),
                    KeyCode::Backspace => self.composer.backspace(),
                    KeyCode::Left => self.composer.move_left(),
                    KeyCode::Right => self.composer.move_right(),
                    KeyCode::Home => self.composer.move_home(),
                    KeyCode::End => self.composer.move_end(),
                    _ => {}
                }
            }
        }

        Ok(!self.should_quit)
    }
}

pub fn run_tui(conversation: Arc<Conversation<RelayClient>>, mode: RelayMode) -> UiResult<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    let (_, rows) = size()?;
    if rows > 0 {
        // Push existing screen content into scrollback without clearing it.
        for _ in 0..rows {
            writeln!(stdout)?;
        }
        stdout.flush()?;
    }
    execute!(stdout, MoveTo(0, 0))?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::with_options(
        backend,
        TerminalOptions {
            viewport: Viewport::Inline(INPUT_HEIGHT),
        },
    )?;

    let mut app = App::new(conversation, mode);

    let _guard = TerminalGuard;

    terminal.draw(|f| app.draw(f))?;

    while !app.should_quit {
        if !app.handle_events(&mut terminal)? {
            break;
        }

        terminal.draw(|f| app.draw(f))?;

        std::thread::sleep(Duration::from_millis(10));
    }

    Ok(())
}
