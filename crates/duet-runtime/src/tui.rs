use std::io;
use std::time::{Duration, Instant};

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::prelude::*;
use ratatui::widgets::*;
use tokio::sync::mpsc;

use duet_core::TestStatus;

use crate::app::{App, Outcome, View};
use crate::display::{
    banner, compile_label, detail_rows, detailed_diff_lines, expandable, progress_label, status_indicator,
    TABLE_HEADER,
};
use crate::listener::{ListenerEvent, SocketServer};
use crate::process::{ProcessRunner, RunEvent};

// ---------------------------------------------------------------------------
// Terminal cleanup guard
// ---------------------------------------------------------------------------

/// Restores the terminal when dropped, including on panic or early `?`.
struct TerminalGuard;

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
    }
}

// ---------------------------------------------------------------------------
// Run targets
// ---------------------------------------------------------------------------

/// What Enter / `r` launch.
pub enum Target {
    /// One fixed command (`duet run`).
    Command(ProcessRunner),
    /// Whatever script is selected in the browser (`duet browse`).
    Scripts { python: String },
}

/// Everything the loop needs to start runs.
pub struct Launcher<'a> {
    pub target: Target,
    /// Passed to every child so its emitter finds the listener.
    pub env: Vec<(String, String)>,
    pub server: Option<&'a SocketServer>,
}

impl Launcher<'_> {
    fn runner(&self, app: &App) -> Option<ProcessRunner> {
        let runner = match &self.target {
            Target::Command(runner) => runner.clone(),
            Target::Scripts { python } => {
                let (program, args) = app.selected_script()?.command(python);
                ProcessRunner::new(program, args)
            }
        };
        Some(
            self.env
                .iter()
                .fold(runner, |runner, (key, value)| runner.env(key, value)),
        )
    }

    fn start(&self, app: &mut App, runner: ProcessRunner, events: &mpsc::UnboundedSender<RunEvent>) {
        // A producer left over from the previous run must not feed this one.
        if let Some(server) = self.server {
            server.drop_connection();
        }
        let run = app.begin_run(runner.display());
        runner.launch(run, events.clone());
    }
}

// ---------------------------------------------------------------------------
// Key handling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyAction {
    None,
    /// Run the selected script.
    Run,
    /// Run the last command again.
    Rerun,
}

fn handle_key(app: &mut App, code: KeyCode, modifiers: KeyModifiers) -> KeyAction {
    match (code, modifiers) {
        (KeyCode::Char('q'), _) | (KeyCode::Char('c'), KeyModifiers::CONTROL) => {
            app.should_quit = true;
        }
        (KeyCode::Char('j'), _) | (KeyCode::Down, _) => app.next(),
        (KeyCode::Char('k'), _) | (KeyCode::Up, _) => app.previous(),
        (KeyCode::Enter, _) => match app.view {
            View::Scripts => return KeyAction::Run,
            View::Results => app.toggle_expanded(),
        },
        (KeyCode::Char('d'), _) => app.toggle_expanded(),
        (KeyCode::Char('r'), _) => return KeyAction::Rerun,
        (KeyCode::Esc, _) | (KeyCode::Tab, _) => app.toggle_view(),
        _ => {}
    }
    KeyAction::None
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the TUI until the user quits. A fixed command starts immediately;
/// the script browser waits for Enter. Returns the outcome of the last run.
pub async fn run_tui(
    app: &mut App,
    launcher: Launcher<'_>,
    listener_rx: &mut mpsc::UnboundedReceiver<ListenerEvent>,
) -> anyhow::Result<Option<Outcome>> {
    let (run_tx, mut run_rx) = mpsc::unbounded_channel();
    let mut last: Option<ProcessRunner> = None;

    if matches!(launcher.target, Target::Command(_)) {
        if let Some(runner) = launcher.runner(app) {
            launcher.start(app, runner.clone(), &run_tx);
            last = Some(runner);
        }
    }

    enable_raw_mode()?;
    let _guard = TerminalGuard;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    loop {
        terminal.draw(|frame| render(frame, app))?;

        if app.should_quit {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                while event::poll(Duration::from_millis(0))? {
                    let Event::Key(key) = event::read()? else {
                        continue;
                    };
                    if key.kind != KeyEventKind::Press {
                        continue;
                    }
                    let runner = match handle_key(app, key.code, key.modifiers) {
                        KeyAction::None => None,
                        KeyAction::Run => launcher.runner(app),
                        KeyAction::Rerun => last.clone(),
                    };
                    if let Some(runner) = runner {
                        launcher.start(app, runner.clone(), &run_tx);
                        last = Some(runner);
                    }
                }
                app.tick(Instant::now());
            }
            Some(event) = run_rx.recv() => app.handle_run_event(event, Instant::now()),
            Some(event) = listener_rx.recv() => app.handle_listener_event(event),
        }
    }

    terminal.show_cursor()?;
    Ok(last.and_then(|_| app.outcome()))
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn status_style(status: TestStatus) -> Style {
    match status {
        TestStatus::Pass => Style::default().fg(Color::Green),
        TestStatus::Fail => Style::default().fg(Color::Red),
        TestStatus::Running => Style::default().fg(Color::Yellow),
        TestStatus::Pending => Style::default().fg(Color::DarkGray),
    }
}

fn run_state(app: &App) -> (String, Style) {
    match app.outcome() {
        None => ("running".into(), Style::default().fg(Color::Yellow)),
        Some(Outcome::Passed) => ("passed".into(), Style::default().fg(Color::Green)),
        Some(Outcome::Failed) => ("failed".into(), Style::default().fg(Color::Red)),
        Some(Outcome::Fatal(msg)) => (format!("error: {msg}"), Style::default().fg(Color::Red).bold()),
    }
}

/// Render the full TUI frame.
fn render(frame: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Title bar
            Constraint::Length(3), // Progress
            Constraint::Min(5),    // Body
            Constraint::Length(3), // Help bar
        ])
        .split(frame.area());

    // Title
    let mut title = vec![Span::styled(" DUET ", Style::default().fg(Color::Cyan).bold())];
    if app.run_id() > 0 {
        let (state, style) = run_state(app);
        title.push(Span::raw(format!(" {} ", app.title())));
        title.push(Span::styled(state, style));
    }
    if let Some(peer) = app.socket_peer() {
        title.push(Span::styled(format!("  socket {peer}"), Style::default().fg(Color::DarkGray)));
    }
    let title = Paragraph::new(Line::from(title)).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Cyan)),
    );
    frame.render_widget(title, chunks[0]);

    // Progress
    let session = app.session();
    let mut label = progress_label(session);
    if let Some(compile) = compile_label(session) {
        label = format!("{compile}  |  {label}");
    }
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL))
        .gauge_style(Style::default().fg(Color::Green))
        .percent(u16::from(session.progress()))
        .label(label);
    frame.render_widget(gauge, chunks[1]);

    match app.view {
        View::Scripts => render_scripts(frame, app, chunks[2]),
        View::Results => render_results(frame, app, chunks[2]),
    }

    // Help bar
    let help = match app.view {
        View::Scripts => " j/k: navigate | enter: run | r: rerun | tab: results | q: quit",
        View::Results => " j/k: navigate | enter/d: details | r: rerun | tab: scripts | q: quit",
    };
    let help = Paragraph::new(help).block(Block::default().borders(Borders::ALL));
    frame.render_widget(help, chunks[3]);
}

fn render_scripts(frame: &mut Frame, app: &App, area: Rect) {
    let rows: Vec<Row> = app
        .scripts
        .iter()
        .enumerate()
        .map(|(i, script)| {
            let style = if i == app.script_selected {
                Style::default().bg(Color::DarkGray)
            } else {
                Style::default()
            };
            Row::new(vec![script.category.clone(), script.name()]).style(style)
        })
        .collect();
    let table = Table::new(rows, [Constraint::Length(20), Constraint::Min(20)])
        .header(Row::new(vec!["Category", "Script"]).style(Style::default().bold()))
        .block(Block::default().borders(Borders::ALL).title(" Scripts "));
    let mut state = TableState::default().with_selected(Some(app.script_selected));
    frame.render_stateful_widget(table, area, &mut state);
}

fn render_results(frame: &mut Frame, app: &App, area: Rect) {
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(35), Constraint::Percentage(65)])
        .split(area);

    let rows: Vec<Row> = app
        .records()
        .iter()
        .enumerate()
        .map(|(i, record)| {
            let mut style = status_style(record.status);
            if i == app.selected {
                style = style.bg(Color::DarkGray);
            }
            Row::new(vec![status_indicator(record.status).to_string(), record.id.clone()]).style(style)
        })
        .collect();
    let list = Table::new(rows, [Constraint::Length(2), Constraint::Min(10)])
        .block(Block::default().borders(Borders::ALL).title(" Tests "));
    let mut state = TableState::default().with_selected(Some(app.selected));
    frame.render_stateful_widget(list, columns[0], &mut state);

    render_detail(frame, app, columns[1]);
}

fn render_detail(frame: &mut Frame, app: &App, area: Rect) {
    let block = Block::default().borders(Borders::ALL).title(" Detail ");
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let Some(record) = app.selected_record() else {
        let text = match app.fatal() {
            Some(msg) => Line::styled(msg.to_owned(), Style::default().fg(Color::Red)),
            None if app.is_running() => Line::raw("waiting for results..."),
            None => Line::raw("no test records"),
        };
        frame.render_widget(Paragraph::new(text).wrap(Wrap { trim: false }), inner);
        return;
    };

    let mut head = vec![Line::styled(banner(record), status_style(record.status).bold())];
    if !record.fail_reason.is_empty() {
        head.push(Line::raw(format!("reason: {}", record.fail_reason)));
    }
    if expandable(record) && !app.expanded {
        head.push(Line::styled(
            format!("{} detailed diffs (enter to expand)", record.detailed_diffs.len()),
            Style::default().fg(Color::DarkGray),
        ));
    }
    let diffs: Vec<Line> = detailed_diff_lines(record, app.expanded)
        .into_iter()
        .map(Line::raw)
        .collect();

    let head_height = u16::try_from(head.len()).unwrap_or(u16::MAX);
    let diff_height = if diffs.is_empty() {
        0
    } else {
        u16::try_from(diffs.len() + 2).unwrap_or(u16::MAX)
    };
    let parts = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(head_height),
            Constraint::Min(3),
            Constraint::Length(diff_height),
        ])
        .split(inner);

    frame.render_widget(Paragraph::new(head).wrap(Wrap { trim: false }), parts[0]);

    if let Some(rows) = detail_rows(record) {
        let rows: Vec<Row> = rows.into_iter().map(|cells| Row::new(cells.to_vec())).collect();
        let table = Table::new(rows, [Constraint::Ratio(1, 4); 4])
            .header(Row::new(TABLE_HEADER.to_vec()).style(Style::default().bold()))
            .block(Block::default().borders(Borders::TOP));
        frame.render_widget(table, parts[1]);
    }

    if !diffs.is_empty() {
        let diffs = Paragraph::new(diffs)
            .wrap(Wrap { trim: false })
            .block(Block::default().borders(Borders::ALL).title(" Detailed diffs "));
        frame.render_widget(diffs, parts[2]);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
