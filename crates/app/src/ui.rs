//! Terminal dashboard
//!
//! Read-only view over the shared snapshot and the publisher's status. Runs on
//! its own blocking thread and redraws at `ui.refresh_rate`.

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use micmon_core::domain::activity::ActivityState;
use micmon_core::domain::audio::{unix_timestamp, Channel};
use micmon_core::domain::config::Settings;
use micmon_core::domain::publish::{ConnectionState, Publisher, PublisherStats};
use micmon_core::domain::snapshot::{ChannelReading, SharedSnapshot, Snapshot};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph},
    Frame, Terminal,
};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Static facts shown on the dashboard
#[derive(Debug, Clone, PartialEq)]
pub struct DashboardInfo {
    pub broker: String,
    pub threshold: f64,
    pub left_device: String,
    pub right_device: String,
}

impl DashboardInfo {
    pub fn new(settings: &Settings, left_device: String, right_device: String) -> Self {
        Self {
            broker: format!("{}:{}", settings.mqtt.broker, settings.mqtt.port),
            threshold: settings.audio.threshold,
            left_device,
            right_device,
        }
    }

    fn device(&self, channel: Channel) -> &str {
        match channel {
            Channel::Left => &self.left_device,
            Channel::Right => &self.right_device,
        }
    }
}

/// Publisher status captured once per frame
#[derive(Debug, Clone, PartialEq)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub stats: PublisherStats,
}

impl LinkStatus {
    pub fn of(publisher: &dyn Publisher) -> Self {
        Self {
            state: publisher.connection_state(),
            stats: publisher.stats(),
        }
    }

    fn label(&self) -> String {
        match self.state {
            ConnectionState::Backoff | ConnectionState::Connecting
                if self.stats.reconnect_attempts > 0 =>
            {
                format!("{} (attempt {})", self.state, self.stats.reconnect_attempts)
            }
            state => state.to_string(),
        }
    }

    fn color(&self) -> Color {
        match self.state {
            ConnectionState::Connected => Color::Green,
            ConnectionState::Connecting => Color::Yellow,
            ConnectionState::Backoff | ConnectionState::Disconnected => Color::Red,
        }
    }
}

/// Gauge fill for a level, full at four times the threshold
pub fn gauge_ratio(level: f64, threshold: f64) -> f64 {
    let scale = threshold * 4.0;
    let ratio = if scale > 0.0 {
        level / scale
    } else if level > 0.0 {
        1.0
    } else {
        0.0
    };
    if ratio.is_finite() {
        ratio.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub fn is_quit_key(key: &KeyEvent) -> bool {
    if key.kind != KeyEventKind::Press {
        return false;
    }
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => true,
        KeyCode::Char('c') => key.modifiers.contains(KeyModifiers::CONTROL),
        _ => false,
    }
}

/// Render one frame
pub fn draw(frame: &mut Frame<'_>, info: &DashboardInfo, snapshot: &Snapshot, link: &LinkStatus, now: i64) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(3),
        ])
        .split(frame.size());

    draw_header(frame, rows[0], info, link);

    let panels = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(rows[1]);
    for (channel, area) in Channel::ALL.into_iter().zip(panels.iter()) {
        draw_channel(frame, *area, channel, info, snapshot.get(channel));
    }

    draw_footer(frame, rows[2], link, now);
}

fn draw_header(frame: &mut Frame<'_>, area: Rect, info: &DashboardInfo, link: &LinkStatus) {
    let line = Line::from(vec![
        Span::styled(
            "Microphone Monitor",
            Style::default().add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!("  Broker: {}  Status: ", info.broker)),
        Span::styled(link.label(), Style::default().fg(link.color())),
        Span::raw(format!("  Messages sent: {}", link.stats.messages_sent)),
    ]);
    frame.render_widget(
        Paragraph::new(line).block(Block::default().borders(Borders::ALL)),
        area,
    );
}

fn draw_channel(
    frame: &mut Frame<'_>,
    area: Rect,
    channel: Channel,
    info: &DashboardInfo,
    reading: &ChannelReading,
) {
    let title = match channel {
        Channel::Left => " Left Microphone ",
        Channel::Right => " Right Microphone ",
    };
    let block = Block::default().borders(Borders::ALL).title(title);
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let parts = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(4), Constraint::Length(3)])
        .split(inner);

    let state_color = match reading.state {
        ActivityState::Active => Color::Green,
        ActivityState::Inactive => Color::Blue,
    };
    let mut lines = vec![
        Line::from(format!("Device: {}", info.device(channel))),
        Line::from(vec![
            Span::raw("State: "),
            Span::styled(
                reading.state.label(),
                Style::default().fg(state_color).add_modifier(Modifier::BOLD),
            ),
        ]),
        Line::from(format!("Level: {:.2}", reading.level)),
    ];
    if let Some(reason) = &reading.halted {
        lines.push(Line::from(Span::styled(
            format!("Halted: {}", reason),
            Style::default().fg(Color::Red),
        )));
    }
    frame.render_widget(Paragraph::new(lines), parts[0]);

    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Level"))
        .gauge_style(Style::default().fg(state_color))
        .ratio(gauge_ratio(reading.level, info.threshold))
        .label(format!("{:.0} / {:.0}", reading.level, info.threshold));
    frame.render_widget(gauge, parts[1]);
}

fn draw_footer(frame: &mut Frame<'_>, area: Rect, link: &LinkStatus, now: i64) {
    let text = match &link.stats.last_message {
        Some(last) => format!(
            "Last message ({}s ago): {}",
            (now - last.timestamp).max(0),
            last.summary
        ),
        None => "No messages sent yet".to_string(),
    };
    frame.render_widget(
        Paragraph::new(text).block(Block::default().borders(Borders::ALL)),
        area,
    );
}

/// Raw mode and alternate screen for as long as it lives
struct TerminalGuard;

impl TerminalGuard {
    fn enter() -> io::Result<Self> {
        enable_raw_mode()?;
        let guard = TerminalGuard;
        execute!(io::stdout(), EnterAlternateScreen, crossterm::cursor::Hide)?;
        Ok(guard)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen, crossterm::cursor::Show);
    }
}

/// Draw until a quit key is pressed or `stop` is raised
pub fn run_dashboard(
    info: DashboardInfo,
    snapshot: SharedSnapshot,
    publisher: Arc<dyn Publisher>,
    refresh: Duration,
    stop: Arc<AtomicBool>,
) -> io::Result<()> {
    let guard = TerminalGuard::enter()?;
    let mut terminal = Terminal::new(CrosstermBackend::new(io::stdout()))?;

    let result = loop {
        if stop.load(Ordering::SeqCst) {
            break Ok(());
        }

        let view = snapshot.read();
        let link = LinkStatus::of(publisher.as_ref());
        let now = unix_timestamp();
        if let Err(e) = terminal.draw(|frame| draw(frame, &info, &view, &link, now)) {
            break Err(e);
        }

        match event::poll(refresh) {
            Ok(true) => match event::read() {
                Ok(Event::Key(key)) if is_quit_key(&key) => break Ok(()),
                Ok(_) => {}
                Err(e) => break Err(e),
            },
            Ok(false) => {}
            Err(e) => break Err(e),
        }
    };

    drop(terminal);
    drop(guard);
    result
}
