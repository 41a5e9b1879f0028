//! Live terminal monitor for a running scan

use crate::config::ScanOverrides;
use crate::proxy::WorkingProxy;
use crate::scan::{ScanController, ScanRun, ScanState};
use crate::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, List, ListItem, Paragraph, Wrap},
    Frame, Terminal,
};
use std::collections::VecDeque;
use std::io;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::time::Duration;

/// Maximum number of log lines kept for display
const MAX_LOG_LINES: usize = 200;

/// Color of a scan log line, by its prefix
pub fn line_color(line: &str) -> Color {
    if line.starts_with("[OK]") {
        Color::Green
    } else if line.starts_with("[GEO]") {
        Color::Magenta
    } else if line.starts_with("[TIMEOUT]") {
        Color::Yellow
    } else if line.starts_with("[FAIL]") || line.starts_with("[ERROR]") {
        Color::Red
    } else if line.starts_with("Warning") || line.starts_with("Failed") {
        Color::LightRed
    } else {
        Color::Gray
    }
}

/// Scan monitor TUI application state
pub struct ScanMonitorApp {
    controller: ScanController,
    /// Most recent log lines, oldest first
    lines: VecDeque<String>,
    /// Status as of the last refresh
    run: ScanRun,
    /// Working proxies found so far
    working: Vec<WorkingProxy>,
    should_quit: bool,
}

impl ScanMonitorApp {
    pub fn new(controller: ScanController) -> Self {
        Self {
            run: controller.status(),
            controller,
            lines: VecDeque::new(),
            working: Vec::new(),
            should_quit: false,
        }
    }

    /// Start a scan and follow it until it ends and the user quits.
    ///
    /// Quitting early stops the scan; the call still waits for in-flight
    /// probes and the result write before returning the final status.
    pub async fn run(&mut self, overrides: ScanOverrides) -> Result<ScanRun> {
        let logs = self.controller.subscribe_logs();
        let handle = self.controller.start(overrides)?;

        // Setup terminal
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let result = self.run_app(&mut terminal, logs).await;

        // Restore terminal
        disable_raw_mode()?;
        execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
        terminal.show_cursor()?;

        result?;
        Ok(handle.await?)
    }

    async fn run_app<B: Backend>(
        &mut self,
        terminal: &mut Terminal<B>,
        mut logs: broadcast::Receiver<String>,
    ) -> Result<()> {
        loop {
            self.drain_logs(&mut logs);
            self.run = self.controller.status();
            self.working = self.controller.live_results();

            terminal.draw(|f| self.ui(f))?;

            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_input(key.code);
                    }
                }
            }
            if self.should_quit {
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
    }

    fn drain_logs(&mut self, logs: &mut broadcast::Receiver<String>) {
        loop {
            match logs.try_recv() {
                Ok(line) => {
                    self.lines.push_back(line);
                    if self.lines.len() > MAX_LOG_LINES {
                        self.lines.pop_front();
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    self.lines.push_back(format!("... {skipped} log lines skipped"));
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return,
            }
        }
    }

    fn handle_input(&mut self, key: KeyCode) {
        match key {
            KeyCode::Char('q') | KeyCode::Esc => {
                if self.run.is_running() {
                    let _ = self.controller.stop();
                }
                self.should_quit = true;
            }
            KeyCode::Char('s') => {
                let _ = self.controller.stop();
            }
            _ => {}
        }
    }

    fn status_message(&self) -> String {
        let run = &self.run;
        match run.state {
            ScanState::Idle => "Waiting for the scan to start...".to_string(),
            ScanState::Running if run.stopping => {
                "Stopping, waiting for in-flight probes... | q: quit".to_string()
            }
            ScanState::Running => format!(
                "Scanning {} candidates | Working: {} | s: stop, q: quit",
                run.candidates, run.working
            ),
            ScanState::Finished => format!(
                "Complete! Probes: {} | Working: {} | Press 'q' to quit",
                run.probes_done, run.working
            ),
            ScanState::Failed => format!(
                "Failed: {} | Press 'q' to quit",
                run.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }

    fn ui(&mut self, f: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .margin(1)
            .constraints([
                Constraint::Length(3), // Title
                Constraint::Length(3), // Progress bar
                Constraint::Min(0),    // Log feed and working list
                Constraint::Length(3), // Status bar
            ])
            .split(f.size());

        let title = Paragraph::new("Proxy Finder")
            .style(Style::default().fg(Color::Cyan))
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL));
        f.render_widget(title, chunks[0]);

        let planned = self.run.probes_planned;
        let done = self.run.probes_done.min(planned);
        let progress = if planned > 0 {
            (done as f64 / planned as f64 * 100.0) as u16
        } else {
            0
        };
        let gauge = Gauge::default()
            .block(Block::default().borders(Borders::ALL).title("Probes"))
            .gauge_style(Style::default().fg(Color::Green).bg(Color::Black))
            .percent(progress)
            .label(format!("{}/{} ({}%)", done, planned, progress));
        f.render_widget(gauge, chunks[1]);

        let body = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(65), Constraint::Percentage(35)])
            .split(chunks[2]);
        self.render_logs(f, body[0]);
        self.render_working(f, body[1]);

        let done = matches!(self.run.state, ScanState::Finished | ScanState::Failed);
        let status = Paragraph::new(self.status_message())
            .style(match self.run.state {
                ScanState::Failed => Style::default().fg(Color::Red),
                _ if done => Style::default().fg(Color::Green),
                _ => Style::default().fg(Color::Yellow),
            })
            .wrap(Wrap { trim: true })
            .block(Block::default().borders(Borders::ALL).title("Status"));
        f.render_widget(status, chunks[3]);
    }

    fn render_logs(&self, f: &mut Frame, area: Rect) {
        // newest lines at the bottom, trimmed to what fits
        let visible = area.height.saturating_sub(2) as usize;
        let skip = self.lines.len().saturating_sub(visible);
        let items: Vec<ListItem> = self
            .lines
            .iter()
            .skip(skip)
            .map(|line| ListItem::new(line.as_str()).style(Style::default().fg(line_color(line))))
            .collect();

        let list = List::new(items).block(Block::default().borders(Borders::ALL).title("Log"));
        f.render_widget(list, area);
    }

    fn render_working(&self, f: &mut Frame, area: Rect) {
        let items: Vec<ListItem> = self
            .working
            .iter()
            .rev() // Show newest first
            .map(|w| {
                ListItem::new(format!("{} {} ({:.3}s)", w.proxy, w.scheme, w.latency))
                    .style(Style::default().fg(Color::Green))
            })
            .collect();

        let list = List::new(items).block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!("Working ({})", self.working.len()))
                .border_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
        );
        f.render_widget(list, area);
    }
}
