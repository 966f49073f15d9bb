//! Operator dashboard with three tabs:
//! Overview (tasks per status, broker queue depths)
//! Queue (next scheduled tasks)
//! Logs (latest task log entries)

use std::{
  error::Error,
  io,
  sync::{Arc, mpsc},
  time::{Duration, Instant},
};

use crossterm::{
  event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyCode},
  execute,
  terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use dtsched::config::Config;
use dtsched::database::setup_database;
use dtsched::dispatch::{AmqpDispatchQueue, RoutingPolicy};
use dtsched::models::{Task, TaskStatus};
use dtsched::store::{PgTaskStore, TaskLogLine, TaskStore};
use tokio::runtime::Runtime;
use tui::{
  Terminal,
  backend::{Backend, CrosstermBackend},
  layout::{Constraint, Direction, Layout, Rect},
  style::{Color, Modifier, Style},
  text::{Span, Spans},
  widgets::{Block, Borders, List, ListItem, Paragraph, Tabs},
};

const REFRESH_EVERY: Duration = Duration::from_secs(2);
const UPCOMING_LIMIT: i64 = 10;
const LOG_LIMIT: i64 = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DashboardTab {
  Overview,
  Queue,
  Logs,
}

#[derive(Default)]
struct Snapshot {
  counts: Vec<(TaskStatus, i64)>,
  queue_depths: Vec<(String, Option<u32>)>,
  upcoming: Vec<Task>,
  logs: Vec<TaskLogLine>,
  error: Option<String>,
}

struct App {
  current_tab: DashboardTab,
  snapshot: Snapshot,
}

impl App {
  fn new() -> Self {
    Self { current_tab: DashboardTab::Overview, snapshot: Snapshot::default() }
  }

  fn next_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Overview => DashboardTab::Queue,
      DashboardTab::Queue => DashboardTab::Logs,
      DashboardTab::Logs => DashboardTab::Overview,
    }
  }

  fn previous_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Overview => DashboardTab::Logs,
      DashboardTab::Queue => DashboardTab::Overview,
      DashboardTab::Logs => DashboardTab::Queue,
    }
  }

  /// One line per status, including the ones with no tasks.
  fn status_lines(&self) -> Vec<(TaskStatus, i64)> {
    TaskStatus::ALL
      .iter()
      .map(|status| {
        let count = self
          .snapshot
          .counts
          .iter()
          .find(|(s, _)| s == status)
          .map_or(0, |(_, n)| *n);
        (*status, count)
      })
      .collect()
  }
}

async fn fetch_snapshot(store: &dyn TaskStore, queue: &AmqpDispatchQueue, routing: &RoutingPolicy) -> Snapshot {
  let mut snapshot = Snapshot::default();
  let fetched = async {
    snapshot.counts = store.status_counts().await?;
    snapshot.upcoming = store.upcoming(UPCOMING_LIMIT).await?;
    snapshot.logs = store.recent_logs(LOG_LIMIT).await?;
    Ok::<(), dtsched::error::StoreError>(())
  }
  .await;
  if let Err(e) = fetched {
    snapshot.error = Some(format!("store: {e}"));
  }

  for name in routing.queues() {
    let depth = queue.message_count(&name).await.ok();
    snapshot.queue_depths.push((name, depth));
  }
  snapshot
}

fn main() -> Result<(), Box<dyn Error>> {
  let config = Config::from_env()?;
  let rt = Runtime::new()?;
  let db_pool = rt.block_on(setup_database(&config.database_url, 2))?;
  let queue = rt.block_on(AmqpDispatchQueue::connect(config.broker_url()?, 1))?;

  let store: Arc<dyn TaskStore> = Arc::new(PgTaskStore::new(db_pool));
  let routing = config.routing.clone();
  let (tx, rx) = mpsc::channel::<Snapshot>();
  rt.spawn(async move {
    loop {
      let snapshot = fetch_snapshot(store.as_ref(), &queue, &routing).await;
      if tx.send(snapshot).is_err() {
        break;
      }
      tokio::time::sleep(REFRESH_EVERY).await;
    }
  });

  enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
  let backend = CrosstermBackend::new(stdout);
  let mut terminal = Terminal::new(backend)?;

  let result = run_ui(&mut terminal, &rx);

  disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
  terminal.show_cursor()?;
  result
}

fn run_ui<B: Backend>(terminal: &mut Terminal<B>, rx: &mpsc::Receiver<Snapshot>) -> Result<(), Box<dyn Error>> {
  let mut app = App::new();
  let tick_rate = Duration::from_millis(500);
  let mut last_tick = Instant::now();

  loop {
    while let Ok(snapshot) = rx.try_recv() {
      app.snapshot = snapshot;
    }
    terminal.draw(|f| ui(f, &app))?;

    let timeout = tick_rate.checked_sub(last_tick.elapsed()).unwrap_or(Duration::ZERO);
    if event::poll(timeout)? {
      if let CEvent::Key(key) = event::read()? {
        match key.code {
          KeyCode::Char('q') => return Ok(()),
          KeyCode::Right => app.next_tab(),
          KeyCode::Left => app.previous_tab(),
          _ => {}
        }
      }
    }
    if last_tick.elapsed() >= tick_rate {
      last_tick = Instant::now();
    }
  }
}

fn ui<B: Backend>(f: &mut tui::Frame<B>, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(3)].as_ref())
    .split(f.size());

  let tab_titles = ["Overview", "Queue", "Logs"];
  let tabs = Tabs::new(
    tab_titles
      .iter()
      .map(|t| Spans::from(Span::styled(*t, Style::default().fg(Color::Yellow))))
      .collect(),
  )
  .block(Block::default().borders(Borders::ALL).title("Task Scheduler"))
  .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
  .select(match app.current_tab {
    DashboardTab::Overview => 0,
    DashboardTab::Queue => 1,
    DashboardTab::Logs => 2,
  });
  f.render_widget(tabs, chunks[0]);

  match app.current_tab {
    DashboardTab::Overview => render_overview(f, app, chunks[1]),
    DashboardTab::Queue => render_queue(f, app, chunks[1]),
    DashboardTab::Logs => render_logs(f, app, chunks[1]),
  }

  let footer_text = match &app.snapshot.error {
    Some(e) => format!("←/→: Switch Tabs | q: Quit | {e}"),
    None => "←/→: Switch Tabs | q: Quit".to_string(),
  };
  let footer = Paragraph::new(footer_text)
    .style(Style::default().fg(if app.snapshot.error.is_some() { Color::Red } else { Color::White }))
    .block(Block::default().borders(Borders::ALL));
  f.render_widget(footer, chunks[2]);
}

fn status_color(status: TaskStatus) -> Color {
  match status {
    TaskStatus::Success => Color::Green,
    TaskStatus::Failed => Color::Red,
    TaskStatus::Retrying => Color::Magenta,
    TaskStatus::Running => Color::Cyan,
    TaskStatus::Cancelled => Color::DarkGray,
    TaskStatus::Scheduled | TaskStatus::Pending => Color::Yellow,
  }
}

fn render_overview<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let chunks = Layout::default()
    .direction(Direction::Horizontal)
    .constraints([Constraint::Percentage(50), Constraint::Percentage(50)].as_ref())
    .split(area);

  let count_items: Vec<ListItem> = app
    .status_lines()
    .into_iter()
    .map(|(status, count)| {
      ListItem::new(Spans::from(vec![
        Span::styled(format!("{:<10}", status.as_str()), Style::default().fg(status_color(status))),
        Span::raw(format!(" {count}")),
      ]))
    })
    .collect();
  let counts = List::new(count_items).block(Block::default().borders(Borders::ALL).title("Tasks by Status"));
  f.render_widget(counts, chunks[0]);

  let depth_items: Vec<ListItem> = app
    .snapshot
    .queue_depths
    .iter()
    .map(|(name, depth)| {
      let depth = depth.map_or_else(|| "unavailable".to_string(), |n| n.to_string());
      ListItem::new(Spans::from(Span::raw(format!("{name}: {depth}"))))
    })
    .collect();
  let depths = List::new(depth_items).block(Block::default().borders(Borders::ALL).title("Broker Queues"));
  f.render_widget(depths, chunks[1]);
}

fn render_queue<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let task_items: Vec<ListItem> = app
    .snapshot
    .upcoming
    .iter()
    .map(|t| {
      ListItem::new(Spans::from(vec![
        Span::styled(format!("{} ", t.id), Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
        Span::raw(format!(
          "Type: {} | Run at: {} | Retries: {}/{}",
          t.task_type,
          t.run_at.format("%Y-%m-%d %H:%M:%S"),
          t.retries,
          t.max_retries
        )),
      ]))
    })
    .collect();
  let header = format!("Next {UPCOMING_LIMIT} Scheduled Tasks");
  let tasks_list = List::new(task_items).block(Block::default().borders(Borders::ALL).title(header));
  f.render_widget(tasks_list, area);
}

fn render_logs<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let log_items: Vec<ListItem> = app
    .snapshot
    .logs
    .iter()
    .map(|line| {
      ListItem::new(Spans::from(vec![
        Span::styled(line.entry.at.format("%Y-%m-%d %H:%M:%S").to_string(), Style::default().fg(Color::Green)),
        Span::raw(format!(" {} - ", line.task_id)),
        Span::raw(line.entry.message.clone()),
      ]))
    })
    .collect();
  let logs_list = List::new(log_items).block(Block::default().borders(Borders::ALL).title("Task Logs"));
  f.render_widget(logs_list, area);
}
