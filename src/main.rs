use anyhow::{Context, Result};
use clap::Parser;
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, Wrap},
    Frame, Terminal,
};
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pillowterm::api::HttpTransport;
use pillowterm::data::DayReport;
use pillowterm::entity::{ButtonKind, DeviceInfo, Sensor, SensorKind, SensorValue};
use pillowterm::{Config, Coordinator, PollOutcome, PollState, Store};

#[derive(Parser)]
#[command(name = "pillowterm")]
#[command(about = "YUDEE smart pillow sleep report for the terminal")]
#[command(version)]
struct Cli {
    /// Fetch last night's report at startup
    #[arg(short, long)]
    refresh: bool,

    /// Log in, store the token and exit
    #[arg(short, long)]
    login: bool,

    /// Fetch last night's report, print it and exit
    #[arg(long)]
    once: bool,

    /// Path to config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,
}

struct App {
    state: PollState,
    coordinator: Arc<Coordinator>,
    device: DeviceInfo,
    error_message: Option<String>,
}

impl App {
    fn new(coordinator: Arc<Coordinator>) -> Self {
        let device = DeviceInfo::for_identity(coordinator.identity());
        let state = coordinator.subscribe().borrow().clone();
        Self {
            state,
            coordinator,
            device,
            error_message: None,
        }
    }

    async fn press(&mut self, button: ButtonKind) {
        match button.press(&self.coordinator).await {
            Ok(PollOutcome::Updated(_)) => self.error_message = None,
            Ok(PollOutcome::Skipped) => {}
            Err(e) => self.error_message = Some(format!("Error: {}", e)),
        }
    }
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pillowterm=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => builder.with_writer(io::stderr).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let store = Store::open_default()?;

    let dashboard = !cli.login && !cli.once;
    let log_path = store.dir().join("pillowterm.log");
    init_logging(dashboard.then_some(log_path.as_path()))?;

    let identity = config
        .identity()
        .context("Device identity incomplete; set [device] in config.toml or PILLOW_* variables")?;
    let transport = Arc::new(HttpTransport::new(
        config.base_url(),
        config.polling.request_timeout(),
    )?);
    let coordinator = Arc::new(
        Coordinator::new(transport, identity)
            .with_store(store)
            .with_request_timeout(config.polling.request_timeout()),
    );

    if cli.login {
        let (_, renewed) = coordinator.current_token().await?;
        if renewed {
            println!("Login successful, token stored.");
        } else {
            println!("Stored token is still valid.");
        }
        return Ok(());
    }

    if cli.once {
        let outcome = ButtonKind::GetLastNightReport.press(&coordinator).await?;
        if let PollOutcome::Updated(report) = outcome {
            print_report(&coordinator, &report);
        }
        return Ok(());
    }

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(coordinator.clone());
    if cli.refresh {
        app.press(ButtonKind::GetLastNightReport).await;
    }

    let poller = tokio::spawn(coordinator.clone().run(config.polling.interval()));
    let res = run_app(&mut terminal, &mut app, coordinator.subscribe()).await;
    poller.abort();

    // Restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        error!("Dashboard exited with error: {:?}", err);
        println!("{:?}", err)
    }

    info!("Bye");
    Ok(())
}

fn print_report(coordinator: &Coordinator, report: &DayReport) {
    println!("Sleep report for {}", report.day);
    for sensor in Sensor::all(coordinator) {
        let description = sensor.kind.description();
        let value = sensor
            .native_value()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        match description.unit {
            Some(unit) => println!("  {:<26} {} {}", description.name, value, unit),
            None => println!("  {:<26} {}", description.name, value),
        }
    }
}

async fn run_app<B: Backend>(
    terminal: &mut Terminal<B>,
    app: &mut App,
    mut updates: watch::Receiver<PollState>,
) -> Result<()> {
    let tick_rate = std::time::Duration::from_millis(250);

    loop {
        if updates.has_changed().unwrap_or(false) {
            app.state = updates.borrow_and_update().clone();
        }

        terminal.draw(|f| ui(f, app))?;

        if crossterm::event::poll(tick_rate)? {
            if let Event::Key(key) = event::read()? {
                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                    KeyCode::Char('r') => {
                        app.press(ButtonKind::GetLastNightReport).await;
                    }
                    _ => app.error_message = None,
                }
            }
        }
    }
}

fn ui(f: &mut Frame, app: &App) {
    let size = f.size();

    // Main layout
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Length(2), // Device info
            Constraint::Min(10),   // Main content
            Constraint::Length(1), // Footer
        ])
        .split(size);

    // Header
    let header = Paragraph::new("SMART PILLOW")
        .style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
        .alignment(Alignment::Center)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_type(ratatui::widgets::BorderType::Rounded),
        );
    f.render_widget(header, chunks[0]);

    // Device info
    let updated = match (&app.state.report, &app.state.last_error) {
        (_, Some(err)) => format!("Last poll failed: {}", err),
        (Some(report), None) => format!(
            "Night of {}  |  fetched {}",
            report.day,
            report.fetched_at.with_timezone(&chrono::Local).format("%H:%M")
        ),
        (None, None) => "No report yet".to_string(),
    };
    let device_text = format!(
        "  {}  |  {} {}  |  {}",
        app.device.title, app.device.manufacturer, app.device.model, updated
    );
    f.render_widget(
        Paragraph::new(device_text).style(Style::default().fg(Color::Gray)),
        chunks[1],
    );

    // Main content
    match &app.state.report {
        Some(_) => render_main_content(f, chunks[2], &Sensor::all(&app.coordinator)),
        None => {
            let waiting = Paragraph::new("Waiting for the first report... press [r] to fetch now")
                .style(Style::default().fg(Color::DarkGray))
                .alignment(Alignment::Center);
            f.render_widget(waiting, chunks[2]);
        }
    }

    // Footer
    let footer = Paragraph::new(format!("[r] {}  |  [q] Quit", ButtonKind::GetLastNightReport.name()))
        .style(Style::default().fg(Color::DarkGray))
        .alignment(Alignment::Center);
    f.render_widget(footer, chunks[3]);

    // Error message
    if let Some(error) = &app.error_message {
        let error_widget = Paragraph::new(error.as_str())
            .style(Style::default().fg(Color::Red))
            .alignment(Alignment::Center)
            .wrap(Wrap { trim: true })
            .block(Block::default().borders(Borders::ALL).border_style(Style::default().fg(Color::Red)));
        let area = centered_rect(60, 20, size);
        f.render_widget(Clear, area);
        f.render_widget(error_widget, area);
    }
}

fn render_main_content(f: &mut Frame, area: Rect, sensors: &[Sensor]) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Length(50), Constraint::Min(30)])
        .split(area);

    render_metrics(f, chunks[0], sensors);
    render_timeline(f, chunks[1], sensors);
}

fn render_metrics(f: &mut Frame, area: Rect, sensors: &[Sensor]) {
    let block = Block::default()
        .title(" Last Night ")
        .borders(Borders::ALL)
        .border_type(ratatui::widgets::BorderType::Rounded);

    let inner = block.inner(area);
    f.render_widget(block, area);

    let header_cells = ["Sensor", "Value"]
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().fg(Color::Yellow)));
    let header = Row::new(header_cells).height(1).bottom_margin(1);

    let rows: Vec<Row> = sensors
        .iter()
        .filter(|sensor| !sensor.kind.is_timeline())
        .map(|sensor| {
            let description = sensor.kind.description();
            let value = sensor.native_value();
            let style = match (sensor.kind, &value) {
                (SensorKind::SleepScore, Some(SensorValue::Number(score))) => {
                    Style::default().fg(get_score_color(*score))
                }
                _ => Style::default().fg(Color::White),
            };
            let text = match (value, description.unit) {
                _ if !sensor.available() => "unavailable".to_string(),
                (Some(v), Some(unit)) => format!("{} {}", v, unit),
                (Some(v), None) => v.to_string(),
                (None, _) => "-".to_string(),
            };
            Row::new(vec![
                Cell::from(description.name),
                Cell::from(text).style(style),
            ])
            .height(1)
        })
        .collect();

    let table = Table::new(rows)
        .header(header)
        .block(Block::default())
        .widths(&[Constraint::Length(26), Constraint::Length(20)]);

    f.render_widget(table, inner);
}

fn render_timeline(f: &mut Frame, area: Rect, sensors: &[Sensor]) {
    let block = Block::default()
        .title(" Timeline ")
        .borders(Borders::ALL)
        .border_type(ratatui::widgets::BorderType::Rounded);

    let inner = block.inner(area);
    f.render_widget(block, area);

    let mut text = vec![];
    for sensor in sensors.iter().filter(|sensor| sensor.kind.is_timeline()) {
        let value = sensor
            .native_value()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string());
        text.push(Line::from(vec![Span::styled(
            format!("{}:", sensor.kind.description().name),
            Style::default().fg(Color::Yellow),
        )]));
        text.push(Line::from(vec![Span::styled(
            format!("  {}", value),
            Style::default().fg(Color::Gray),
        )]));
    }

    let paragraph = Paragraph::new(text).wrap(Wrap { trim: false });
    f.render_widget(paragraph, inner);
}

fn get_score_color(score: f64) -> Color {
    if score >= 80.0 {
        Color::Green
    } else if score >= 60.0 {
        Color::Yellow
    } else {
        Color::Red
    }
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}
