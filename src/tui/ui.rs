//! UI rendering for the debugger.

use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Paragraph, List, ListItem},
    style::{Color, Style, Modifier},
};
use crate::cpu::{CpuState, ExecMode, Stage, MEMORY_SIZE};
use super::app::DebuggerApp;

/// Bytes shown per memory row.
const MEMORY_COLUMNS: usize = 8;

/// Number of rows in the memory view.
pub const MEMORY_ROWS: usize = MEMORY_SIZE / MEMORY_COLUMNS;

/// Main draw function.
pub fn draw(frame: &mut Frame, app: &DebuggerApp) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(55),
            Constraint::Percentage(45),
        ])
        .split(frame.area());

    // Left side: code, pipeline, registers and status
    let left_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(10),
            Constraint::Length(4),
            Constraint::Length(7),
            Constraint::Length(3),
        ])
        .split(chunks[0]);

    draw_disassembly(frame, left_chunks[0], app);
    draw_pipeline(frame, left_chunks[1], app);
    draw_registers(frame, left_chunks[2], app);
    draw_status(frame, left_chunks[3], app);

    // Right side: memory and help
    let right_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(10),
            Constraint::Length(5),
        ])
        .split(chunks[1]);

    draw_memory(frame, right_chunks[0], app);
    draw_help(frame, right_chunks[1]);
}

/// Draw disassembly view.
fn draw_disassembly(frame: &mut Frame, area: Rect, app: &DebuggerApp) {
    let disasm = app.get_disassembly((area.height as usize).saturating_sub(2));

    let items: Vec<ListItem> = disasm
        .iter()
        .map(|(addr, instr, is_current)| {
            let prefix = if *is_current { "▶ " } else { "  " };
            let bp = if app.breakpoints.contains(addr) { "●" } else { " " };
            let text = format!("{}{:03}: {}", prefix, addr, instr);

            let style = if *is_current {
                Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)
            } else if app.breakpoints.contains(addr) {
                Style::default().fg(Color::Red)
            } else {
                Style::default()
            };

            ListItem::new(format!("{} {}", bp, text)).style(style)
        })
        .collect();

    let list = List::new(items)
        .block(Block::default()
            .title(" Disassembly ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Cyan)));

    frame.render_widget(list, area);
}

/// Draw the stage strip with the next stage highlighted.
fn draw_pipeline(frame: &mut Frame, area: Rect, app: &DebuggerApp) {
    let current = app.cpu.pipeline.stage;

    let mut spans: Vec<Span> = Vec::new();
    for stage in Stage::ALL {
        let style = if app.mode == ExecMode::Multi && stage == current {
            Style::default().fg(Color::Black).bg(Color::Yellow).add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(Color::DarkGray)
        };
        spans.push(Span::styled(format!(" {} ", stage.short_name()), style));
        spans.push(Span::raw(" "));
    }

    let content = vec![
        Line::from(spans),
        Line::from(vec![
            Span::raw("in flight: "),
            Span::styled(app.cpu.pipeline.instr.to_string(), Style::default().fg(Color::White)),
            Span::raw(format!("   alu: {}", app.cpu.pipeline.alu)),
        ]),
    ];

    let title = format!(" Pipeline ({:?}-cycle) ", app.mode);
    let paragraph = Paragraph::new(content)
        .block(Block::default()
            .title(title)
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Blue)));

    frame.render_widget(paragraph, area);
}

/// Draw register state.
fn draw_registers(frame: &mut Frame, area: Rect, app: &DebuggerApp) {
    let regs = &app.cpu.regs;

    let reg_line = |range: std::ops::Range<usize>| {
        let spans: Vec<Span> = range
            .map(|i| {
                Span::styled(
                    format!("R{}: {:>3}  ", i, regs.gpr[i]),
                    if regs.gpr[i] != 0 {
                        Style::default().fg(Color::White)
                    } else {
                        Style::default().fg(Color::DarkGray)
                    },
                )
            })
            .collect();
        Line::from(spans)
    };

    let content = vec![
        reg_line(0..4),
        reg_line(4..8),
        Line::from(vec![
            Span::raw("PC: "),
            Span::styled(format!("{}", regs.pc), Style::default().fg(Color::Yellow)),
        ]),
        Line::from(vec![
            Span::raw("Ticks: "),
            Span::styled(format!("{}", app.cpu.cycles), Style::default().fg(Color::Cyan)),
            Span::raw("   Retired: "),
            Span::styled(format!("{}", app.cpu.retired), Style::default().fg(Color::Cyan)),
            Span::raw("   State: "),
            Span::styled(format!("{:?}", app.cpu.state), state_style(app.cpu.state)),
        ]),
    ];

    let paragraph = Paragraph::new(content)
        .block(Block::default()
            .title(" Registers ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Green)));

    frame.render_widget(paragraph, area);
}

/// Draw memory view, 8 bytes per row.
fn draw_memory(frame: &mut Frame, area: Rect, app: &DebuggerApp) {
    let visible_rows = (area.height as usize).saturating_sub(2);
    let start = app.mem_scroll;
    let end = (start + visible_rows).min(MEMORY_ROWS);
    let pc = app.cpu.regs.pc as usize;

    let items: Vec<ListItem> = (start..end)
        .map(|row| {
            let base = row * MEMORY_COLUMNS;
            let mut spans = vec![Span::raw(format!("{:03}: ", base))];

            for (addr, byte) in app.cpu.mem.dump(base, MEMORY_COLUMNS) {
                let style = if addr == pc {
                    Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)
                } else if byte != 0 {
                    Style::default().fg(Color::White)
                } else {
                    Style::default().fg(Color::DarkGray)
                };
                spans.push(Span::styled(format!("{:3} ", byte), style));
            }

            ListItem::new(Line::from(spans))
        })
        .collect();

    let list = List::new(items)
        .block(Block::default()
            .title(" Memory ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Magenta)));

    frame.render_widget(list, area);
}

/// Draw status bar.
fn draw_status(frame: &mut Frame, area: Rect, app: &DebuggerApp) {
    let status = Paragraph::new(app.status.clone())
        .style(Style::default().fg(Color::White))
        .block(Block::default()
            .title(" Status ")
            .borders(Borders::ALL));

    frame.render_widget(status, area);
}

/// Draw help panel.
fn draw_help(frame: &mut Frame, area: Rect) {
    let help = Paragraph::new(vec![
        Line::from("s: Step  r: Run  p: Pause  b: Breakpoint"),
        Line::from("m: Single/multi-cycle  x: Reset"),
        Line::from("↑↓: Scroll memory  q: Quit"),
    ])
    .style(Style::default().fg(Color::DarkGray))
    .block(Block::default()
        .title(" Help ")
        .borders(Borders::ALL));

    frame.render_widget(help, area);
}

fn state_style(state: CpuState) -> Style {
    match state {
        CpuState::Running => Style::default().fg(Color::Green),
        CpuState::Ready => Style::default().fg(Color::Gray),
        CpuState::Halted => Style::default().fg(Color::Yellow),
        CpuState::Faulted => Style::default().fg(Color::Red),
    }
}
