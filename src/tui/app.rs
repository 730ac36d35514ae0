//! Debugger application state and logic.

use crate::asm::disasm::listing;
use crate::asm::Program;
use crate::cpu::{Cpu, ExecMode, Stage};
use std::collections::HashSet;

/// Debugger application state.
pub struct DebuggerApp {
    /// The CPU being debugged.
    pub cpu: Cpu,
    /// Loaded program, kept for reset.
    pub program: Program,
    /// Engine that `s` and `r` drive.
    pub mode: ExecMode,
    /// Breakpoints (by PC).
    pub breakpoints: HashSet<u16>,
    /// Is the debugger running continuously?
    pub running: bool,
    /// Should we quit?
    pub should_quit: bool,
    /// Status message to display.
    pub status: String,
    /// Memory view scroll offset, in rows.
    pub mem_scroll: usize,
}

impl DebuggerApp {
    /// Create a new debugger with a loaded program.
    pub fn new(program: Program) -> Self {
        let mut app = Self {
            cpu: Cpu::new(),
            program,
            mode: ExecMode::Multi,
            breakpoints: HashSet::new(),
            running: false,
            should_quit: false,
            status: String::new(),
            mem_scroll: 0,
        };
        app.reset();
        app.status = "Ready. Press 's' to step, 'r' to run, 'q' to quit.".into();
        app
    }

    /// Advance one tick: a stage in multi-cycle mode, an instruction in
    /// single-cycle mode.
    pub fn step(&mut self) {
        if !self.cpu.is_running() {
            self.status = match &self.cpu.fault {
                Some(fault) => format!("CPU stopped: {}", fault),
                None => format!("CPU stopped: {:?}", self.cpu.state),
            };
            self.running = false;
            return;
        }

        let pc = self.cpu.regs.pc;
        let result = match self.mode {
            ExecMode::Single => self.cpu.step().map(|instr| format!("PC={:03}: {}", pc, instr)),
            ExecMode::Multi => self.cpu.step_stage().map(|stage| {
                format!("PC={:03}: {:<9} {}", pc, stage.to_string(), self.cpu.pipeline.instr)
            }),
        };

        match result {
            Ok(status) => self.status = status,
            Err(e) => {
                self.status = format!("Error: {}", e);
                self.running = false;
            }
        }
    }

    /// Run until halt, breakpoint, or error.
    pub fn run(&mut self) {
        self.running = true;
        self.status = "Running...".into();
        // Leave the breakpoint we are sitting on.
        if self.at_breakpoint() {
            self.step();
        }
    }

    /// Run one iteration of continuous execution.
    pub fn tick(&mut self) {
        if !self.running {
            return;
        }

        if !self.cpu.is_running() {
            self.running = false;
            self.status = format!(
                "Stopped after {} ticks, {} instructions",
                self.cpu.cycles, self.cpu.retired
            );
            return;
        }

        if self.at_breakpoint() {
            self.running = false;
            self.status = format!("Breakpoint at PC={}", self.cpu.regs.pc);
            return;
        }

        self.step();
    }

    /// Whether the next tick starts an instruction at a breakpoint.
    fn at_breakpoint(&self) -> bool {
        self.cpu.pipeline.stage == Stage::Fetch && self.breakpoints.contains(&self.cpu.regs.pc)
    }

    /// Toggle breakpoint at current PC.
    pub fn toggle_breakpoint(&mut self) {
        let pc = self.cpu.regs.pc;
        if self.breakpoints.remove(&pc) {
            self.status = format!("Removed breakpoint at PC={}", pc);
        } else {
            self.breakpoints.insert(pc);
            self.status = format!("Set breakpoint at PC={}", pc);
        }
    }

    /// Switch engines. Only allowed between instructions.
    pub fn toggle_mode(&mut self) {
        if self.cpu.pipeline.stage != Stage::Fetch {
            self.status = format!("Finish the instruction first (in {})", self.cpu.pipeline.stage);
            return;
        }
        self.mode = match self.mode {
            ExecMode::Single => ExecMode::Multi,
            ExecMode::Multi => ExecMode::Single,
        };
        self.status = format!("Mode: {:?}-cycle", self.mode);
    }

    /// Reset CPU to initial state.
    pub fn reset(&mut self) {
        if let Err(e) = self.cpu.load(&self.program) {
            self.status = format!("Load failed: {}", e);
            return;
        }
        self.cpu.start();
        self.running = false;
        self.status = "Reset. Ready.".into();
    }

    /// Disassembly from address 0, flagged with the current PC.
    pub fn get_disassembly(&self, lines: usize) -> Vec<(u16, String, bool)> {
        let pc = self.cpu.regs.pc;
        let all = listing(&self.cpu.mem, 0, usize::from(u8::MAX) + 1);
        let current = all.iter().position(|(addr, _)| *addr == pc).unwrap_or(0);
        let start = current.saturating_sub(lines / 2);

        all.into_iter()
            .skip(start)
            .take(lines)
            .map(|(addr, text)| (addr, text, addr == pc))
            .collect()
    }
}

/// Run the debugger with a program.
pub fn run_debugger(program: Program) -> std::io::Result<()> {
    use crossterm::{
        event::{self, Event, KeyCode, KeyEventKind},
        terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
        ExecutableCommand,
    };
    use ratatui::prelude::*;
    use std::io::stdout;
    use std::time::Duration;

    // Setup terminal
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;

    let mut app = DebuggerApp::new(program);

    loop {
        terminal.draw(|frame| {
            super::ui::draw(frame, &app);
        })?;

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') => app.should_quit = true,
                        KeyCode::Char('s') => {
                            app.running = false;
                            app.step();
                        }
                        KeyCode::Char('r') => app.run(),
                        KeyCode::Char('p') => {
                            app.running = false;
                            app.status = "Paused.".into();
                        }
                        KeyCode::Char('b') => app.toggle_breakpoint(),
                        KeyCode::Char('m') => app.toggle_mode(),
                        KeyCode::Char('x') => app.reset(),
                        KeyCode::Up => {
                            app.mem_scroll = app.mem_scroll.saturating_sub(1);
                        }
                        KeyCode::Down => {
                            if app.mem_scroll + 1 < super::ui::MEMORY_ROWS {
                                app.mem_scroll += 1;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        // Tick for continuous running
        if app.running {
            app.tick();
        }

        if app.should_quit {
            break;
        }
    }

    // Restore terminal
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble;

    fn app(source: &str) -> DebuggerApp {
        DebuggerApp::new(assemble(source).unwrap())
    }

    #[test]
    fn test_step_is_one_stage_in_multi_mode() {
        let mut app = app("R1 5\nMOV_RR 0 1\nHALT");
        app.step();
        assert_eq!(app.cpu.pipeline.stage, Stage::Decode);
        assert!(app.status.contains("Fetch"));
    }

    #[test]
    fn test_mode_switch_only_between_instructions() {
        let mut app = app("NOP\nHALT");
        app.step();
        app.toggle_mode();
        assert_eq!(app.mode, ExecMode::Multi);

        for _ in 0..4 {
            app.step();
        }
        app.toggle_mode();
        assert_eq!(app.mode, ExecMode::Single);

        app.step();
        assert_eq!(app.cpu.regs.pc, 1);
        assert!(!app.cpu.is_running());
    }

    #[test]
    fn test_run_stops_at_breakpoint() {
        let mut app = app("NOP\nNOP\nNOP\nHALT");
        app.cpu.regs.pc = 0;
        app.breakpoints.insert(2);

        app.run();
        for _ in 0..100 {
            app.tick();
        }

        assert!(!app.running);
        assert_eq!(app.cpu.regs.pc, 2);
        assert!(app.status.contains("Breakpoint"));

        // Running again leaves the breakpoint
        app.run();
        for _ in 0..100 {
            app.tick();
        }
        assert!(!app.cpu.is_running());
    }

    #[test]
    fn test_reset_restores_program() {
        let mut app = app("R2 7\nADD_RR 2 2\nHALT");
        app.run();
        for _ in 0..20 {
            app.tick();
        }
        assert_eq!(app.cpu.regs.gpr[2], 14);

        app.reset();
        assert_eq!(app.cpu.regs.gpr[2], 7);
        assert!(app.cpu.is_running());
    }

    #[test]
    fn test_disassembly_marks_pc() {
        let mut app = app("NOP\nJMP 0");
        app.mode = ExecMode::Single;
        app.step();

        let lines = app.get_disassembly(4);
        assert_eq!(lines[0], (0, "NOP".to_string(), false));
        assert_eq!(lines[1], (1, "JMP 0".to_string(), true));
    }
}
