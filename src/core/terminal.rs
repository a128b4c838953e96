use console::{Emoji, style};

static MOON: Emoji<'_, '_> = Emoji("🌙 ", "");
static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");

#[derive(Clone, Copy)]
enum Notice {
    Success,
    Info,
    Warn,
    Error,
}

fn notice(kind: Notice, msg: &str) {
    match kind {
        Notice::Success => println!("{}{}", Emoji("✅ ", "[ok] "), style(msg).green()),
        Notice::Info => println!("{}{}", Emoji("ℹ️  ", "[i] "), style(msg).blue()),
        Notice::Warn => println!("{}{}", Emoji("⚠️  ", "[!] "), style(msg).yellow()),
        Notice::Error => eprintln!("{}{}", Emoji("❌ ", "[x] "), style(msg).red().bold()),
    }
}

pub fn print_success(msg: &str) {
    notice(Notice::Success, msg);
}

pub fn print_info(msg: &str) {
    notice(Notice::Info, msg);
}

pub fn print_warn(msg: &str) {
    notice(Notice::Warn, msg);
}

pub fn print_error(msg: &str) {
    notice(Notice::Error, msg);
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

pub fn print_banner() {
    println!();
    println!("{}{}", MOON, style("nightshift").bold().magenta());
    println!("{}\n", style("Works the backlog while you sleep.").cyan());
}

pub fn print_goodbye() {
    println!("\n{}{}", MOON, style("nightshift stopped. Good morning!").bold().cyan());
}

enum Line {
    Command(String, String),
    Status(String, String),
    Text(String),
    Blank,
}

/// A titled block of help or status lines, printed in one go.
pub struct GuideSection {
    title: String,
    lines: Vec<Line>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, description: &str) -> Self {
        self.lines.push(Line::Command(name.to_string(), description.to_string()));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.lines.push(Line::Status(label.to_string(), value.to_string()));
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.lines.push(Line::Text(text.to_string()));
        self
    }

    pub fn blank(mut self) -> Self {
        self.lines.push(Line::Blank);
        self
    }

    pub fn print(&self) {
        println!("\n {}", style(&self.title).bold().underlined());
        let width = self
            .lines
            .iter()
            .filter_map(|l| match l {
                Line::Command(name, _) => Some(name.chars().count()),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        for line in &self.lines {
            match line {
                Line::Command(name, description) => println!(
                    "   {:<width$}  {}",
                    style(name).green(),
                    style(description).dim(),
                    width = width
                ),
                Line::Status(label, value) => print_status(label, value),
                Line::Text(text) => println!("   {}", text),
                Line::Blank => println!(),
            }
        }
    }
}
