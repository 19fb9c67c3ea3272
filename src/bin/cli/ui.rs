//! Terminal rendering of maintenance reports, prompts and progress.

use std::io::{self, BufRead, IsTerminal, Write};
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use nu_ansi_term::{Color, Style};
use vecmaint::admin::{
    CollectionReport, CommitReport, OrphanDir, RebuildPlan, RetentionPlan, StoreReport, WalInfo,
};
use vecmaint::config::ConfigChange;
use vecmaint::store::human_bytes;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Theme {
    Auto,
    Light,
    Dark,
    Plain,
}

pub struct Ui {
    palette: Palette,
    paint: bool,
    quiet: bool,
    stderr_tty: bool,
}

impl Ui {
    pub fn new(theme: Theme, quiet: bool) -> Self {
        let paint = theme != Theme::Plain && !quiet && io::stdout().is_terminal();
        #[cfg(windows)]
        if paint {
            let _ = nu_ansi_term::enable_ansi_support();
        }
        let palette = match theme {
            Theme::Plain => Palette::default(),
            Theme::Light => Palette::light(),
            Theme::Dark | Theme::Auto => Palette::dark(),
        };
        Self {
            palette,
            paint,
            quiet,
            stderr_tty: io::stderr().is_terminal(),
        }
    }

    pub fn gap(&self) {
        if !self.quiet {
            println!();
        }
    }

    pub fn done(&self, message: &str) {
        self.status(self.palette.ok, "✔", message);
    }

    pub fn note(&self, message: &str) {
        self.status(self.palette.note, "ℹ", message);
    }

    /// Asks on stderr, reads one line from stdin. Only `y` or `yes`
    /// accepts; end of input declines.
    pub fn confirm(&self, question: &str, assume_yes: bool) -> bool {
        if assume_yes {
            return true;
        }
        eprint!("{} ", self.paint(self.palette.caution, format!("{question} [y/N]")));
        let _ = io::stderr().flush();
        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(0) | Err(_) => {
                if !self.stderr_tty {
                    eprintln!();
                }
                false
            }
            Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
        }
    }

    /// Spinner on stderr while a long operation runs. Hidden when stderr is
    /// not a terminal or output is quiet.
    pub fn spinner(&self, label: impl Into<String>) -> Spinner<'_> {
        let label = label.into();
        let bar = (!self.quiet && self.stderr_tty).then(|| {
            let style = ProgressStyle::with_template("{spinner} {msg} {elapsed}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            let bar = ProgressBar::new_spinner().with_style(style);
            bar.set_message(label.clone());
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        });
        Spinner {
            ui: self,
            label,
            started: Instant::now(),
            bar,
        }
    }

    pub fn collection(&self, report: &CollectionReport) {
        self.title(&format!("Collection {}", report.name));
        self.fields(&[
            ("id", report.collection_id.clone()),
            ("tenant", report.tenant.clone()),
            ("database", report.database.clone()),
            ("dimensionality", opt(report.dimensionality)),
            ("segment", report.segment_id.clone()),
            ("metadata segment", opt(report.metadata_segment_id.clone())),
            ("path", report.segment_path.display().to_string()),
            ("size", human_bytes(report.disk_size_bytes)),
        ]);
        let watermark = match (report.watermark, report.watermark_source) {
            (Some(w), Some(source)) => format!("{w} ({source:?})"),
            (Some(w), None) => w.to_string(),
            _ => "-".to_string(),
        };
        let mut fragmentation = format!("{:.2}%", report.fragmentation * 100.0);
        if report.fragmentation_estimated {
            fragmentation.push_str(" (estimated)");
        }
        self.title("Segment");
        self.fields(&[
            ("has metadata", report.has_metadata.to_string()),
            ("live elements", report.live_elements.to_string()),
            ("total added", report.total_elements_added.to_string()),
            ("fragmentation", fragmentation),
            ("watermark", watermark),
            ("catalog max_seq_id", opt(report.catalog_max_seq_id)),
            ("wal entries", report.wal_entries.to_string()),
            ("wal gap", opt(report.wal_gap)),
        ]);
        if report.has_metadata && report.fragmentation_estimated && report.fragmentation > 0.0 {
            self.hint(
                "estimate counts every label ever assigned and stays put after a rebuild; \
                 use --verbose to measure",
            );
        }
        self.bullets(
            "Configuration",
            report.config.iter().map(|entry| {
                let runtime = if entry.runtime_mutable { ", runtime" } else { "" };
                format!("{} = {} ({:?}{runtime})", entry.key, entry.value, entry.source)
            }),
        );
        if let Some(index) = &report.index {
            self.title("Index");
            self.fields(&[
                ("allocated", index.allocated.to_string()),
                ("live", index.live.to_string()),
                ("max elements", index.max_elements.to_string()),
                ("orphan positions", index.orphan_positions.len().to_string()),
                ("missing positions", index.missing_positions.len().to_string()),
            ]);
        }
    }

    pub fn store(&self, report: &StoreReport) {
        self.title("Store");
        self.fields(&[
            ("catalog size", human_bytes(report.catalog_size_bytes)),
            ("store size", human_bytes(report.store_size_bytes)),
            ("collections", report.collection_count.to_string()),
            ("wal rows", report.wal_total.to_string()),
            (
                "automatically_purge",
                report.retention.automatically_purge.to_string(),
            ),
        ]);
        for collection in &report.collections {
            self.gap();
            self.collection(collection);
        }
        self.bullets(
            "Failed",
            report.failures.iter().map(|f| format!("{}: {}", f.name, f.error)),
        );
        self.bullets("Skipped", report.skipped.iter().cloned());
        self.orphans("Orphaned directories", &report.orphan_dirs);
    }

    /// One line per key: old value struck in the caution color, new value in
    /// the ok color, structural keys tagged.
    pub fn changes(&self, changes: &[ConfigChange]) {
        if changes.is_empty() {
            return;
        }
        self.title("Changes");
        let width = changes
            .iter()
            .map(|c| c.key.to_string().len())
            .max()
            .unwrap_or(0);
        for change in changes {
            let key = format!("{:<width$}", change.key.to_string());
            let tag = if change.requires_rebuild() {
                self.paint(self.palette.caution, " [rebuild]")
            } else {
                String::new()
            };
            println!(
                "  ~ {key}  {} -> {}{tag}",
                self.paint(self.palette.old, change.old.to_string()),
                self.paint(self.palette.ok, change.new.to_string()),
            );
        }
    }

    pub fn rebuild_plan(&self, plan: &RebuildPlan) {
        self.title(&format!("Rebuild {}", plan.collection));
        let mut rows = vec![
            ("segment", plan.segment_id.clone()),
            ("path", plan.segment_path.display().to_string()),
        ];
        if plan.rebuild_index {
            rows.extend([
                ("live elements", plan.live_elements.to_string()),
                ("source size", human_bytes(plan.source_size_bytes)),
                (
                    "free space",
                    format!(
                        "{} available, {} required",
                        human_bytes(plan.available_bytes),
                        human_bytes(plan.required_bytes)
                    ),
                ),
                ("staging", plan.staging_root.display().to_string()),
                ("copy batch", plan.batch_size.to_string()),
                (
                    "old directory",
                    if plan.backup { "kept as backup" } else { "deleted" }.to_string(),
                ),
            ]);
        } else {
            rows.push(("index", "never flushed; rows only".to_string()));
        }
        self.fields(&rows);
        self.changes(&plan.changes);
    }

    pub fn wal(&self, info: &WalInfo) {
        self.title("WAL");
        self.fields(&[
            ("rows", info.total.to_string()),
            (
                "automatically_purge",
                info.retention.automatically_purge.to_string(),
            ),
        ]);
        self.bullets(
            "Topics",
            info.topics.iter().map(|t| {
                format!(
                    "{} [{}]: {} rows from seq {}",
                    t.collection.as_deref().unwrap_or("?"),
                    t.topic,
                    t.count,
                    t.first_seq_id
                )
            }),
        );
    }

    pub fn retention(&self, plan: &RetentionPlan) {
        self.bullets(
            "WAL cleanup",
            plan.entries.iter().map(|e| {
                let below = e.watermark.map(|w| format!(" below {w}")).unwrap_or_default();
                format!(
                    "{}: {} of {} rows ({:?}{below})",
                    e.collection, e.qualifying, e.wal_entries, e.strategy
                )
            }),
        );
        self.bullets("Excluded", plan.excluded.iter().cloned());
    }

    pub fn commit(&self, report: &CommitReport) {
        self.bullets(
            "Committed",
            report.segments.iter().map(|s| {
                if let Some(reason) = &s.skipped {
                    return format!("{}: skipped ({reason})", s.collection);
                }
                let purged = if s.purged > 0 {
                    format!(", {} purged", s.purged)
                } else {
                    String::new()
                };
                format!(
                    "{}: +{} ~{} -{} ({} ignored), watermark {} -> {}, {} live{purged}",
                    s.collection,
                    s.added,
                    s.updated,
                    s.deleted,
                    s.ignored,
                    opt(s.watermark_before),
                    opt(s.watermark_after),
                    s.live_elements,
                )
            }),
        );
        self.bullets("Excluded", report.excluded.iter().cloned());
    }

    pub fn orphans(&self, title: &str, dirs: &[OrphanDir]) {
        self.bullets(
            title,
            dirs.iter()
                .map(|d| format!("{} ({})", d.path.display(), human_bytes(d.size_bytes))),
        );
    }

    fn status(&self, style: Style, icon: &str, message: &str) {
        if self.quiet {
            println!("{message}");
        } else {
            println!("{} {message}", self.paint(style, icon));
        }
    }

    fn hint(&self, message: &str) {
        if !self.quiet {
            println!("  {}", self.paint(self.palette.note, format!("note: {message}")));
        }
    }

    fn title(&self, text: &str) {
        if self.quiet {
            println!("{text}");
        } else {
            println!("{}", self.paint(self.palette.title, format!("▸ {text}")));
        }
    }

    fn fields(&self, rows: &[(&str, String)]) {
        let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        for (key, value) in rows {
            println!(
                "  {} {value}",
                self.paint(self.palette.key, format!("{key:>width$}:"))
            );
        }
    }

    fn bullets(&self, title: &str, items: impl IntoIterator<Item = String>) {
        let mut items = items.into_iter().peekable();
        if items.peek().is_none() {
            return;
        }
        self.title(title);
        for item in items {
            println!("  - {item}");
        }
    }

    fn paint(&self, style: Style, text: impl Into<String>) -> String {
        let text = text.into();
        if self.paint {
            style.paint(text).to_string()
        } else {
            text
        }
    }
}

pub struct Spinner<'a> {
    ui: &'a Ui,
    label: String,
    started: Instant,
    bar: Option<ProgressBar>,
}

impl Spinner<'_> {
    pub fn stop(mut self) -> Duration {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
        let elapsed = self.started.elapsed();
        self.label.clear();
        elapsed
    }
}

impl Drop for Spinner<'_> {
    fn drop(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.abandon();
        }
        if !self.label.is_empty() {
            eprintln!(
                "{} {} stopped after {}",
                self.ui.paint(self.ui.palette.caution, "⚠"),
                self.label,
                format_duration(self.started.elapsed())
            );
        }
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs >= 1.0 {
        format!("{secs:.2}s")
    } else {
        format!("{:.0}ms", secs * 1_000.0)
    }
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

#[derive(Clone, Copy, Default)]
struct Palette {
    title: Style,
    key: Style,
    note: Style,
    ok: Style,
    old: Style,
    caution: Style,
}

impl Palette {
    fn dark() -> Self {
        Self {
            title: Color::Purple.bold(),
            key: Color::LightBlue.bold(),
            note: Color::LightCyan.normal(),
            ok: Color::LightGreen.bold(),
            old: Color::DarkGray.strikethrough(),
            caution: Color::Yellow.bold(),
        }
    }

    fn light() -> Self {
        Self {
            title: Color::Blue.bold(),
            key: Color::Black.bold(),
            note: Color::Purple.normal(),
            ok: Color::Green.bold(),
            old: Color::DarkGray.strikethrough(),
            caution: Color::Red.bold(),
        }
    }
}
