//! Pyro Desktop — egui app state and UI.

use anyhow::Context;
use eframe::egui;
use pyro::bridge::{BridgeError, BridgeEvent, ChatBridge, SendHandle, SendRequest};
use pyro::error::ErrorKind;
use pyro::llm::{GeminiBackend, ImagePayload};
use pyro::settings::{self, Settings, SettingsStore, SettingsUpdate, Theme, FONT_SIZE_RANGE};
use pyro::transcript::{AutoSaveTimer, Speaker, Transcript, TranscriptLine};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

const CHAT_MESSAGES_MIN_HEIGHT: f32 = 80.0;
const LOG_BUFFER_MAX_LINES: usize = 2000;
/// How often to poll the bridge while a reply is streaming.
const SEND_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Ring buffer of log lines for the Logs screen. Written by DesktopLogger.
static LOG_LINES: OnceLock<Mutex<VecDeque<String>>> = OnceLock::new();

fn log_buffer() -> &'static Mutex<VecDeque<String>> {
    LOG_LINES.get_or_init(|| Mutex::new(VecDeque::new()))
}

fn push_log_line(line: String) {
    if let Ok(mut buf) = log_buffer().lock() {
        buf.push_back(line);
        while buf.len() > LOG_BUFFER_MAX_LINES {
            buf.pop_front();
        }
    }
}

/// Logger that appends to LOG_LINES for display in the Logs screen, and mirrors to
/// stderr through env_logger when RUST_LOG is set.
struct DesktopLogger {
    stderr: Option<env_logger::Logger>,
}

impl log::Log for DesktopLogger {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let line = format!(
            "{} [{}] {}",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            record.level(),
            record.args()
        );
        push_log_line(line);
        if let Some(stderr) = &self.stderr {
            log::Log::log(stderr, record);
        }
    }

    fn flush(&self) {
        if let Some(stderr) = &self.stderr {
            log::Log::flush(stderr);
        }
    }
}

fn install_logger() {
    let stderr = std::env::var_os("RUST_LOG")
        .map(|_| env_logger::Builder::from_env(env_logger::Env::default()).build());
    let logger: &'static DesktopLogger = Box::leak(Box::new(DesktopLogger { stderr }));
    if log::set_logger(logger).is_ok() {
        log::set_max_level(log::LevelFilter::Debug);
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Default)]
enum Screen {
    #[default]
    Chat,
    Logs,
}

/// egui ships two font families; pick the closer one for the configured family name.
fn font_family_for(name: &str) -> egui::FontFamily {
    let lower = name.to_ascii_lowercase();
    if ["mono", "courier", "consol", "menlo", "code"]
        .iter()
        .any(|hint| lower.contains(hint))
    {
        egui::FontFamily::Monospace
    } else {
        egui::FontFamily::Proportional
    }
}

fn transcript_font(settings: &Settings) -> egui::FontId {
    egui::FontId::new(
        settings.effective_font_size() as f32,
        font_family_for(&settings.font_family),
    )
}

fn failure_text(e: &BridgeError) -> String {
    match e.kind() {
        ErrorKind::InvalidKey => {
            format!("{}. Open Settings → Preferences… to enter your Gemini API key.", e)
        }
        _ => e.to_string(),
    }
}

/// Editable copy of the settings shown in the Settings window; committed on OK.
struct SettingsDraft {
    api_key: String,
    theme: Theme,
    font_family: String,
    font_size: u32,
    auto_save: bool,
    auto_save_interval: u32,
    error: Option<String>,
}

impl SettingsDraft {
    fn from_settings(s: &Settings) -> Self {
        Self {
            api_key: s.api_key.clone(),
            theme: s.theme,
            font_family: s.font_family.clone(),
            font_size: s.effective_font_size(),
            auto_save: s.auto_save,
            auto_save_interval: s.auto_save_interval,
            error: None,
        }
    }

    fn to_update(&self) -> SettingsUpdate {
        SettingsUpdate {
            api_key: Some(self.api_key.clone()),
            theme: Some(self.theme.as_str().to_string()),
            font_size: Some(self.font_size),
            font_family: Some(self.font_family.clone()),
            auto_save: Some(self.auto_save),
            auto_save_interval: Some(self.auto_save_interval),
        }
    }
}

pub struct PyroApp {
    /// Owns the worker threads the bridge spawns sends onto.
    _runtime: tokio::runtime::Runtime,
    bridge: ChatBridge,
    store: SettingsStore,
    settings: Settings,
    transcript: Transcript,
    chat_input: String,
    /// Optional image file attached to the next message.
    image_path: String,
    /// Events for the send in flight, polled each frame.
    pending: Option<SendHandle>,
    /// Fragments received so far for the send in flight.
    fragments: usize,
    /// Shown in a modal error window until dismissed.
    error_dialog: Option<String>,
    /// One-line status under the input row (saved, auto-saved, cleared).
    notice: Option<String>,
    settings_dialog: Option<SettingsDraft>,
    /// Path buffer for the Save chat window; None when closed.
    save_dialog: Option<String>,
    auto_save: Option<AutoSaveTimer>,
    /// Theme last pushed to egui; None forces a re-apply next frame.
    applied_theme: Option<Theme>,
    current_screen: Screen,
}

impl PyroApp {
    /// Space between the main screen title (Chat, Logs) and the content below.
    const SCREEN_TITLE_BOTTOM_SPACING: f32 = 18.0;
    /// Space between the bottom of the content and the window edge.
    const SCREEN_FOOTER_SPACING: f32 = 24.0;

    pub fn new(_cc: &eframe::CreationContext<'_>, runtime: tokio::runtime::Runtime) -> Self {
        let _ = LOG_LINES.get_or_init(|| Mutex::new(VecDeque::new()));
        install_logger();
        log::info!("desktop started");

        let store = SettingsStore::at_default_path();
        let (settings, error_dialog) = match store.load() {
            Ok(s) => (s, None),
            Err(e) => {
                log::warn!("settings: {}; using defaults", e);
                (Settings::default(), Some(format!("{}\n\nUsing default settings.", e)))
            }
        };
        let bridge = ChatBridge::new(Arc::new(GeminiBackend::from_env()), runtime.handle().clone());
        let auto_save = AutoSaveTimer::from_settings(&settings, Instant::now());

        Self {
            _runtime: runtime,
            bridge,
            store,
            settings,
            transcript: Transcript::new(),
            chat_input: String::new(),
            image_path: String::new(),
            pending: None,
            fragments: 0,
            error_dialog,
            notice: None,
            settings_dialog: None,
            save_dialog: None,
            auto_save,
            applied_theme: None,
            current_screen: Screen::default(),
        }
    }

    fn is_sending(&self) -> bool {
        self.pending.is_some()
    }

    fn apply_theme(&mut self, ctx: &egui::Context) {
        if self.applied_theme == Some(self.settings.theme) {
            return;
        }
        ctx.set_visuals(match self.settings.theme {
            Theme::Dark => egui::Visuals::dark(),
            Theme::Light => egui::Visuals::light(),
        });
        self.applied_theme = Some(self.settings.theme);
    }

    /// Drain bridge events for the send in flight. Call each frame.
    fn poll_chat_turn(&mut self) {
        let Some(handle) = self.pending.as_mut() else {
            return;
        };
        let mut finished = false;
        while let Some(ev) = handle.try_recv() {
            match ev {
                BridgeEvent::Progress(n) => self.fragments = n,
                BridgeEvent::Completion(text) => {
                    self.transcript.push(Speaker::Assistant, text);
                    finished = true;
                }
                BridgeEvent::Failure(e) => {
                    log::warn!("chat: send failed: {}", e);
                    self.error_dialog = Some(failure_text(&e));
                    finished = true;
                }
            }
        }
        if finished {
            self.pending = None;
            self.fragments = 0;
        }
    }

    fn poll_auto_save(&mut self, ctx: &egui::Context) {
        let Some(timer) = self.auto_save.as_mut() else {
            return;
        };
        let now = Instant::now();
        if timer.due(now) {
            timer.mark(now);
            match self.transcript.auto_save(Path::new("."), chrono::Local::now()) {
                Ok(path) => self.notice = Some(format!("Chat auto-saved to {}", path.display())),
                Err(e) => {
                    log::warn!("auto-save failed: {}", e);
                    self.notice = Some(format!("Auto-save failed: {}", e));
                }
            }
        }
        ctx.request_repaint_after(timer.remaining(now));
    }

    /// Send the input line through the bridge, or close the window on quit/exit.
    fn start_chat_turn(&mut self, ctx: &egui::Context) {
        if self.is_sending() {
            return;
        }
        let message = self.chat_input.trim().to_string();
        if message.eq_ignore_ascii_case("quit") || message.eq_ignore_ascii_case("exit") {
            ctx.send_viewport_cmd(egui::ViewportCommand::Close);
            return;
        }

        let image = match self.image_path.trim() {
            "" => None,
            path => match ImagePayload::from_path(Path::new(path)) {
                Ok(img) => Some(img),
                Err(e) => {
                    self.error_dialog = Some(format!("Failed to read image {}: {}", path, e));
                    return;
                }
            },
        };

        self.chat_input.clear();
        self.image_path.clear();
        self.notice = None;
        self.transcript.push(Speaker::User, message.clone());

        let mut request = SendRequest::new(message, settings::resolve_api_key(&self.settings));
        if let Some(img) = image {
            request = request.with_image(img);
        }
        self.fragments = 0;
        self.pending = Some(self.bridge.send(request));
    }

    fn clear_chat(&mut self) {
        match self.bridge.reset() {
            Ok(()) => {
                self.transcript.clear();
                self.notice = Some("Conversation cleared.".to_string());
            }
            Err(e) => self.error_dialog = Some(format!("Cannot clear chat: {}", e)),
        }
    }

    fn save_transcript(&self, path: &Path) -> anyhow::Result<()> {
        self.transcript
            .save_to(path)
            .with_context(|| format!("Failed to save chat to {}", path.display()))
    }

    /// Renders one transcript line: frame with speaker-based fill, text in the configured font.
    fn render_transcript_line(ui: &mut egui::Ui, line: &TranscriptLine, font: &egui::FontId) {
        let is_user = line.speaker == Speaker::User;
        let frame = egui::Frame::none()
            .fill(if is_user {
                ui.style().visuals.extreme_bg_color
            } else {
                ui.style().visuals.panel_fill
            })
            .stroke(egui::Stroke::new(
                1.0,
                ui.style().visuals.widgets.noninteractive.bg_stroke.color,
            ))
            .rounding(egui::Rounding::same(8.0))
            .inner_margin(egui::Margin::same(8.0));

        frame.show(ui, |ui| {
            let text = egui::RichText::new(line.render()).font(font.clone());
            ui.label(if is_user { text.strong() } else { text });
        });
    }

    /// Transcript fills the space above a fixed input section; stick-to-bottom scrolling.
    fn ui_chat(&mut self, ui: &mut egui::Ui) {
        let sending = self.is_sending();
        let row_height = ui.spacing().interact_size.y + 8.0;
        let bottom_section_height = row_height * 4.0 + Self::SCREEN_FOOTER_SPACING;
        let available = ui.available_height();
        let messages_height = (available - bottom_section_height).max(CHAT_MESSAGES_MIN_HEIGHT);

        let messages_width = ui.available_width();
        let messages_rect = ui
            .allocate_exact_size(egui::vec2(messages_width, messages_height), egui::Sense::hover())
            .0;
        let mut messages_ui = ui.child_ui(messages_rect, egui::Layout::top_down(egui::Align::Min));
        let font = transcript_font(&self.settings);
        egui::ScrollArea::vertical()
            .stick_to_bottom(true)
            .show(&mut messages_ui, |ui| {
                let content_width = ui.available_width();
                ui.allocate_exact_size(egui::vec2(content_width, 0.0), egui::Sense::hover());
                for line in self.transcript.lines() {
                    Self::render_transcript_line(ui, line, &font);
                    ui.add_space(8.0);
                }
                if self.transcript.is_empty() {
                    ui.weak("No messages yet.");
                }
            });

        ui.add_space(8.0);

        let mut send_now = false;
        ui.horizontal(|ui| {
            let input_width = (ui.available_width() - 80.0).max(120.0);
            let response = ui.add_enabled(
                !sending,
                egui::TextEdit::singleline(&mut self.chat_input)
                    .hint_text("Type your message...")
                    .desired_width(input_width),
            );
            if ui.add_enabled(!sending, egui::Button::new("Send")).clicked() {
                send_now = true;
            }
            if response.lost_focus() && ui.input(|i| i.key_pressed(egui::Key::Enter)) {
                send_now = true;
                response.request_focus();
            }
        });
        ui.horizontal(|ui| {
            ui.label("Image:");
            ui.add_enabled(
                !sending,
                egui::TextEdit::singleline(&mut self.image_path)
                    .hint_text("optional path to a PNG/JPEG/GIF/WebP")
                    .desired_width(f32::INFINITY),
            );
        });

        ui.add_space(4.0);
        ui.horizontal(|ui| {
            if sending {
                ui.spinner();
                if self.fragments > 0 {
                    ui.label(format!("Receiving reply… ({} fragments)", self.fragments));
                } else {
                    ui.label("Waiting for reply…");
                }
            } else if let Some(ref notice) = self.notice {
                ui.weak(notice.as_str());
            }
        });

        if send_now {
            self.start_chat_turn(ui.ctx());
        }
        ui.add_space(Self::SCREEN_FOOTER_SPACING);
    }

    fn ui_logs_screen(&self, ui: &mut egui::Ui) {
        ui.add_space(24.0);
        ui.heading("Logs");
        ui.add_space(Self::SCREEN_TITLE_BOTTOM_SPACING);

        let lines: Vec<String> = log_buffer()
            .lock()
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default();

        let available = ui.available_height();
        let scroll_height = (available - Self::SCREEN_FOOTER_SPACING).max(0.0);
        egui::ScrollArea::vertical()
            .max_height(scroll_height)
            .stick_to_bottom(true)
            .show(ui, |ui| {
                for line in &lines {
                    ui.label(egui::RichText::new(line.as_str()).family(egui::FontFamily::Monospace));
                }
                if lines.is_empty() {
                    ui.label("No log output yet.");
                }
            });
        ui.add_space(Self::SCREEN_FOOTER_SPACING);
    }

    fn ui_menu_bar(&mut self, ui: &mut egui::Ui) {
        let sending = self.is_sending();
        egui::menu::bar(ui, |ui| {
            ui.menu_button("File", |ui| {
                if ui.button("Save chat…").clicked() {
                    self.save_dialog = Some(String::new());
                    ui.close_menu();
                }
                if ui.add_enabled(!sending, egui::Button::new("Clear chat")).clicked() {
                    self.clear_chat();
                    ui.close_menu();
                }
                ui.separator();
                if ui.button("Quit").clicked() {
                    ui.ctx().send_viewport_cmd(egui::ViewportCommand::Close);
                    ui.close_menu();
                }
            });
            ui.menu_button("Settings", |ui| {
                if ui.button("Preferences…").clicked() {
                    self.settings_dialog = Some(SettingsDraft::from_settings(&self.settings));
                    ui.close_menu();
                }
            });
            ui.menu_button("View", |ui| {
                if ui
                    .selectable_label(self.current_screen == Screen::Chat, "Chat")
                    .clicked()
                {
                    self.current_screen = Screen::Chat;
                    ui.close_menu();
                }
                if ui
                    .selectable_label(self.current_screen == Screen::Logs, "Logs")
                    .clicked()
                {
                    self.current_screen = Screen::Logs;
                    ui.close_menu();
                }
            });
        });
    }

    fn settings_window(&mut self, ctx: &egui::Context) {
        let Some(mut draft) = self.settings_dialog.take() else {
            return;
        };
        let mut ok = false;
        let mut cancel = false;
        egui::Window::new("Settings")
            .collapsible(false)
            .resizable(false)
            .anchor(egui::Align2::CENTER_CENTER, [0.0, 0.0])
            .show(ctx, |ui| {
                egui::Grid::new("settings_grid")
                    .num_columns(2)
                    .spacing([12.0, 8.0])
                    .show(ui, |ui| {
                        ui.label("Gemini API key");
                        ui.add(egui::TextEdit::singleline(&mut draft.api_key).password(true));
                        ui.end_row();

                        ui.label("Theme");
                        egui::ComboBox::from_id_source("theme_select")
                            .selected_text(draft.theme.as_str())
                            .show_ui(ui, |ui| {
                                ui.selectable_value(&mut draft.theme, Theme::Light, "light");
                                ui.selectable_value(&mut draft.theme, Theme::Dark, "dark");
                            });
                        ui.end_row();

                        ui.label("Font family");
                        ui.text_edit_singleline(&mut draft.font_family);
                        ui.end_row();

                        ui.label("Font size");
                        ui.add(egui::DragValue::new(&mut draft.font_size).clamp_range(FONT_SIZE_RANGE));
                        ui.end_row();

                        ui.label("Auto-save");
                        ui.checkbox(&mut draft.auto_save, "Save the chat periodically");
                        ui.end_row();

                        ui.label("Interval (minutes)");
                        ui.add_enabled(
                            draft.auto_save,
                            egui::DragValue::new(&mut draft.auto_save_interval).clamp_range(1..=1440),
                        );
                        ui.end_row();
                    });
                if let Some(ref err) = draft.error {
                    ui.add_space(8.0);
                    ui.colored_label(egui::Color32::RED, err);
                }
                ui.add_space(8.0);
                ui.horizontal(|ui| {
                    if ui.button("OK").clicked() {
                        ok = true;
                    }
                    if ui.button("Cancel").clicked() {
                        cancel = true;
                    }
                });
            });

        if cancel {
            return;
        }
        if ok {
            match self.store.commit(&mut self.settings, &draft.to_update()) {
                Ok(()) => {
                    log::info!("settings: saved to {}", self.store.path().display());
                    self.auto_save = AutoSaveTimer::from_settings(&self.settings, Instant::now());
                    self.applied_theme = None;
                    return;
                }
                Err(e) => {
                    log::warn!("settings: commit failed: {}", e);
                    draft.error = Some(e.to_string());
                }
            }
        }
        self.settings_dialog = Some(draft);
    }

    fn save_window(&mut self, ctx: &egui::Context) {
        let Some(mut path) = self.save_dialog.take() else {
            return;
        };
        let mut save = false;
        let mut cancel = false;
        egui::Window::new("Save Chat As")
            .collapsible(false)
            .resizable(false)
            .anchor(egui::Align2::CENTER_CENTER, [0.0, 0.0])
            .show(ctx, |ui| {
                ui.label("File path:");
                let response = ui.add(
                    egui::TextEdit::singleline(&mut path)
                        .hint_text("chat.txt")
                        .desired_width(320.0),
                );
                if response.lost_focus() && ui.input(|i| i.key_pressed(egui::Key::Enter)) {
                    save = true;
                }
                ui.add_space(8.0);
                ui.horizontal(|ui| {
                    if ui.add_enabled(!path.trim().is_empty(), egui::Button::new("Save")).clicked() {
                        save = true;
                    }
                    if ui.button("Cancel").clicked() {
                        cancel = true;
                    }
                });
            });

        if cancel {
            return;
        }
        if save && !path.trim().is_empty() {
            let target = PathBuf::from(path.trim());
            match self.save_transcript(&target) {
                Ok(()) => self.notice = Some("Chat saved successfully!".to_string()),
                Err(e) => self.error_dialog = Some(format!("{:#}", e)),
            }
            return;
        }
        self.save_dialog = Some(path);
    }

    fn error_window(&mut self, ctx: &egui::Context) {
        let Some(message) = self.error_dialog.as_deref() else {
            return;
        };
        let mut dismissed = false;
        egui::Window::new("Error")
            .collapsible(false)
            .resizable(false)
            .anchor(egui::Align2::CENTER_CENTER, [0.0, 0.0])
            .show(ctx, |ui| {
                ui.colored_label(egui::Color32::RED, message);
                ui.add_space(8.0);
                if ui.button("OK").clicked() {
                    dismissed = true;
                }
            });
        if dismissed {
            self.error_dialog = None;
        }
    }
}

impl eframe::App for PyroApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.apply_theme(ctx);
        self.poll_chat_turn();
        self.poll_auto_save(ctx);
        if self.is_sending() {
            ctx.request_repaint_after(SEND_POLL_INTERVAL);
        }

        egui::TopBottomPanel::top("header").show(ctx, |ui| {
            self.ui_menu_bar(ui);
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            egui::Frame::none()
                .inner_margin(egui::Margin::symmetric(24.0, 0.0))
                .show(ui, |ui| match self.current_screen {
                    Screen::Chat => {
                        ui.add_space(16.0);
                        ui.heading("PyroAI");
                        ui.add_space(Self::SCREEN_TITLE_BOTTOM_SPACING);
                        self.ui_chat(ui);
                    }
                    Screen::Logs => self.ui_logs_screen(ui),
                });
        });

        self.settings_window(ctx);
        self.save_window(ctx);
        self.error_window(ctx);
    }
}
