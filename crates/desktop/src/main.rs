//! Pyro Desktop — application entry.

mod app;

use eframe::egui;

fn main() -> eframe::Result<()> {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("pyro-chat")
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([800.0, 600.0])
            .with_min_inner_size([480.0, 360.0]),
        ..Default::default()
    };
    eframe::run_native(
        "PyroAI Chatbot",
        options,
        Box::new(move |cc| Box::new(app::PyroApp::new(cc, runtime))),
    )
}
