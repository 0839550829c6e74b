//! Run with: cargo run --package server --bin generate-types --features typescript

use std::fs;
use std::io::Write;
use std::path::Path;

use ts_rs::TS;

const OUT_DIR: &str = "bindings";

type Export = fn(&Path) -> Result<(), ts_rs::ExportError>;

fn entry(name: &'static str, export: Export) -> (&'static str, Export) {
    (name, export)
}

fn exports() -> Vec<(&'static str, Export)> {
    vec![
        entry("SessionStatus", |dir| insight_core::SessionStatus::export_all_to(dir)),
        entry("SessionParameters", |dir| insight_core::SessionParameters::export_all_to(dir)),
        entry("WorkflowSession", |dir| insight_core::WorkflowSession::export_all_to(dir)),
        entry("StageStatus", |dir| insight_core::StageStatus::export_all_to(dir)),
        entry("StageState", |dir| insight_core::StageState::export_all_to(dir)),
        entry("Severity", |dir| insight_core::Severity::export_all_to(dir)),
        entry("ErrorRecord", |dir| insight_core::ErrorRecord::export_all_to(dir)),
        entry("EventEnvelope", |dir| events::EventEnvelope::export_all_to(dir)),
        entry("Event", |dir| events::Event::export_all_to(dir)),
        entry("SessionUpdate", |dir| events::SessionUpdate::export_all_to(dir)),
        entry("ClientMessage", |dir| websocket::ClientMessage::export_all_to(dir)),
        entry("ServerMessage", |dir| websocket::ServerMessage::export_all_to(dir)),
        entry("SubscriptionFilter", |dir| websocket::SubscriptionFilter::export_all_to(dir)),
        entry("StartSessionRequest", |dir| server::routes::StartSessionRequest::export_all_to(dir)),
        entry("StartSessionResponse", |dir| server::routes::StartSessionResponse::export_all_to(dir)),
        entry("SessionControlRequest", |dir| server::routes::SessionControlRequest::export_all_to(dir)),
        entry("SessionControlResponse", |dir| server::routes::SessionControlResponse::export_all_to(dir)),
    ]
}

fn main() {
    println!("Generating TypeScript types...");

    let out_dir = Path::new(OUT_DIR);
    if let Err(e) = fs::create_dir_all(out_dir) {
        eprintln!("Failed to create output directory: {}", e);
        std::process::exit(1);
    }

    let exports = exports();
    for (name, export) in &exports {
        if let Err(e) = export(out_dir) {
            eprintln!("Failed to export {}: {}", name, e);
            std::process::exit(1);
        }
    }
    println!("Types exported to {}", out_dir.display());

    if let Err(e) = generate_index(out_dir, exports.iter().map(|(name, _)| *name)) {
        eprintln!("Failed to write index.ts: {}", e);
        std::process::exit(1);
    }
}

fn generate_index<'a>(out_dir: &Path, names: impl Iterator<Item = &'a str>) -> std::io::Result<()> {
    let index_path = out_dir.join("index.ts");
    let mut file = fs::File::create(&index_path)?;

    writeln!(
        file,
        "// Auto-generated - regenerate with: cargo run --package server --bin generate-types --features typescript\n"
    )?;
    for name in names {
        writeln!(file, "export * from './{}';", name)?;
    }

    println!("Generated {}", index_path.display());
    Ok(())
}
