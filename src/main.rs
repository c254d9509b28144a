use std::path::Path;

use giftsregister_to_md::{load_config, run_pipeline, PipelineConfig};

fn main() {
    // Simple CLI flag parsing: only --config <path> is supported.
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = String::from("pipeline.yaml");
    if let Some(pos) = args.iter().position(|a| a == "--config") {
        if let Some(val) = args.get(pos + 1) {
            if !val.starts_with("--") {
                config_path = val.clone();
            }
        }
    }

    // Missing config falls back to the documented defaults; a present but
    // unreadable or invalid config is a startup error.
    let cfg = if Path::new(&config_path).exists() {
        match load_config(Path::new(&config_path)) {
            Ok(cfg) => {
                eprintln!(
                    "{}",
                    serde_json::json!({
                        "tool": "load_config",
                        "file": config_path,
                        "status": "ok",
                        "input_dir": &cfg.input_dir,
                        "output_dir": &cfg.output_dir,
                    })
                );
                cfg
            }
            Err(e) => {
                eprintln!(
                    "{}",
                    serde_json::json!({
                        "tool": "load_config",
                        "file": config_path,
                        "error": e.to_string(),
                    })
                );
                std::process::exit(3);
            }
        }
    } else {
        let cfg = PipelineConfig::default();
        eprintln!(
            "{}",
            serde_json::json!({
                "tool": "load_config",
                "file": config_path,
                "status": "defaults",
                "input_dir": &cfg.input_dir,
                "output_dir": &cfg.output_dir,
            })
        );
        cfg
    };

    match run_pipeline(&cfg) {
        Ok(summary) => {
            eprintln!(
                "{}",
                serde_json::json!({
                    "tool": "run_pipeline",
                    "status": "done",
                    "summary": summary,
                })
            );
        }
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::json!({
                    "tool": "run_pipeline",
                    "error": e.to_string(),
                    "error_code": 6,
                })
            );
            std::process::exit(6);
        }
    }
}
