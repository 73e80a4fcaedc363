//! BoothPrint CLI - operator and kiosk bridge
//!
//! Commands: templates, validate, create, delete, run, compose
//! Outputs JSON to stdout
//! Returns 2 on validation failure, 1 on any other error

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use boothprint_core::{
    pipeline::PipelineError,
    session::{run_to_end, SystemClock},
    thermal::CropRect,
    BoothConfig, BoothPipeline, DirectoryStore, ImageData, PhotoSet, PngFileSink, QueuedCamera,
    SessionEvent, TemplateStore,
};

#[derive(Parser)]
#[command(name = "boothprint-cli")]
#[command(about = "BoothPrint CLI - photo booth layouts, capture and thermal print")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a JSON booth config
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Template store directory (overrides the config)
    #[arg(short, long)]
    store: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List stored templates
    Templates,

    /// Validate a stored template
    Validate {
        /// Template ID
        #[arg(short, long)]
        template: String,
    },

    /// Create a template from a background image and slot rectangles
    Create {
        #[arg(short, long)]
        name: String,

        /// Background image file
        #[arg(short, long)]
        background: PathBuf,

        /// Crop of the background, as x,y,width,height in source pixels
        #[arg(long, value_parser = parse_crop)]
        crop: Option<CropRect>,

        /// Slot as x,y,width,height[,rotation] in template pixels; repeatable
        #[arg(long = "slot", value_parser = parse_slot)]
        slots: Vec<SlotArg>,
    },

    /// Delete a stored template
    Delete {
        #[arg(short, long)]
        template: String,
    },

    /// Run a capture session from a directory of frames and print the result
    Run {
        #[arg(short, long)]
        template: String,

        /// Directory of captured frames, consumed in file-name order
        #[arg(short, long)]
        frames: PathBuf,

        /// Output directory for the print
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Compose a print from existing photos
    Compose {
        #[arg(short, long)]
        template: String,

        /// Photo for one slot, as slot_id=path; repeatable
        #[arg(long = "photo", value_parser = parse_photo)]
        photos: Vec<(String, PathBuf)>,

        #[arg(short, long)]
        out: PathBuf,
    },
}

#[derive(Debug, Clone, Copy)]
struct SlotArg {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
    rotation: f64,
}

fn parse_numbers(s: &str) -> Result<Vec<f64>, String> {
    s.split(',')
        .map(|part| part.trim().parse::<f64>().map_err(|e| format!("'{}': {}", part, e)))
        .collect()
}

fn parse_slot(s: &str) -> Result<SlotArg, String> {
    match parse_numbers(s)?.as_slice() {
        [x, y, width, height] => Ok(SlotArg { x: *x, y: *y, width: *width, height: *height, rotation: 0.0 }),
        [x, y, width, height, rotation] => Ok(SlotArg {
            x: *x,
            y: *y,
            width: *width,
            height: *height,
            rotation: *rotation,
        }),
        _ => Err("expected x,y,width,height[,rotation]".to_string()),
    }
}

fn parse_crop(s: &str) -> Result<CropRect, String> {
    let values: Vec<u32> = s
        .split(',')
        .map(|part| part.trim().parse::<u32>().map_err(|e| format!("'{}': {}", part, e)))
        .collect::<Result<_, _>>()?;
    match values.as_slice() {
        [x, y, width, height] => Ok(CropRect { x: *x, y: *y, width: *width, height: *height }),
        _ => Err("expected x,y,width,height".to_string()),
    }
}

fn parse_photo(s: &str) -> Result<(String, PathBuf), String> {
    let (slot, path) = s.split_once('=').ok_or("expected slot_id=path")?;
    Ok((slot.to_string(), PathBuf::from(path)))
}

fn emit(value: Value) {
    println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()));
}

fn fail(error: impl std::fmt::Display) -> ExitCode {
    emit(json!({ "success": false, "error": error.to_string() }));
    ExitCode::FAILURE
}

fn pipeline_failure(error: PipelineError) -> ExitCode {
    let validation = matches!(error, PipelineError::ValidationFailed(_));
    emit(json!({ "success": false, "error": error.to_string() }));
    if validation {
        ExitCode::from(2)
    } else {
        ExitCode::FAILURE
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match BoothConfig::load(path) {
            Ok(c) => c,
            Err(e) => return fail(e),
        },
        None => BoothConfig::default(),
    };
    if let Some(dir) = cli.store {
        config.store_dir = dir;
    }

    let store = match DirectoryStore::open(&config.store_dir) {
        Ok(s) => s,
        Err(e) => return fail(format!("Failed to open store: {}", e)),
    };
    let mut pipeline = BoothPipeline::new(store, config);

    match cli.command {
        Commands::Templates => match pipeline.list_templates() {
            Ok(templates) => {
                let listing: Vec<_> = templates
                    .iter()
                    .map(|t| {
                        json!({
                            "id": t.id,
                            "name": t.name,
                            "height": t.height,
                            "slots": t.slots.len(),
                            "createdAt": t.created_at,
                        })
                    })
                    .collect();
                emit(Value::Array(listing));
                ExitCode::SUCCESS
            }
            Err(e) => pipeline_failure(e),
        },

        Commands::Validate { template } => match pipeline.validate_template(&template) {
            Ok(result) => {
                let valid = result.valid;
                emit(serde_json::to_value(&result).unwrap_or(Value::Null));
                if valid {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::from(2)
                }
            }
            Err(e) => pipeline_failure(e),
        },

        Commands::Create { name, background, crop, slots } => {
            let source = match fs::read(&background) {
                Ok(bytes) => bytes,
                Err(e) => return fail(format!("Could not read {}: {}", background.display(), e)),
            };
            let mut editor = match pipeline.new_editor(&source, crop) {
                Ok(editor) => editor,
                Err(e) => return pipeline_failure(e),
            };
            editor.rename(name);
            for slot in slots {
                let id = editor.add_slot();
                if let Err(e) = editor.move_or_resize_slot(&id, slot.x, slot.y, slot.width, slot.height, slot.rotation) {
                    return fail(e);
                }
            }
            match pipeline.save_layout(&editor) {
                Ok(saved) => {
                    emit(json!({ "success": true, "template": saved }));
                    ExitCode::SUCCESS
                }
                Err(PipelineError::Editor(e)) => {
                    emit(json!({ "success": false, "error": e.to_string() }));
                    ExitCode::from(2)
                }
                Err(e) => pipeline_failure(e),
            }
        }

        Commands::Delete { template } => match pipeline.delete_template(&template) {
            Ok(()) => {
                emit(json!({ "success": true, "deleted": template }));
                ExitCode::SUCCESS
            }
            Err(e) => pipeline_failure(e),
        },

        Commands::Run { template, frames, out } => {
            let camera = match QueuedCamera::from_dir(&frames) {
                Ok(camera) => camera,
                Err(e) => return fail(format!("Could not read frames: {}", e)),
            };
            let mut session = match pipeline.start_session(&template, camera) {
                Ok(session) => session,
                Err(e) => return pipeline_failure(e),
            };

            let clock = SystemClock::new();
            let photos = match run_to_end(&mut session, &clock, || false, |event| match event {
                SessionEvent::Countdown { slot_index, remaining } => {
                    log::info!("slot {}: {}", slot_index + 1, remaining)
                }
                SessionEvent::Captured { slot_id, sequence } => log::info!("captured #{} ({})", sequence, slot_id),
                SessionEvent::CaptureMissed { slot_id, attempt } => {
                    log::warn!("no frame for {} (attempt {})", slot_id, attempt)
                }
                _ => {}
            }) {
                Ok(photos) => photos,
                Err(e) => return fail(e),
            };
            let captured = session.template().clone();
            drop(session);

            compose_and_print(&pipeline, &captured.id, &photos, out)
        }

        Commands::Compose { template, photos, out } => {
            let mut set = PhotoSet::new();
            for (slot_id, path) in photos {
                match fs::read(&path) {
                    Ok(bytes) => {
                        set.insert(slot_id, ImageData(bytes));
                    }
                    Err(e) => return fail(format!("Could not read {}: {}", path.display(), e)),
                }
            }
            compose_and_print(&pipeline, &template, &set, out)
        }
    }
}

fn compose_and_print<S: TemplateStore>(
    pipeline: &BoothPipeline<S>,
    template_id: &str,
    photos: &PhotoSet,
    out: PathBuf,
) -> ExitCode {
    let template = match pipeline.get_template(template_id) {
        Ok(t) => t,
        Err(e) => return pipeline_failure(e),
    };
    let job = match pipeline.compose_print(&template, photos) {
        Ok(job) => job,
        Err(e) => return pipeline_failure(e),
    };
    let mut sink = match PngFileSink::new(out) {
        Ok(sink) => sink,
        Err(e) => return fail(e),
    };
    if let Err(e) = pipeline.print(&job, &mut sink) {
        return pipeline_failure(e);
    }

    emit(json!({
        "success": true,
        "templateId": job.template_id,
        "layoutHash": job.layout_hash,
        "photos": photos.len(),
        "width": job.image.width(),
        "height": job.image.height(),
        "output": sink.last_output().map(|p| p.display().to_string()),
    }));
    ExitCode::SUCCESS
}
