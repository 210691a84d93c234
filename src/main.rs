mod conversion;
mod diagnostics;
mod error;
mod fstools;
mod manager;
mod presets;
mod probe;
mod progress;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use human_repr::HumanCount;
use kdam::{BarExt, term, tqdm};
use rustop::opts;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use conversion::{Conversion, ConversionStatus};
use fstools::InputKind;
use manager::ConversionManager;
use presets::{Preset, PresetCatalog};
use probe::MediaFile;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let (args, rest) = opts! {
        synopsis "Convert video files for phones, tablets and the web";
        opt list_presets:bool=false, desc:"List the available presets and exit.";
        opt preset:String=String::from("mp4"), desc:"Identifier of the preset to convert with.";
        opt jobs:Option<usize>, desc:"Maximum simultaneous conversions. [default: unlimited]";
        opt output_dir:Option<String>, desc:"Directory for converted files. [default: next to each input]";
        param infile:Option<String>, desc:"Input media file(s)";
    }
    .parse_or_exit();

    let catalog = PresetCatalog::standard();
    if args.list_presets {
        for preset in catalog.all() {
            println!("{:<16} {}", preset.identifier(), preset.name());
        }
        return ExitCode::SUCCESS;
    }

    let Some(preset) = catalog.get(&args.preset.to_lowercase()) else {
        println!(
            "Unknown preset {:?}; --list-presets shows what is available.",
            args.preset
        );
        return ExitCode::FAILURE;
    };

    let mut inputs: Vec<String> = vec![];
    inputs.extend(args.infile.clone());
    inputs.extend(rest);
    if inputs.is_empty() {
        println!("No input files given.");
        return ExitCode::FAILURE;
    }

    if !presets::encoder_available(preset.as_ref()) {
        println!(
            "{:?} is not runnable; is the encoder installed?",
            preset.executable()
        );
        return ExitCode::FAILURE;
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    if let Err(err) =
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupted))
    {
        warn!("unable to register SIGINT handler: {}", err);
    }

    let output_dir = args.output_dir.as_deref().map(Path::new);
    let mut manager = ConversionManager::new(args.jobs);
    let mut conversions = vec![];

    term::init(false);
    for (position, input) in inputs.iter().enumerate() {
        let path = PathBuf::from(input);
        match fstools::classify_input(&path) {
            InputKind::File => {}
            InputKind::Missing => {
                println!("{:?} does not exist.", input);
                return ExitCode::FAILURE;
            }
            kind => {
                println!("{:?} is not a regular file ({:?}).", input, kind);
                return ExitCode::FAILURE;
            }
        }
        let file = match MediaFile::open(&path) {
            Ok(file) => file,
            Err(err) => {
                println!("Unable to inspect {:?}: {}", input, err);
                return ExitCode::FAILURE;
            }
        };
        let conversion = manager.start_conversion(file, Arc::clone(&preset), output_dir);
        attach_progress_bar(&conversion, position as u16);
        conversions.push(conversion);
    }

    if manager.waiting_count() > 0 {
        println!(
            "{} running, {} waiting.",
            manager.in_progress().len(),
            manager.waiting_count()
        );
    }

    while manager.is_running() {
        if interrupted.swap(false, Ordering::SeqCst) {
            println!("Caught interrupt; stopping conversions.");
            manager.stop_all();
        }
        manager.check_notifications();
        thread::sleep(Duration::from_millis(100));
    }

    println!();
    let mut all_finished = true;
    for conversion in &conversions {
        let state = conversion.state();
        match state.status {
            ConversionStatus::Finished => {
                let size = fs::metadata(conversion.output())
                    .map(|metadata| metadata.len())
                    .unwrap_or(0);
                println!(
                    "{} ({})",
                    conversion.output().display(),
                    size.human_count_bytes()
                );
            }
            status => {
                all_finished = false;
                println!(
                    "{}: {:?} ({})",
                    conversion.file().file_name(),
                    status,
                    state.error.unwrap_or_default()
                );
                // the tail of the encoder log usually names the culprit
                let lines = conversion.lines();
                for line in lines.iter().rev().take(8).rev() {
                    println!("    {}", line);
                }
            }
        }
    }

    if all_finished {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn attach_progress_bar(conversion: &Arc<Conversion>, position: u16) {
    let file = conversion.file();
    let input_size = fs::metadata(&file.path)
        .map(|metadata| metadata.len())
        .unwrap_or(0);
    let desc = match conversion.preset().output_size_guess(file) {
        Some(guess) => format!(
            "{} ({} -> ~{})",
            file.file_name(),
            input_size.human_count_bytes(),
            guess.human_count_bytes()
        ),
        None => format!("{} ({})", file.file_name(), input_size.human_count_bytes()),
    };

    let bar = Mutex::new(tqdm!(
        total = 100,
        desc = desc,
        position = position,
        force_refresh = true
    ));
    conversion.listen(Box::new(move |c| {
        let mut bar = bar.lock().unwrap();
        let postfix = match c.status() {
            ConversionStatus::Converting => format!(
                "{:.1}/{:.1}s eta {:.0}s",
                c.progress().unwrap_or(0.0),
                c.duration().unwrap_or(0.0),
                c.eta().unwrap_or(0.0)
            ),
            status => format!("{:?}", status).to_lowercase(),
        };
        bar.set_postfix(postfix);
        let percent = (c.progress_percent().unwrap_or(0.0) * 100.0).round() as usize;
        let _ = bar.update_to(percent);
    }));
}
