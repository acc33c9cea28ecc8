use std::env;
use std::fs::File;
use std::io::Read;
use std::time::{Duration, Instant};

use jvm_weaver::event::EventTypes;
use jvm_weaver::matcher::{MatchAll, Matcher};
use jvm_weaver::structure::{LoadingBoundary, StructuralType};
use jvm_weaver::weaver::Weaver;
use zip::ZipArchive;

const MAX_REPORTED_FAILURES: usize = 20;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let jar_path = env::args().nth(1).ok_or("usage: jar_weave_bench JAR_PATH [EVENTS]")?;
    let event_types = match env::args().nth(2).as_deref() {
        None | Some("all") => EventTypes::all(),
        Some("entry") => EventTypes::BEFORE | EventTypes::RETURN | EventTypes::THROWS,
        Some("lines") => EventTypes::LINE,
        Some("calls") => EventTypes::CALLS,
        Some(other) => return Err(format!("unknown event selection {other:?}").into()),
    };
    let mut zip = ZipArchive::new(File::open(&jar_path)?)?;

    let boundary = LoadingBoundary::Application { id: 1 };
    let weaver = Weaver::new("bench", 1000, event_types);
    let mut total_bytes: u64 = 0;
    let mut class_files: u64 = 0;
    let mut woven_classes: u64 = 0;
    let mut woven_methods: u64 = 0;
    let mut failures: Vec<(String, String)> = Vec::new();
    let mut elapsed = Duration::ZERO;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let name = entry.name().to_string();
        if !name.ends_with(".class") || name.ends_with("module-info.class") {
            continue;
        }
        class_files += 1;
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;
        total_bytes += bytes.len() as u64;

        let start = Instant::now();
        let outcome = StructuralType::from_bytes(&bytes, boundary.clone())
            .map_err(|e| e.to_string())
            .and_then(|ty| MatchAll.matching(&ty).map_err(|e| e.to_string()))
            .and_then(|matched| {
                weaver.weave(boundary.object_id(), &bytes, &matched.sign_codes()).map_err(|e| e.to_string())
            });
        elapsed += start.elapsed();

        match outcome {
            Ok(woven) if woven.is_modified() => {
                woven_classes += 1;
                woven_methods += woven.behaviors.len() as u64;
            }
            Ok(_) => {}
            Err(error) => failures.push((name, error)),
        }
    }

    let secs = elapsed.as_secs_f64();
    let mb = total_bytes as f64 / (1024.0 * 1024.0);
    let ns_per_class = if class_files > 0 { elapsed.as_nanos() as f64 / class_files as f64 } else { 0.0 };
    let mb_per_s = if secs > 0.0 { mb / secs } else { 0.0 };

    println!("jar_path={jar_path}");
    println!("event_types={event_types:?}");
    println!("class_files={class_files}");
    println!("woven_classes={woven_classes} woven_methods={woven_methods} failed={}", failures.len());
    println!("total_mb={mb:.3}");
    println!("weave_time_ms={:.3}", secs * 1000.0);
    println!("ns_per_class={ns_per_class:.1}");
    println!("mb_per_s={mb_per_s:.2}");
    for (name, error) in failures.iter().take(MAX_REPORTED_FAILURES) {
        eprintln!("failed {name}: {error}");
    }
    if failures.len() > MAX_REPORTED_FAILURES {
        eprintln!("... and {} more", failures.len() - MAX_REPORTED_FAILURES);
    }

    Ok(())
}
