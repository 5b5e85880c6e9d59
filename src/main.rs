//! `mkopal`: builds an Opal disk image on the host.
//!
//! Usage: `mkopal <image> <size_mib> [boot.bin] [files...]`
//!
//! The boot image (if given) lands in the 8 boot sectors of block 0; every further file is
//! packed into the data area and listed in the root directory under its basename.

use std::env;
use std::fs;
use std::path::Path;
use std::process::ExitCode;

use opal::fs::ofs::mkfs::{build_image, InputFile, DEFAULT_DISK_SIZE};
use opal::time::DateTime;

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("usage: {} <image> <size_mib> [boot.bin] [files...]", args[0]);
        return ExitCode::FAILURE;
    }

    let image_path = Path::new(&args[1]);
    let disk_size = match args[2].parse::<usize>() {
        Ok(0) => DEFAULT_DISK_SIZE,
        Ok(mib) => mib * 1024 * 1024,
        Err(_) => {
            eprintln!("error: invalid disk size '{}'", args[2]);
            return ExitCode::FAILURE;
        }
    };

    let boot_block = match args.get(3) {
        Some(path) => match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) => {
                eprintln!("error: could not read '{path}': {err}");
                return ExitCode::FAILURE;
            }
        },
        None => Vec::new(),
    };

    let mut file_data = Vec::new();
    for path in &args[4..] {
        match fs::read(path) {
            Ok(bytes) => file_data.push((path.clone(), bytes)),
            Err(err) => {
                eprintln!("error: could not read '{path}': {err}");
                return ExitCode::FAILURE;
            }
        }
    }

    let files: Vec<InputFile> = file_data
        .iter()
        .map(|(name, data)| InputFile { name, data })
        .collect();

    println!(
        "Creating disk image {}: {:.2}MiB, {} files",
        image_path.display(),
        disk_size as f64 / (1024.0 * 1024.0),
        files.len()
    );

    // Offline build: a fixed stamp instead of an RTC.
    let stamp = DateTime {
        seconds: 0,
        minutes: 0,
        hours: 12,
        day: 1,
        month: 1,
        year: 2024,
    };

    let image = match build_image(disk_size, &boot_block, &files, stamp) {
        Ok(image) => image,
        Err(err) => {
            eprintln!("error: could not build image: {err:?}");
            return ExitCode::FAILURE;
        }
    };

    for (name, data) in &file_data {
        println!(
            "  {}: {} bytes, {} blocks",
            name,
            data.len(),
            data.len().div_ceil(4096)
        );
    }

    if let Err(err) = fs::write(image_path, &image) {
        eprintln!("error: could not write '{}': {err}", image_path.display());
        return ExitCode::FAILURE;
    }

    println!("Done: {} bytes", image.len());
    ExitCode::SUCCESS
}
