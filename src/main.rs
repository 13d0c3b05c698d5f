use log::{debug, info};
use relo6502::config::RelocationJob;
use relo6502::disassembler::Disassembler;
use relo6502::{ProgramImage, Relocator};
use std::env;
use std::fs;
use std::path::Path;

fn print_usage(program: &str) {
    println!("relo6502 - move finished 6502 machine code to a new address");
    println!();
    println!("Usage:");
    println!("  {} <job.toml> [--report]", program);
    println!("  {} --disasm <image.bin> <origin>", program);
    println!();
    println!("The job file names the input image, its origin and entry points,");
    println!("and the [target] code base and zero-page window.");
    println!("--report prints the relocation map as TOML instead of text.");
}

fn parse_address(text: &str) -> Result<u16, String> {
    let digits = text.trim_start_matches("0x").trim_start_matches('$');
    u16::from_str_radix(digits, 16).map_err(|_| format!("Invalid address: {}", text))
}

fn disassemble(path: &str, origin: &str) -> Result<(), Box<dyn std::error::Error>> {
    let origin = parse_address(origin)?;
    let bytes = fs::read(path).map_err(|e| format!("Failed to read {}: {}", path, e))?;
    let image = ProgramImage::new(bytes, origin)?;
    let disasm = Disassembler::new(image.bytes(), image.origin());
    print!("{}", disasm.listing(0..image.len()));
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        return Ok(());
    }

    if args[1] == "--disasm" {
        if args.len() < 4 {
            print_usage(&args[0]);
            std::process::exit(1);
        }
        return disassemble(&args[2], &args[3]);
    }

    let report = args[2..].iter().any(|arg| arg == "--report");

    let job = RelocationJob::load(Path::new(&args[1]))?;
    debug!("Loaded job: {:?}", job);

    let bytes = fs::read(&job.input)
        .map_err(|e| format!("Failed to read {}: {}", job.input.display(), e))?;
    let image = ProgramImage::new(bytes, job.origin)?;
    info!(
        "Relocating {} ({} bytes at ${:04X})",
        job.input.display(),
        image.len(),
        image.origin()
    );

    let mut relocator = Relocator::new();
    let relocated = match relocator.relocate(
        &image,
        &job.entry_points,
        job.relocation_target(),
        job.max_cycles_per_run,
    ) {
        Ok(bytes) => bytes,
        Err(error) => {
            eprintln!("Error: {}", error);
            eprintln!();
            for diagnostic in &error.diagnostics {
                eprintln!("  {}", diagnostic);
            }
            std::process::exit(1);
        }
    };

    let output = job.output_path();
    fs::write(&output, &relocated)
        .map_err(|e| format!("Failed to write {}: {}", output.display(), e))?;

    if let Some(map) = relocator.relocation_map() {
        if report {
            print!("{}", toml::to_string(&map.report())?);
        } else {
            print!("{}", map);
        }
    }
    println!("Wrote {} bytes to {}", relocated.len(), output.display());
    Ok(())
}
