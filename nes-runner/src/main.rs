//! Headless NES runner.
//!
//! Loads an iNES ROM, runs it for a number of frames on the configured
//! execution core and reports the final CPU state plus a digest of the last
//! frame. Useful for benchmarking the cores against each other and for
//! regression-checking ROMs without a window.

use std::path::Path;

use cpu_6502::DumpHook;
use machine_nes::{Configuration, CoreKind, FrameSink, InesFile, Runner};
use machine_nes::{DISPLAY_HEIGHT, DISPLAY_WIDTH};

/// Keeps the most recent frame and counts them.
#[derive(Default)]
struct HeadlessSink {
    frames: u32,
    last: Vec<u32>,
}

impl FrameSink for HeadlessSink {
    fn display(&mut self, pixels: &[u32]) {
        self.frames += 1;
        self.last = pixels.to_vec();
    }
}

/// FNV-1a over the frame pixels; enough to compare runs.
fn frame_digest(pixels: &[u32]) -> u64 {
    let mut hash: u64 = 0xCBF2_9CE4_8422_2325;

    for pixel in pixels {
        for byte in pixel.to_le_bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
        }
    }

    hash
}

struct Options {
    rom: String,
    cpu: Option<String>,
    frames: Option<u32>,
    trace: bool,
    dump: Option<String>,
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut rom = None;
    let mut cpu = None;
    let mut frames = None;
    let mut trace = false;
    let mut dump = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--cpu" => {
                cpu = Some(iter.next().ok_or("--cpu needs a value")?.clone());
            }
            "--frames" => {
                let value = iter.next().ok_or("--frames needs a value")?;
                frames = Some(value.parse().map_err(|_| "--frames needs a number")?);
            }
            "--trace" => trace = true,
            "--dump-frame" => {
                dump = Some(iter.next().ok_or("--dump-frame needs a path")?.clone());
            }
            other if other.starts_with('-') => {
                return Err(format!("Unknown option {other}"));
            }
            other => rom = Some(other.to_string()),
        }
    }

    Ok(Options {
        rom: rom.ok_or("No ROM given")?,
        cpu,
        frames,
        trace,
        dump,
    })
}

fn run(options: &Options) -> Result<(), String> {
    let config = Configuration::load(Path::new("config.json"))?;
    let cpu_name = options.cpu.as_deref().unwrap_or(&config.cpu);
    let frames = options.frames.unwrap_or(config.frames);

    let data = std::fs::read(&options.rom)
        .map_err(|error| format!("Failed to read {}: {error}", options.rom))?;
    let ines = InesFile::load(&data)?;

    println!(
        "{}: mapper {}, {} PRG / {} CHR banks, cpu core '{}'",
        options.rom,
        ines.mapper_id(),
        ines.prg_banks().len(),
        ines.chr_banks().len(),
        cpu_name,
    );

    let kind = CoreKind::from_name(cpu_name)?;
    let mut runner = Runner::new(&ines, kind)?;

    if options.trace {
        runner.cpu_mut().set_hook(Some(Box::new(DumpHook)));
    }

    let mut sink = HeadlessSink::default();
    for _ in 0..frames {
        runner.tick(&mut sink)?;
    }

    let state = runner.cpu().state();
    println!(
        "After {} frames: A {:02x} X {:02x} Y {:02x} S {:02x} P {:02x} PC {:04x}",
        sink.frames,
        state.a,
        state.x,
        state.y,
        state.s,
        state.p,
        { state.pc },
    );
    println!("Frame digest: {:016x}", frame_digest(&sink.last));

    if let Some(path) = &options.dump {
        write_ppm(path, &sink.last)?;
        println!("Last frame written to {path}");
    }

    Ok(())
}

/// Writes the frame as a binary PPM image.
fn write_ppm(path: &str, pixels: &[u32]) -> Result<(), String> {
    let mut data = format!("P6\n{DISPLAY_WIDTH} {DISPLAY_HEIGHT}\n255\n").into_bytes();

    for pixel in pixels {
        data.push((pixel >> 16) as u8);
        data.push((pixel >> 8) as u8);
        data.push(*pixel as u8);
    }

    std::fs::write(path, data).map_err(|error| format!("Failed to write {path}: {error}"))
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(error) => {
            eprintln!("{error}");
            eprintln!();
            eprintln!("Usage: nes-runner [options] <rom.nes>");
            eprintln!("  --cpu <impl>        interpret | amd64 | dynarec | lua");
            eprintln!("  --frames <count>    frames to run (default from config.json)");
            eprintln!("  --trace             dump executed instructions (interpret only)");
            eprintln!("  --dump-frame <path> write the last frame as PPM");
            std::process::exit(1);
        }
    };

    if let Err(error) = run(&options) {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}
