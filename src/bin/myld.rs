use std::fs;
use std::path::PathBuf;
use std::process;

use log::warn;
use structopt::StructOpt;

use myld::layout::DEFAULT_BASE_VADDR;
use myld::{link_with_base, LinkError};

#[derive(StructOpt, Debug)]
#[structopt(
    name = "myld",
    about = "A minimal static linker for ELF64 x86-64 relocatable objects"
)]
struct Args {
    #[structopt(
        short = "o",
        default_value = "myld-a.out",
        help = "Path to write the linked executable to"
    )]
    output: PathBuf,

    #[structopt(
        short = "T",
        help = "Linker script (accepted for command-line compatibility; ignored)"
    )]
    script: Option<PathBuf>,

    #[structopt(
        long = "nostdlib",
        help = "Do not link the standard library (accepted for command-line compatibility; ignored)"
    )]
    nostdlib: bool,

    #[structopt(help = "Input relocatable object files")]
    inputs: Vec<PathBuf>,
}

fn run(args: &Args) -> Result<(), LinkError> {
    if args.script.is_some() {
        warn!("-T <script> is accepted but ignored; myld has no linker-script support");
    }
    if args.nostdlib {
        warn!("-nostdlib is accepted but ignored; myld never links a standard library");
    }

    let mut inputs = Vec::with_capacity(args.inputs.len());
    for path in &args.inputs {
        let bytes = fs::read(path).map_err(LinkError::Io)?;
        inputs.push((path.display().to_string(), bytes));
    }

    let image = link_with_base(&inputs, DEFAULT_BASE_VADDR)?;
    fs::write(&args.output, image).map_err(LinkError::Io)?;
    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::from_args();
    if let Err(err) = run(&args) {
        eprintln!("myld: {}", err);
        process::exit(1);
    }
}
