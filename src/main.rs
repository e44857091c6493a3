use clap::Parser;

use minifs::cli_interface::{MiniFsCli, Shell};
use minifs::FileSystem;

/// Entry point: `format` lays a fresh filesystem onto an image file,
/// `mount` attaches an image and hands control to the interactive shell
/// until `exit`.
fn main() -> anyhow::Result<()> {
    env_logger::builder().format_timestamp_nanos().init();
    let args = MiniFsCli::parse();
    match args {
        MiniFsCli::Format(args) => {
            let fs = FileSystem::new();
            fs.format(&args.image_file_path, args.size_mb)?;
            println!(
                "formatted {} ({} MiB)",
                args.image_file_path, args.size_mb
            );
        }
        MiniFsCli::Mount(args) => {
            let fs = FileSystem::new();
            fs.mount(&args.image_file_path)?;
            let stdin = std::io::stdin();
            let mut input = stdin.lock();
            let mut output = std::io::stdout();
            Shell::new(&fs).run(&mut input, &mut output)?;
            fs.unmount()?;
        }
    }
    Ok(())
}
