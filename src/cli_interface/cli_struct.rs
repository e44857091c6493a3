use clap::Parser;

/// a CLI interface to create a filesystem image, or mount one and work in
/// it through the interactive shell
#[derive(Parser, Debug, PartialEq)]
#[command(author, version, about, long_about)]
pub enum MiniFsCli {
    /// create and format a new filesystem image
    Format(FormatArgs),
    /// mount an image file and start the interactive shell
    Mount(MountArgs),
}

/// format subcommand
#[derive(clap::Args, Debug, PartialEq)]
#[command(author, version, about = "create a new filesystem image")]
pub struct FormatArgs {
    /// the path of the filesystem image file
    #[clap(short = 'p', long)]
    pub image_file_path: String,
    /// the size of the filesystem in MiB
    #[clap(short, long)]
    pub size_mb: u64,
}

/// mount subcommand
#[derive(clap::Args, Debug, PartialEq)]
#[command(author, version, about = "mount a filesystem image")]
pub struct MountArgs {
    /// the path of the filesystem image file
    #[clap(short = 'p', long)]
    pub image_file_path: String,
}
