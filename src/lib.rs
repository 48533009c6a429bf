// SPDX-License-Identifier: GPL-2.0-or-later

mod commands;
mod config;
mod console;
mod error;
mod http;
mod image;
mod instance;
mod interp;
mod logging;
mod qemu;
mod store;
mod terminal;
mod util;
mod vsock;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

const VERSION: &str = "v0.6.2";

#[derive(Parser, Debug)]
#[command(
    name = "qemu-compose",
    about = "Define and run QEMU VM with qemu",
    disable_version_flag = true
)]
struct Args {
    /// Show the qemu-compose version information
    #[arg(short = 'v', long)]
    version: bool,

    /// Shows only qemu-compose's version number
    #[arg(long, default_value_t = false)]
    short: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create and start QEMU vm from a compose file
    Up {
        /// Compose configuration file
        #[arg(short = 'f', long)]
        file: Option<PathBuf>,

        /// Specify an alternate working directory (default: the path of the
        /// compose file)
        #[arg(long)]
        project_directory: Option<PathBuf>,
    },

    /// Run a new instance from an image
    Run {
        /// Image name, id, or unique id prefix
        image: String,

        /// Assign a name to the vm
        #[arg(long)]
        name: Option<String>,

        /// Publish a vm port to the host (host_ip:host_port:vm_port[/proto])
        #[arg(short = 'p', long = "publish")]
        ports: Vec<String>,

        /// Bind mount a host directory into the vm (src:dst[:ro])
        #[arg(short = 'v', long = "volume")]
        volumes: Vec<String>,
    },

    /// Restart an existing instance
    Start {
        /// Instance id, name, or unique id prefix
        identifier: String,

        /// Compose configuration file merged over the persisted one
        #[arg(short = 'f', long)]
        file: Option<PathBuf>,
    },

    /// List instances
    Ps {
        /// Show all instances (default shows just running)
        #[arg(short = 'a', long)]
        all: bool,
    },

    /// List images
    Images,

    /// Run ssh with the instance key
    Ssh {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Show the qemu-compose version information
    Version {
        /// Shows only qemu-compose's version number
        #[arg(long, default_value_t = false)]
        short: bool,
    },
}

fn print_version(short: bool) {
    if short {
        eprintln!("{VERSION}");
    } else {
        eprintln!("qemu-compose version {VERSION}");
    }
}

pub fn main(args: impl IntoIterator<Item = String>) -> i32 {
    logging::init();

    let parsed = Args::parse_from(args);

    if parsed.version {
        print_version(parsed.short);
        return 0;
    }

    let command = match parsed.command {
        Some(command) => command,
        None => {
            use clap::CommandFactory;
            let _ = Args::command().print_help();
            return 1;
        }
    };

    let result = match command {
        Command::Up {
            file,
            project_directory,
        } => commands::up::up(file.as_deref(), project_directory.as_deref()),
        Command::Run {
            image,
            name,
            ports,
            volumes,
        } => commands::run::run(&image, name.as_deref(), &ports, &volumes),
        Command::Start { identifier, file } => {
            commands::start::start(&identifier, file.as_deref())
        }
        Command::Ps { all } => commands::ps::ps(all),
        Command::Images => commands::images::images(),
        Command::Ssh { args } => commands::ssh::ssh(&args),
        Command::Version { short } => {
            print_version(short);
            Ok(())
        }
    };

    match result {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {err}");
            err.exit_code()
        }
    }
}
