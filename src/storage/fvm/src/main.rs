// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host tooling for FVM images: format a fresh image, validate one, or wipe
//! one.

use anyhow::{bail, Context, Error};
use argh::FromArgs;
use block_device::{BlockDevice, FileBlockDevice};
use fvm::check::check;
use fvm::volume::{format, probe_geometry};

#[derive(FromArgs)]
/// Operate on an FVM image file.
struct Args {
    /// path to the image file
    #[argh(positional)]
    image: String,

    /// device block size in bytes
    #[argh(option, default = "512")]
    block_size: u32,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Create(CreateArgs),
    Check(CheckArgs),
    Destroy(DestroyArgs),
}

#[derive(FromArgs)]
/// Write a fresh, valid metadata pair to the image.
#[argh(subcommand, name = "create")]
struct CreateArgs {
    /// slice size in bytes (a power-of-two multiple of the block size)
    #[argh(option)]
    slice_size: u64,

    /// create or resize the image to this many bytes first
    #[argh(option)]
    length: Option<u64>,
}

#[derive(FromArgs)]
/// Validate both metadata copies and every volume invariant.
#[argh(subcommand, name = "check")]
struct CheckArgs {}

#[derive(FromArgs)]
/// Zero both metadata regions.
#[argh(subcommand, name = "destroy")]
struct DestroyArgs {}

fn run(args: Args) -> Result<(), Error> {
    match args.command {
        Command::Create(create) => {
            let device = match create.length {
                Some(length) => FileBlockDevice::create(&args.image, args.block_size, length),
                None => FileBlockDevice::open(&args.image, args.block_size),
            }
            .with_context(|| format!("opening {}", args.image))?;
            format(&device, create.slice_size)?;
            println!("{}: formatted with slice size {}", args.image, create.slice_size);
        }
        Command::Check(_) => {
            let device = FileBlockDevice::open(&args.image, args.block_size)
                .with_context(|| format!("opening {}", args.image))?;
            let report = check(&device)?;
            if !report.is_valid() {
                eprintln!("{report}");
                bail!("{} failed validation", args.image);
            }
            println!("{report}");
        }
        Command::Destroy(_) => {
            let device = FileBlockDevice::open(&args.image, args.block_size)
                .with_context(|| format!("opening {}", args.image))?;
            let geometry = probe_geometry(&device)?;
            let zeroes = vec![0u8; geometry.metadata_size as usize];
            device.write_at(&zeroes, 0).context("zeroing metadata copy A")?;
            device.write_at(&zeroes, geometry.metadata_size).context("zeroing metadata copy B")?;
            device.flush()?;
            println!("{}: destroyed", args.image);
        }
    }
    Ok(())
}

fn main() {
    let args: Args = argh::from_env();
    let image = args.image.clone();
    if let Err(error) = run(args) {
        eprintln!("fvm: {image}: {error:#}");
        std::process::exit(1);
    }
}
