// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::{Args, Subcommand};

use crate::{
    commands::{Handle, HandledResult},
    context::Context,
    tools::{self, ImageImportOpts},
};

#[derive(Args, Debug, Clone)]
pub struct ImageArgs {
    #[command(subcommand)]
    command: ImageCommands,
}

#[derive(Subcommand, Debug, Clone)]
enum ImageCommands {
    /// Import images from the local runtime into every node of a cluster
    Import {
        #[arg(required = true)]
        images: Vec<String>,

        #[arg(short, long, default_value = "k3s-default")]
        cluster: String,

        /// Do not delete the tools node afterwards
        #[arg(long)]
        keep_tools: bool,
    },
}

pub async fn image(ctx: &Context, args: &ImageArgs) -> HandledResult<()> {
    match &args.command {
        ImageCommands::Import {
            images,
            cluster,
            keep_tools,
        } => {
            let opts = ImageImportOpts {
                keep_tools: *keep_tools,
            };
            tools::import_images(ctx, cluster, images, &opts)
                .await
                .handle_err(|e| eprintln!("Failed to import images into cluster '{cluster}': {e}"))?;
            println!("Imported {} image(s) into cluster '{cluster}'", images.len());
            Ok(())
        }
    }
}
