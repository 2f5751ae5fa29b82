use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};

use cask_core::{ImageInfo, Remote, Store};

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = CaskCli::parse();
    init_tracing(cli.trace, cli.verbose);

    let store = Store::open(store_root(cli.store.clone())).map_err(|err| eyre!("{err:?}"))?;
    run(&store, &cli).map_err(|err| eyre!("{err:?}"))
}

fn init_tracing(trace: bool, verbose: u8) {
    let level = if trace {
        "trace"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("cask_core={level},cask_domain={level},cask={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn store_root(flag: Option<PathBuf>) -> PathBuf {
    if let Some(path) = flag {
        return path;
    }
    dirs_next::home_dir()
        .map(|home| home.join(".cask").join("store"))
        .unwrap_or_else(|| PathBuf::from(".cask-store"))
}

fn run(store: &Store, cli: &CaskCli) -> anyhow::Result<()> {
    match &cli.command {
        Command::Import(args) => {
            let key = match &args.file {
                Some(path) => {
                    let file = File::open(path)
                        .with_context(|| format!("failed to open {}", path.display()))?;
                    store.import_archive(io::BufReader::new(file))?
                }
                None => store.import_archive(io::stdin().lock())?,
            };
            println!("{key}");
        }
        Command::Cat(args) => {
            let key = store.resolve_key(&args.key)?;
            let blob = store.read_blob(&key)?;
            io::stdout()
                .write_all(&blob)
                .context("failed to write blob to stdout")?;
        }
        Command::Manifest(args) => {
            let key = store.resolve_key(&args.key)?;
            let manifest = store.get_manifest(&key)?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }
        Command::Resolve(args) => {
            println!("{}", store.resolve_key(&args.key)?);
        }
        Command::Images => {
            let images = store.list_images()?;
            if images.is_empty() {
                if !cli.quiet {
                    println!("no images imported");
                }
            } else {
                println!("{}", format_image_table(&images));
            }
        }
        Command::Remote(RemoteCommand::Get { url }) => match store.get_remote(url)? {
            Some(remote) => println!("{}", remote.blob_key),
            None => anyhow::bail!("no remote cached for {url}"),
        },
        Command::Remote(RemoteCommand::Set { url, key }) => {
            let key = store.resolve_key(key)?;
            store.put_remote(&Remote {
                source_url: url.clone(),
                blob_key: key.clone(),
            })?;
            if !cli.quiet {
                println!("{url} -> {key}");
            }
        }
        Command::Dump(args) => store.dump(args.hex),
    }
    Ok(())
}

fn format_image_table(images: &[ImageInfo]) -> String {
    let headers = ["Key", "App", "Imported"];
    let rendered: Vec<[String; 3]> = images
        .iter()
        .map(|info| {
            [
                info.blob_key.clone(),
                info.app_name.clone(),
                format_import_time(info.import_time),
            ]
        })
        .collect();

    let mut widths = [headers[0].len(), headers[1].len(), headers[2].len()];
    for row in &rendered {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.len());
        }
    }

    let mut lines = Vec::new();
    lines.push(format!(
        "{:<w0$}  {:<w1$}  {:<w2$}",
        headers[0],
        headers[1],
        headers[2],
        w0 = widths[0],
        w1 = widths[1],
        w2 = widths[2],
    ));
    lines.push(format!(
        "{:-<w0$}  {:-<w1$}  {:-<w2$}",
        "",
        "",
        "",
        w0 = widths[0],
        w1 = widths[1],
        w2 = widths[2],
    ));
    for row in &rendered {
        lines.push(format!(
            "{:<w0$}  {:<w1$}  {:<w2$}",
            row[0],
            row[1],
            row[2],
            w0 = widths[0],
            w1 = widths[1],
            w2 = widths[2],
        ));
    }
    lines.join("\n")
}

fn format_import_time(secs: i64) -> String {
    time::OffsetDateTime::from_unix_timestamp(secs)
        .ok()
        .and_then(|ts| ts.format(&time::format_description::well_known::Rfc3339).ok())
        .unwrap_or_else(|| secs.to_string())
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Content-addressable store for container image archives",
    after_help = "Examples:\n  cask import ./app.aci.gz\n  cask resolve sha512-0c45\n  cask dump --hex\n"
)]
struct CaskCli {
    #[arg(
        long,
        env = "CASK_STORE_PATH",
        value_name = "DIR",
        help = "Store base directory (defaults to ~/.cask/store)"
    )]
    store: Option<PathBuf>,
    #[arg(
        short,
        long,
        help = "Suppress status output (errors still print to stderr)"
    )]
    quiet: bool,
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)")]
    verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q")]
    trace: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(
        about = "Import an archive (gzip, bzip2, or plain tar) and print its key.",
        override_usage = "cask import [FILE]",
        after_help = "Examples:\n  cask import ./app.aci\n  curl -sL $URL | cask import\n"
    )]
    Import(ImportArgs),
    #[command(about = "Write the canonical blob for KEY to stdout.")]
    Cat(KeyArgs),
    #[command(about = "Print the stored manifest for KEY as JSON.")]
    Manifest(KeyArgs),
    #[command(
        about = "Resolve a partial key to the unique stored key it prefixes.",
        after_help = "Example:\n  cask resolve sha512-0c45e8c0ab2\n"
    )]
    Resolve(KeyArgs),
    #[command(about = "List imported images with their provenance rows.")]
    Images,
    #[command(subcommand, about = "Inspect or update the remote-URL cache.")]
    Remote(RemoteCommand),
    #[command(about = "Enumerate every namespace value (debugging aid).")]
    Dump(DumpArgs),
}

#[derive(Args, Debug)]
struct ImportArgs {
    #[arg(value_name = "FILE", help = "Archive path (reads stdin when omitted)")]
    file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct KeyArgs {
    #[arg(value_name = "KEY", help = "Full or partial store key")]
    key: String,
}

#[derive(Subcommand, Debug)]
enum RemoteCommand {
    #[command(about = "Print the key cached for URL.")]
    Get {
        #[arg(value_name = "URL")]
        url: String,
    },
    #[command(about = "Cache KEY as what URL resolves to.")]
    Set {
        #[arg(value_name = "URL")]
        url: String,
        #[arg(value_name = "KEY", help = "Full or partial store key")]
        key: String,
    },
}

#[derive(Args, Debug)]
struct DumpArgs {
    #[arg(long, help = "Hex-encode value previews")]
    hex: bool,
}
