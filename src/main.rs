//! mnfkit CLI - Command-line tool for browsing and extracting MNF archives.
//!
//! This is the main entry point for the mnfkit command-line application.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mnfkit::prelude::*;

/// mnfkit - MNF game archive browsing and extraction tool
#[derive(Parser)]
#[command(name = "mnfkit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ArchiveArgs {
    /// Path to the .mnf index file
    #[arg(short, long, env = "MNFKIT_ARCHIVE")]
    archive: PathBuf,

    /// File id of the entry carrying the file table (decimal or 0x-prefixed hex)
    #[arg(long, value_parser = parse_file_id, conflicts_with = "no_table")]
    carrier_id: Option<u32>,

    /// Do not resolve names through the file table
    #[arg(long)]
    no_table: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show archive header, data files and name resolution summary
    Info {
        #[command(flatten)]
        archive: ArchiveArgs,

        /// Dump every decoded header field
        #[arg(long)]
        fields: bool,
    },

    /// List the children of a directory
    List {
        #[command(flatten)]
        archive: ArchiveArgs,

        /// Directory to list
        #[arg(short, long, default_value = "/")]
        path: String,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Search file and directory paths
    Search {
        #[command(flatten)]
        archive: ArchiveArgs,

        /// Substring (case-sensitive) or regular expression
        pattern: String,

        /// Treat the pattern as a regular expression
        #[arg(short, long)]
        regex: bool,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Write the content of one entry to stdout or a file
    Cat {
        #[command(flatten)]
        archive: ArchiveArgs,

        /// Entry path
        path: String,

        /// Output file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Keep the stored bytes instead of decompressing
        #[arg(long)]
        raw: bool,
    },

    /// Extract entries to a directory
    Extract {
        #[command(flatten)]
        archive: ArchiveArgs,

        /// Output directory
        #[arg(short, long, env = "MNFKIT_OUTPUT")]
        output: PathBuf,

        /// Only extract entries below this directory
        #[arg(long, default_value = "/")]
        root: String,

        /// Only extract entries whose path matches this glob
        #[arg(short, long)]
        filter: Option<String>,

        /// Skip entries whose path matches this glob
        #[arg(short, long)]
        ignore: Option<String>,

        /// Keep the stored bytes instead of decompressing
        #[arg(long)]
        raw: bool,

        /// Number of worker threads
        #[arg(short, long)]
        workers: Option<usize>,

        /// Skip the free disk space check
        #[arg(long)]
        no_space_check: bool,
    },

    /// Find the archives of a game installation
    Installs {
        /// Installation directory
        dir: PathBuf,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("mnfkit={}", level).parse()?)
                .add_directive(format!("mnfkit_archive={}", level).parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Info { archive, fields } => cmd_info(&archive, fields)?,
        Commands::List { archive, path, json } => cmd_list(&archive, &path, json)?,
        Commands::Search {
            archive,
            pattern,
            regex,
            json,
        } => cmd_search(&archive, &pattern, regex, json)?,
        Commands::Cat {
            archive,
            path,
            output,
            raw,
        } => cmd_cat(&archive, &path, output.as_deref(), raw)?,
        Commands::Extract {
            archive,
            output,
            root,
            filter,
            ignore,
            raw,
            workers,
            no_space_check,
        } => {
            let options = ExtractOptions {
                root,
                filter,
                ignore,
                decompress: !raw,
                workers,
                check_disk_space: !no_space_check,
            };
            cmd_extract(&archive, &output, options)?;
        }
        Commands::Installs { dir, json } => cmd_installs(&dir, json)?,
    }

    Ok(())
}

fn parse_file_id(value: &str) -> Result<u32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid file id {:?}: {}", value, e))
}

fn open_archive(args: &ArchiveArgs) -> Result<Arc<Archive>> {
    let carrier = match (args.no_table, args.carrier_id) {
        (true, _) => CarrierStrategy::Disabled,
        (false, Some(id)) => CarrierStrategy::FileId(id),
        (false, None) => CarrierStrategy::Auto,
    };

    let start = Instant::now();
    let archive = Archive::open_with(&args.archive, ArchiveOptions::default().with_carrier(carrier))
        .with_context(|| format!("Failed to open archive {}", args.archive.display()))?;
    info!(
        entries = archive.entry_count(),
        elapsed = ?start.elapsed(),
        "opened {}",
        args.archive.display()
    );

    Ok(Arc::new(archive))
}

fn cmd_info(args: &ArchiveArgs, fields: bool) -> Result<()> {
    let archive = open_archive(args)?;
    let header = archive.header();

    println!("Archive:    {}", archive.path().display());
    println!("Size:       {}", HumanBytes(archive.size()));
    println!("Version:    {}", header.version);
    println!("Entries:    {} ({} live)", archive.entry_count(), archive.live_count());
    if let Some(extra) = &header.extra {
        println!(
            "Extra:      type {} ({} + {} bytes)",
            extra.extra_type, extra.extra1_size, extra.extra2_size
        );
    }
    if archive.id_anomalies() > 0 {
        println!("Anomalies:  {} unexpected id table rows", archive.id_anomalies());
    }

    println!("\nData files:");
    for data_file in archive.data_files() {
        println!(
            "  {:>4} {:>12} {}{}",
            data_file.number(),
            HumanBytes(data_file.size()).to_string(),
            data_file.path().display(),
            if data_file.exists() { "" } else { " (missing)" }
        );
    }

    match (archive.carrier(), archive.file_table()) {
        (Some(carrier), Some(table)) => {
            let stats = archive.resolution_stats();
            println!("\nFile table: entry {} ({} rows)", carrier.id, table.len());
            println!(
                "  {} linked, {} unmatched, {} duplicates, {} unnamed",
                stats.linked, stats.unmatched, stats.duplicates, stats.unnamed
            );
        }
        (Some(carrier), None) => println!("\nFile table: entry {} could not be decoded", carrier.id),
        (None, _) => println!("\nFile table: none"),
    }

    if fields {
        println!("\nHeader fields:");
        for field in archive.header_fields() {
            println!("  {}", field);
        }
    }

    Ok(())
}

fn cmd_list(args: &ArchiveArgs, path: &str, json: bool) -> Result<()> {
    let archive = open_archive(args)?;
    let items = archive.list_directory(path);

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    for item in &items {
        match item {
            DirectoryItem::Folder { name, .. } => println!("{:>12} {:>12} {}/", "", "", name),
            DirectoryItem::File {
                name,
                compressed_size,
                decompressed_size,
                ..
            } => println!("{:>12} {:>12} {}", compressed_size, decompressed_size, name),
        }
    }

    let stats = archive.folder_stats(path);
    println!(
        "\nTotal: {} folders, {} files, {} stored, {} decompressed",
        stats.folders,
        stats.files,
        HumanBytes(stats.compressed),
        HumanBytes(stats.decompressed)
    );

    Ok(())
}

fn cmd_search(args: &ArchiveArgs, pattern: &str, regex: bool, as_json: bool) -> Result<()> {
    let archive = open_archive(args)?;
    let results = archive
        .search(pattern, regex)
        .with_context(|| format!("Invalid search pattern {:?}", pattern))?;

    if as_json {
        let values: Vec<_> = results
            .iter()
            .map(|result| match result {
                SearchResult::Directory { archive, path } => json!({
                    "kind": "directory",
                    "archive": archive.display().to_string(),
                    "path": path,
                }),
                SearchResult::File { archive, path, entry } => json!({
                    "kind": "file",
                    "archive": archive.display().to_string(),
                    "path": path,
                    "entry": entry.id,
                    "compressed_size": entry.compressed_size,
                    "decompressed_size": entry.decompressed_size,
                }),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&values)?);
        return Ok(());
    }

    for result in &results {
        match result {
            SearchResult::Directory { path, .. } => println!("{}/", path.trim_end_matches('/')),
            SearchResult::File { path, .. } => println!("{}", path),
        }
    }
    println!("\nTotal: {} matches", results.len());

    Ok(())
}

fn cmd_cat(args: &ArchiveArgs, path: &str, output: Option<&Path>, raw: bool) -> Result<()> {
    let archive = open_archive(args)?;
    let data = archive
        .read(path, !raw)
        .with_context(|| format!("Failed to read {}", path))?;

    match output {
        Some(output) => {
            fs::write(output, &data).context("Failed to write output file")?;
            eprintln!("Wrote {} to {}", HumanBytes(data.len() as u64), output.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&data)?;
            stdout.flush()?;
        }
    }

    Ok(())
}

struct ExtractOptions {
    root: String,
    filter: Option<String>,
    ignore: Option<String>,
    decompress: bool,
    workers: Option<usize>,
    check_disk_space: bool,
}

fn cmd_extract(args: &ArchiveArgs, output: &Path, options: ExtractOptions) -> Result<()> {
    let archive = open_archive(args)?;

    let filter = options
        .filter
        .as_deref()
        .map(glob::Pattern::new)
        .transpose()
        .context("Invalid filter pattern")?;
    let selected: Vec<EntryId> = archive
        .live_entries()
        .filter(|e| e.relative_path(&options.root).is_some())
        .filter(|e| filter.as_ref().map_or(true, |p| p.matches(e.path())))
        .map(|e| e.id)
        .collect();

    let mut request = ExtractionRequest::new(output)
        .root(options.root.as_str())
        .decompress(options.decompress)
        .check_disk_space(options.check_disk_space)
        .select(selected);

    if let Some(pattern) = &options.ignore {
        request = request.ignore(glob::Pattern::new(pattern).context("Invalid ignore pattern")?);
    }
    if let Some(workers) = options.workers {
        request = request.workers(workers);
    }

    let token = CancellationToken::new();
    let request = request.token(token.clone());
    ctrlc::set_handler(move || {
        info!("Received interrupt, stopping extraction");
        token.cancel();
    })
    .context("Failed to install interrupt handler")?;

    let job = archive.extract(request).context("Failed to start extraction")?;

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {wide_msg}")?
            .progress_chars("#>-"),
    );

    for event in job.events().iter() {
        match event {
            ExtractionEvent::Started { total, workers } => {
                pb.set_length(total as u64);
                pb.println(format!("Extracting {} entries with {} workers...", total, workers));
            }
            ExtractionEvent::Progress { processed, path, .. } => {
                pb.set_position(processed as u64);
                pb.set_message(path);
            }
            ExtractionEvent::Failed { path, error } => {
                pb.println(format!("Error extracting {}: {}", path, error));
            }
            ExtractionEvent::Stopping { .. } => pb.set_message("stopping after in-flight entries"),
            ExtractionEvent::Finished(_) => break,
        }
    }

    let report = job.wait().context("Extraction failed")?;
    pb.set_position(report.processed as u64);
    pb.finish_with_message(if report.cancelled { "Stopped" } else { "Done" });

    println!(
        "Extracted {} of {} entries in {:?} ({} errors){}",
        report.succeeded(),
        report.total,
        report.elapsed,
        report.failed,
        if report.cancelled { ", cancelled" } else { "" }
    );

    Ok(())
}

fn cmd_installs(dir: &Path, as_json: bool) -> Result<()> {
    let install = GameInstall::discover(dir);

    if as_json {
        println!("{}", serde_json::to_string_pretty(&install)?);
        return Ok(());
    }

    println!("Installation: {}", install.path.display());
    match &install.build {
        Some(build) => println!(
            "Build:        {} ({}, {})",
            build.version, build.build_number, build.build_date
        ),
        None => println!("Build:        unknown"),
    }
    for archive in &install.archives {
        println!("  {}", archive.display());
    }
    println!("\nTotal: {} archives", install.archives.len());

    Ok(())
}
