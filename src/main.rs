use anyhow::{bail, Context, Result};
use log::warn;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

use dedup_store::{
    orphaned_jobs, reclaim_job, row_count, AccnumBulkAdapter, BulkLoader, DescriptionBulkAdapter,
    ProteinAccnum, ProteinDescription, ProteinSequence, SequenceBulkAdapter, SqliteGateway,
    StoreConfig, STAGING_TABLES,
};

const USAGE: &str = "usage: dedup-store [--config <file>] <load <csv> | stats | reclaim>";

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args: Vec<String> = env::args().skip(1).collect();

    let mut config_path: Option<PathBuf> = None;
    if args.first().map(String::as_str) == Some("--config") {
        if args.len() < 2 {
            bail!("--config needs a file\n{}", USAGE);
        }
        config_path = Some(PathBuf::from(args.remove(1)));
        args.remove(0);
    }

    let config = StoreConfig::load(config_path.as_deref())?;
    let gateway = config.open()?;

    match args.first().map(String::as_str) {
        Some("load") => match args.get(1) {
            Some(csv_path) => run_load(&gateway, &config, Path::new(csv_path)),
            None => bail!("load needs a CSV file\n{}", USAGE),
        },
        Some("stats") => run_stats(&gateway),
        Some("reclaim") => run_reclaim(&gateway),
        _ => bail!(USAGE),
    }
}

#[derive(Debug, Deserialize)]
struct ProteinRecord {
    #[serde(rename = "Sequence")]
    sequence: String,
    #[serde(rename = "Accession", default)]
    accession: Option<String>,
    #[serde(rename = "Description", default)]
    description: Option<String>,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn run_load(gateway: &SqliteGateway, config: &StoreConfig, csv_path: &Path) -> Result<()> {
    println!("🧬 Bulk load: {}", csv_path.display());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let orphans = orphaned_jobs(gateway)?;
    if !orphans.is_empty() {
        warn!("{} orphaned bulk jobs found, run `dedup-store reclaim`", orphans.len());
    }

    // 1. Read CSV
    println!("\n📂 Reading CSV...");
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("cannot open {}", csv_path.display()))?;

    let mut sequences = Vec::new();
    let mut accessions = Vec::new();
    let mut descriptions = Vec::new();
    for (line, record) in reader.deserialize::<ProteinRecord>().enumerate() {
        let record = record.with_context(|| format!("bad record {}", line + 1))?;
        sequences.push(ProteinSequence::new(&record.sequence));
        if let Some(accession) = present(&record.accession) {
            accessions.push(ProteinAccnum::new(accession));
        }
        if let Some(description) = present(&record.description) {
            descriptions.push(ProteinDescription::new(description));
        }
    }
    println!("✓ Read {} records", sequences.len());

    // 2. Resolve each value type
    println!("\n💾 Deduplicating...");
    let outcome = BulkLoader::with_config(gateway, SequenceBulkAdapter, &config.loader)
        .load(&mut sequences)?;
    println!(
        "✓ Sequences:    {} in, {} new, {} reused",
        outcome.ids.len(),
        outcome.stats.inserted,
        outcome.stats.staged - outcome.stats.inserted
    );

    let outcome = BulkLoader::with_config(gateway, AccnumBulkAdapter, &config.loader)
        .load(&mut accessions)?;
    println!(
        "✓ Accessions:   {} in, {} new, {} reused",
        outcome.ids.len(),
        outcome.stats.inserted,
        outcome.stats.staged - outcome.stats.inserted
    );

    let outcome = BulkLoader::with_config(gateway, DescriptionBulkAdapter, &config.loader)
        .load(&mut descriptions)?;
    println!(
        "✓ Descriptions: {} in, {} new, {} reused",
        outcome.ids.len(),
        outcome.stats.inserted,
        outcome.stats.staged - outcome.stats.inserted
    );

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("🎉 Load complete");
    Ok(())
}

fn run_stats(gateway: &SqliteGateway) -> Result<()> {
    println!("📊 Stored values");
    for table in [
        "protein_sequence",
        "protein_accnum",
        "protein_description",
        "protein_sequence_list",
        "protein_accnum_set",
        "curation",
    ] {
        println!("  {:<24} {:>10}", table, row_count(gateway, table)?);
    }

    let orphans = orphaned_jobs(gateway)?;
    if !orphans.is_empty() {
        println!("\n⚠️  {} orphaned bulk jobs", orphans.len());
    }
    Ok(())
}

fn run_reclaim(gateway: &SqliteGateway) -> Result<()> {
    let orphans = orphaned_jobs(gateway)?;
    if orphans.is_empty() {
        println!("✓ No orphaned bulk jobs");
        return Ok(());
    }

    let mut removed = 0;
    for job in orphans {
        removed += reclaim_job(gateway, job, STAGING_TABLES)?;
    }
    println!("✓ Removed {} staging rows", removed);
    Ok(())
}
