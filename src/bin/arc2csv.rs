/// Convert journal or archive files to CSV on stdout
use anyhow::Context;
use clap::Parser;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

use envlog::models::{Reading, Snapshot};
use envlog::storage::archive::gunzip;
use envlog::storage::journal::parse_records;

#[derive(Parser, Debug)]
#[command(about = "Export recorded snapshots as CSV")]
struct Args {
    /// Journal files or `rec*.txt.gz` archives, read in the given order
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn load(path: &Path) -> anyhow::Result<Vec<Snapshot>> {
    let raw = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let bytes = if path.extension().is_some_and(|ext| ext == "gz") {
        gunzip(&raw).with_context(|| format!("Failed to decompress {}", path.display()))?
    } else {
        raw
    };
    let text = String::from_utf8_lossy(&bytes);
    let (snapshots, skipped) = parse_records(&text);
    if skipped > 0 {
        log::warn!("{}: {} unreadable records skipped", path.display(), skipped);
    }
    Ok(snapshots)
}

fn climate_columns(dat: &Reading) -> Vec<(String, String)> {
    let name = dat.text("name").unwrap_or_default();
    let mut columns = Vec::new();
    if let Some(tenths) = dat.int("dcE1") {
        columns.push((format!("{} temperature[C]", name), format!("{:.1}", tenths as f64 / 10.0)));
    }
    if let Some(rh) = dat.int("rh") {
        columns.push((format!("{} humidity[%]", name), rh.to_string()));
    }
    if let Some(co2) = dat.int("CO2") {
        columns.push((format!("{} CO2[ppm]", name), co2.to_string()));
    }
    columns
}

fn power_columns(dat: &Reading, field: &str) -> Vec<(String, String)> {
    dat.breakdown(field)
        .unwrap_or_default()
        .iter()
        .map(|entry| (format!("{}[W]", entry.1), entry.0.to_string()))
        .collect()
}

/// Column order: climate descending, then generation and consumption ascending
fn header(snapshots: &[Snapshot]) -> Vec<String> {
    let mut climate = BTreeSet::new();
    let mut generation = BTreeSet::new();
    let mut usage = BTreeSet::new();
    for record in snapshots.iter().flat_map(|s| s.devices.values()) {
        climate.extend(climate_columns(&record.dat).into_iter().map(|(name, _)| name));
        generation.extend(power_columns(&record.dat, "gen").into_iter().map(|(name, _)| name));
        usage.extend(power_columns(&record.dat, "use").into_iter().map(|(name, _)| name));
    }

    let mut columns: Vec<String> = climate.into_iter().rev().collect();
    columns.extend(generation);
    columns.extend(usage.into_iter());
    let mut seen = BTreeSet::new();
    columns.retain(|name| seen.insert(name.clone()));
    columns
}

fn row(snapshot: &Snapshot, index: &HashMap<&str, usize>, offset: UtcOffset) -> anyhow::Result<Vec<String>> {
    let mut cells = vec![String::new(); index.len() + 1];
    let time = OffsetDateTime::from_unix_timestamp(snapshot.timestamp)?.to_offset(offset);
    cells[0] = time.format(format_description!("[year]/[month]/[day] [hour]:[minute]"))?;

    for record in snapshot.devices.values() {
        let values = climate_columns(&record.dat)
            .into_iter()
            .chain(power_columns(&record.dat, "gen"))
            .chain(power_columns(&record.dat, "use"));
        for (name, value) in values {
            if let Some(&i) = index.get(name.as_str()) {
                cells[i + 1] = value;
            }
        }
    }
    Ok(cells)
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Warn)
        .parse_default_env()
        .init();

    let args = Args::parse();
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);

    let mut snapshots = Vec::new();
    for file in &args.files {
        snapshots.extend(load(file)?);
    }

    let columns = header(&snapshots);
    let index: HashMap<&str, usize> = columns
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    let mut writer = csv::Writer::from_writer(std::io::stdout());
    let mut head = vec!["time".to_string()];
    head.extend(columns.iter().cloned());
    writer.write_record(&head)?;
    for snapshot in &snapshots {
        writer.write_record(row(snapshot, &index, offset)?)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use envlog::models::{DeviceMap, DeviceRecord, Entry};

    fn sample() -> Snapshot {
        let mut devices = DeviceMap::new();
        devices.insert(
            "meter1".to_string(),
            DeviceRecord {
                dat: Reading::new()
                    .with("dcE1", 234i64)
                    .with("rh", 55i64)
                    .with("name", "Bedroom"),
                ut: 1700000000,
            },
        );
        devices.insert(
            "hems".to_string(),
            DeviceRecord {
                dat: Reading::new()
                    .with("gen", vec![Entry(123, "Solar".to_string())])
                    .with("use", vec![Entry(300, "Living".to_string())]),
                ut: 1700000000,
            },
        );
        Snapshot::new(1700000000, devices)
    }

    #[test]
    fn header_orders_climate_then_power() {
        assert_eq!(
            header(&[sample()]),
            vec![
                "Bedroom temperature[C]",
                "Bedroom humidity[%]",
                "Solar[W]",
                "Living[W]",
            ]
        );
    }

    #[test]
    fn row_fills_known_columns() {
        let snapshots = [sample()];
        let columns = header(&snapshots);
        let index: HashMap<&str, usize> = columns
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();
        let cells = row(&snapshots[0], &index, UtcOffset::UTC).unwrap();
        assert_eq!(cells, vec!["2023/11/14 22:13", "23.4", "55", "123", "300"]);
    }
}
