//! Dump worker
//!
//! Exports every snapshot that NFS has not seen yet as a gzip-compressed CSV
//! named `<outfile>#<seq>.csv.gz`. A non-blocking advisory lock on an NFS
//! sentinel file keeps at most one exporter per directory across hosts; lock
//! contention is a silent skip. The high-water mark (`lastid`) is recovered
//! from the NFS directory itself on every cycle, so the worker is stateless
//! across restarts.

use std::cmp::Ordering;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write as _};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use fs2::FileExt;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::error;

use crate::backend::ZkJournal;
use crate::sequence::{entry_cmp, sequence_cmp, snapshot_seq};
use crate::snapshot;
use crate::zk::ZkClient;

use super::WorkerError;

/// CSV header. `as_role` is exported as `role`, `resourcepk` as `pk`;
/// `resourcegroup` is not exported.
const CSV_COLUMNS: [&str; 13] = [
    "transaction_id",
    "request_id",
    "step",
    "host",
    "resource",
    "verb",
    "pk",
    "date",
    "user_id",
    "authuser_id",
    "role",
    "cm",
    "payload",
];

/// Run the dump loop forever, sleeping `interval` between cycles.
pub fn run(journal: &ZkJournal, nfspath: &Path, interval: u64, outfile: &str, nfsregex: &Regex) {
    loop {
        if let Err(e) = dump_once(journal, nfspath, outfile, nfsregex) {
            error!("error in zk dump: {}", e);
        }
        thread::sleep(Duration::from_secs(interval));
    }
}

/// One dump cycle under the NFS sentinel lock.
pub fn dump_once(
    journal: &ZkJournal,
    nfspath: &Path,
    outfile: &str,
    nfsregex: &Regex,
) -> Result<(), WorkerError> {
    let lockname = format!("{}.lock", journal.client().chroot().replace('/', ""));
    let lockfile = File::create(nfspath.join(lockname))?;
    match lockfile.try_lock_exclusive() {
        Ok(()) => {}
        Err(e) if lock_contended(&e) => return Ok(()),
        Err(e) => {
            error!("error in acquiring lock for dump function: {}", e);
            return Ok(());
        }
    }
    let result = (|| -> Result<(), WorkerError> {
        let zk = journal.client();
        if zk.exists("/history")? {
            let mut entries = zk.get_children("/history")?;
            entries.sort_by(|a, b| entry_cmp(a, b));
            dump_entries(journal, &entries, nfspath, outfile, nfsregex)?;
        }
        Ok(())
    })();
    let _ = FileExt::unlock(&lockfile);
    result
}

pub(super) fn lock_contended(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::PermissionDenied
    )
}

/// Export every snapshot with a sequence past the NFS high-water mark, in
/// ascending serial order.
fn dump_entries(
    journal: &ZkJournal,
    entries: &[String],
    nfspath: &Path,
    outfile: &str,
    nfsregex: &Regex,
) -> Result<(), WorkerError> {
    let zk = journal.client();
    let mut lastid = last_dumped_id(nfspath, outfile, nfsregex)?;
    for entry in entries {
        let jseqid = snapshot_seq(entry);
        if sequence_cmp(lastid.as_deref(), jseqid) != Ordering::Less {
            continue;
        }
        let seq = match jseqid {
            Some(seq) => seq,
            None => continue,
        };
        let csv_path = nfspath.join(format!("{outfile}#{seq}.csv"));
        let mut csv = match open_csv(&csv_path) {
            Ok(csv) => csv,
            Err(e) => {
                error!("error in writing to NFS {}", e);
                continue;
            }
        };
        let (data, _) = match zk.get(&format!("/history/{entry}")) {
            Ok(found) => found,
            Err(e) => {
                error!("error in zk {}", e);
                continue;
            }
        };
        let rows = match snapshot_rows(&data) {
            Ok(rows) => rows,
            Err(e) => {
                error!("error reading snapshot {}: {}", entry, e);
                continue;
            }
        };
        for row in &rows {
            if let Err(e) = write_csv_row(&mut csv, row) {
                error!("error in writing to NFS {}", e);
            }
        }
        drop(csv);
        lastid = Some(seq.to_string());
        match gzip_file(&csv_path) {
            Ok(gz_path) => {
                let _ = fs::set_permissions(&gz_path, fs::Permissions::from_mode(0o644));
                let _ = fs::remove_file(&csv_path);
            }
            Err(e) => {
                error!("failed to gzip {}: {}", csv_path.display(), e);
                let _ = fs::set_permissions(&csv_path, fs::Permissions::from_mode(0o644));
            }
        }
    }
    Ok(())
}

/// Recover the highest exported sequence ID by scanning the NFS directory
/// for files matching the configured pattern.
pub(super) fn last_dumped_id(
    nfspath: &Path,
    outfile: &str,
    nfsregex: &Regex,
) -> io::Result<Option<String>> {
    let mut lastid: Option<String> = None;
    for entry in fs::read_dir(nfspath)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(outfile) {
            continue;
        }
        let path = entry.path().to_string_lossy().into_owned();
        let candidate = match nfsregex.captures(&path).and_then(|caps| caps.get(1)) {
            Some(m) => m.as_str().to_string(),
            None => continue,
        };
        let newer = match &lastid {
            None => true,
            Some(current) => current.parse::<i64>().ok() < candidate.parse::<i64>().ok(),
        };
        if newer {
            lastid = Some(candidate);
        }
    }
    Ok(lastid)
}

fn open_csv(path: &Path) -> io::Result<File> {
    let mut file = OpenOptions::new().append(true).create(true).open(path)?;
    writeln!(file, "{}\r", CSV_COLUMNS.join(","))?;
    Ok(file)
}

fn snapshot_rows(blob: &[u8]) -> Result<Vec<Map<String, Value>>, WorkerError> {
    let script = snapshot::decompress_script(blob)?;
    let conn = snapshot::load_script(&script)?;
    Ok(snapshot::all_rows(&conn)?)
}

fn write_csv_row(out: &mut File, row: &Map<String, Value>) -> io::Result<()> {
    let mut fields = Vec::with_capacity(CSV_COLUMNS.len());
    for column in CSV_COLUMNS {
        let source = match column {
            "role" => "as_role",
            "pk" => "resourcepk",
            other => other,
        };
        fields.push(csv_field(row.get(source)));
    }
    writeln!(out, "{}\r", fields.join(","))
}

fn csv_field(value: Option<&Value>) -> String {
    let text = match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    if text.contains(',') || text.contains('"') || text.contains('\n') || text.contains('\r') {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text
    }
}

fn gzip_file(csv_path: &Path) -> io::Result<PathBuf> {
    let gz_path = PathBuf::from(format!("{}.gz", csv_path.display()));
    let mut input = File::open(csv_path)?;
    let output = File::create(&gz_path)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;
    Ok(gz_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_last_dumped_id_takes_max() {
        let dir = TempDir::new().unwrap();
        for seq in ["0000000001", "0000000004", "0000000002"] {
            fs::write(dir.path().join(format!("out#{seq}.csv.gz")), b"").unwrap();
        }
        fs::write(dir.path().join("unrelated.txt"), b"").unwrap();
        let regex = Regex::new(r".*out#(-?\d+)\.csv.*").unwrap();
        let lastid = last_dumped_id(dir.path(), "out", &regex).unwrap();
        assert_eq!(lastid.as_deref(), Some("0000000004"));
    }

    #[test]
    fn test_last_dumped_id_empty_directory() {
        let dir = TempDir::new().unwrap();
        let regex = Regex::new(r".*out#(-?\d+)\.csv.*").unwrap();
        assert_eq!(last_dumped_id(dir.path(), "out", &regex).unwrap(), None);
    }

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field(None), "");
        assert_eq!(csv_field(Some(&Value::Null)), "");
        assert_eq!(
            csv_field(Some(&Value::String("plain".to_string()))),
            "plain"
        );
        assert_eq!(
            csv_field(Some(&Value::String("a,b".to_string()))),
            "\"a,b\""
        );
        assert_eq!(
            csv_field(Some(&Value::String("say \"hi\"".to_string()))),
            "\"say \"\"hi\"\"\""
        );
    }
}
