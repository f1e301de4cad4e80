/**
 * # txjournal - Transactional Audit Journal
 *
 * Records the lifecycle of multi-step business transactions
 * (begin → commit/abort) with primary/secondary failover between a
 * coordination-service journal and an NFS journal.
 *
 * ## Usage
 *
 * ```bash
 * # HTTP server on a Unix socket
 * txjournal server -u /run/journal.sock -c journal.yaml
 *
 * # Write one length-prefixed JSON record from stdin
 * txjournal write -c journal.yaml < record.bin
 *
 * # Fold live nodes into snapshot entries every 5 minutes
 * txjournal fold -c journal.yaml -b 2000 -i 300
 *
 * # Export snapshots to NFS as gzip CSV
 * txjournal dump -c journal.yaml -n /export/journal -r '.*out#(-?\d+)\.csv.*' -o out
 *
 * # Age out snapshots that dump already exported
 * txjournal cleanup -c journal.yaml -n /export/journal -r '.*out#(-?\d+)\.csv.*' -o out -a 3600
 *
 * # Drain NFS failover records back into the coordination journal
 * txjournal resync-nfs -c journal.yaml
 * ```
 *
 * Each command accepts `-p/--primary` and `-s/--secondary` URL overrides
 * (`zookeeper://hosts[/chroot][#auth]` or `nfs://<path>`); file values from
 * `-c/--cfg` are used otherwise, and any other key in the file is forwarded
 * to the coordination client verbatim. Configuration errors terminate with a
 * brief message and a nonzero exit code.
 */

use std::error::Error;
use std::io::Read as _;
use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use regex::Regex;
use serde_json::Value;

use txjournal::backend::{Journal, ZkJournal};
use txjournal::config::{JournalConfig, DEFAULT_HISTORY_CACHE};
use txjournal::logging::init_logging;
use txjournal::server;
use txjournal::workers;
use txjournal::zk::ZkClient;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the journal web server on a Unix socket
    Server {
        /// Journal config file
        #[arg(short = 'c', long)]
        cfg: Option<String>,

        /// Socket for the web server to listen on
        #[arg(short = 'u', long)]
        unixsocket: String,

        /// Primary journal URL
        #[arg(short = 'p', long)]
        primary: Option<String>,

        /// Secondary journal URL
        #[arg(short = 's', long)]
        secondary: Option<String>,

        /// Size of the history cache
        #[arg(short = 'i', long, default_value_t = DEFAULT_HISTORY_CACHE)]
        historycache: usize,

        /// Admin user which has rw/delete access
        #[arg(long)]
        adminuser: Option<String>,
    },

    /// Drain NFS failover records back into the coordination journal
    ResyncNfs {
        /// Journal config file
        #[arg(short = 'c', long)]
        cfg: Option<String>,

        /// Primary journal URL
        #[arg(short = 'p', long)]
        primary: Option<String>,

        /// Secondary journal URL
        #[arg(short = 's', long)]
        secondary: Option<String>,

        /// Admin user which has rw/delete access
        #[arg(long)]
        adminuser: Option<String>,
    },

    /// Write one journal record read from stdin (4-byte big-endian length
    /// prefix followed by that many bytes of JSON)
    Write {
        /// Journal config file
        #[arg(short = 'c', long)]
        cfg: Option<String>,

        /// Primary journal URL
        #[arg(short = 'p', long)]
        primary: Option<String>,

        /// Secondary journal URL
        #[arg(short = 's', long)]
        secondary: Option<String>,

        /// Admin user which has rw/delete access
        #[arg(long)]
        adminuser: Option<String>,
    },

    /// Fold live journal nodes into snapshot entries
    Fold {
        /// Journal config file
        #[arg(short = 'c', long)]
        cfg: Option<String>,

        /// Zookeeper journal URL
        #[arg(short = 'p', long)]
        primary: Option<String>,

        /// Batch size
        #[arg(short = 'b', long, default_value_t = 2000)]
        batchsize: usize,

        /// Interval in seconds
        #[arg(short = 'i', long, default_value_t = 300)]
        interval: u64,

        /// Admin user which has rw/delete access
        #[arg(long)]
        adminuser: Option<String>,
    },

    /// Export snapshot entries to NFS as gzip CSV
    Dump {
        /// Journal config file
        #[arg(short = 'c', long)]
        cfg: Option<String>,

        /// Zookeeper journal URL
        #[arg(short = 'p', long)]
        primary: Option<String>,

        /// NFS path
        #[arg(short = 'n', long)]
        nfspath: String,

        /// Interval in seconds
        #[arg(short = 'i', long, default_value_t = 300)]
        interval: u64,

        /// Pattern of files in nfs
        #[arg(short = 'r', long)]
        nfsregex: String,

        /// Dump output file name
        #[arg(short = 'o', long)]
        outfile: String,
    },

    /// Age exported snapshot entries out of the history area
    Cleanup {
        /// Journal config file
        #[arg(short = 'c', long)]
        cfg: Option<String>,

        /// Zookeeper journal URL
        #[arg(short = 'p', long)]
        primary: Option<String>,

        /// NFS path
        #[arg(short = 'n', long)]
        nfspath: String,

        /// Interval in seconds
        #[arg(short = 'i', long, default_value_t = 900)]
        interval: u64,

        /// Age in seconds
        #[arg(short = 'a', long, default_value_t = 3600)]
        age: u64,

        /// Pattern of files in nfs
        #[arg(short = 'r', long)]
        nfsregex: String,

        /// Dump output file name
        #[arg(short = 'o', long)]
        outfile: String,
    },
}

fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();
    init_logging();

    match cli.command {
        Command::Server {
            cfg,
            unixsocket,
            primary,
            secondary,
            historycache,
            adminuser,
        } => {
            let config = JournalConfig::resolve(
                cfg.as_deref(),
                primary,
                secondary,
                adminuser,
                historycache,
            )?;
            config.require_any()?;
            let journal = Arc::new(Journal::initialize(&config)?);

            // Create the runtime explicitly for proper shutdown control
            let runtime = tokio::runtime::Runtime::new().map_err(|e| {
                Box::<dyn Error + Send + Sync>::from(format!("Failed to create runtime: {e}"))
            })?;
            let result = runtime.block_on(server::run_server(journal, &unixsocket));
            runtime.shutdown_timeout(std::time::Duration::from_secs(2));
            result
        }

        Command::ResyncNfs {
            cfg,
            primary,
            secondary,
            adminuser,
        } => {
            let config = JournalConfig::resolve(
                cfg.as_deref(),
                primary,
                secondary,
                adminuser,
                DEFAULT_HISTORY_CACHE,
            )?;
            let zkurl = config.zookeeper_primary()?.to_string();
            let nfspath = config.nfs_secondary_path()?.to_string();
            let journal = ZkJournal::connect(
                &zkurl,
                &config.conn_args,
                config.adminuser.as_deref(),
                config.cachesize,
            )?;
            workers::resync::run(&journal, Path::new(&nfspath));
            Ok(())
        }

        Command::Write {
            cfg,
            primary,
            secondary,
            adminuser,
        } => {
            let config = JournalConfig::resolve(
                cfg.as_deref(),
                primary,
                secondary,
                adminuser,
                DEFAULT_HISTORY_CACHE,
            )?;
            config.require_any()?;
            let journal = Journal::initialize(&config)?;
            let msg = read_stdin_message()?;
            let txid = string_field(&msg, "request_id")?;
            let step = string_field(&msg, "step")?;
            let rc = match journal.write(&txid, &step, &msg) {
                Ok(()) => 0,
                Err(_) => 1,
            };
            std::process::exit(rc)
        }

        Command::Fold {
            cfg,
            primary,
            batchsize,
            interval,
            adminuser,
        } => {
            let config = JournalConfig::resolve(
                cfg.as_deref(),
                primary,
                None,
                adminuser,
                DEFAULT_HISTORY_CACHE,
            )?;
            let zkurl = config.zookeeper_primary()?.to_string();
            let journal = ZkJournal::connect(
                &zkurl,
                &config.conn_args,
                config.adminuser.as_deref(),
                config.cachesize,
            )?;
            journal.ensure_started();
            if journal.client().connected() {
                workers::fold::run(&journal, batchsize, interval);
            }
            Ok(())
        }

        Command::Dump {
            cfg,
            primary,
            nfspath,
            interval,
            nfsregex,
            outfile,
        } => {
            let config = JournalConfig::resolve(
                cfg.as_deref(),
                primary,
                None,
                None,
                DEFAULT_HISTORY_CACHE,
            )?;
            let zkurl = config.zookeeper_primary()?.to_string();
            let nfsregex = Regex::new(&nfsregex)?;
            let journal =
                ZkJournal::connect(&zkurl, &config.conn_args, None, config.cachesize)?;
            journal.ensure_started();
            if journal.client().connected() {
                workers::dump::run(&journal, Path::new(&nfspath), interval, &outfile, &nfsregex);
            }
            Ok(())
        }

        Command::Cleanup {
            cfg,
            primary,
            nfspath,
            interval,
            age,
            nfsregex,
            outfile,
        } => {
            let config = JournalConfig::resolve(
                cfg.as_deref(),
                primary,
                None,
                None,
                DEFAULT_HISTORY_CACHE,
            )?;
            let zkurl = config.zookeeper_primary()?.to_string();
            let nfsregex = Regex::new(&nfsregex)?;
            let journal =
                ZkJournal::connect(&zkurl, &config.conn_args, None, config.cachesize)?;
            journal.ensure_started();
            if journal.client().connected() {
                workers::cleanup::run(
                    &journal,
                    Path::new(&nfspath),
                    interval,
                    age,
                    &outfile,
                    &nfsregex,
                );
            }
            Ok(())
        }
    }
}

/// Read one record from stdin: a 4-byte big-endian length followed by that
/// many bytes of JSON.
fn read_stdin_message() -> Result<Value, Box<dyn Error + Send + Sync>> {
    let mut stdin = std::io::stdin().lock();
    let mut len_buf = [0u8; 4];
    stdin.read_exact(&mut len_buf)?;
    let msglen = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; msglen];
    stdin.read_exact(&mut buf)?;
    Ok(serde_json::from_slice(&buf)?)
}

fn string_field(msg: &Value, key: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
    msg.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Box::<dyn Error + Send + Sync>::from(format!("message missing {key}")))
}
