use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use vigil::{
    encode_record, parse_record, parse_vhash, EnableFlags, EnforceFlags, ExecHelper,
    FixedPlatform, Hook, Invoker, Options, StaticCreds, StdFs, Validator,
};

/// Inspect and exercise vigil integrity data. Results are emitted as JSON;
/// errors are encoded in the JSON, not the exit code.
#[derive(Parser, Debug)]
#[command(name = "vigil-cli", about = "Inspect and exercise vigil integrity data")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the SHA-1 digest of each file
    Digest {
        files: Vec<PathBuf>,
    },

    /// Produce a hashlist ingestion record for a real file
    MakeRecord {
        file: PathBuf,
        /// Source identifier to embed
        #[arg(long, default_value_t = 0)]
        src_id: i64,
        /// Write the raw record here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Parse a file of concatenated ingestion records and dump them
    CheckRecords {
        file: PathBuf,
    },

    /// Load records, then verify one file end-to-end
    Verify {
        /// File of concatenated ingestion records
        #[arg(long)]
        records: PathBuf,
        file: PathBuf,
    },

    /// Validate a vhash command-line value
    Vhash {
        value: String,
    },
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    match args.command {
        Command::Digest { files } => digest(&files),
        Command::MakeRecord { file, src_id, out } => make_record(&file, src_id, out.as_deref()),
        Command::CheckRecords { file } => check_records(&file),
        Command::Verify { records, file } => verify(&records, &file),
        Command::Vhash { value } => vhash(&value),
    }
}

fn digest(files: &[PathBuf]) {
    let fs = StdFs::new();
    for path in files {
        let result = fs.resolve(path).and_then(|id| {
            vigil::digest_file(&fs, id)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        });
        match result {
            Ok(digest) => println!("{}  {}", hex::encode(digest), path.display()),
            Err(err) => eprintln!("{}: {err}", path.display()),
        }
    }
}

fn make_record(path: &Path, src_id: i64, out: Option<&Path>) {
    use std::os::unix::fs::MetadataExt;

    let fs = StdFs::new();
    let record = (|| -> std::io::Result<Vec<u8>> {
        let id = fs.resolve(path)?;
        let md = std::fs::metadata(path)?;
        let digest = vigil::digest_file(&fs, id)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        let entry = vigil::RefEntry {
            ino: id.ino,
            nodetype: vigil::NodeType::Executable,
            uid: md.uid(),
            gid: md.gid(),
            mode: md.mode(),
            src_id,
            digest,
            wcreds: None,
        };
        Ok(encode_record(id.dev, &entry))
    })();
    match record {
        Ok(record) => match out {
            Some(out) => {
                if let Err(err) = std::fs::write(out, &record) {
                    eprintln!("{}: {err}", out.display());
                    std::process::exit(1);
                }
            }
            None => {
                use std::io::Write;
                std::io::stdout()
                    .write_all(&record)
                    .expect("stdout write failed");
            }
        },
        Err(err) => {
            eprintln!("{}: {err}", path.display());
            std::process::exit(1);
        }
    }
}

/// Split concatenated wire records on their NUL-newline terminators,
/// keeping the terminator with each record.
fn split_records(data: &[u8]) -> Vec<&[u8]> {
    let mut records = Vec::new();
    let mut start = 0;
    for i in 1..data.len() {
        if data[i - 1] == 0 && data[i] == b'\n' {
            records.push(&data[start..=i]);
            start = i + 1;
        }
    }
    if start < data.len() {
        records.push(&data[start..]);
    }
    records
}

fn check_records(path: &Path) {
    let data = std::fs::read(path).unwrap_or_else(|err| {
        eprintln!("{}: {err}", path.display());
        std::process::exit(1);
    });
    let creds = StaticCreds::new();
    let results: Vec<_> = split_records(&data)
        .iter()
        .map(|record| match parse_record(record, &creds) {
            Ok((device, entry)) => json!({ "device": device, "entry": entry }),
            Err(err) => json!({ "error": err.to_string() }),
        })
        .collect();
    println!(
        "{}",
        serde_json::to_string(&results).expect("record reports are always serializable")
    );
}

fn verify(records: &Path, file: &Path) {
    let fs = Arc::new(StdFs::new());
    let creds = Arc::new(StaticCreds::new());
    let engine = Validator::new(
        Options {
            enable: EnableFlags::HASH_CHECK | EnableFlags::ATTRIB,
            enforce: EnforceFlags::HASH_CHECK | EnforceFlags::ATTRIB,
            ..Options::default()
        },
        Arc::clone(&fs) as Arc<dyn vigil::Filesystem>,
        Arc::clone(&creds) as Arc<dyn vigil::CredentialService>,
        Arc::new(FixedPlatform(true)),
        Arc::new(ExecHelper),
    );
    // Records come from the command line, not the helper.
    engine.config().set_hashlist_ready();

    let data = std::fs::read(records).unwrap_or_else(|err| {
        eprintln!("{}: {err}", records.display());
        std::process::exit(1);
    });
    let mut loaded = 0usize;
    for record in split_records(&data) {
        match engine.volumes().ingest(record, creds.as_ref()) {
            Ok(()) => loaded += 1,
            Err(err) => eprintln!("record rejected: {err}"),
        }
    }

    let verdict = match fs.resolve(file) {
        Ok(id) => {
            let open = engine.open_file(id);
            match engine.check_executable(&open, Hook::Exec, &Invoker::named("vigil-cli")) {
                Ok(()) => json!({
                    "file": file.display().to_string(),
                    "records_loaded": loaded,
                    "allowed": true,
                }),
                Err(denial) => json!({
                    "file": file.display().to_string(),
                    "records_loaded": loaded,
                    "allowed": false,
                    "denial": denial,
                }),
            }
        }
        Err(err) => json!({
            "file": file.display().to_string(),
            "records_loaded": loaded,
            "error": err.to_string(),
        }),
    };
    println!(
        "{}",
        serde_json::to_string(&verdict).expect("verdict is always serializable")
    );
}

fn vhash(value: &str) {
    let report = match parse_vhash(value) {
        Some(digest) => json!({ "valid": true, "digest": hex::encode(digest) }),
        None => json!({ "valid": false }),
    };
    println!(
        "{}",
        serde_json::to_string(&report).expect("vhash report is always serializable")
    );
}
