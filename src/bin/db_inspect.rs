//! Small CLI for inspecting a database directory by hand
//!
//! ```text
//! qa-db-inspect list <test-key> [--db <path>]
//! qa-db-inspect show <test-key> <entry-prefix> [--db <path>]
//! qa-db-inspect delete <test-key> <entry-prefix> [--db <path>]
//! qa-db-inspect decode <blob>
//! ```
//!
//! `list`/`show`/`delete` talk to a directory store the way `Database` does;
//! `decode` unpacks a reproducible blob (the string a `FailingInput` error
//! carries) without touching any database at all.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use qa_core::database::{decode_reproducible_blob, Database};

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn entry_digest(bytes: &[u8]) -> String {
    use sha1::{Digest, Sha1};
    hex::encode(Sha1::digest(bytes))
}

fn usage() -> ! {
    eprintln!("usage:");
    eprintln!("  qa-db-inspect list <test-key> [--db <path>]");
    eprintln!("  qa-db-inspect show <test-key> <entry-prefix> [--db <path>]");
    eprintln!("  qa-db-inspect delete <test-key> <entry-prefix> [--db <path>]");
    eprintln!("  qa-db-inspect decode <blob>");
    std::process::exit(2);
}

fn open_database(args: &[String]) -> Database {
    Database::new(parse_flag(args, "--db").map(PathBuf::from))
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else { usage() };

    match command.as_str() {
        "list" => {
            let test_key = args.get(1).unwrap_or_else(|| usage());
            let db = open_database(&args);
            let entries = db.fetch(test_key)?;
            if entries.is_empty() {
                println!("no entries under test key {test_key:?}");
                return Ok(());
            }
            for bytes in &entries {
                println!("{}  {} bytes  {:02x?}", entry_digest(bytes), bytes.len(), bytes);
            }
        }

        "show" => {
            let test_key = args.get(1).unwrap_or_else(|| usage());
            let prefix = args.get(2).unwrap_or_else(|| usage());
            let db = open_database(&args);
            let entry = db
                .fetch(test_key)?
                .into_iter()
                .find(|bytes| entry_digest(bytes).starts_with(prefix.as_str()))
                .ok_or_else(|| anyhow::anyhow!("no entry under {test_key:?} matching prefix {prefix:?}"))?;
            println!("{} bytes: {:02x?}", entry.len(), entry);
        }

        "delete" => {
            let test_key = args.get(1).unwrap_or_else(|| usage());
            let prefix = args.get(2).unwrap_or_else(|| usage());
            let db = open_database(&args);
            let entry = db
                .fetch(test_key)?
                .into_iter()
                .find(|bytes| entry_digest(bytes).starts_with(prefix.as_str()))
                .ok_or_else(|| anyhow::anyhow!("no entry under {test_key:?} matching prefix {prefix:?}"))?;
            db.delete(test_key, &entry)?;
            println!("deleted {} ({} bytes)", entry_digest(&entry), entry.len());
        }

        "decode" => {
            let blob = args.get(1).unwrap_or_else(|| usage());
            let bytes = decode_reproducible_blob(blob)?;
            println!("{} bytes: {:02x?}", bytes.len(), bytes);
        }

        other => {
            eprintln!("unknown command {other:?}");
            usage();
        }
    }

    Ok(())
}
