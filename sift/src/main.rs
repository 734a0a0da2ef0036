use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use clap::Parser;
use itertools::Itertools;

use tally::dirs::parse_record_name;

/// Summarize a packrat dump directory: replay `log.txt`, reconstruct the
/// live set and cross-check it against the per-allocation files.
#[derive(Parser, Debug)]
struct Arg {
    /// Dump directory (the PACKRAT_DIR of the monitored run)
    #[arg(short, long, value_parser = clap::value_parser!(PathBuf))]
    dir: PathBuf,

    /// How many of the most common sizes to print
    #[arg(short, long, default_value_t = 10)]
    top: usize,
}

#[derive(Default)]
struct Tale {
    mallocs: usize,
    callocs: usize,
    memaligns: usize,
    reallocs: usize,
    frees: usize,
    invalid_frees: usize,
    failures: usize,
    bytes_requested: usize,
    sizes: Vec<usize>,
    live: HashSet<usize>,
}

impl Tale {
    /// One `log.txt` line, already stripped of its `[tid] [time]` prefix.
    fn digest(&mut self, message: &str) {
        if message.contains("failed") {
            self.failures += 1;
            return;
        }
        let addr = field_hex(message, "addr=");
        match message.split(['(', ' ']).next().unwrap_or("") {
            op @ ("malloc" | "calloc" | "memalign") => {
                match op {
                    "malloc" => self.mallocs += 1,
                    "calloc" => self.callocs += 1,
                    _ => self.memaligns += 1,
                }
                if let Some(size) = field_dec(message, "size=") {
                    self.bytes_requested += size;
                    self.sizes.push(size);
                }
                if let Some(addr) = addr {
                    self.live.insert(addr);
                }
            }
            "realloc" => {
                self.reallocs += 1;
                if let Some(old) = field_hex(message, "old=") {
                    self.live.remove(&old);
                }
                if let Some(new) = field_hex(message, "new=") {
                    self.live.insert(new);
                }
                if let Some(size) = field_dec(message, "newsize=") {
                    self.bytes_requested += size;
                    self.sizes.push(size);
                }
            }
            "free" => {
                if message.contains("invalid") {
                    self.invalid_frees += 1;
                } else {
                    self.frees += 1;
                    if let Some(addr) = addr {
                        self.live.remove(&addr);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Hex field of the form `key=0x1a2b`, as the tracker logs addresses.
fn field_hex(message: &str, key: &str) -> Option<usize> {
    let tail = &message[message.find(key)? + key.len()..];
    let tail = tail.strip_prefix("0x")?;
    let digits: String = tail.chars().take_while(|c| c.is_ascii_hexdigit()).collect();
    usize::from_str_radix(&digits, 16).ok()
}

/// Decimal field of the form `key=123`.
fn field_dec(message: &str, key: &str) -> Option<usize> {
    let tail = &message[message.find(key)? + key.len()..];
    let digits: String = tail.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Everything after the second `] `.
fn strip_prefix(line: &str) -> &str {
    let mut rest = line;
    for _ in 0..2 {
        match rest.split_once("] ") {
            Some((_, tail)) => rest = tail,
            None => return line,
        }
    }
    rest
}

fn main() {
    let cli = Arg::parse();
    assert!(cli.dir.is_dir(), "dump directory does not exist");

    let log = fs::read_to_string(cli.dir.join("log.txt")).expect("cannot read log.txt");
    let mut tale = Tale::default();
    for line in log.lines() {
        tale.digest(strip_prefix(line));
    }

    let mut record_files = 0usize;
    let mut record_bytes = 0usize;
    for entry in fs::read_dir(&cli.dir).expect("cannot list dump directory") {
        let entry = entry.expect("cannot stat dump entry");
        if let Some(name) = entry.file_name().to_str() {
            if let Some((_, size, _)) = parse_record_name(name) {
                record_files += 1;
                record_bytes += size;
            }
        }
    }

    println!("dump directory: {}", cli.dir.display());
    println!(
        "operations: {} malloc, {} calloc, {} memalign, {} realloc, {} free",
        tale.mallocs, tale.callocs, tale.memaligns, tale.reallocs, tale.frees
    );
    println!("invalid frees: {}", tale.invalid_frees);
    println!("failed requests: {}", tale.failures);
    println!("bytes requested: {}", tale.bytes_requested);
    println!("live at end of log: {}", tale.live.len());
    println!("record files on disk: {} ({} bytes)", record_files, record_bytes);

    if tale.sizes.is_empty() {
        return;
    }
    println!("most common sizes:");
    for (size, hits) in tale
        .sizes
        .iter()
        .counts()
        .into_iter()
        .sorted_by_key(|&(_, hits)| std::cmp::Reverse(hits))
        .take(cli.top)
    {
        println!("  {:>12} bytes  x{}", size, hits);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_lines_replay_into_a_live_set() {
        let mut tale = Tale::default();
        tale.digest("malloc(id=0 frame=0x1 ret=0x2 addr=0x7f00 size=16 alignment=1)");
        tale.digest("malloc(id=1 frame=0x1 ret=0x2 addr=0x7f40 size=32 alignment=1)");
        tale.digest("free(frame=0x1 ret=0x2 addr=0x7f00)");
        tale.digest("free(frame=0x1 ret=0x2 addr=0x7f00) invalid");
        tale.digest(
            "realloc(frame=0x1 ret=0x2 old=0x7f40 oldsize=32 new=0x7f80 newsize=64)",
        );

        assert_eq!(tale.mallocs, 2);
        assert_eq!(tale.frees, 1);
        assert_eq!(tale.invalid_frees, 1);
        assert_eq!(tale.reallocs, 1);
        assert_eq!(tale.live, HashSet::from([0x7f80]));
        assert_eq!(tale.bytes_requested, 16 + 32 + 64);
    }

    #[test]
    fn prefixes_strip_cleanly() {
        assert_eq!(
            strip_prefix("[140230] [1754600000] free(addr=0x10)"),
            "free(addr=0x10)"
        );
    }
}
