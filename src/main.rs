#![allow(clippy::print_stderr)]
#![allow(clippy::exit)]

use std::ffi::OsString;
use std::io::{BufWriter, Write as _};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, ValueEnum, ValueHint};
use ftwalk::{Action, Strategy, Visit, WalkBuilder, WalkFlags};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Order {
    Bfs,
    Dfs,
    Ids,
    Eds,
}

impl From<Order> for Strategy {
    fn from(order: Order) -> Self {
        match order {
            Order::Bfs => Self::Bfs,
            Order::Dfs => Self::Dfs,
            Order::Ids => Self::Ids,
            Order::Eds => Self::Eds,
        }
    }
}

/// Walk directory trees and print every path found.
#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[allow(clippy::struct_excessive_bools)]
struct Args {
    #[arg(
        value_name = "PATH",
        help = "Starting paths (defaults to .)",
        value_hint = ValueHint::DirPath
    )]
    paths: Vec<OsString>,

    #[arg(short = 'S', long, value_enum, default_value_t = Order::Bfs, help = "Traversal order")]
    strategy: Order,

    #[arg(short, long, help = "Print siblings in collation order")]
    sort: bool,

    #[arg(short = 'd', long, help = "Print each directory after its contents")]
    post_order: bool,

    #[arg(short = 'L', long, help = "Follow symbolic links (implies cycle detection)")]
    follow: bool,

    #[arg(short = 'x', long, help = "Do not descend into other filesystems")]
    one_filesystem: bool,

    #[arg(long, value_name = "N", help = "Skip paths shallower than N")]
    min_depth: Option<usize>,

    #[arg(long, value_name = "N", help = "Skip paths deeper than N")]
    max_depth: Option<usize>,

    #[arg(short = 'j', long, value_name = "N", help = "I/O worker threads (0 = synchronous)")]
    threads: Option<usize>,

    #[arg(long, value_name = "N", default_value_t = 256, help = "Open descriptor budget")]
    open_files: usize,

    #[arg(short = '0', long, help = "Separate paths with NUL instead of newline")]
    print0: bool,

    #[arg(short = 'q', long, help = "Print only the number of paths found")]
    count: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let paths = if args.paths.is_empty() {
        vec![OsString::from(".")]
    } else {
        args.paths.clone()
    };

    let mut flags = WalkFlags::RECOVER;
    if args.sort {
        flags |= WalkFlags::SORT;
    }
    if args.post_order {
        flags |= WalkFlags::POST_ORDER;
    }
    if args.follow {
        flags |= WalkFlags::FOLLOW_ALL | WalkFlags::FOLLOW_ROOTS | WalkFlags::DETECT_CYCLES;
    }
    if args.one_filesystem {
        flags |= WalkFlags::SKIP_MOUNTS;
    }

    let mut builder = WalkBuilder::new(&paths)
        .flags(flags)
        .strategy(args.strategy.into())
        .open_files(args.open_files);
    if let Some(threads) = args.threads {
        builder = builder.threads(threads);
    }

    let broken_pipe = Arc::new(AtomicBool::new(false));
    let pipe_flag = Arc::clone(&broken_pipe);
    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let terminator = if args.print0 { b"\0" } else { b"\n" };
    let mut found = 0u64;
    let mut errors = 0u64;

    let result = builder.run(|entry| {
        if entry.error().is_some() {
            errors += 1;
            eprintln!(
                "ftwalk: {}: {}",
                entry.path().display(),
                entry.error().map_or_else(String::new, |e| e.to_string())
            );
            return Action::Continue;
        }
        // with -d, directories print on the way out and everything else on
        // the way in
        let wanted = match entry.visit() {
            Visit::Post => true,
            Visit::Pre => !(args.post_order && entry.kind().is_dir()),
        };
        if !wanted {
            return Action::Continue;
        }
        if let Some(max) = args.max_depth {
            if entry.depth() > max {
                return Action::Prune;
            }
        }

        if args.min_depth.is_none_or(|min| entry.depth() >= min) {
            found += 1;
            if !args.count {
                let done = out
                    .write_all(entry.path_bytes())
                    .and_then(|()| out.write_all(terminator));
                if done.is_err() {
                    pipe_flag.store(true, Ordering::Relaxed);
                    return Action::Stop;
                }
            }
        }

        // stop descending once the next level would be too deep
        if args.max_depth == Some(entry.depth()) {
            return Action::Prune;
        }
        Action::Continue
    });

    if args.count {
        let _ = writeln!(out, "{found}");
    }
    let _ = out.flush();

    match result {
        Ok(()) if errors == 0 => {}
        Ok(()) => std::process::exit(1),
        Err(error) => {
            if !broken_pipe.load(Ordering::Relaxed) {
                eprintln!("ftwalk: {error}");
            }
            std::process::exit(1);
        }
    }
}
