use std::fs;
use std::path::PathBuf;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use ftwalk::{Action, Strategy, WalkBuilder, WalkFlags};

/// A moderately bushy scratch tree: 4 levels, 4 dirs and 8 files per level.
fn build_tree() -> PathBuf {
    let root = std::env::temp_dir().join("ftwalk_bench_tree");
    if root.exists() {
        return root;
    }
    fn fill(dir: &PathBuf, depth: usize) {
        for f in 0..8 {
            fs::write(dir.join(format!("file{f}")), "x").unwrap();
        }
        if depth == 0 {
            return;
        }
        for d in 0..4 {
            let sub = dir.join(format!("dir{d}"));
            fs::create_dir_all(&sub).unwrap();
            fill(&sub, depth - 1);
        }
    }
    fs::create_dir_all(&root).unwrap();
    fill(&root, 3);
    root
}

fn count_walk(root: &PathBuf, strategy: Strategy, flags: WalkFlags, threads: usize) -> usize {
    let mut count = 0usize;
    WalkBuilder::new([root])
        .strategy(strategy)
        .flags(flags)
        .threads(threads)
        .run(|entry| {
            black_box(entry.path_bytes());
            count += 1;
            Action::Continue
        })
        .unwrap();
    count
}

fn bench_walk(c: &mut Criterion) {
    let root = build_tree();

    let mut group = c.benchmark_group("walk");
    for threads in [0usize, 2, 4] {
        group.bench_function(format!("bfs_{threads}_threads"), |b| {
            b.iter(|| count_walk(&root, Strategy::Bfs, WalkFlags::empty(), threads));
        });
    }
    group.bench_function("dfs_sync", |b| {
        b.iter(|| count_walk(&root, Strategy::Dfs, WalkFlags::empty(), 0));
    });
    group.bench_function("bfs_sorted", |b| {
        b.iter(|| count_walk(&root, Strategy::Bfs, WalkFlags::SORT, 2));
    });
    group.bench_function("bfs_stat_all", |b| {
        b.iter(|| count_walk(&root, Strategy::Bfs, WalkFlags::STAT_ALL, 2));
    });
    group.finish();
}

criterion_group!(benches, bench_walk);
criterion_main!(benches);
