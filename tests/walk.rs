//! End-to-end traversal tests over real scratch trees.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use ftwalk::{Action, FileKind, Strategy, Visit, WalkBuilder, WalkFlags};

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("ftwalk_it_{name}"));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// What `find <root>` would print, ignoring order.
fn reference_listing(root: &Path) -> BTreeSet<PathBuf> {
    fn recurse(dir: &Path, out: &mut BTreeSet<PathBuf>) {
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                out.insert(path.clone());
                if entry.file_type().is_ok_and(|t| t.is_dir()) {
                    recurse(&path, out);
                }
            }
        }
    }
    let mut out = BTreeSet::new();
    out.insert(root.to_path_buf());
    recurse(root, &mut out);
    out
}

fn collect_visits(builder: WalkBuilder) -> Vec<(PathBuf, Visit, FileKind, usize)> {
    let mut visits = Vec::new();
    builder
        .run(|entry| {
            visits.push((
                entry.path().to_path_buf(),
                entry.visit(),
                entry.kind(),
                entry.depth(),
            ));
            Action::Continue
        })
        .unwrap();
    visits
}

fn make_tree(root: &Path) {
    fs::create_dir_all(root.join("sub/inner")).unwrap();
    fs::create_dir_all(root.join("other")).unwrap();
    fs::write(root.join("top.txt"), "x").unwrap();
    fs::write(root.join("sub/mid.txt"), "x").unwrap();
    fs::write(root.join("sub/inner/leaf.txt"), "x").unwrap();
    fs::write(root.join("other/peer.txt"), "x").unwrap();
}

#[test]
fn bfs_visits_every_path_exactly_once() {
    let root = scratch("bfs_roundtrip");
    make_tree(&root);

    for threads in [0, 2] {
        let visits = collect_visits(WalkBuilder::new([&root]).threads(threads));
        let paths: Vec<_> = visits.iter().map(|v| v.0.clone()).collect();
        let unique: BTreeSet<_> = paths.iter().cloned().collect();
        assert_eq!(paths.len(), unique.len(), "a path was visited twice");
        assert_eq!(unique, reference_listing(&root));
    }

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn parents_visited_before_children() {
    let root = scratch("preorder");
    make_tree(&root);

    let visits = collect_visits(WalkBuilder::new([&root]).threads(2));
    for (i, (path, _, _, _)) in visits.iter().enumerate() {
        if let Some(parent) = path.parent() {
            if parent.starts_with(&root) && parent != path {
                let pos = visits.iter().position(|v| v.0 == parent).unwrap();
                assert!(pos < i, "{} visited before its parent", path.display());
            }
        }
    }

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn empty_directory_post_order() {
    let root = scratch("empty_post");
    fs::create_dir(root.join("d")).unwrap();

    let visits = collect_visits(
        WalkBuilder::new([&root]).flags(WalkFlags::POST_ORDER).threads(0),
    );
    let d = root.join("d");
    let expect = vec![
        (root.clone(), Visit::Pre),
        (d.clone(), Visit::Pre),
        (d, Visit::Post),
        (root.clone(), Visit::Post),
    ];
    let got: Vec<_> = visits.into_iter().map(|v| (v.0, v.1)).collect();
    assert_eq!(got, expect);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn post_order_children_before_parents() {
    let root = scratch("postorder");
    make_tree(&root);

    let visits = collect_visits(
        WalkBuilder::new([&root]).flags(WalkFlags::POST_ORDER).threads(2),
    );
    for (i, (path, visit, kind, _)) in visits.iter().enumerate() {
        if *visit == Visit::Post {
            assert!(kind.is_dir(), "post-order visit on a non-directory");
            // every descendant directory must have posted earlier
            for (j, (other, ov, _, _)) in visits.iter().enumerate() {
                if *ov == Visit::Post && other.parent() == Some(path) {
                    assert!(j < i, "{} posted after its parent", other.display());
                }
            }
        }
    }
    // each directory posts exactly once
    let posts: Vec<_> = visits.iter().filter(|v| v.1 == Visit::Post).collect();
    let unique: BTreeSet<_> = posts.iter().map(|v| v.0.clone()).collect();
    assert_eq!(posts.len(), unique.len());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn deep_chain_with_four_descriptors() {
    let root = scratch("deep_chain");
    let mut path = root.clone();
    for c in 'a'..='z' {
        path.push(c.to_string());
    }
    fs::create_dir_all(&path).unwrap();

    for threads in [0, 2] {
        let visits = collect_visits(
            WalkBuilder::new([&root]).open_files(4).threads(threads),
        );
        // the root plus 26 nested directories, each exactly once
        assert_eq!(visits.len(), 27);
        let unique: BTreeSet<_> = visits.iter().map(|v| v.0.clone()).collect();
        assert_eq!(unique.len(), 27);
    }

    let _ = fs::remove_dir_all(&root);
}

#[cfg(target_os = "linux")]
#[test]
fn descriptor_budget_is_respected() {
    fn open_fds() -> usize {
        fs::read_dir("/proc/self/fd").unwrap().count()
    }

    let root = scratch("fd_budget");
    for d in 0..5 {
        let dir = root.join(format!("d{d}"));
        fs::create_dir_all(dir.join("x/y")).unwrap();
        fs::write(dir.join("f"), "x").unwrap();
    }

    let baseline = open_fds();
    let mut peak = 0usize;
    WalkBuilder::new([&root])
        .open_files(4)
        .threads(0)
        .run(|_| {
            peak = peak.max(open_fds());
            Action::Continue
        })
        .unwrap();
    assert!(
        peak <= baseline + 4,
        "peak {peak} exceeded baseline {baseline} + 4 descriptors"
    );

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn symlink_cycle_detected_with_recover() {
    let root = scratch("cycle_recover");
    std::os::unix::fs::symlink(&root, root.join("loop")).unwrap();

    let mut loops = Vec::new();
    WalkBuilder::new([&root])
        .flags(WalkFlags::FOLLOW_ALL | WalkFlags::DETECT_CYCLES | WalkFlags::RECOVER)
        .threads(0)
        .run(|entry| {
            if entry.kind() == FileKind::Error {
                loops.push((
                    entry.path().to_path_buf(),
                    entry.error().unwrap().raw(),
                    entry.loopoff(),
                ));
            }
            Action::Continue
        })
        .unwrap();

    assert_eq!(loops.len(), 1);
    let (path, errno, loopoff) = &loops[0];
    assert_eq!(path, &root.join("loop"));
    assert_eq!(*errno, libc::ELOOP);
    // the ancestor forming the loop is the root itself
    assert_eq!(*loopoff, Some(root.as_os_str().len()));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn symlink_cycle_aborts_without_recover() {
    let root = scratch("cycle_abort");
    std::os::unix::fs::symlink(&root, root.join("loop")).unwrap();

    let err = WalkBuilder::new([&root])
        .flags(WalkFlags::FOLLOW_ALL | WalkFlags::DETECT_CYCLES)
        .threads(0)
        .run(|_| Action::Continue)
        .unwrap_err();
    assert_eq!(err.errno().map(|e| e.raw()), Some(libc::ELOOP));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn overlong_paths_still_traverse() {
    let root = scratch("overlong");
    let segment = "x".repeat(200);

    // build a tree whose absolute paths blow PATH_MAX, component by
    // component through openat
    let root_c = std::ffi::CString::new(root.as_os_str().as_encoded_bytes()).unwrap();
    let mut fd = unsafe {
        libc::open(root_c.as_ptr(), libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC)
    };
    assert!(fd >= 0);
    let depth = 30usize;
    let cname = std::ffi::CString::new(segment.clone()).unwrap();
    for _ in 0..depth {
        unsafe {
            assert_eq!(libc::mkdirat(fd, cname.as_ptr(), 0o755), 0);
            let next = libc::openat(
                fd,
                cname.as_ptr(),
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
            );
            assert!(next >= 0);
            libc::close(fd);
            fd = next;
        }
    }
    unsafe { libc::close(fd) };
    assert!(root.as_os_str().len() + depth * (segment.len() + 1) > libc::PATH_MAX as usize);

    for threads in [0, 2] {
        let visits = collect_visits(
            WalkBuilder::new([&root]).open_files(8).threads(threads),
        );
        assert_eq!(visits.len(), depth + 1);
        let deepest = visits.iter().map(|v| v.3).max().unwrap();
        assert_eq!(deepest, depth);
    }

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn sorted_breadth_first_order() {
    let root = scratch("sorted");
    fs::write(root.join("b"), "x").unwrap();
    fs::write(root.join("a"), "x").unwrap();
    fs::write(root.join("c"), "x").unwrap();
    fs::create_dir(root.join("d")).unwrap();
    fs::write(root.join("d/y"), "x").unwrap();
    fs::write(root.join("d/x"), "x").unwrap();

    for threads in [0, 2] {
        let visits = collect_visits(
            WalkBuilder::new([&root])
                .flags(WalkFlags::SORT)
                .strategy(Strategy::Bfs)
                .threads(threads),
        );
        let got: Vec<_> = visits.iter().map(|v| v.0.clone()).collect();
        let want = vec![
            root.clone(),
            root.join("a"),
            root.join("b"),
            root.join("c"),
            root.join("d"),
            root.join("d/x"),
            root.join("d/y"),
        ];
        assert_eq!(got, want, "with {threads} threads");
    }

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn stop_halts_all_further_visits() {
    let root = scratch("stop");
    make_tree(&root);

    let mut seen = 0usize;
    let result = WalkBuilder::new([&root]).threads(2).run(|_| {
        seen += 1;
        if seen == 3 { Action::Stop } else { Action::Continue }
    });
    assert!(result.is_ok());
    assert_eq!(seen, 3, "a visit was delivered after Stop");

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn prune_skips_subtree() {
    let root = scratch("prune");
    make_tree(&root);

    let mut paths = Vec::new();
    WalkBuilder::new([&root])
        .threads(0)
        .run(|entry| {
            paths.push(entry.path().to_path_buf());
            if entry.path().file_name().is_some_and(|n| n == "sub") {
                Action::Prune
            } else {
                Action::Continue
            }
        })
        .unwrap();

    assert!(paths.contains(&root.join("sub")));
    assert!(!paths.iter().any(|p| p.starts_with(root.join("sub/inner"))));
    assert!(!paths.contains(&root.join("sub/mid.txt")));
    assert!(paths.contains(&root.join("other/peer.txt")));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn pruned_directory_post_visits_are_strategy_independent() {
    // the same tree and flags must behave identically whether the engine
    // visits the pruned directory straight off its parent's stream
    // (bfs + workers), through the buffered file queue (dfs, synchronous),
    // or across deepening passes
    for (label, strategy, threads) in [
        ("bfs", Strategy::Bfs, 2),
        ("dfs", Strategy::Dfs, 0),
        ("ids", Strategy::Ids, 0),
    ] {
        let root = scratch(&format!("prune_post_{label}"));
        make_tree(&root);

        let mut visits = Vec::new();
        WalkBuilder::new([&root])
            .strategy(strategy)
            .threads(threads)
            .flags(WalkFlags::POST_ORDER)
            .run(|entry| {
                visits.push((entry.path().to_path_buf(), entry.visit()));
                if entry.visit() == Visit::Pre
                    && entry.path().file_name().is_some_and(|n| n == "sub")
                {
                    Action::Prune
                } else {
                    Action::Continue
                }
            })
            .unwrap();

        let sub = root.join("sub");
        let pres = visits.iter().filter(|v| v.0 == sub && v.1 == Visit::Pre).count();
        let posts = visits.iter().filter(|v| v.0 == sub && v.1 == Visit::Post).count();
        assert_eq!((pres, posts), (1, 1), "{label}: pruned dir must get one Pre and one Post");
        assert!(
            !visits.iter().any(|v| v.0.starts_with(&sub) && v.0 != sub),
            "{label}: descended into a pruned subtree"
        );
        let sub_post = visits
            .iter()
            .position(|v| v.0 == sub && v.1 == Visit::Post)
            .unwrap();
        let root_post = visits
            .iter()
            .position(|v| v.0 == root && v.1 == Visit::Post)
            .unwrap();
        assert!(sub_post < root_post, "{label}: parent posted before pruned child");

        let _ = fs::remove_dir_all(&root);
    }
}

#[test]
fn dfs_is_strictly_depth_first_without_workers() {
    let root = scratch("dfs_strict");
    make_tree(&root);

    let visits = collect_visits(
        WalkBuilder::new([&root]).strategy(Strategy::Dfs).threads(0),
    );
    // once a directory is entered, everything beneath it comes before any
    // sibling of that directory
    let sub_pos = visits.iter().position(|v| v.0 == root.join("sub")).unwrap();
    let inner_leaf = visits
        .iter()
        .position(|v| v.0 == root.join("sub/inner/leaf.txt"))
        .unwrap();
    let later_sibling = visits
        .iter()
        .enumerate()
        .filter(|(_, v)| v.3 == 1 && v.0 != root.join("sub"))
        .map(|(i, _)| i)
        .find(|&i| i > sub_pos);
    if let Some(sibling) = later_sibling {
        assert!(inner_leaf < sibling, "descendants interleaved with siblings");
    }

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn ids_and_eds_match_bfs_visit_set() {
    let root = scratch("deepening");
    make_tree(&root);

    let reference: BTreeSet<_> = collect_visits(WalkBuilder::new([&root]).threads(0))
        .into_iter()
        .map(|v| v.0)
        .collect();

    for strategy in [Strategy::Ids, Strategy::Eds] {
        let visits = collect_visits(
            WalkBuilder::new([&root]).strategy(strategy).threads(0),
        );
        let unique: BTreeSet<_> = visits.iter().map(|v| v.0.clone()).collect();
        assert_eq!(visits.len(), unique.len(), "{strategy:?} duplicated a visit");
        assert_eq!(unique, reference, "{strategy:?} visit set diverged");
    }

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn ids_delivers_shallower_levels_first() {
    let root = scratch("ids_levels");
    make_tree(&root);

    let visits = collect_visits(
        WalkBuilder::new([&root]).strategy(Strategy::Ids).threads(0),
    );
    let depths: Vec<_> = visits.iter().map(|v| v.3).collect();
    let mut sorted = depths.clone();
    sorted.sort_unstable();
    assert_eq!(depths, sorted, "IDS delivered a deeper level before a shallower one");

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn ids_post_order_finale_runs_bottom_up() {
    let root = scratch("ids_post");
    make_tree(&root);

    let mut posts = Vec::new();
    WalkBuilder::new([&root])
        .strategy(Strategy::Ids)
        .flags(WalkFlags::POST_ORDER)
        .threads(0)
        .run(|entry| {
            if entry.visit() == Visit::Post {
                posts.push((entry.path().to_path_buf(), entry.depth()));
            }
            Action::Continue
        })
        .unwrap();

    let depths: Vec<_> = posts.iter().map(|v| v.1).collect();
    let mut sorted = depths.clone();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    assert_eq!(depths, sorted, "post-order finale was not bottom-up");
    assert!(posts.iter().any(|v| v.0 == root.join("sub/inner")));
    assert!(posts.last().is_some_and(|v| v.0 == root));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn multiple_roots_visit_in_argument_order() {
    let one = scratch("roots_one");
    let two = scratch("roots_two");
    fs::write(one.join("f"), "x").unwrap();
    fs::write(two.join("g"), "x").unwrap();

    let visits = collect_visits(WalkBuilder::new([&one, &two]).threads(0));
    let first_root = visits.iter().position(|v| v.0 == one).unwrap();
    let second_root = visits.iter().position(|v| v.0 == two).unwrap();
    assert!(first_root < second_root);
    assert!(visits.iter().any(|v| v.0 == one.join("f")));
    assert!(visits.iter().any(|v| v.0 == two.join("g")));

    let _ = fs::remove_dir_all(&one);
    let _ = fs::remove_dir_all(&two);
}

#[test]
fn missing_root_aborts_without_recover() {
    let err = WalkBuilder::new(["/definitely/not/here/ftwalk"])
        .threads(0)
        .run(|_| Action::Continue)
        .unwrap_err();
    assert_eq!(err.errno().map(|e| e.raw()), Some(libc::ENOENT));
}

#[test]
fn missing_root_reported_with_recover() {
    let mut errors = Vec::new();
    WalkBuilder::new(["/definitely/not/here/ftwalk"])
        .flags(WalkFlags::RECOVER)
        .threads(0)
        .run(|entry| {
            if entry.kind() == FileKind::Error {
                errors.push(entry.error().unwrap().raw());
            }
            Action::Continue
        })
        .unwrap();
    assert_eq!(errors, vec![libc::ENOENT]);
}

#[test]
fn stat_all_caches_a_stat_for_every_visit() {
    let root = scratch("stat_all");
    make_tree(&root);

    WalkBuilder::new([&root])
        .flags(WalkFlags::STAT_ALL)
        .threads(2)
        .run(|entry| {
            let stat = entry.stat().expect("STAT_ALL visit without a stat");
            assert_eq!(stat.kind(), entry.kind());
            Action::Continue
        })
        .unwrap();

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn follow_roots_resolves_a_symlinked_root() {
    let root = scratch("follow_roots");
    fs::create_dir(root.join("real")).unwrap();
    fs::write(root.join("real/f"), "x").unwrap();
    let link = root.join("link");
    std::os::unix::fs::symlink(root.join("real"), &link).unwrap();

    let visits = collect_visits(
        WalkBuilder::new([&link]).flags(WalkFlags::FOLLOW_ROOTS).threads(0),
    );
    assert!(visits.iter().any(|v| v.0 == link.join("f")));

    let _ = fs::remove_dir_all(&root);
}
