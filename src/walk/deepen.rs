//! Iterative and exponential deepening.
//!
//! Both strategies wrap the user callback in a depth-filtering shim and run
//! the base traversal repeatedly: IDS advances a one-level window, EDS
//! doubles the depth cap. The shim remembers every directory the user
//! pruned, so later passes refuse to descend into them, and a visit outside
//! the current band is translated into `Prune` (past the cap) or a bare
//! `Continue` (above the band, still descending toward it).

use dashmap::DashSet;

use crate::error::Result;
use crate::walk::state;
use crate::walk::{Action, Entry, Strategy, Visit, WalkBuilder, WalkFlags};

pub(crate) fn run(
    builder: &WalkBuilder,
    callback: &mut dyn FnMut(&Entry<'_>) -> Action,
) -> Result<()> {
    let exponential = matches!(builder.walk_strategy(), Strategy::Eds);
    let flags = builder.walk_flags();
    // post-order is delivered by the descending finale, not the passes
    let pass_flags = flags.difference(WalkFlags::POST_ORDER);
    let pruned: DashSet<Box<[u8]>> = DashSet::new();

    let mut min = 0usize;
    let mut max = 0usize;
    let mut bottom = 0usize;
    let mut stopped = false;

    loop {
        let mut forwarded = false;
        let mut deepest = 0usize;
        {
            let mut shim = |entry: &Entry<'_>| -> Action {
                if entry.kind().is_dir() && pruned.contains(entry.path_bytes()) {
                    return Action::Prune;
                }
                let depth = entry.depth();
                if depth < min {
                    return Action::Continue;
                }
                if depth > max {
                    return Action::Prune;
                }

                forwarded = true;
                deepest = deepest.max(depth);
                match callback(entry) {
                    Action::Continue if depth == max && entry.kind().is_dir() => {
                        // cap the descent; the next pass picks this up
                        Action::Prune
                    }
                    Action::Continue => Action::Continue,
                    Action::Prune => {
                        if entry.kind().is_dir() {
                            pruned.insert(entry.path_bytes().into());
                        }
                        Action::Prune
                    }
                    Action::Stop => {
                        stopped = true;
                        Action::Stop
                    }
                }
            };
            state::walk_pass(builder, Strategy::Dfs, pass_flags, &mut shim)?;
        }

        bottom = bottom.max(deepest);
        if stopped {
            return Ok(());
        }
        if !forwarded {
            // the last band was empty; there is no deeper level
            break;
        }
        min = max + 1;
        max = if exponential {
            (max * 2).max(1)
        } else {
            max + 1
        };
    }

    if flags.contains(WalkFlags::POST_ORDER) {
        // re-deliver directories bottom-up: one pass per level, deepest
        // first, so every child's post-visit precedes its parent's. The
        // pruned set only gates descent: a pruned directory still gets its
        // own post-visit, the same as in a single-pass walk.
        for target in (0..=bottom).rev() {
            let mut shim = |entry: &Entry<'_>| -> Action {
                let depth = entry.depth();
                if depth < target {
                    if entry.kind().is_dir() && pruned.contains(entry.path_bytes()) {
                        return Action::Prune;
                    }
                    return Action::Continue;
                }
                if depth == target && entry.kind().is_dir() {
                    entry.visit.set(Visit::Post);
                    if matches!(callback(entry), Action::Stop) {
                        stopped = true;
                        return Action::Stop;
                    }
                }
                Action::Prune
            };
            state::walk_pass(builder, Strategy::Dfs, pass_flags, &mut shim)?;
            if stopped {
                break;
            }
        }
    }
    Ok(())
}
