/*!
A parallel filesystem traversal engine for find-like tools.

Every file beneath one or more starting paths is visited through a callback,
under four hard budgets: a cap on open directory descriptors, a pool of I/O
worker threads, bounded in-flight directory state, and signal-driven
cancellation. Breadth-first, depth-first, and the two deepening orders are
supported, along with lexicographic sorting, post-order visits, cycle
detection, and mount-boundary policies.

# Examples

Count the regular files under a path:

```no_run
use ftwalk::{Action, FileKind, WalkBuilder};

fn main() -> Result<(), ftwalk::WalkError> {
    let mut files = 0usize;
    WalkBuilder::new(["/some/path"]).run(|entry| {
        if entry.kind() == FileKind::RegularFile {
            files += 1;
        }
        Action::Continue
    })?;
    println!("{files} files");
    Ok(())
}
```

Sorted, post-order, with a tight descriptor budget:

```no_run
use ftwalk::{Action, Strategy, Visit, WalkBuilder, WalkFlags};

fn main() -> Result<(), ftwalk::WalkError> {
    WalkBuilder::new(["."])
        .strategy(Strategy::Bfs)
        .flags(WalkFlags::SORT | WalkFlags::POST_ORDER)
        .open_files(16)
        .run(|entry| {
            if entry.visit() == Visit::Post {
                println!("leaving  {}", entry.path().display());
            } else {
                println!("entering {}", entry.path().display());
            }
            Action::Continue
        })
}
```
*/

mod error;
mod fs;
mod ioq;
pub mod signal;
mod util;
mod walk;

pub use error::{Errno, Result, WalkError};
pub use fs::{FileKind, FileStat, StatFlag};
pub use walk::{
    Action, Entry, MountTable, Strategy, Visit, WalkBuilder, WalkFlags, walk,
};

#[cfg(all(
    feature = "mimalloc",
    any(target_os = "linux", target_os = "macos", target_os = "android")
))]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;
