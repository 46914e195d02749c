pub(crate) mod arena;
pub(crate) mod list;

pub(crate) use arena::{Arena, Idx, NamePool, NameRef};
pub(crate) use list::{Dlist, DlistNode, Slist, SlistNode};
