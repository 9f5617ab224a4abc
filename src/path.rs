//! Path resolution.
//!
//! Paths are UTF-8, `/`-separated and resolved against the root; repeated
//! separators and `.` components are ignored. `..` is not interpreted
//! here: directories carry real dotdot entries, so walking into them works
//! through ordinary lookup.

use crate::dir::Node;
use crate::fs::Volume;
use crate::sector::SectorCache;
use crate::{Error, Result};

pub(crate) fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".")
}

/// Outcome of resolving a path.
pub(crate) enum Walk<'a> {
    Found(Node),
    /// Everything but the last component resolved; create paths consume
    /// this.
    Missing { parent: Node, name: &'a str },
}

impl Volume {
    pub(crate) fn root_node(&self) -> Node {
        Node::root(self.geo.root_cluster)
    }

    /// Cluster a directory node's slots actually live in. A dotdot entry
    /// of a top-level directory stores cluster 0 as a stand-in for the
    /// root.
    pub(crate) fn dir_cluster_of(&self, node: &Node) -> u32 {
        if node.first_cluster == 0 {
            self.geo.root_cluster
        } else {
            node.first_cluster
        }
    }

    /// Walk `path` component by component, matching case-insensitively
    /// against the coalesced entry names.
    pub(crate) fn resolve<'a>(&self, ctx: &mut SectorCache, path: &'a str) -> Result<Walk<'a>> {
        let mut node = self.root_node();
        let mut parts = components(path).peekable();
        while let Some(name) = parts.next() {
            if !node.is_dir() {
                return Err(Error::NotADirectory);
            }
            let dir_cluster = self.dir_cluster_of(&node);
            match self.find_entry(ctx, dir_cluster, name)? {
                Some(found) => node = found,
                None => {
                    return if parts.peek().is_none() {
                        Ok(Walk::Missing { parent: node, name })
                    } else {
                        Err(Error::NotFound)
                    };
                }
            }
        }
        Ok(Walk::Found(node))
    }
}
