//! DRM render node discovery.
//!
//! A one-shot query performed at construction; the device is never
//! re-examined afterwards.

use std::path::{Path, PathBuf};

const DRI_DIR: &str = "/dev/dri";

/// Find the first DRM render node on the system.
pub fn find_render_node() -> Option<PathBuf> {
    let entries = std::fs::read_dir(DRI_DIR).ok()?;
    let names = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned());
    pick_render_node(names).map(|name| Path::new(DRI_DIR).join(name))
}

fn pick_render_node(names: impl Iterator<Item = String>) -> Option<String> {
    let mut nodes: Vec<String> = names
        .filter(|name| name.starts_with("renderD"))
        .collect();
    nodes.sort();
    nodes.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_lowest_render_node() {
        let names = ["card0", "renderD129", "by-path", "renderD128"]
            .map(String::from)
            .into_iter();
        assert_eq!(pick_render_node(names).as_deref(), Some("renderD128"));
    }

    #[test]
    fn none_without_render_nodes() {
        let names = ["card0", "card1"].map(String::from).into_iter();
        assert_eq!(pick_render_node(names), None);
    }
}
