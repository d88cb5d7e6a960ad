//! Graphviz DOT rendering of the index, colored by vertex status, following
//! the walk-and-format pattern of `turborepo-lib/src/engine/dot.rs`.

use std::io;

use compendium_types::Status;

use crate::Index;

const PRELUDE: &str = "digraph {\n\trankdir = \"LR\"\n";

/// Render the index as a DOT graph. Outdated vertices are colored red,
/// updated vertices green — mirroring how `bdcrrm_cli` flags stale steps.
pub fn render<W: io::Write>(index: &Index, mut writer: W) -> Result<(), io::Error> {
    writer.write_all(PRELUDE.as_bytes())?;

    let mut nodes: Vec<_> = index.all();
    nodes.sort_by(|a, b| a.name.cmp(&b.name));
    for compendium in &nodes {
        let color = match compendium.status {
            Status::Updated => "green",
            Status::Outdated => "red",
        };
        writer.write_all(
            format!(
                "\t\"{}\" [style=filled, color={color}]\n",
                compendium.name
            )
            .as_bytes(),
        )?;
    }

    let mut edges = Vec::new();
    for u in &nodes {
        for v in &nodes {
            if u.name == v.name {
                continue;
            }
            if !u.output_digests().is_disjoint(&v.input_digests()) {
                edges.push(format!("\t\"{}\" -> \"{}\"", u.name, v.name));
            }
        }
    }
    edges.sort();
    writer.write_all(edges.join("\n").as_bytes())?;

    writer.write_all(b"\n}\n")?;
    Ok(())
}
