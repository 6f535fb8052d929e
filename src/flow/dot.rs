//! Graphviz rendering of element graphs.

use crate::planner::graph::{Element, ElementEdge};
use std::fmt::Write;

pub(crate) fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

fn node_label(element: &Element) -> String {
    if element.outgoing.is_unknown() || element.is_tap() {
        escape(&element.to_string())
    } else {
        format!("{}\\n{}", escape(&element.to_string()), escape(&element.outgoing.to_string()))
    }
}

fn node_shape(element: &Element) -> &'static str {
    if element.is_tap() {
        "box"
    } else if element.kind.is_grouping() {
        "diamond"
    } else {
        "ellipse"
    }
}

pub(crate) fn write_node(out: &mut String, indent: &str, element: &Element) {
    let _ = writeln!(
        out,
        "{}e{} [label=\"{}\", shape={}];",
        indent,
        element.id.0,
        node_label(element),
        node_shape(element)
    );
}

pub(crate) fn write_edge(out: &mut String, indent: &str, edge: &ElementEdge) {
    let _ = write!(out, "{}e{} -> e{} [label=\"{}", indent, edge.from.0, edge.to.0, escape(&edge.fields.to_string()));
    if edge.ordinal > 0 {
        let _ = write!(out, " #{}", edge.ordinal);
    }
    out.push_str("\"];\n");
}

/// A standalone digraph over the given elements and edges.
pub(crate) fn render<'a>(
    name: &str,
    elements: impl IntoIterator<Item = &'a Element>,
    edges: impl IntoIterator<Item = &'a ElementEdge>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph \"{}\" {{", escape(name));
    for element in elements {
        write_node(&mut out, "  ", element);
    }
    for edge in edges {
        write_edge(&mut out, "  ", edge);
    }
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape() {
        assert_eq!(escape(r#"a "b" \c"#), r#"a \"b\" \\c"#);
    }
}
