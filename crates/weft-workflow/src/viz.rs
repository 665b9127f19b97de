use std::fmt::Write;

use crate::builder::Workflow;
use crate::edge::EdgeKind;

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Render the workflow graph in Graphviz DOT format.
///
/// Conditional edges are dashed, switch cases are labelled with their
/// condition, and fan-in joins go through a point node.
pub fn to_dot(workflow: &Workflow) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph {} {{", quote(workflow.name()));
    let _ = writeln!(out, "  rankdir=TD;");
    let _ = writeln!(out, "  node [shape=box, style=rounded];");

    for id in workflow.executor_ids() {
        if id == workflow.start_id() {
            let _ = writeln!(out, "  {} [style=\"rounded,filled\", fillcolor=lightgreen];", quote(id.as_str()));
        } else {
            let _ = writeln!(out, "  {};", quote(id.as_str()));
        }
    }

    for edge in workflow.edges() {
        match &edge.kind {
            EdgeKind::Direct {
                source,
                sink,
                condition,
            } => match condition {
                Some(c) => {
                    let _ = writeln!(
                        out,
                        "  {} -> {} [style=dashed, label={}];",
                        quote(source.as_str()),
                        quote(sink.as_str()),
                        quote(c.label())
                    );
                }
                None => {
                    let _ = writeln!(out, "  {} -> {};", quote(source.as_str()), quote(sink.as_str()));
                }
            },
            EdgeKind::FanOut { source, sinks } => {
                for sink in sinks {
                    let _ = writeln!(out, "  {} -> {};", quote(source.as_str()), quote(sink.as_str()));
                }
            }
            EdgeKind::Switch {
                source,
                cases,
                default,
            } => {
                for case in cases {
                    let _ = writeln!(
                        out,
                        "  {} -> {} [style=dashed, label={}];",
                        quote(source.as_str()),
                        quote(case.sink.as_str()),
                        quote(case.condition.label())
                    );
                }
                if let Some(sink) = default {
                    let _ = writeln!(
                        out,
                        "  {} -> {} [style=dashed, label=\"default\"];",
                        quote(source.as_str()),
                        quote(sink.as_str())
                    );
                }
            }
            EdgeKind::FanIn { sources, sink } => {
                let join = quote(&format!("{}::join", edge.id));
                let _ = writeln!(out, "  {} [shape=point];", join);
                for source in sources {
                    let _ = writeln!(out, "  {} -> {};", quote(source.as_str()), join);
                }
                let _ = writeln!(out, "  {} -> {};", join, quote(sink.as_str()));
            }
        }
    }

    out.push_str("}\n");
    out
}
