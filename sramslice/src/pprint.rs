use crate::datadeps::Unit;
use crate::graph::Graph;
use crate::pipeline::{Operand, Pipeline, TaskKind};
use crate::scheduler::Scheduled;
use crate::utils::join_into_string;

use prettytable::{self, format, row, Cell, Row};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum PrintStyle {
    Full,
    Compact,
}

/// Pretty-print a schedule's units to stdout.
pub fn pprint(graph: &Graph, scheduled: &Scheduled, style: PrintStyle) {
    schedule_table(graph, scheduled, style).printstd()
}

pub fn pprint_write<W: fmt::Write>(
    out: &mut W,
    graph: &Graph,
    scheduled: &Scheduled,
    style: PrintStyle,
) -> fmt::Result {
    write!(out, "{}", schedule_table(graph, scheduled, style))
}

pub fn pprint_tasks(graph: &Graph, pipeline: &Pipeline) {
    task_table(graph, pipeline).printstd()
}

pub fn pprint_tasks_string(graph: &Graph, pipeline: &Pipeline) -> String {
    format!("{}", task_table(graph, pipeline))
}

fn compact_format() -> format::TableFormat {
    format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build()
}

fn schedule_table(graph: &Graph, scheduled: &Scheduled, style: PrintStyle) -> prettytable::Table {
    let mut table = prettytable::Table::new();
    table.set_titles(match style {
        PrintStyle::Full => row!["Unit", "Nodes", "Strategy", "Slices", "SRAM", "Latency"],
        PrintStyle::Compact => row!["Unit", "Nodes", "Strategy"],
    });
    for unit in &scheduled.units {
        let mut r = match unit {
            Unit::Node(n) => row![n, graph.node(*n).name, "unbundled"],
            Unit::Bundle(id) => match scheduled.bundles.get(id) {
                Some(b) => {
                    let names = join_into_string(
                        b.strategy
                            .members
                            .nodes()
                            .into_iter()
                            .map(|n| graph.node(n).name.as_str()),
                        ", ",
                    );
                    row![format!("b{}", id.0), names, b.strategy]
                }
                None => row![format!("b{}", id.0), "?", "?"],
            },
        };
        if style == PrintStyle::Full {
            match unit {
                Unit::Bundle(id) => {
                    if let Some(b) = scheduled.bundles.get(id) {
                        r.add_cell(Cell::new(&b.strategy.slice_count().to_string()));
                        r.add_cell(Cell::new(&b.allocation.total_bytes().to_string()));
                        r.add_cell(Cell::new(&b.cost.latency.to_string()));
                    }
                }
                Unit::Node(_) => {
                    for _ in 0..3 {
                        r.add_cell(Cell::new(""));
                    }
                }
            }
        }
        table.add_row(r);
    }
    table.set_format(compact_format());
    table
}

fn operand_str(graph: &Graph, op: &Operand) -> String {
    match op {
        Operand::Hbm { tensor, region } => format!("{}{}", graph.tensor(*tensor).name, region),
        Operand::Sram { buffer, region, .. } => format!("b{}{}", buffer.0, region),
    }
}

fn task_table(graph: &Graph, pipeline: &Pipeline) -> prettytable::Table {
    let mut table = prettytable::Table::new();
    table.set_titles(row!["Task", "Unit", "Slice", "Op", "Waits"]);
    for task in &pipeline.tasks {
        let unit = task.bundle.map_or(String::new(), |b| format!("b{}", b.0));
        let op = match &task.kind {
            TaskKind::Compute {
                node,
                inputs,
                output,
                accumulate,
                ..
            } => format!(
                "{} {} {} ({})",
                graph.node(*node).name,
                operand_str(graph, output),
                if *accumulate { "+=" } else { "=" },
                join_into_string(inputs.iter().map(|i| operand_str(graph, i)), ", ")
            ),
            TaskKind::Fetch { tensor, region, dst } => {
                format!("fetch b{} <- {}{}", dst.0, graph.tensor(*tensor).name, region)
            }
            TaskKind::Evict {
                src,
                tensor,
                region,
            } => format!("evict {}{} <- b{}", graph.tensor(*tensor).name, region, src.0),
        };
        let waits = join_into_string(task.waits.iter().map(|w| format!("t{}", w.0)), " ");
        table.add_row(Row::new(vec![
            Cell::new(&format!("t{}", task.id.0)),
            Cell::new(&unit),
            Cell::new(&task.slice.to_string()),
            Cell::new(&op),
            Cell::new(&waits),
        ]));
    }
    table.set_format(compact_format());
    table
}
