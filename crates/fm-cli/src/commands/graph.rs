//! Dependency graph rendering: plain text, Mermaid, or Graphviz DOT.

use std::path::Path;

use clap::ValueEnum;

use fm_core::resolver;
use fm_core::types::{Plan, TaskStatus};

use super::open_context;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GraphFormat {
    Text,
    Mermaid,
    Dot,
}

pub fn run(project_root: &Path, format: GraphFormat) -> anyhow::Result<()> {
    let ctx = open_context(project_root)?;
    let plan = ctx.store.load()?;

    let rendered = match format {
        GraphFormat::Text => text_format(&plan),
        GraphFormat::Mermaid => mermaid_format(&plan),
        GraphFormat::Dot => dot_format(&plan),
    };
    print!("{rendered}");
    Ok(())
}

fn status_symbol(status: TaskStatus) -> char {
    match status {
        TaskStatus::Pending => 'o',
        TaskStatus::Assigned | TaskStatus::InProgress => '>',
        TaskStatus::Completed => 'x',
        TaskStatus::Blocked => '!',
    }
}

fn text_format(plan: &Plan) -> String {
    let mut out = String::new();
    out.push_str(&format!("Dependency graph for plan '{}'\n", plan.name));
    out.push_str("legend: [x] completed  [>] running  [o] pending  [!] blocked\n\n");

    for task in &plan.tasks {
        out.push_str(&format!(
            "[{}] {}: {} ({})\n",
            status_symbol(task.status),
            task.id,
            task.title,
            task.priority,
        ));
        for dep in &task.depends_on {
            let dep_symbol = plan
                .task(dep)
                .map(|d| status_symbol(d.status))
                .unwrap_or('?');
            out.push_str(&format!("    depends on: {} [{}]\n", dep, dep_symbol));
        }
        let blocks: Vec<&str> = plan
            .tasks
            .iter()
            .filter(|t| t.depends_on.iter().any(|d| d == &task.id))
            .map(|t| t.id.as_str())
            .collect();
        if !blocks.is_empty() {
            out.push_str(&format!("    blocks: {}\n", blocks.join(", ")));
        }
        if task.depends_on.is_empty() && blocks.is_empty() {
            out.push_str("    independent (can run in parallel)\n");
        }
    }

    if let Ok(order) = resolver::execution_order(plan) {
        out.push_str(&format!("\nexecution order: {}\n", order.join(" -> ")));
    }
    out
}

fn mermaid_format(plan: &Plan) -> String {
    let mut out = String::new();
    out.push_str("graph LR\n");

    for task in &plan.tasks {
        let class = match task.status {
            TaskStatus::Completed => "completed",
            TaskStatus::Assigned | TaskStatus::InProgress => "running",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Pending => "pending",
        };
        let title = task.title.replace('"', "'");
        out.push_str(&format!("  {}[\"{}\"]:::{}\n", task.id, title, class));
    }
    out.push('\n');

    for task in &plan.tasks {
        for dep in &task.depends_on {
            out.push_str(&format!("  {} --> {}\n", dep, task.id));
        }
    }
    out.push('\n');
    out.push_str("  classDef completed fill:#90EE90,stroke:#006400\n");
    out.push_str("  classDef running fill:#87CEEB,stroke:#00008B\n");
    out.push_str("  classDef blocked fill:#FFB6C1,stroke:#8B0000\n");
    out.push_str("  classDef pending fill:#FFFFE0,stroke:#DAA520\n");
    out
}

fn dot_format(plan: &Plan) -> String {
    let mut out = String::new();
    out.push_str("digraph task_dependencies {\n");
    out.push_str("  rankdir=LR;\n");
    out.push_str("  node [shape=box, style=rounded];\n\n");

    for task in &plan.tasks {
        let color = match task.status {
            TaskStatus::Completed => "green",
            TaskStatus::Assigned | TaskStatus::InProgress => "blue",
            TaskStatus::Blocked => "red",
            TaskStatus::Pending => "yellow",
        };
        let title = task.title.replace('"', "'");
        out.push_str(&format!(
            "  \"{}\" [label=\"{}\\n{}\", color={}];\n",
            task.id, task.id, title, color
        ));
    }
    out.push('\n');

    for task in &plan.tasks {
        for dep in &task.depends_on {
            out.push_str(&format!("  \"{}\" -> \"{}\";\n", dep, task.id));
        }
    }
    out.push_str("}\n");
    out
}
