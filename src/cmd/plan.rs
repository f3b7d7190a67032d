//! Plan inspection: `conductor plan <file>`.

use anyhow::{Context, Result};
use conductor::dag::GraphBuilder;
use conductor::task::PlanFile;
use std::path::Path;

pub fn cmd_plan(path: &Path, json: bool) -> Result<()> {
    let plan = PlanFile::load(path)?;
    let graph = GraphBuilder::new(plan.tasks)
        .build()
        .with_context(|| format!("Invalid plan: {}", path.display()))?;

    if json {
        let phases = serde_json::json!({
            "name": plan.name,
            "tasks": graph.len(),
            "phases": graph.phase_ids(),
        });
        println!("{}", serde_json::to_string_pretty(&phases)?);
        return Ok(());
    }

    println!();
    match &plan.name {
        Some(name) => println!("Plan: {}", name),
        None => println!("Plan: {}", path.display()),
    }
    println!(
        "{} task(s) in {} phase(s)",
        graph.len(),
        graph.phase_count()
    );
    println!();

    for (phase, layer) in graph.phases().iter().enumerate() {
        println!("Phase {}:", phase);
        for &index in layer {
            let task = &graph.tasks()[index];
            let mut line = format!("  {} [{}]", task.id, task.capability);
            if task.priority != 0 {
                line.push_str(&format!(" priority={}", task.priority));
            }
            if !task.depends_on.is_empty() {
                line.push_str(&format!(" after {}", task.depends_on.join(", ")));
            }
            println!("{}", line);
        }
    }
    println!();

    Ok(())
}
