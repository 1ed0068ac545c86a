//! Cascade inspection commands: `cascade plan` and `cascade validate`.

use anyhow::{Result, bail};
use cascade::dag::{DagBuilder, DagScheduler, PhaseGraph};
use cascade::definition::Cascade;
use cascade::template::referenced_outputs;
use console::style;
use std::path::Path;

use super::super::Cli;
use super::resolve_config;

fn load(file: &Path) -> Result<(Cascade, PhaseGraph)> {
    let cascade = Cascade::load(file)?;
    let graph = DagBuilder::new(&cascade).build()?;
    Ok((cascade, graph))
}

pub fn cmd_plan(cli: &Cli, file: &Path) -> Result<()> {
    let (cascade, graph) = load(file)?;
    let (_, config) = resolve_config(cli)?;
    let parallel = graph.is_parallel_eligible();

    println!();
    println!("{} {}", style("Cascade").bold().cyan(), style(&cascade.cascade_id).bold());
    if !cascade.description.is_empty() {
        println!("{}", style(&cascade.description).dim());
    }
    println!();
    if parallel {
        println!(
            "Mode: parallel (up to {} phases at once)",
            config.engine.max_parallel_phases
        );
    } else {
        println!("Mode: sequential");
    }
    println!();

    println!("{}", style("Dependencies").bold());
    for (phase, deps) in graph.dependency_map() {
        if deps.is_empty() {
            println!("  {}", phase);
        } else {
            let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
            println!("  {} {} {}", phase, style("<-").dim(), deps.join(", "));
        }
    }
    println!();

    if parallel {
        println!("{}", style("Waves").bold());
        let scheduler = DagScheduler::new(graph);
        for (i, wave) in scheduler.compute_waves().iter().enumerate() {
            println!("  {}: {}", i + 1, wave.join(", "));
        }
    } else {
        println!("{}", style("Order").bold());
        for (i, phase) in cascade.phases.iter().enumerate() {
            if phase.handoffs.is_empty() {
                println!("  {}. {}", i + 1, phase.name);
            } else {
                println!(
                    "  {}. {} {} {}",
                    i + 1,
                    phase.name,
                    style("->").dim(),
                    phase.handoffs.join(" | ")
                );
            }
        }
    }
    println!();
    Ok(())
}

pub fn cmd_validate(_cli: &Cli, file: &Path) -> Result<()> {
    let (cascade, _) = load(file)?;
    let (errors, warnings) = check(&cascade);

    println!();
    for warning in &warnings {
        println!("  {} {}", style("warning:").yellow(), warning);
    }
    for error in &errors {
        println!("  {} {}", style("error:").red().bold(), error);
    }
    if !errors.is_empty() {
        bail!("{} has {} error(s)", file.display(), errors.len());
    }
    println!(
        "{} {} ({} phases)",
        style("Cascade is valid:").green(),
        cascade.cascade_id,
        cascade.phases.len()
    );
    Ok(())
}

/// Static checks beyond graph construction. Returns `(errors, warnings)`.
fn check(cascade: &Cascade) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    if cascade.phases.is_empty() {
        errors.push("cascade has no phases".to_string());
    }

    for phase in &cascade.phases {
        for target in &phase.handoffs {
            if cascade.phase(target).is_none() {
                errors.push(format!("phase '{}' hands off to unknown phase '{}'", phase.name, target));
            }
        }

        let mut sources: Vec<String> = referenced_outputs(&phase.instructions).into_iter().collect();
        if let Some(context) = &phase.context {
            sources.extend(
                context
                    .from
                    .iter()
                    .filter(|s| !matches!(s.as_str(), "all" | "previous" | "first"))
                    .cloned(),
            );
        }
        let position = cascade.position(&phase.name).unwrap_or(0);
        for source in sources {
            match cascade.position(&source) {
                None => warnings.push(format!(
                    "phase '{}' refers to unknown phase '{}'",
                    phase.name, source
                )),
                Some(p) if p >= position => warnings.push(format!(
                    "phase '{}' refers to '{}', which is not defined before it; the reference is ignored",
                    phase.name, source
                )),
                Some(_) => {}
            }
        }

        let mut refs: Vec<&str> = Vec::new();
        refs.extend(phase.wards.pre.iter().map(|w| w.validator.as_str()));
        refs.extend(phase.wards.post.iter().map(|w| w.validator.as_str()));
        refs.extend(phase.rules.loop_until.as_deref());
        if let Some(candidates) = &phase.candidates {
            refs.extend(candidates.validator.as_deref());
            if let Some(reforge) = &candidates.reforge {
                refs.extend(reforge.threshold.as_deref());
            }
        }
        for name in refs {
            if !cascade.validators.contains_key(name) {
                warnings.push(format!(
                    "phase '{}' uses validator '{}', which must be registered at run time",
                    phase.name, name
                ));
            }
        }

        if phase.rules.loop_until.is_none() && phase.rules.max_attempts > 1 && phase.wards.post.is_empty() {
            warnings.push(format!(
                "phase '{}' allows {} attempts but has nothing that can reject an attempt",
                phase.name, phase.rules.max_attempts
            ));
        }
    }
    (errors, warnings)
}
