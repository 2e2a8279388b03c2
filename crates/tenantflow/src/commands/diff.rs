use std::path::Path;

use colored::Colorize;
use tenantflow_lifecycle::Reconciler;

use crate::utils;

pub fn handle(
    desired: &Path,
    observed: &Path,
    identities: &[String],
    project: bool,
) -> anyhow::Result<()> {
    let desired = utils::read_desired(desired)?;
    let observed = utils::read_json(observed)?;

    let mut reconciler = Reconciler::new();
    for raw in identities {
        let (path, key) = utils::parse_identity(raw)?;
        reconciler = reconciler.with_identity(path, key);
    }

    let patch = reconciler.diff(&desired, &observed);
    if patch.is_empty() {
        eprintln!("{}", "✓ Already converged, nothing to change".green());
    } else {
        eprintln!("{} {} change(s):", "→".cyan(), patch.len());
        for entry in patch.entries() {
            eprintln!("  {} = {}", entry.path.to_string().cyan(), entry.value);
        }
    }

    if project {
        utils::print_json(&reconciler.project(&observed, &patch))
    } else {
        utils::print_json(&patch)
    }
}
