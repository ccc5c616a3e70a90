//! Output formatting for CLI commands.
//!
//! This module renders plans, drift reports, apply results, state and
//! outputs either as colored text tables or as JSON.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::error::{DeployError, Result};
use crate::planner::{ActionType, DeploymentPlan, DiffResult, DiffType};
use crate::reconciler::{DriftReport, ReconciliationResult};
use crate::state::{DeploymentState, ResourceStatus, StackOutputs};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Resource row for state display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Hash")]
    hash: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a deployment plan, with per-resource details when `diff` is
    /// given.
    #[must_use]
    pub fn format_plan(&self, plan: &DeploymentPlan, diff: Option<&DiffResult>) -> String {
        match self.format {
            OutputFormat::Json => to_json(&PlanJson::from(plan)),
            OutputFormat::Text => {
                let mut output = Self::format_plan_text(plan);
                if let Some(diff) = diff {
                    output.push_str(&Self::format_diff_text(diff));
                }
                output
            }
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &DeploymentPlan) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - infrastructure is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();

        let _ = writeln!(output, "\nDeployment Plan");
        let _ = write!(output, "   Config hash: {}\n\n", short(&plan.config_hash));

        let rows: Vec<PlanActionRow> = plan
            .actions
            .iter()
            .enumerate()
            .map(|(i, a)| PlanActionRow {
                index: i + 1,
                action: Self::format_action_type(a.action_type),
                kind: a.kind.to_string(),
                resource: a.resource_name.clone(),
                reason: Self::truncate(&a.reason, 48),
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to destroy\n",
            plan.create_count().to_string().green(),
            plan.update_count().to_string().yellow(),
            plan.delete_count().to_string().red()
        );

        if !plan.passes_guardrails {
            let _ = write!(output, "\n{} Guardrail violations:\n", "⚠".yellow());
            for violation in &plan.guardrail_violations {
                let _ = writeln!(output, "   - {violation}");
            }
        }

        output
    }

    /// Formats the field-level details of a diff.
    fn format_diff_text(diff: &DiffResult) -> String {
        let mut output = String::from("\nDetailed changes:\n");
        for resource in diff.actionable_diffs() {
            let _ = writeln!(output, "  {resource}");
            for detail in &resource.details {
                let _ = writeln!(
                    output,
                    "      {}: {} -> {}",
                    detail.field,
                    detail.old_value.as_deref().unwrap_or("-"),
                    detail.new_value.as_deref().unwrap_or("-")
                );
            }
        }
        output
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                let mut output = if report.is_converged() {
                    format!("{} No drift detected - state is converged.\n", "✓".green())
                } else {
                    let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                    for resource in &report.drifted_resources {
                        let _ = writeln!(
                            output,
                            "   - {} {} ({})",
                            resource.kind,
                            resource.name,
                            Self::format_diff_type(resource.change)
                        );
                    }
                    let _ = write!(
                        output,
                        "\n{}/{} resources differ from the definition.\n",
                        report.drifted_resources.len(),
                        report.total_resources
                    );
                    output
                };

                if !report.foreign.is_empty() {
                    let _ = write!(
                        output,
                        "\n{} Managed by another stack: {}\n",
                        "✗".red(),
                        report.foreign.join(", ")
                    );
                }
                output
            }
        }
    }

    /// Formats an apply or destroy result.
    #[must_use]
    pub fn format_reconciliation(&self, result: &ReconciliationResult) -> String {
        match self.format {
            OutputFormat::Json => to_json(result),
            OutputFormat::Text => {
                let status = if result.success {
                    format!("{} Reconciliation successful", "✓".green())
                } else {
                    format!("{} Reconciliation failed", "✗".red())
                };

                let mut output = format!("{status}\n\n");
                let _ = writeln!(output, "   Created: {}", result.created);
                let _ = writeln!(output, "   Updated: {}", result.updated);
                let _ = writeln!(output, "   Deleted: {}", result.deleted);
                let _ = writeln!(output, "   Unchanged: {}", result.unchanged);
                if result.attempts > 1 {
                    let _ = writeln!(output, "   Attempts: {}", result.attempts);
                }

                if let Some(ip) = result.outputs.public_ip_address {
                    let _ = write!(output, "\n   Public IP: {}\n", ip.to_string().cyan());
                }

                if !result.errors.is_empty() {
                    let _ = write!(output, "\n{} Errors:\n", "⚠".yellow());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }

                output
            }
        }
    }

    /// Formats deployment state.
    #[must_use]
    pub fn format_state(&self, state: &DeploymentState) -> String {
        match self.format {
            OutputFormat::Json => to_json(state),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(
                    output,
                    "\nState: {} in {}\n\n",
                    state.stack_name(),
                    state.resource_group
                );

                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Config hash: {}", short(&state.config_hash));
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                if let Some(anchor) = state.anchor {
                    let _ = writeln!(output, "   First deployed: {anchor}");
                }
                if let Some(window) = state.shutdown_anchor {
                    let _ = writeln!(output, "   Shutdown window opened: {window}");
                }

                if !state.resources.is_empty() {
                    let rows: Vec<ResourceRow> = state
                        .resources
                        .values()
                        .map(|r| ResourceRow {
                            name: r.name.clone(),
                            kind: r.kind.to_string(),
                            status: Self::format_status(r.status),
                            hash: short(&r.spec_hash).to_string(),
                        })
                        .collect();
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({} resources)",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.len()
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats the stack's outputs, or only `name` when given.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is not a known output.
    pub fn format_outputs(&self, outputs: &StackOutputs, name: Option<&str>) -> Result<String> {
        let Some(name) = name else {
            return Ok(match self.format {
                OutputFormat::Json => to_json(outputs),
                OutputFormat::Text => match outputs.public_ip_address {
                    Some(ip) => format!("public_ip_address = {ip}\n"),
                    None => String::from("public_ip_address = (not allocated)\n"),
                },
            });
        };

        if name != "public_ip_address" {
            return Err(DeployError::internal(format!("Unknown output: {name}")));
        }

        let value = outputs.public_ip_address.map(|ip| ip.to_string());
        Ok(match self.format {
            OutputFormat::Json => to_json(&value),
            OutputFormat::Text => value.map(|v| format!("{v}\n")).unwrap_or_default(),
        })
    }

    /// Formats an action type with color.
    fn format_action_type(action_type: ActionType) -> String {
        match action_type {
            ActionType::Create => "+create".green().to_string(),
            ActionType::Update => "~update".yellow().to_string(),
            ActionType::Delete => "-delete".red().to_string(),
        }
    }

    fn format_diff_type(diff_type: DiffType) -> String {
        match diff_type {
            DiffType::Create => "missing".green().to_string(),
            DiffType::Update => "changed".yellow().to_string(),
            DiffType::Delete => "orphaned".red().to_string(),
            DiffType::Drift => "drifted".yellow().to_string(),
            DiffType::NoChange => "unchanged".dimmed().to_string(),
        }
    }

    fn format_status(status: ResourceStatus) -> String {
        match status {
            ResourceStatus::Provisioned => "provisioned".green().to_string(),
            ResourceStatus::Failed => "failed".red().to_string(),
            ResourceStatus::Unknown => "unknown".dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

fn short(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

// JSON serialization helpers

#[derive(Serialize)]
struct PlanJson {
    config_hash: String,
    action_count: usize,
    creates: usize,
    updates: usize,
    deletes: usize,
    passes_guardrails: bool,
    guardrail_violations: Vec<String>,
    actions: Vec<ActionJson>,
}

#[derive(Serialize)]
struct ActionJson {
    action_type: ActionType,
    kind: String,
    resource: String,
    reason: String,
}

impl From<&DeploymentPlan> for PlanJson {
    fn from(plan: &DeploymentPlan) -> Self {
        Self {
            config_hash: plan.config_hash.clone(),
            action_count: plan.action_count(),
            creates: plan.create_count(),
            updates: plan.update_count(),
            deletes: plan.delete_count(),
            passes_guardrails: plan.passes_guardrails,
            guardrail_violations: plan.guardrail_violations.clone(),
            actions: plan
                .actions
                .iter()
                .map(|a| ActionJson {
                    action_type: a.action_type,
                    kind: a.kind.to_string(),
                    resource: a.resource_name.clone(),
                    reason: a.reason.clone(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs() -> StackOutputs {
        StackOutputs {
            public_ip_address: Some("20.112.0.1".parse().expect("ip")),
        }
    }

    #[test]
    fn test_format_outputs() {
        let text = OutputFormatter::new(OutputFormat::Text);
        assert_eq!(
            text.format_outputs(&outputs(), None).expect("all"),
            "public_ip_address = 20.112.0.1\n"
        );
        assert_eq!(
            text.format_outputs(&outputs(), Some("public_ip_address"))
                .expect("one"),
            "20.112.0.1\n"
        );
        assert!(text.format_outputs(&outputs(), Some("nope")).is_err());

        let json = OutputFormatter::new(OutputFormat::Json);
        let value: serde_json::Value =
            serde_json::from_str(&json.format_outputs(&outputs(), None).expect("json"))
                .expect("valid json");
        assert_eq!(value["public_ip_address"], "20.112.0.1");
    }

    #[test]
    fn test_unallocated_output() {
        let text = OutputFormatter::new(OutputFormat::Text);
        let empty = StackOutputs::default();
        assert!(
            text.format_outputs(&empty, None)
                .expect("all")
                .contains("not allocated")
        );
        assert_eq!(
            text.format_outputs(&empty, Some("public_ip_address"))
                .expect("one"),
            ""
        );
    }

    #[test]
    fn test_empty_plan_json() {
        let json = OutputFormatter::new(OutputFormat::Json);
        let plan = DeploymentPlan::empty("abcdef0123456789");
        let value: serde_json::Value =
            serde_json::from_str(&json.format_plan(&plan, None)).expect("valid json");

        assert_eq!(value["action_count"], 0);
        assert_eq!(value["passes_guardrails"], true);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("a longer reason", 10), "a longe...");
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(short("0123456789abcdef"), "01234567");
        assert_eq!(short("abc"), "abc");
    }
}
