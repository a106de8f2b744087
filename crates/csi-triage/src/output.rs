//! Result rendering for the CLI.
//!
//! The engine owes no wire contract; everything here is presentation.

use std::fmt::Write as _;
use std::str::FromStr;

use colored::Colorize;

use crate::error::{ScanError, ScanResult};
use crate::types::{DetectionMethod, DetectionResult, Finding, Severity};

/// How `detect` results are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Detailed,
}

impl OutputFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Table => "table",
            OutputFormat::Json => "json",
            OutputFormat::Detailed => "detailed",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            "detailed" => Ok(OutputFormat::Detailed),
            other => Err(ScanError::UnknownOutputFormat {
                name: other.to_string(),
            }),
        }
    }
}

/// Render a detection result in the requested format.
pub fn render(result: &DetectionResult, format: OutputFormat) -> ScanResult<String> {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(result).map_err(|err| {
            ScanError::Api {
                operation: "serialize result".to_string(),
                reason: err.to_string(),
            }
        }),
        OutputFormat::Table => Ok(render_table(result)),
        OutputFormat::Detailed => Ok(render_detailed(result)),
    }
}

fn placeholder(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        value
    }
}

fn severity_label(severity: Severity) -> String {
    let label = severity.as_str();
    match severity {
        Severity::Critical => label.red().bold().to_string(),
        Severity::High => label.red().to_string(),
        Severity::Medium => label.yellow().to_string(),
        Severity::Low => label.normal().to_string(),
    }
}

fn render_table(result: &DetectionResult) -> String {
    let mut out = String::new();

    if result.issues.is_empty() {
        out.push_str("No CSI mount issues detected\n");
        return out;
    }

    let _ = writeln!(out, "Total Issues: {}\n", result.summary.total_issues);

    if !result.summary.affected_nodes.is_empty() {
        out.push_str("AFFECTED NODES:\n");
        for node in &result.summary.affected_nodes {
            let _ = writeln!(out, "  {node}");
        }
        out.push('\n');
    }

    let by_method = |method: DetectionMethod| -> Vec<&Finding> {
        result
            .issues
            .iter()
            .filter(|f| f.detected_by == method)
            .collect()
    };

    let attachment_issues = by_method(DetectionMethod::VolumeAttachments);
    if !attachment_issues.is_empty() {
        out.push_str("VOLUME ATTACHMENT ISSUES:\n");
        let _ = writeln!(out, "{:<20} {:<10} {}", "NODE", "SEVERITY", "VOLUME");
        let _ = writeln!(out, "{:<20} {:<10} {}", "----", "--------", "------");
        for issue in attachment_issues {
            let _ = writeln!(
                out,
                "{:<20} {:<10} {}",
                placeholder(&issue.node),
                issue.severity,
                placeholder(&issue.volume)
            );
        }
        out.push('\n');
    }

    let cross_node_issues = by_method(DetectionMethod::CrossNodePvc);
    if !cross_node_issues.is_empty() {
        out.push_str("CROSS-NODE PVC ISSUES:\n");
        let _ = writeln!(out, "{:<50} {}", "PVC", "AFFECTED NODES");
        let _ = writeln!(out, "{:<50} {}", "---", "--------------");
        for issue in cross_node_issues {
            let nodes = issue
                .metadata
                .get("nodes")
                .map_or_else(|| placeholder(&issue.node).to_string(), Clone::clone);
            let _ = writeln!(out, "{:<50} {}", placeholder(&issue.pvc), nodes);
        }
        out.push('\n');
    }

    let event_issues = by_method(DetectionMethod::Events);
    if !event_issues.is_empty() {
        out.push_str("EVENT-BASED ISSUES:\n");
        let _ = writeln!(
            out,
            "{:<15} {:<40} {:<15} {:<35} {}",
            "NAMESPACE", "OBJECT", "NODE", "VOLUME", "MESSAGE"
        );
        let _ = writeln!(
            out,
            "{:<15} {:<40} {:<15} {:<35} {}",
            "---------", "------", "----", "------", "-------"
        );
        for issue in event_issues {
            let object = issue
                .metadata
                .get("involved_object")
                .map_or("-", String::as_str);
            let message = issue
                .metadata
                .get("full_event_message")
                .map_or(issue.description.as_str(), String::as_str);
            let _ = writeln!(
                out,
                "{:<15} {:<40} {:<15} {:<35} {}",
                placeholder(&issue.namespace),
                object,
                placeholder(&issue.node),
                placeholder(&issue.volume),
                message
            );
        }
        out.push('\n');
    }

    let other_issues = by_method(DetectionMethod::Metrics);
    if !other_issues.is_empty() {
        out.push_str("OTHER ISSUES:\n");
        let _ = writeln!(out, "{:<20} {:<30} {}", "NODE", "PVC", "VOLUME");
        let _ = writeln!(out, "{:<20} {:<30} {}", "----", "---", "------");
        for issue in other_issues {
            let _ = writeln!(
                out,
                "{:<20} {:<30} {}",
                placeholder(&issue.node),
                placeholder(&issue.pvc),
                placeholder(&issue.volume)
            );
        }
    }

    out
}

fn render_detailed(result: &DetectionResult) -> String {
    let mut out = String::new();

    out.push_str("# CSI Volume Triage - Detailed Report\n\n");
    let _ = writeln!(out, "**Generated:** {}\n", result.generated_at.to_rfc3339());

    out.push_str("## Summary\n\n");
    let _ = writeln!(out, "- **Total Issues:** {}", result.summary.total_issues);
    let methods: Vec<&str> = result
        .summary
        .methods_used
        .iter()
        .map(|m| m.as_str())
        .collect();
    let _ = writeln!(out, "- **Methods Used:** {}", methods.join(", "));

    if !result.summary.issues_by_severity.is_empty() {
        out.push_str("- **Issues by Severity:**\n");
        for (severity, count) in &result.summary.issues_by_severity {
            let _ = writeln!(out, "  - {}: {count}", severity_label(*severity));
        }
    }

    if !result.summary.affected_nodes.is_empty() {
        let _ = writeln!(
            out,
            "- **Affected Nodes:** {}",
            result.summary.affected_nodes.join(", ")
        );
    }

    if !result.summary.affected_drivers.is_empty() {
        let _ = writeln!(
            out,
            "- **Affected Drivers:** {}",
            result.summary.affected_drivers.join(", ")
        );
    }

    if !result.issues.is_empty() {
        out.push_str("\n## Detailed Issues\n\n");
        for (i, issue) in result.issues.iter().enumerate() {
            let _ = writeln!(out, "### Issue {}: {}\n", i + 1, issue.issue_type);
            let _ = writeln!(out, "- **Severity:** {}", severity_label(issue.severity));
            let _ = writeln!(out, "- **Description:** {}", issue.description);
            let _ = writeln!(out, "- **Detected By:** {}", issue.detected_by);
            let _ = writeln!(out, "- **Detected At:** {}", issue.detected_at.to_rfc3339());

            if !issue.node.is_empty() {
                let _ = writeln!(out, "- **Node:** {}", issue.node);
            }
            if !issue.volume.is_empty() {
                let _ = writeln!(out, "- **Volume:** {}", issue.volume);
            }
            if !issue.pvc.is_empty() {
                let _ = writeln!(out, "- **PVC:** {}", issue.pvc);
            }
            if !issue.driver.is_empty() {
                let _ = writeln!(out, "- **Driver:** {}", issue.driver);
            }

            if !issue.metadata.is_empty() {
                out.push_str("- **Metadata:**\n");
                for (key, value) in &issue.metadata {
                    let _ = writeln!(out, "  - {key}: {value}");
                }
            }
            out.push('\n');
        }
    }

    if !result.recommendations.is_empty() {
        out.push_str("## Recommendations\n\n");
        for recommendation in &result.recommendations {
            let _ = writeln!(out, "{recommendation}");
        }
    }

    out
}
