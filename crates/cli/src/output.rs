//! Output formatting

use anyhow::{Context, Result};
use clap::ValueEnum;
use colored::Colorize;
use tabled::{builder::Builder, settings::Style};
use usage_lib::{Granularity, ResourceKind, ResultRow};

/// Output format for ranked rows
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Aligned table (default)
    #[default]
    Table,
    /// Pretty-printed JSON array
    Json,
}

/// What the rows describe, which decides headers and number formatting
#[derive(Debug, Clone, Copy)]
pub struct View {
    pub granularity: Granularity,
    pub resource: ResourceKind,
    pub no_headers: bool,
}

impl View {
    fn headers(&self) -> [&'static str; 5] {
        let name = match self.granularity {
            Granularity::Aggregate => "POD",
            Granularity::PerSubUnit => "CONTAINER (POD)",
        };
        let (used, limit) = match self.resource {
            ResourceKind::Memory => ("USED(Mi)", "LIMIT(Mi)"),
            ResourceKind::Cpu => ("USED(mCPU)", "LIMIT(mCPU)"),
        };
        ["NAMESPACE", name, used, limit, "%USED"]
    }

    fn amount(&self, value: f64) -> String {
        match self.resource {
            ResourceKind::Memory => format!("{value:.1}"),
            ResourceKind::Cpu => format!("{value:.0}"),
        }
    }
}

/// `c:p` names are shown as `c (p)`
fn display_name(row: &ResultRow) -> String {
    match row.sub_unit_parts() {
        Some((sub_unit, workload)) => format!("{sub_unit} ({workload})"),
        None => row.name.clone(),
    }
}

pub fn render_table(rows: &[ResultRow], view: &View) -> String {
    let mut builder = Builder::default();
    if !view.no_headers {
        builder.push_record(view.headers());
    }
    for row in rows {
        builder.push_record([
            row.namespace.clone(),
            display_name(row),
            view.amount(row.usage),
            view.amount(row.limit),
            format!("{:.1}%", row.percentage),
        ]);
    }

    let mut table = builder.build();
    table.with(Style::blank());
    table.to_string()
}

pub fn print_rows(rows: &[ResultRow], format: OutputFormat, view: &View) -> Result<()> {
    match format {
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("{}", "No matching workloads".yellow());
                return Ok(());
            }
            println!("{}", render_table(rows, view));
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(rows).context("Failed to serialize rows")?;
            println!("{json}");
        }
    }
    Ok(())
}
