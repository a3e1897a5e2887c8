use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// One self-test exchange outcome.
#[derive(Serialize)]
pub struct Check {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

pub fn print_checks(checks: &[Check], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            for check in checks {
                println!(
                    "{}",
                    serde_json::to_string(check).unwrap_or_else(|_| "{}".to_string())
                );
            }
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CHECK", "RESULT", "DETAIL"]);
            for check in checks {
                table.add_row(vec![
                    check.name.to_string(),
                    if check.passed { "ok" } else { "FAIL" }.to_string(),
                    check.detail.clone(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for check in checks {
                println!(
                    "{} {} ({})",
                    if check.passed { "ok  " } else { "FAIL" },
                    check.name,
                    check.detail
                );
            }
        }
    }
}
