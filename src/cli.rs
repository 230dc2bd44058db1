//! Command-line interface definitions.

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::queue::entry::{DlqPriority, DlqStatus, ErrorCategory};
use crate::queue::repository::{ListFilter, ListQuery, SortBy, SortOrder};
use crate::redrive::RedriveOptions;

/// Dead letter queue capture, classification and redrive service.
#[derive(Parser, Debug)]
#[command(name = "dlq-redrive", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/config/dlq.yaml", env = "DLQ_CONFIG_PATH", global = true)]
    pub config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Returns the log level based on verbosity flags.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the service: failure listener, scheduler and metrics/health server.
    Run,

    /// List DLQ entries.
    List(ListArgs),

    /// Show one entry by DLQ id.
    Show {
        id: String,
    },

    /// Show the entry recorded for an original task id.
    #[command(name = "show-task")]
    ShowTask {
        task_id: String,
    },

    /// Redrive one entry.
    Redrive {
        id: String,

        #[command(flatten)]
        options: RedriveArgs,
    },

    /// Redrive several entries in order.
    #[command(name = "redrive-bulk")]
    RedriveBulk {
        #[arg(required = true)]
        ids: Vec<String>,

        #[command(flatten)]
        options: RedriveArgs,
    },

    /// Statistics over a trailing window.
    Stats {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },

    /// Health score, alerts and circuit breaker states.
    Health,

    /// Advisory redrive recommendation for an entry.
    Recommend {
        id: String,
    },

    /// Delete one entry.
    Delete {
        id: String,
    },

    /// Delete entries older than a number of days.
    Cleanup {
        #[arg(long)]
        older_than_days: u32,

        /// Only delete entries in this status.
        #[arg(long)]
        status: Option<DlqStatus>,
    },

    /// Validate the configuration file without starting.
    #[command(name = "config-validate")]
    ConfigValidate,

    /// Display the parsed configuration.
    #[command(name = "config-show")]
    ConfigShow,
}

/// Filters and paging for `list`.
#[derive(Args, Debug, Default)]
pub struct ListArgs {
    #[arg(long)]
    pub status: Option<DlqStatus>,

    #[arg(long)]
    pub category: Option<ErrorCategory>,

    #[arg(long)]
    pub priority: Option<DlqPriority>,

    /// Substring of the task name.
    #[arg(long)]
    pub task_name: Option<String>,

    /// Correlated business entity id.
    #[arg(long)]
    pub entity: Option<String>,

    #[arg(long)]
    pub queue: Option<String>,

    #[arg(long)]
    pub worker: Option<String>,

    #[arg(long)]
    pub idempotency_key: Option<String>,

    /// RFC 3339 timestamp.
    #[arg(long)]
    pub created_after: Option<DateTime<Utc>>,

    /// RFC 3339 timestamp.
    #[arg(long)]
    pub created_before: Option<DateTime<Utc>>,

    #[arg(long, default_value_t = 1)]
    pub page: usize,

    #[arg(long, default_value_t = 50)]
    pub page_size: usize,

    /// created_at, updated_at, priority, retry_count, next_retry_at or task_name.
    #[arg(long, default_value = "created_at")]
    pub sort_by: SortBy,

    /// asc or desc.
    #[arg(long, default_value = "desc")]
    pub order: SortOrder,
}

impl ListArgs {
    pub fn to_query(&self) -> ListQuery {
        ListQuery {
            filter: ListFilter {
                status: self.status,
                category: self.category,
                priority: self.priority,
                task_name: self.task_name.clone(),
                correlated_entity_id: self.entity.clone(),
                queue_name: self.queue.clone(),
                worker_name: self.worker.clone(),
                idempotency_key: self.idempotency_key.clone(),
                created_after: self.created_after,
                created_before: self.created_before,
            },
            page: self.page,
            page_size: self.page_size,
            sort_by: self.sort_by,
            sort_order: self.order,
        }
    }
}

/// Options shared by `redrive` and `redrive-bulk`.
#[derive(Args, Debug, Default)]
pub struct RedriveArgs {
    /// Bypass the retry budget and reopen permanently failed entries.
    #[arg(long)]
    pub force: bool,

    /// Keyword argument override, `key=value`. Values are parsed as JSON when possible.
    #[arg(long = "arg", value_parser = parse_key_value)]
    pub args: Vec<(String, Value)>,

    /// Priority for the redriven task.
    #[arg(long)]
    pub priority: Option<DlqPriority>,

    /// Why the entry is being redriven; kept on the entry for audit.
    #[arg(long)]
    pub reason: Option<String>,
}

impl RedriveArgs {
    pub fn to_options(&self) -> RedriveOptions {
        let arg_overrides = if self.args.is_empty() {
            None
        } else {
            Some(self.args.iter().cloned().collect::<Map<String, Value>>())
        };
        RedriveOptions {
            force: self.force,
            arg_overrides,
            priority_override: self.priority,
            reason: self.reason.clone(),
        }
    }
}

/// Parses `key=value`; the value is JSON if it parses, otherwise a plain string.
pub fn parse_key_value(s: &str) -> Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing key in '{}'", s));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_value_parsing() {
        assert_eq!(parse_key_value("timeout=600").unwrap(), ("timeout".to_string(), json!(600)));
        assert_eq!(
            parse_key_value("vendor=acme corp").unwrap(),
            ("vendor".to_string(), json!("acme corp"))
        );
        assert_eq!(
            parse_key_value("flags={\"dry_run\":true}").unwrap().1,
            json!({"dry_run": true})
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=1").is_err());
    }

    #[test]
    fn test_redrive_command_parses() {
        let cli = Cli::try_parse_from([
            "dlq-redrive",
            "redrive",
            "abc",
            "--force",
            "--arg",
            "timeout=600",
            "--priority",
            "critical",
            "--reason",
            "vendor fixed the feed",
        ])
        .unwrap();

        match cli.command {
            Commands::Redrive { id, options } => {
                assert_eq!(id, "abc");
                let options = options.to_options();
                assert!(options.force);
                assert_eq!(options.priority_override, Some(DlqPriority::Critical));
                assert_eq!(options.reason.as_deref(), Some("vendor fixed the feed"));
                assert_eq!(options.arg_overrides.unwrap()["timeout"], json!(600));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_list_flags_build_query() {
        let cli = Cli::try_parse_from([
            "dlq-redrive",
            "list",
            "--status",
            "failed_permanently",
            "--sort-by",
            "priority",
            "--order",
            "asc",
            "--page-size",
            "10",
        ])
        .unwrap();

        let Commands::List(args) = cli.command else {
            panic!("expected list");
        };
        let query = args.to_query();
        assert_eq!(query.filter.status, Some(DlqStatus::FailedPermanently));
        assert_eq!(query.sort_by, SortBy::Priority);
        assert_eq!(query.sort_order, SortOrder::Asc);
        assert_eq!(query.page_size, 10);
    }
}
