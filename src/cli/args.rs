// ABOUTME: Command line argument definitions and parsing using Clap
// ABOUTME: Defines the main CLI structure and the run, validate and resume subcommands

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stepgraph")]
#[command(about = "A step-driven scheduler for task graphs defined in YAML")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Path to configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Disable colored output")]
    pub no_color: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a task graph from a YAML file
    Run {
        #[arg(help = "Path to graph YAML file")]
        graph: PathBuf,

        #[arg(short = 'V', long = "var", help = "Set a context value (key=value)")]
        vars: Vec<String>,

        #[arg(long, help = "Maximum number of outstanding jobs")]
        max_jobs: Option<usize>,

        #[arg(short, long, help = "Write the run result as JSON to this file")]
        output: Option<PathBuf>,

        #[arg(long, help = "Dry run - validate without executing")]
        dry_run: bool,
    },

    /// Validate a graph file without executing
    Validate {
        #[arg(help = "Path to graph YAML file")]
        graph: PathBuf,

        #[arg(long, help = "Treat unknown task kinds and executors as errors")]
        strict: bool,
    },

    /// Resume a graph instance from its last checkpoint
    Resume {
        #[arg(help = "Instance id printed by a previous run")]
        instance_id: String,

        #[arg(short, long, help = "Write the run result as JSON to this file")]
        output: Option<PathBuf>,
    },
}

impl Args {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Parse `key=value` pairs; values are read as YAML scalars so `n=3` is a number.
    pub fn parse_variables(vars: &[String]) -> anyhow::Result<Map<String, Value>> {
        let mut variables = Map::new();

        for var in vars {
            let Some((key, raw)) = var.split_once('=') else {
                return Err(anyhow::anyhow!(
                    "Invalid variable format '{}'. Expected 'key=value'",
                    var
                ));
            };
            let value = serde_yaml::from_str::<Value>(raw)
                .unwrap_or_else(|_| Value::String(raw.to_string()));
            variables.insert(key.to_string(), value);
        }

        Ok(variables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_variables() {
        let vars = vec![
            "env=production".to_string(),
            "n=3".to_string(),
            "debug=true".to_string(),
            "ratio=0.5".to_string(),
        ];

        let parsed = Args::parse_variables(&vars).unwrap();

        assert_eq!(parsed["env"], json!("production"));
        assert_eq!(parsed["n"], json!(3));
        assert_eq!(parsed["debug"], json!(true));
        assert_eq!(parsed["ratio"], json!(0.5));
    }

    #[test]
    fn test_parse_variables_keeps_odd_text_as_string() {
        let parsed = Args::parse_variables(&["msg=a: b: c".to_string()]).unwrap();
        assert_eq!(parsed["msg"], json!("a: b: c"));
    }

    #[test]
    fn test_parse_variables_invalid() {
        let vars = vec!["invalid_format".to_string()];
        assert!(Args::parse_variables(&vars).is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let args = Args::try_parse_from([
            "stepgraph", "run", "graph.yaml", "--var", "x=1", "--max-jobs", "2", "--dry-run",
        ])
        .unwrap();
        match args.command {
            Commands::Run {
                graph,
                vars,
                max_jobs,
                dry_run,
                ..
            } => {
                assert_eq!(graph, PathBuf::from("graph.yaml"));
                assert_eq!(vars, vec!["x=1".to_string()]);
                assert_eq!(max_jobs, Some(2));
                assert!(dry_run);
            }
            _ => panic!("expected run"),
        }
    }
}
