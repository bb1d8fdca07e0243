//! Command-line arguments

use std::path::PathBuf;

use clap::Parser;

/// devvisor - run a dev server and restart it when its sources change
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "devvisor")]
#[command(about = "Run a dev server and restart it when its sources change")]
#[command(version)]
#[command(author = "devvisor Contributors")]
pub struct Cli {
    /// Project root (default: current directory)
    #[arg(long, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Config file (default: <root>/devvisor.toml)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Only restart for paths matching this glob
    #[arg(short, long = "watch", value_name = "GLOB")]
    pub watch: Vec<String>,

    /// Never restart for paths matching this glob
    #[arg(short, long = "ignore", value_name = "GLOB")]
    pub ignore: Vec<String>,

    /// Extra environment for the child
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Time allowed for teardown on exit
    #[arg(long, value_name = "N")]
    pub exit_timeout_ms: Option<u64>,

    /// Enable verbose output
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Minimize output
    #[arg(short, long)]
    pub quiet: bool,

    /// Command to supervise, followed by its arguments
    #[arg(last = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_command_line() {
        let cli = Cli::try_parse_from([
            "devvisor",
            "--root",
            "/proj",
            "--watch",
            "src/**/*.ts",
            "--ignore",
            "**/dist/**",
            "--env",
            "PORT=4000",
            "--exit-timeout-ms",
            "500",
            "-v",
            "--",
            "node",
            "server.js",
            "--inspect",
        ])
        .unwrap();

        assert_eq!(cli.root, Some(PathBuf::from("/proj")));
        assert_eq!(cli.watch, vec!["src/**/*.ts"]);
        assert_eq!(cli.ignore, vec!["**/dist/**"]);
        assert_eq!(cli.env, vec![("PORT".to_string(), "4000".to_string())]);
        assert_eq!(cli.exit_timeout_ms, Some(500));
        assert!(cli.verbose);
        assert_eq!(cli.command, vec!["node", "server.js", "--inspect"]);
    }

    #[test]
    fn test_env_value_may_contain_equals() {
        assert_eq!(
            parse_env_pair("DATABASE_URL=postgres://u@h/db?a=b").unwrap(),
            ("DATABASE_URL".to_string(), "postgres://u@h/db?a=b".to_string())
        );
        assert!(parse_env_pair("=oops").is_err());
        assert!(parse_env_pair("NOVALUE").is_err());
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Cli::try_parse_from(["devvisor", "-v", "-q"]).is_err());
    }
}
