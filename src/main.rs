//! Context Warden CLI
//!
//! Inspect window detection, profile selection and checkpoints from the shell.

use clap::{Parser, Subcommand};
use context_warden::memory::Checkpoint;
use context_warden::profile::{built_in_profiles, AdaptiveOptimizer, WindowProfile};
use context_warden::window::{WindowDetector, WindowManager};
use context_warden::WardenConfig;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Context Warden - context-window budgeting for LLM orchestration loops
#[derive(Parser, Debug)]
#[command(name = "context-warden")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output: debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect a model's context window
    Detect {
        /// Provider name, matched against configured endpoints
        #[arg(short, long, default_value = "openai")]
        provider: String,

        /// Model id
        model: String,

        /// Live query timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// List the profile table
    Profiles,

    /// Show the profile and bounds selected for a window size
    Select {
        /// Window size in tokens
        window_size: usize,

        /// Select a profile by name instead
        #[arg(long)]
        profile: Option<String>,
    },

    /// Summarize a checkpoint file
    Inspect {
        /// Checkpoint path (defaults to the configured one)
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_deref()).await?;

    match cli.command {
        Command::Detect {
            provider,
            model,
            timeout_ms,
        } => {
            let timeout = timeout_ms
                .map(std::time::Duration::from_millis)
                .unwrap_or_else(|| config.detection.timeout());
            let detector = WindowDetector::new(config.detection.clone());
            let detection = detector.detect_with_source(&provider, &model, timeout).await;
            let selector = selector_for(detection.tokens, &config, None)?;
            println!("{} tokens ({})", detection.tokens, detection.source);
            println!("profile: {}", selector.profile().name);
        }
        Command::Profiles => {
            let table = config.profiles.clone().unwrap_or_else(built_in_profiles);
            for profile in &table {
                println!("{}", describe_profile(profile));
            }
        }
        Command::Select {
            window_size,
            profile,
        } => {
            let selector = selector_for(window_size, &config, profile.as_deref())?;
            let window =
                WindowManager::with_thresholds(window_size, config.utilization_fraction, config.zones)?;
            let wm = selector.working_memory_config();
            println!("{}", describe_profile(selector.profile()));
            println!(
                "limit: {} tokens | working memory: {} ops, {} tokens | checkpoint {}",
                window.limit(),
                wm.capacity,
                wm.token_budget,
                selector.checkpoint_config().interval
            );
        }
        Command::Inspect { path } => {
            let path = path
                .or_else(|| config.checkpoint_path.clone())
                .ok_or_else(|| anyhow::anyhow!("No checkpoint path given or configured"))?;
            let (checkpoint, id) = Checkpoint::load_with_id(&path).await?;
            println!("{}", describe_checkpoint(&checkpoint, &id));
        }
    }

    Ok(())
}

/// Explicit path must exist; the default path is optional
async fn load_config(path: Option<&Path>) -> anyhow::Result<WardenConfig> {
    match path {
        Some(path) => Ok(WardenConfig::load(path).await?),
        None => match WardenConfig::default_config_path() {
            Some(path) => {
                info!("Using configuration {:?}", path);
                Ok(WardenConfig::load_or_default(&path).await?)
            }
            None => Ok(WardenConfig::default()),
        },
    }
}

fn selector_for(
    window_size: usize,
    config: &WardenConfig,
    profile: Option<&str>,
) -> anyhow::Result<AdaptiveOptimizer> {
    let table = config.profiles.clone().unwrap_or_else(built_in_profiles);
    let manual = profile.or(config.profile_override.as_deref());
    Ok(AdaptiveOptimizer::new(
        window_size,
        table,
        manual,
        Some(&config.thresholds),
    )?)
}

fn describe_profile(profile: &WindowProfile) -> String {
    let range = match profile.window_range.max {
        Some(max) => format!("[{}, {})", profile.window_range.min, max),
        None => format!("[{}, ∞)", profile.window_range.min),
    };
    format!(
        "{:<17} {:<18} capacity {:>3}, budget {:>2.0}%, checkpoint {}, item threshold {}",
        profile.name,
        range,
        profile.working_memory_capacity,
        profile.working_memory_token_budget_fraction * 100.0,
        profile.checkpoint_interval,
        profile.per_item_optimize_threshold_tokens
    )
}

fn describe_checkpoint(checkpoint: &Checkpoint, id: &str) -> String {
    let mut lines = vec![
        format!("checkpoint {} (version {})", id, checkpoint.version),
        format!("created:    {}", checkpoint.created_at.to_rfc3339()),
        format!(
            "window:     {} tokens, profile '{}'",
            checkpoint.window_size, checkpoint.active_profile_name
        ),
        format!(
            "usage:      {} / {} tokens ({} zone)",
            checkpoint.usage_state.tokens_used,
            checkpoint.usage_state.limit,
            checkpoint.usage_state.zone
        ),
        format!("operations: {}", checkpoint.operations.len()),
    ];
    for op in &checkpoint.operations {
        let text = op.text();
        let preview: String = text.chars().take(60).collect();
        let ellipsis = if text.chars().count() > 60 { "..." } else { "" };
        lines.push(format!(
            "  {} {:<16} {:>6} tokens  {}{}",
            op.timestamp.format("%H:%M:%S"),
            op.kind,
            op.token_cost,
            preview,
            ellipsis
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use context_warden::window::{UsageState, Zone};
    use context_warden::Operation;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["context-warden", "select", "32000", "--profile", "balanced"])
            .unwrap();
        match cli.command {
            Command::Select {
                window_size,
                profile,
            } => {
                assert_eq!(window_size, 32_000);
                assert_eq!(profile.as_deref(), Some("balanced"));
            }
            other => panic!("unexpected command {:?}", other),
        }

        let cli = Cli::try_parse_from(["context-warden", "-v", "detect", "gpt-4o"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Detect { .. }));

        assert!(Cli::try_parse_from(["context-warden", "select", "many"]).is_err());
    }

    #[test]
    fn test_selector_honors_override() {
        let config = WardenConfig::default();
        let selector = selector_for(8_192, &config, Some("minimal")).unwrap();
        assert_eq!(selector.profile().name, "minimal");
        assert!(selector_for(8_192, &config, Some("nope")).is_err());
    }

    #[test]
    fn test_describe_profile_and_checkpoint() {
        let table = built_in_profiles();
        assert!(describe_profile(&table[4]).contains("[500000, ∞)"));

        let checkpoint = Checkpoint::new(
            32_000,
            "aggressive",
            UsageState {
                tokens_used: 100,
                limit: 24_000,
                zone: Zone::Green,
            },
            vec![Operation::new("task_start", serde_json::json!("x".repeat(100)), 100)],
        );
        let text = describe_checkpoint(&checkpoint, "abcd");
        assert!(text.contains("checkpoint abcd (version 1)"));
        assert!(text.contains("operations: 1"));
        assert!(text.contains("..."));
    }
}
