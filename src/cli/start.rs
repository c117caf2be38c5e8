//! Start subcommand: seeding and pool overrides.

use crate::types::SeedTask;
use anyhow::{Context, Result, bail};
use clap::Args;
use std::path::{Path, PathBuf};

/// Arguments for the start subcommand
#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// Reattach to existing tasks instead of seeding when the store is not empty
    #[arg(long)]
    pub resume: bool,

    /// Prompt for a single root task
    #[arg(short, long, requires = "output")]
    pub prompt: Option<String>,

    /// Output path for the root task given with --prompt
    #[arg(short, long, requires = "prompt")]
    pub output: Option<String>,

    /// YAML file with a list of root tasks ({prompt, output_path, context})
    #[arg(long, value_name = "FILE")]
    pub seed_file: Option<PathBuf>,

    /// Number of workers (overrides config)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Maximum task depth (overrides config)
    #[arg(long)]
    pub max_depth: Option<u32>,
}

impl StartArgs {
    /// Collect seed tasks from the seed file and --prompt, in that order.
    pub fn seeds(&self) -> Result<Vec<SeedTask>> {
        let mut seeds = match &self.seed_file {
            Some(path) => load_seed_file(path)?,
            None => Vec::new(),
        };

        if let (Some(prompt), Some(output)) = (&self.prompt, &self.output) {
            seeds.push(SeedTask {
                prompt: prompt.clone(),
                output_path: output.clone(),
                context: None,
            });
        }

        Ok(seeds)
    }
}

/// Read a YAML list of seed tasks.
pub fn load_seed_file(path: &Path) -> Result<Vec<SeedTask>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read seed file {}", path.display()))?;
    let seeds: Vec<SeedTask> = serde_yaml::from_str(&content)
        .with_context(|| format!("invalid seed file {}", path.display()))?;

    if let Some(i) = seeds.iter().position(|s| s.prompt.trim().is_empty()) {
        bail!("seed {} in {} has an empty prompt", i + 1, path.display());
    }

    Ok(seeds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn seed_file_and_prompt_are_combined() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("seeds.yaml");
        std::fs::write(
            &file,
            r#"
- prompt: Document the billing service
  output_path: docs/billing
  context:
    repo: billing
- prompt: Document the dialer
  output_path: docs/dialer
"#,
        )
        .unwrap();

        let args = StartArgs {
            prompt: Some("Document the gateway".into()),
            output: Some("docs/gateway".into()),
            seed_file: Some(file),
            ..Default::default()
        };

        let seeds = args.seeds().unwrap();
        assert_eq!(seeds.len(), 3);
        assert_eq!(seeds[0].context.as_ref().unwrap()["repo"], "billing");
        assert!(seeds[1].context.is_none());
        assert_eq!(seeds[2].output_path, "docs/gateway");
    }

    #[test]
    fn empty_prompt_in_seed_file_is_rejected() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("seeds.yaml");
        std::fs::write(&file, "- prompt: ''\n  output_path: docs\n").unwrap();
        assert!(load_seed_file(&file).is_err());
    }
}
