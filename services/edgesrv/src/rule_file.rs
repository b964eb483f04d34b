//! YAML rule file
//!
//! The file holds a plain list of rules. Rule CRUD on the engine writes the
//! whole set back through [`RuleFile`], via a temp file and rename.

use anyhow::{Context, Result};
use async_trait::async_trait;
use edge_calc::ExprEngine;
use edge_rules::{ActionKind, Rule, RuleAction, RulePersister, RuleType};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct RuleFile {
    path: PathBuf,
}

impl RuleFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all rules; a missing file is an empty rule set
    pub async fn load(&self) -> Result<Vec<Rule>> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        parse_rules(&text).with_context(|| format!("Invalid rule file {}", self.path.display()))
    }
}

#[async_trait]
impl RulePersister for RuleFile {
    async fn save_rules(&self, rules: &[Rule]) -> anyhow::Result<()> {
        let text = serde_yaml::to_string(rules)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), rules = rules.len(), "Rule file saved");
        Ok(())
    }
}

pub fn parse_rules(text: &str) -> Result<Vec<Rule>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_yaml::from_str(text)?)
}

/// Static checks on a rule set: unique IDs, sources present, expressions
/// compile. Returns one message per problem.
pub fn validate_rules(rules: &[Rule], engine: &ExprEngine) -> Vec<String> {
    let mut problems = Vec::new();
    let mut seen = HashSet::new();

    for rule in rules {
        if rule.id.trim().is_empty() {
            problems.push(format!("rule '{}': id is required", rule.name));
            continue;
        }
        if !seen.insert(rule.id.as_str()) {
            problems.push(format!("rule '{}': duplicate id", rule.id));
        }
        if rule.effective_sources().is_empty() {
            problems.push(format!("rule '{}': no sources", rule.id));
        }

        let main_expression = match rule.rule_type {
            RuleType::Calculation => Some(("expression", &rule.expression)),
            _ if !rule.condition.is_empty() => Some(("condition", &rule.condition)),
            _ => None,
        };
        if let Some((field, expression)) = main_expression {
            if let Err(e) = engine.compile(expression) {
                problems.push(format!("rule '{}': {}: {}", rule.id, field, e));
            }
        }
        if rule.rule_type == RuleType::Window && rule.window.is_none() {
            problems.push(format!("rule '{}': window rule without window config", rule.id));
        }

        for action in &rule.actions {
            check_action(&rule.id, action, engine, &mut problems);
        }
    }

    problems
}

fn check_action(rule_id: &str, action: &RuleAction, engine: &ExprEngine, problems: &mut Vec<String>) {
    match &action.kind {
        ActionKind::DeviceControl { targets, .. } => {
            for target in targets {
                // RMW shorthands are resolved by the executor, not compiled
                if target.expression.is_empty() || target.expression.starts_with("bitset(") {
                    continue;
                }
                if let Err(e) = engine.compile(&target.expression) {
                    problems.push(format!(
                        "rule '{}': device_control expression: {}",
                        rule_id, e
                    ));
                }
            }
        },
        ActionKind::Check {
            expression,
            on_fail,
            ..
        } => {
            if let Err(e) = engine.compile(expression) {
                problems.push(format!("rule '{}': check expression: {}", rule_id, e));
            }
            for step in on_fail {
                check_action(rule_id, step, engine, problems);
            }
        },
        ActionKind::Sequence { steps } => {
            for step in steps {
                check_action(rule_id, step, engine, problems);
            }
        },
        _ => {},
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    const RULES: &str = r#"
- id: boiler_overheat
  name: Boiler overheat
  type: state
  priority: 10
  sources:
    - alias: t
      channel_id: modbus1
      device_id: boiler
      point_id: temp
  condition: t > 85
  state:
    duration: 30s
    count: 3
  actions:
    - type: log
      config:
        level: warn
        message: "Boiler at ${t}C"
    - type: device_control
      config:
        channel_id: modbus1
        device_id: boiler
        point_id: burner_ctl
        expression: bitset(2, 0)
"#;

    #[test]
    fn test_parse_and_validate() {
        let rules = parse_rules(RULES).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].rule_type, RuleType::State);
        assert_eq!(rules[0].actions.len(), 2);

        let engine = ExprEngine::new().unwrap();
        assert!(validate_rules(&rules, &engine).is_empty());
    }

    #[test]
    fn test_validate_reports_problems() {
        let mut rules = parse_rules(RULES).unwrap();
        let mut broken = rules[0].clone();
        broken.condition = "t >".to_string();
        rules.push(broken);

        let engine = ExprEngine::new().unwrap();
        let problems = validate_rules(&rules, &engine);
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("duplicate id"));
        assert!(problems[1].contains("condition"));
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let file = RuleFile::new(dir.path().join("rules").join("rules.yaml"));
        assert!(file.load().await.unwrap().is_empty());

        let rules = parse_rules(RULES).unwrap();
        file.save_rules(&rules).await.unwrap();

        let reloaded = file.load().await.unwrap();
        assert_eq!(reloaded, rules);
    }
}
