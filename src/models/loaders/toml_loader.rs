use crate::models::scenario::{Scenario, FOLLOW_UP_ID_OFFSET};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;

/// TOML 场景库文件结构
///
/// ```toml
/// [[scenarios]]
/// id = 1
/// situation = "..."
/// question = "..."
/// best_response_rationale = "..."
/// worst_response_rationale = "..."
/// assessed_competency = "Teamwork"
/// ```
#[derive(Debug, Deserialize)]
struct ScenarioBankFile {
    #[serde(default)]
    scenarios: Vec<Scenario>,
}

/// 从 TOML 文件加载场景库
pub async fn load_scenario_bank(toml_file_path: &Path) -> Result<Vec<Scenario>> {
    let content = fs::read_to_string(toml_file_path)
        .await
        .with_context(|| format!("无法读取TOML文件: {}", toml_file_path.display()))?;

    let bank: ScenarioBankFile = toml::from_str(&content)
        .with_context(|| format!("无法解析TOML文件: {}", toml_file_path.display()))?;

    validate_scenarios(&bank.scenarios)
        .with_context(|| format!("场景库校验失败: {}", toml_file_path.display()))?;

    Ok(bank.scenarios)
}

/// 从文件夹中加载所有 TOML 场景库，按文件名排序后合并
pub async fn load_all_scenario_banks(folder_path: &str) -> Result<Vec<Scenario>> {
    let folder = PathBuf::from(folder_path);

    if !folder.exists() {
        anyhow::bail!("文件夹不存在: {}", folder_path);
    }

    let mut toml_files = Vec::new();
    let mut entries = fs::read_dir(&folder)
        .await
        .with_context(|| format!("无法读取文件夹: {}", folder_path))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml_files.push(path);
        }
    }
    toml_files.sort();

    let mut scenarios = Vec::new();
    for path in toml_files {
        tracing::info!(
            "正在加载场景库: {}",
            path.file_name().unwrap_or_default().to_string_lossy()
        );

        match load_scenario_bank(&path).await {
            Ok(bank) => {
                tracing::info!("成功加载 {} 个场景", bank.len());
                scenarios.extend(bank);
            }
            Err(e) => {
                tracing::warn!("加载文件失败 {}: {:#}", path.display(), e);
            }
        }
    }

    validate_scenarios(&scenarios).context("合并后的场景库校验失败")?;

    Ok(scenarios)
}

/// 校验场景库：ID 唯一、不与追问ID空间冲突、题干非空
fn validate_scenarios(scenarios: &[Scenario]) -> Result<()> {
    let mut seen = HashSet::new();
    for scenario in scenarios {
        if !seen.insert(scenario.id) {
            anyhow::bail!("场景ID重复: {}", scenario.id);
        }
        if scenario.id >= FOLLOW_UP_ID_OFFSET {
            anyhow::bail!(
                "场景ID {} 超出范围，必须小于 {}",
                scenario.id,
                FOLLOW_UP_ID_OFFSET
            );
        }
        if scenario.question.trim().is_empty() {
            anyhow::bail!("场景 {} 的题干为空", scenario.id);
        }
        if scenario.parent_id.is_some() {
            anyhow::bail!("场景库中不能包含追问场景: {}", scenario.id);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BANK: &str = r#"
[[scenarios]]
id = 1
situation = "A customer calls, upset that their order arrived damaged."
question = "How would you handle the call?"
best_response_rationale = "Empathise, take ownership, offer a concrete fix."
worst_response_rationale = "Deflect blame to the courier."
assessed_competency = "Customer Focus"

[[scenarios]]
id = 2
situation = "Two teammates disagree about a release date."
question = "What do you do?"
competency = "Teamwork"
"#;

    #[tokio::test]
    async fn test_load_scenario_bank() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bank.toml");
        std::fs::write(&path, BANK).unwrap();

        let scenarios = load_scenario_bank(&path).await.unwrap();
        assert_eq!(scenarios.len(), 2);
        assert_eq!(scenarios[0].assessed_competency, "Customer Focus");
        assert_eq!(scenarios[1].assessed_competency, "Teamwork");
        assert_eq!(scenarios[1].best_response_rationale, "");
    }

    #[tokio::test]
    async fn test_duplicate_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.toml"), BANK).unwrap();
        std::fs::write(dir.path().join("b.toml"), BANK).unwrap();

        let result = load_all_scenario_banks(dir.path().to_str().unwrap()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_missing_folder() {
        assert!(load_all_scenario_banks("/definitely/not/here").await.is_err());
    }
}
